//! Grouping parsed keys into complete down/up pairs

use std::collections::BTreeMap;

use crate::keys::{Direction, has_indicator, is_alpha_key, is_network_alpha_key, parse_key};
use crate::source::{AdapterSource, scalar_value};
use candle_core::Tensor;
use lorapatch_common::Result;
use tracing::debug;

/// A complete low-rank pair for one module path
#[derive(Debug, Clone)]
pub struct LoraPair {
    pub module_path: String,
    /// `[rank, in]`
    pub down: Tensor,
    /// `[out, rank]`
    pub up: Tensor,
    pub alpha: Option<f32>,
}

impl LoraPair {
    pub fn rank(&self) -> usize {
        self.down.dims().first().copied().unwrap_or(0)
    }

    pub fn in_features(&self) -> usize {
        self.down.dims().get(1).copied().unwrap_or(0)
    }

    pub fn out_features(&self) -> usize {
        self.up.dims().first().copied().unwrap_or(0)
    }
}

#[derive(Default)]
struct PartialPair {
    down: Option<Tensor>,
    up: Option<Tensor>,
}

/// First known prefix carried by the lexicographically first LoRA-bearing name
pub fn detect_prefix<'a>(source: &AdapterSource, known_prefixes: &'a [String]) -> Option<&'a str> {
    let sample = source
        .names()
        .filter(|name| !is_network_alpha_key(name))
        .find(|name| has_indicator(name) || is_alpha_key(name))?;
    known_prefixes
        .iter()
        .filter(|prefix| sample.starts_with(prefix.as_str()))
        .max_by_key(|prefix| prefix.len())
        .map(String::as_str)
}

/// Group the source's tensors into complete pairs keyed by module path.
///
/// `prefix` is stripped from every module path; when `None` it is detected
/// from `known_prefixes`. Entries missing either half are dropped. Alphas are
/// attached after the pass with precedence per-path tensor, network alpha
/// map, metadata default.
pub fn extract_lora_pairs(
    source: &AdapterSource,
    prefix: Option<&str>,
    known_prefixes: &[String],
) -> Result<BTreeMap<String, LoraPair>> {
    let prefix = prefix.or_else(|| detect_prefix(source, known_prefixes)).unwrap_or_default();
    let strip = |path: &str| path.strip_prefix(prefix).unwrap_or(path).to_string();

    let mut partial: BTreeMap<String, PartialPair> = BTreeMap::new();
    let mut path_alphas: Vec<(String, f32)> = Vec::new();

    for (name, tensor) in source.iter() {
        if is_network_alpha_key(name) {
            continue;
        }
        if is_alpha_key(name) {
            let candidate = name.rsplit_once('.').map_or(name, |(base, _)| base);
            match scalar_value(tensor) {
                Some(alpha) => path_alphas.push((strip(candidate), alpha)),
                None => debug!(tensor = name, "ignoring non-scalar alpha"),
            }
            continue;
        }
        let Some(key) = parse_key(name) else { continue };

        let entry = partial.entry(strip(&key.base_module_path)).or_default();
        let slot = match key.direction {
            Direction::Down => &mut entry.down,
            Direction::Up => &mut entry.up,
        };
        if slot.replace(tensor.clone()).is_some() {
            debug!(tensor = name, "duplicate {:?} tensor, keeping the last one", key.direction);
        }
    }

    let mut pairs: BTreeMap<String, LoraPair> = partial
        .into_iter()
        .filter_map(|(path, p)| match (p.down, p.up) {
            (Some(down), Some(up)) => {
                Some((path.clone(), LoraPair { module_path: path, down, up, alpha: None }))
            }
            _ => {
                debug!(module = %path, "dropping incomplete pair");
                None
            }
        })
        .collect();

    let default_alpha = source.default_alpha();
    let network = source.network_alphas()?;
    for (path, pair) in pairs.iter_mut() {
        let from_network = network.get(path).or_else(|| network.get(&format!("{prefix}{path}")));
        pair.alpha = from_network.copied().or(default_alpha);
    }
    for (candidate, alpha) in path_alphas {
        if let Some(pair) =
            match_alpha_path(&candidate, pairs.keys()).and_then(|path| pairs.get_mut(&path))
        {
            pair.alpha = Some(alpha);
        }
    }

    Ok(pairs)
}

/// Pick the pair path an alpha candidate belongs to.
///
/// An exact match wins. Otherwise the longest path that matches the
/// candidate on a dotted-segment boundary (either one a suffix of the other)
/// is chosen; equally long distinct matches are ambiguous.
pub fn match_alpha_path<'a>(
    candidate: &str,
    paths: impl IntoIterator<Item = &'a String>,
) -> Option<String> {
    let mut best: Option<&String> = None;
    let mut tied = false;
    for path in paths {
        if path == candidate {
            return Some(path.clone());
        }
        if !segment_suffix(candidate, path) && !segment_suffix(path, candidate) {
            continue;
        }
        match best {
            Some(current) if current.len() > path.len() => {}
            Some(current) if current.len() == path.len() => tied = true,
            _ => {
                best = Some(path);
                tied = false;
            }
        }
    }
    if tied {
        debug!(candidate, "ambiguous alpha target, ignoring");
        return None;
    }
    best.cloned()
}

/// `short` equals the trailing dotted segments of `long`
fn segment_suffix(long: &str, short: &str) -> bool {
    long.strip_suffix(short).is_some_and(|head| head.ends_with('.'))
}
