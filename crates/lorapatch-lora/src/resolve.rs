//! Module path resolution with fused q/k/v fallback

use lorapatch_common::LoraConfig;
use lorapatch_models::{Module, SliceSpec};

/// Output projection suffixes, longest first
const OUT_SUFFIXES: [&str; 4] = ["to_out.0", "to_out", "o_proj", "out_proj"];

/// Query, key and value suffixes by slice index
const QKV_SUFFIXES: [&[&str]; 3] =
    [&["to_q", "q_proj", "query"], &["to_k", "k_proj", "key"], &["to_v", "v_proj", "value"]];

/// Where an adapter pair lands in the model
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedTarget {
    /// The module at `path` itself
    Direct { path: String },
    /// Rows of the fused q/k/v layer at `path`
    FusedSlice { path: String, slice: SliceSpec },
}

impl ResolvedTarget {
    pub fn path(&self) -> &str {
        match self {
            Self::Direct { path } | Self::FusedSlice { path, .. } => path,
        }
    }

    pub fn slice(&self) -> Option<SliceSpec> {
        match self {
            Self::Direct { .. } => None,
            Self::FusedSlice { slice, .. } => Some(*slice),
        }
    }
}

/// Resolve `module_path` against `model`.
///
/// Direct lookup first. When that fails and the path ends in a known
/// attention sub-projection, the suffix is rewritten to the fused module name
/// from `config`: output projections resolve directly, query/key/value become
/// a [`ResolvedTarget::FusedSlice`] of a layer whose height splits in three.
pub fn resolve(model: &Module, module_path: &str, config: &LoraConfig) -> Option<ResolvedTarget> {
    if model.get(module_path).is_some() {
        return Some(ResolvedTarget::Direct { path: module_path.to_string() });
    }

    if let Some(parent) = OUT_SUFFIXES.iter().find_map(|s| strip_segment_suffix(module_path, s)) {
        let path = join(parent, &config.fused_out_name);
        return model.get(&path).is_some().then_some(ResolvedTarget::Direct { path });
    }

    let (index, parent) = QKV_SUFFIXES.iter().enumerate().find_map(|(index, suffixes)| {
        suffixes.iter().find_map(|s| strip_segment_suffix(module_path, s)).map(|p| (index, p))
    })?;
    let path = join(parent, &config.fused_qkv_name);
    let fused = model.layer_at(&path)?;
    let slice = SliceSpec::new(index, fused.out_features())?;
    Some(ResolvedTarget::FusedSlice { path, slice })
}

/// Parent path when `path` ends in `suffix` on a segment boundary
fn strip_segment_suffix<'a>(path: &'a str, suffix: &str) -> Option<&'a str> {
    let head = path.strip_suffix(suffix)?;
    if head.is_empty() {
        return Some("");
    }
    head.strip_suffix('.')
}

fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() { name.to_string() } else { format!("{parent}.{name}") }
}
