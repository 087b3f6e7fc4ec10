//! Per-pair application with tri-state outcomes

use std::collections::BTreeSet;
use std::fmt;

use crate::pairs::LoraPair;
use crate::resolve::resolve;
use candle_core::Device;
use lorapatch_common::{LoraConfig, to_f32_matrix};
use lorapatch_models::{LayerKind, LowRankPatch, Module};
use tracing::{debug, warn};

/// Why a pair was not attempted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// No module at the path, fused fallback included
    Unresolved,
    /// Path belongs to a text encoder, which is never patched
    TextEncoder,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unresolved => f.write_str("module not found"),
            Self::TextEncoder => f.write_str("text encoder modules are not patched"),
        }
    }
}

/// Result of applying one pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Accepted by a layer of this kind
    Applied(LayerKind),
    Failed(String),
    Skipped(SkipReason),
}

/// Whether the first path segment names a text-encoder component
pub fn is_text_encoder_path(module_path: &str, config: &LoraConfig) -> bool {
    let root = module_path.split('.').next().unwrap_or_default();
    config.text_encoder_roots.iter().any(|r| r == root)
}

/// Resolve `pair` in `model` and hand it to the target layer.
///
/// `claimed` holds the `(layer path, record name)` targets already written
/// during the current load; a second pair landing on one of them fails.
/// Never returns an error: every problem is an outcome the caller counts.
pub fn apply_pair(
    model: &mut Module,
    pair: &LoraPair,
    adapter: &str,
    scale: f32,
    config: &LoraConfig,
    device: &Device,
    claimed: &mut BTreeSet<(String, String)>,
) -> ApplyOutcome {
    let module = pair.module_path.as_str();
    if is_text_encoder_path(module, config) {
        return ApplyOutcome::Skipped(SkipReason::TextEncoder);
    }

    let Some(target) = resolve(model, module, config) else {
        debug!(adapter, module, "no matching module, skipping");
        return ApplyOutcome::Skipped(SkipReason::Unresolved);
    };

    let record = match target.slice() {
        Some(slice) => format!("{adapter}{}", slice.suffix()),
        None => adapter.to_string(),
    };
    let claim = (target.path().to_string(), record);
    if claimed.contains(&claim) {
        let reason =
            format!("duplicate target '{}' already patched by this adapter", target.path());
        warn!(adapter, module, reason = %reason, "failed to apply");
        return ApplyOutcome::Failed(reason);
    }

    let Some(layer) = model.layer_at_mut(target.path()) else {
        let reason = format!("'{}' is not a layer", target.path());
        warn!(adapter, module, reason = %reason, "unsupported target");
        return ApplyOutcome::Failed(reason);
    };

    let matrices = to_f32_matrix(&pair.down, device)
        .and_then(|down| Ok((down, to_f32_matrix(&pair.up, device)?)));
    let (down, up) = match matrices {
        Ok(m) => m,
        Err(e) => {
            warn!(adapter, module, reason = %e, "adapter tensors are not matrices");
            return ApplyOutcome::Failed(e.to_string());
        }
    };

    let mut patch =
        LowRankPatch::new(claim.1.as_str(), down, up).with_alpha(pair.alpha).with_scale(scale);
    if let Some(slice) = target.slice() {
        patch = patch.with_slice(slice);
    }

    match layer.apply_delta(&patch) {
        Ok(()) => {
            debug!(adapter, module, target = target.path(), kind = %layer.kind(), "applied");
            let kind = layer.kind();
            claimed.insert(claim);
            ApplyOutcome::Applied(kind)
        }
        Err(e) => {
            warn!(adapter, module, target = target.path(), reason = %e, "failed to apply");
            ApplyOutcome::Failed(e.to_string())
        }
    }
}
