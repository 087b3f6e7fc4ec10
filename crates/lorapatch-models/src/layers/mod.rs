//! Layer kinds and the patch capability interface

use std::fmt;

use crate::patch::LowRankPatch;
use crate::registry::PatchRegistry;
use candle_core::Tensor;
use lorapatch_common::{LayerError, Result};
use serde::Serialize;

pub mod additive;
pub mod dense;
pub mod norm;
pub mod quantized;

pub use additive::AdditiveLinear;
pub use dense::DenseLinear;
pub use norm::RmsNorm;
pub use quantized::QuantizedLinear;

/// What a layer does with a low-rank patch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerKind {
    /// Plain weight, patch merged in place
    Dense,
    /// Compressed weight, patch merged into a cached dequantized view
    Quantized,
    /// Compressed weight, patches kept as named records
    Additive,
    /// Normalization, no patch support
    Norm,
}

impl LayerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dense => "dense",
            Self::Quantized => "quantized",
            Self::Additive => "additive",
            Self::Norm => "norm",
        }
    }

    /// Applying a patch to this kind cannot be undone
    pub fn is_destructive(&self) -> bool {
        matches!(self, Self::Dense | Self::Quantized)
    }
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capability interface implemented by every layer in a [`crate::Module`] graph.
///
/// The defaults describe a layer that cannot take patches at all; each kind
/// overrides only what it supports.
pub trait Layer: Send + Sync + fmt::Debug {
    fn kind(&self) -> LayerKind;

    fn in_features(&self) -> usize;

    fn out_features(&self) -> usize;

    fn forward(&self, x: &Tensor) -> Result<Tensor>;

    /// Effective float weight as the forward pass sees it, without additive records
    fn weight(&self) -> Result<Tensor>;

    fn bias(&self) -> Option<&Tensor> {
        None
    }

    /// Apply `patch`. Implementations must check the shape before mutating anything.
    fn apply_delta(&mut self, _patch: &LowRankPatch) -> Result<()> {
        Err(self.unsupported("low-rank patches"))
    }

    /// Remove the record called `name`; `Ok(false)` when there is none
    fn remove_delta(&mut self, _name: &str) -> Result<bool> {
        Err(self.unsupported("patch removal"))
    }

    fn patches(&self) -> Option<&PatchRegistry> {
        None
    }

    fn patches_mut(&mut self) -> Option<&mut PatchRegistry> {
        None
    }

    fn unsupported(&self, operation: &str) -> lorapatch_common::LoraError {
        LayerError::Unsupported { kind: self.kind().to_string(), operation: operation.to_string() }
            .into()
    }
}

/// `x @ w.T` for `x` of shape `[.., in]` and `w` of shape `[out, in]`
pub(crate) fn matmul_t(x: &Tensor, w: &Tensor) -> Result<Tensor> {
    let dims = x.dims();
    let in_features = dims.last().copied().unwrap_or(0);
    let (out_features, _) = w.dims2()?;
    if dims.len() == 2 {
        return Ok(x.matmul(&w.t()?)?);
    }
    let rows = x.elem_count() / in_features.max(1);
    let flat = x.reshape((rows, in_features))?.matmul(&w.t()?)?;
    let mut out_dims = dims.to_vec();
    if let Some(last) = out_dims.last_mut() {
        *last = out_features;
    }
    Ok(flat.reshape(out_dims)?)
}

/// Linear forward over a float weight, used by the compressed kinds
pub(crate) fn linear_forward(x: &Tensor, weight: &Tensor, bias: Option<&Tensor>) -> Result<Tensor> {
    let out = matmul_t(x, weight)?;
    match bias {
        Some(bias) => Ok(out.broadcast_add(bias)?),
        None => Ok(out),
    }
}
