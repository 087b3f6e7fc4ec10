//! Compressed linear layer that merges patches into a cached float view
//!
//! The packed weight itself is never touched. The first patch dequantizes it
//! once; every later patch is added to that cached tensor, which the forward
//! pass then uses instead of dequantizing again.

use super::{Layer, LayerKind, linear_forward};
use crate::patch::LowRankPatch;
use candle_core::{Device, Tensor};
use lorapatch_common::{LayerError, Result};
use lorapatch_quantization::{I2SQuantizer, QuantizedTensor};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct QuantizedLinear {
    weight: QuantizedTensor,
    bias: Option<Tensor>,
    device: Device,
    merged: Option<Tensor>,
}

impl QuantizedLinear {
    pub fn new(weight: QuantizedTensor, bias: Option<Tensor>, device: Device) -> Result<Self> {
        weight.validate()?;
        if weight.shape.len() != 2 {
            return Err(
                LayerError::ShapeMismatch { expected: vec![0, 0], actual: weight.shape.clone() }
                    .into(),
            );
        }
        Ok(Self { weight, bias, device, merged: None })
    }

    /// Quantize a float `[out, in]` weight with the default block size
    pub fn from_float(weight: &Tensor, bias: Option<Tensor>) -> Result<Self> {
        let quantized = I2SQuantizer::new().quantize(weight)?;
        Self::new(quantized, bias, weight.device().clone())
    }

    pub fn quantized_weight(&self) -> &QuantizedTensor {
        &self.weight
    }

    /// Whether a merged float override is in use
    pub fn is_merged(&self) -> bool {
        self.merged.is_some()
    }
}

impl Layer for QuantizedLinear {
    fn kind(&self) -> LayerKind {
        LayerKind::Quantized
    }

    fn in_features(&self) -> usize {
        self.weight.shape[1]
    }

    fn out_features(&self) -> usize {
        self.weight.shape[0]
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let weight = self.weight()?;
        linear_forward(x, &weight, self.bias.as_ref())
    }

    fn weight(&self) -> Result<Tensor> {
        match &self.merged {
            Some(merged) => Ok(merged.clone()),
            None => self.weight.dequantize(&self.device),
        }
    }

    fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    fn apply_delta(&mut self, patch: &LowRankPatch) -> Result<()> {
        patch.check_shape(self.out_features(), self.in_features())?;
        let delta = patch.delta()?;
        let base = self.weight()?;
        self.merged = Some((base + delta)?);
        debug!(patch = %patch.name, "merged patch into dequantized override");
        Ok(())
    }
}
