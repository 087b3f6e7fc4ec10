//! Compressed linear layer that keeps patches as stacked named records

use super::{Layer, LayerKind, linear_forward};
use crate::patch::LowRankPatch;
use crate::registry::{AppliedRecord, PatchRegistry};
use candle_core::{Device, Tensor};
use lorapatch_common::{LayerError, Result};
use lorapatch_quantization::{I2SQuantizer, QuantizedTensor};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct AdditiveLinear {
    weight: QuantizedTensor,
    bias: Option<Tensor>,
    device: Device,
    patches: PatchRegistry,
}

impl AdditiveLinear {
    pub fn new(weight: QuantizedTensor, bias: Option<Tensor>, device: Device) -> Result<Self> {
        weight.validate()?;
        if weight.shape.len() != 2 {
            return Err(
                LayerError::ShapeMismatch { expected: vec![0, 0], actual: weight.shape.clone() }
                    .into(),
            );
        }
        Ok(Self { weight, bias, device, patches: PatchRegistry::new() })
    }

    pub fn from_float(weight: &Tensor, bias: Option<Tensor>) -> Result<Self> {
        let quantized = I2SQuantizer::new().quantize(weight)?;
        Self::new(quantized, bias, weight.device().clone())
    }

    /// Named record insertion, the additive counterpart of a merge
    pub fn add_patch(
        &mut self,
        name: &str,
        down: Tensor,
        up: Tensor,
        alpha: Option<f32>,
        scale: f32,
    ) -> Result<()> {
        let patch = LowRankPatch::new(name, down, up).with_alpha(alpha).with_scale(scale);
        self.apply_delta(&patch)
    }
}

impl Layer for AdditiveLinear {
    fn kind(&self) -> LayerKind {
        LayerKind::Additive
    }

    fn in_features(&self) -> usize {
        self.weight.shape[1]
    }

    fn out_features(&self) -> usize {
        self.weight.shape[0]
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let base = linear_forward(x, &self.weight()?, self.bias.as_ref())?;
        match self.patches.contribution(x)? {
            Some(extra) => Ok((base + extra)?),
            None => Ok(base),
        }
    }

    fn weight(&self) -> Result<Tensor> {
        self.weight.dequantize(&self.device)
    }

    fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    fn apply_delta(&mut self, patch: &LowRankPatch) -> Result<()> {
        patch.check_shape(self.out_features(), self.in_features())?;
        let record = AppliedRecord {
            down: patch.down.clone(),
            up: patch.full_up()?,
            alpha: patch.alpha,
            scale: patch.scale,
            enabled: true,
        };
        if self.patches.insert(patch.name.clone(), record).is_some() {
            debug!(patch = %patch.name, "replaced existing patch record");
        }
        Ok(())
    }

    fn remove_delta(&mut self, name: &str) -> Result<bool> {
        Ok(self.patches.remove(name))
    }

    fn patches(&self) -> Option<&PatchRegistry> {
        Some(&self.patches)
    }

    fn patches_mut(&mut self) -> Option<&mut PatchRegistry> {
        Some(&mut self.patches)
    }
}
