//! RMS normalization; carries a weight but takes no patches

use super::{Layer, LayerKind};
use candle_core::Tensor;
use lorapatch_common::{LayerError, Result};

#[derive(Debug, Clone)]
pub struct RmsNorm {
    weight: Tensor,
    eps: f32,
}

impl RmsNorm {
    pub const DEFAULT_EPS: f32 = 1e-6;

    pub fn new(weight: Tensor, eps: f32) -> Result<Self> {
        if weight.rank() != 1 {
            return Err(LayerError::ShapeMismatch {
                expected: vec![0],
                actual: weight.dims().to_vec(),
            }
            .into());
        }
        Ok(Self { weight, eps })
    }
}

impl Layer for RmsNorm {
    fn kind(&self) -> LayerKind {
        LayerKind::Norm
    }

    fn in_features(&self) -> usize {
        self.weight.dims()[0]
    }

    fn out_features(&self) -> usize {
        self.in_features()
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        Ok(candle_nn::ops::rms_norm(x, &self.weight, self.eps)?)
    }

    fn weight(&self) -> Result<Tensor> {
        Ok(self.weight.clone())
    }
}
