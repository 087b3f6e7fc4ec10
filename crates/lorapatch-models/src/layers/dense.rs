//! Plain float linear layer; patches are merged straight into the weight

use super::{Layer, LayerKind};
use crate::patch::LowRankPatch;
use candle_core::{Module as _, Tensor};
use candle_nn::Linear;
use lorapatch_common::{Result, as_matrix};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct DenseLinear {
    linear: Linear,
    in_features: usize,
    out_features: usize,
}

impl DenseLinear {
    /// `weight` is `[out, in]`
    pub fn new(weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        let (out_features, in_features) = as_matrix(&weight)?;
        Ok(Self { linear: Linear::new(weight, bias), in_features, out_features })
    }
}

impl Layer for DenseLinear {
    fn kind(&self) -> LayerKind {
        LayerKind::Dense
    }

    fn in_features(&self) -> usize {
        self.in_features
    }

    fn out_features(&self) -> usize {
        self.out_features
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        Ok(self.linear.forward(x)?)
    }

    fn weight(&self) -> Result<Tensor> {
        Ok(self.linear.weight().clone())
    }

    fn bias(&self) -> Option<&Tensor> {
        self.linear.bias()
    }

    fn apply_delta(&mut self, patch: &LowRankPatch) -> Result<()> {
        patch.check_shape(self.out_features, self.in_features)?;
        let delta = patch.delta()?.to_dtype(self.linear.weight().dtype())?;
        let merged = (self.linear.weight() + delta)?;
        debug!(patch = %patch.name, "merged patch into dense weight");
        self.linear = Linear::new(merged, self.linear.bias().cloned());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn merge_adds_product() {
        let w = Tensor::zeros((2, 2), DType::F32, &Device::Cpu).unwrap();
        let mut layer = DenseLinear::new(w, None).unwrap();
        let down = Tensor::new(&[[1.0f32, 2.0]], &Device::Cpu).unwrap();
        let up = Tensor::new(&[[1.0f32], [-1.0]], &Device::Cpu).unwrap();
        layer.apply_delta(&LowRankPatch::new("a", down, up)).unwrap();
        assert_eq!(
            layer.weight().unwrap().to_vec2::<f32>().unwrap(),
            vec![vec![1.0, 2.0], vec![-1.0, -2.0]]
        );
    }

    #[test]
    fn removal_is_unsupported() {
        let w = Tensor::zeros((2, 2), DType::F32, &Device::Cpu).unwrap();
        let mut layer = DenseLinear::new(w, None).unwrap();
        let err = layer.remove_delta("a").unwrap_err();
        assert_eq!(err.to_string(), "Layer error: dense layers do not support patch removal");
    }
}
