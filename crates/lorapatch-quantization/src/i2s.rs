//! I2_S style ternary quantization
//!
//! Each block of `block_size` weights shares one absmean scale; each weight is
//! rounded to {-1, 0, 1} and packed into two bits.

use crate::QuantizedTensor;
use crate::utils::{calculate_block_scales, pack_ternary, quantize_ternary, unpack_ternary};
use candle_core::{DType, Device, Tensor};
use half::f16;
use lorapatch_common::{QuantizationError, Result};
use rayon::prelude::*;

/// Ternary block quantizer
#[derive(Debug, Clone, Copy)]
pub struct I2SQuantizer {
    block_size: usize,
}

impl Default for I2SQuantizer {
    fn default() -> Self {
        Self::new()
    }
}

impl I2SQuantizer {
    pub const DEFAULT_BLOCK_SIZE: usize = 32;

    pub fn new() -> Self {
        Self { block_size: Self::DEFAULT_BLOCK_SIZE }
    }

    /// Block size must be a non-zero multiple of four
    pub fn with_block_size(block_size: usize) -> Result<Self> {
        if block_size == 0 || block_size % 4 != 0 {
            return Err(QuantizationError::InvalidBlockSize { size: block_size }.into());
        }
        Ok(Self { block_size })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Quantize any float tensor
    pub fn quantize(&self, tensor: &Tensor) -> Result<QuantizedTensor> {
        let shape = tensor.dims().to_vec();
        let data = tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;

        let scales = calculate_block_scales(&data, self.block_size);
        let mut codes = vec![0i8; data.len()];
        codes
            .par_chunks_mut(self.block_size)
            .zip(data.par_chunks(self.block_size))
            .zip(scales.par_iter())
            .for_each(|((code_block, data_block), &scale)| {
                for (code, &value) in code_block.iter_mut().zip(data_block) {
                    *code = quantize_ternary(value, scale);
                }
            });

        Ok(QuantizedTensor {
            data: pack_ternary(&codes),
            scales: scales.into_iter().map(f16::from_f32).collect(),
            shape,
            block_size: self.block_size,
        })
    }

    /// Dequantize into an F32 tensor with the original shape
    pub fn dequantize(&self, tensor: &QuantizedTensor, device: &Device) -> Result<Tensor> {
        tensor.validate()?;
        if tensor.block_size != self.block_size {
            return Err(QuantizationError::InvalidBlockSize { size: tensor.block_size }.into());
        }

        let codes = unpack_ternary(&tensor.data, tensor.numel());
        let mut values = vec![0.0f32; codes.len()];
        values
            .par_chunks_mut(self.block_size)
            .zip(codes.par_chunks(self.block_size))
            .zip(tensor.scales.par_iter())
            .for_each(|((out, code_block), scale)| {
                let scale = scale.to_f32();
                for (v, &q) in out.iter_mut().zip(code_block) {
                    *v = q as f32 * scale;
                }
            });

        Ok(Tensor::from_vec(values, tensor.shape.as_slice(), device)?)
    }
}
