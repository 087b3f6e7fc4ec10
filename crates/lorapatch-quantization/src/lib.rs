//! Compressed weight storage for lorapatch layers
//!
//! Weights are stored as 2-bit packed ternary codes with one `f16` scale per
//! block (an I2_S style layout). Layers built on this representation cannot be
//! added to in place; they either take additive patches or dequantize once
//! and cache a merged float view.

use candle_core::Device;
use half::f16;
use lorapatch_common::{QuantizationError, Result};

pub mod i2s;
pub mod utils;

pub use i2s::I2SQuantizer;

/// Quantized tensor: packed ternary codes plus per-block scales
#[derive(Debug, Clone)]
pub struct QuantizedTensor {
    /// Packed 2-bit codes, four per byte
    pub data: Vec<u8>,
    /// One scale per block
    pub scales: Vec<f16>,
    /// Original tensor shape
    pub shape: Vec<usize>,
    /// Elements per scale block
    pub block_size: usize,
}

impl QuantizedTensor {
    /// Number of elements in the original tensor
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Bytes held by the compressed representation
    pub fn memory_bytes(&self) -> usize {
        self.data.len() + self.scales.len() * std::mem::size_of::<f16>()
    }

    /// Compression ratio compared to F32 storage
    pub fn compression_ratio(&self) -> f32 {
        (self.numel() * 4) as f32 / self.memory_bytes().max(1) as f32
    }

    /// Check that the buffers are consistent with the shape
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 || self.block_size % 4 != 0 {
            return Err(QuantizationError::InvalidBlockSize { size: self.block_size }.into());
        }
        let expected = self.numel().div_ceil(4);
        if self.data.len() != expected {
            return Err(
                QuantizationError::CorruptData { expected, actual: self.data.len() }.into()
            );
        }
        let blocks = self.numel().div_ceil(self.block_size);
        if self.scales.len() != blocks {
            return Err(QuantizationError::QuantizationFailed {
                reason: format!("expected {blocks} block scales, got {}", self.scales.len()),
            }
            .into());
        }
        Ok(())
    }

    /// Dequantize into a float tensor on `device`
    pub fn dequantize(&self, device: &Device) -> Result<candle_core::Tensor> {
        I2SQuantizer::with_block_size(self.block_size)?.dequantize(self, device)
    }
}
