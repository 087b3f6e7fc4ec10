//! Tensor helpers shared by layers and the adapter loader

use crate::{LayerError, Result};
use candle_core::{DType, Device, Tensor};

/// Normalize an adapter tensor into an F32 matrix on `device`.
///
/// Convolution-style LoRA weights `[a, b, 1, 1]` are squeezed to `[a, b]`.
/// Anything that is not a matrix after squeezing is rejected.
pub fn to_f32_matrix(tensor: &Tensor, device: &Device) -> Result<Tensor> {
    let tensor = match tensor.dims() {
        [_, _] => tensor.clone(),
        [a, b, 1, 1] => tensor.reshape((*a, *b))?,
        dims => {
            return Err(LayerError::ShapeMismatch {
                expected: vec![0, 0],
                actual: dims.to_vec(),
            }
            .into());
        }
    };

    let tensor = if tensor.dtype() != DType::F32 { tensor.to_dtype(DType::F32)? } else { tensor };

    let tensor =
        if !tensor.device().same_device(device) { tensor.to_device(device)? } else { tensor };

    Ok(tensor)
}

/// `(rows, cols)` of a rank-2 tensor, as a layer error when it is not one
pub fn as_matrix(tensor: &Tensor) -> Result<(usize, usize)> {
    match tensor.dims() {
        [rows, cols] => Ok((*rows, *cols)),
        dims => Err(LayerError::ShapeMismatch { expected: vec![0, 0], actual: dims.to_vec() }.into()),
    }
}

/// Largest absolute element-wise difference between two same-shaped tensors
pub fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    if a.dims() != b.dims() {
        return Err(
            LayerError::ShapeMismatch { expected: a.dims().to_vec(), actual: b.dims().to_vec() }
                .into(),
        );
    }
    let diff = (a - b)?.abs()?.flatten_all()?.max(0)?.to_dtype(DType::F32)?;
    Ok(diff.to_scalar::<f32>()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn squeezes_conv_style_weights() {
        let t = Tensor::ones((4, 3, 1, 1), DType::F16, &Device::Cpu).unwrap();
        let m = to_f32_matrix(&t, &Device::Cpu).unwrap();
        assert_eq!(m.dims(), &[4, 3]);
        assert_eq!(m.dtype(), DType::F32);
    }

    #[test]
    fn rejects_vectors() {
        let t = Tensor::ones(5, DType::F32, &Device::Cpu).unwrap();
        assert!(to_f32_matrix(&t, &Device::Cpu).is_err());
        assert!(as_matrix(&t).is_err());
    }

    #[test]
    fn max_abs_diff_reports_largest_gap() {
        let a = Tensor::new(&[[1.0f32, 2.0], [3.0, 4.0]], &Device::Cpu).unwrap();
        let b = Tensor::new(&[[1.0f32, 2.5], [3.0, 3.0]], &Device::Cpu).unwrap();
        assert_eq!(max_abs_diff(&a, &b).unwrap(), 1.0);
    }
}
