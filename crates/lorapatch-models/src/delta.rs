//! Low-rank weight delta computation

use crate::patch::SliceSpec;
use candle_core::Tensor;
use lorapatch_common::{LayerError, Result, as_matrix};

/// `scale * alpha / rank`, with `alpha` defaulting to `rank`
pub fn effective_scale(alpha: Option<f32>, rank: usize, scale: f32) -> f32 {
    if rank == 0 {
        return 0.0;
    }
    let rank = rank as f32;
    scale * alpha.unwrap_or(rank) / rank
}

/// Compute `effective_scale * (up @ down)`.
///
/// `rank` defaults to the number of rows in `down`. The result has shape
/// `[up.rows, down.cols]`; callers check it against the target themselves.
pub fn compute_delta(
    down: &Tensor,
    up: &Tensor,
    alpha: Option<f32>,
    rank: Option<usize>,
    scale: f32,
) -> Result<Tensor> {
    let (down_rows, _) = as_matrix(down)?;
    let (_, up_cols) = as_matrix(up)?;
    if down_rows != up_cols || down_rows == 0 {
        return Err(LayerError::RankMismatch { down: down_rows, up: up_cols }.into());
    }

    let factor = effective_scale(alpha, rank.unwrap_or(down_rows), scale);
    let product = up.matmul(down)?;
    if factor == 1.0 {
        return Ok(product);
    }
    Ok(product.affine(factor as f64, 0.0)?)
}

/// Zero-pad a slice-height matrix to the full fused height so that only the
/// rows of `slice` are populated.
pub fn pad_rows(tensor: &Tensor, slice: SliceSpec) -> Result<Tensor> {
    let (rows, cols) = as_matrix(tensor)?;
    if rows != slice.size || slice.total != slice.size * 3 || slice.index > 2 {
        return Err(LayerError::ShapeMismatch {
            expected: vec![slice.size, cols],
            actual: vec![rows, cols],
        }
        .into());
    }

    let before = slice.index * slice.size;
    let after = slice.total - before - slice.size;
    let mut parts = Vec::with_capacity(3);
    if before > 0 {
        parts.push(Tensor::zeros((before, cols), tensor.dtype(), tensor.device())?);
    }
    parts.push(tensor.clone());
    if after > 0 {
        parts.push(Tensor::zeros((after, cols), tensor.dtype(), tensor.device())?);
    }
    Ok(Tensor::cat(&parts, 0)?)
}
