//! A low-rank patch on its way into a layer

use std::ops::Range;

use crate::delta::{compute_delta, pad_rows};
use candle_core::Tensor;
use lorapatch_common::{LayerError, Result, as_matrix};

/// Row range of one logical projection inside a fused q/k/v matrix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceSpec {
    /// 0 = query, 1 = key, 2 = value
    pub index: usize,
    /// Rows per projection
    pub size: usize,
    /// Rows of the fused matrix
    pub total: usize,
}

impl SliceSpec {
    /// Slice `index` of a fused matrix with `total` output rows, if it splits evenly
    pub fn new(index: usize, total: usize) -> Option<Self> {
        (index < 3 && total > 0 && total % 3 == 0).then_some(Self { index, size: total / 3, total })
    }

    pub fn rows(&self) -> Range<usize> {
        self.index * self.size..(self.index + 1) * self.size
    }

    /// `_q`, `_k` or `_v`
    pub fn suffix(&self) -> &'static str {
        crate::registry::SLICE_SUFFIXES[self.index.min(2)]
    }
}

/// A named `down`/`up` pair with its scaling, ready to hand to [`crate::Layer::apply_delta`]
#[derive(Debug, Clone)]
pub struct LowRankPatch {
    /// Physical record name (already carries the slice suffix when sliced)
    pub name: String,
    /// `[rank, in]`
    pub down: Tensor,
    /// `[out, rank]`, or `[slice, rank]` when `slice` is set
    pub up: Tensor,
    pub alpha: Option<f32>,
    pub scale: f32,
    pub slice: Option<SliceSpec>,
}

impl LowRankPatch {
    pub fn new(name: impl Into<String>, down: Tensor, up: Tensor) -> Self {
        Self { name: name.into(), down, up, alpha: None, scale: 1.0, slice: None }
    }

    pub fn with_alpha(mut self, alpha: Option<f32>) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn with_scale(mut self, scale: f32) -> Self {
        self.scale = scale;
        self
    }

    pub fn with_slice(mut self, slice: SliceSpec) -> Self {
        self.slice = Some(slice);
        self
    }

    pub fn rank(&self) -> usize {
        self.down.dims().first().copied().unwrap_or(0)
    }

    /// Check this patch against a target weight of shape `[out, in]`.
    ///
    /// Compares `[up.rows, down.cols]` with `[out, in]`, or with
    /// `[slice.size, in]` for a sliced patch.
    pub fn check_shape(&self, out_features: usize, in_features: usize) -> Result<()> {
        let (down_rows, down_cols) = as_matrix(&self.down)?;
        let (up_rows, up_cols) = as_matrix(&self.up)?;
        if down_rows != up_cols {
            return Err(LayerError::RankMismatch { down: down_rows, up: up_cols }.into());
        }

        let expected_rows = match self.slice {
            Some(slice) if slice.total != out_features => {
                return Err(LayerError::ShapeMismatch {
                    expected: vec![out_features, in_features],
                    actual: vec![slice.total, down_cols],
                }
                .into());
            }
            Some(slice) => slice.size,
            None => out_features,
        };

        if up_rows != expected_rows || down_cols != in_features {
            return Err(LayerError::ShapeMismatch {
                expected: vec![expected_rows, in_features],
                actual: vec![up_rows, down_cols],
            }
            .into());
        }
        Ok(())
    }

    /// Full-height delta for the target weight
    pub fn delta(&self) -> Result<Tensor> {
        let delta = compute_delta(&self.down, &self.up, self.alpha, None, self.scale)?;
        match self.slice {
            Some(slice) => pad_rows(&delta, slice),
            None => Ok(delta),
        }
    }

    /// `up` padded to the full fused height, for layers that keep `down`/`up` separately
    pub fn full_up(&self) -> Result<Tensor> {
        match self.slice {
            Some(slice) => pad_rows(&self.up, slice),
            None => Ok(self.up.clone()),
        }
    }
}
