//! Property tests for delta computation and shape-checked application.
//!
//! Invariants:
//! - alpha == rank with scale 1 yields exactly `up @ down`
//! - the delta is linear in `scale`
//! - a patch whose shape disagrees with the target fails and leaves the
//!   target weight bit-for-bit unchanged, for every layer kind

use candle_core::{Device, Tensor};
use lorapatch_models::{
    AdditiveLinear, DenseLinear, Layer, LowRankPatch, QuantizedLinear, compute_delta,
};
use proptest::prelude::*;

fn int_matrix(rows: usize, cols: usize) -> impl Strategy<Value = Tensor> {
    prop::collection::vec(-3i32..=3, rows * cols).prop_map(move |v| {
        let data: Vec<f32> = v.into_iter().map(|x| x as f32).collect();
        Tensor::from_vec(data, (rows, cols), &Device::Cpu).unwrap()
    })
}

/// (down[rank, in], up[out, rank])
fn pair() -> impl Strategy<Value = (Tensor, Tensor)> {
    (1usize..5, 1usize..7, 1usize..7)
        .prop_flat_map(|(rank, inp, out)| (int_matrix(rank, inp), int_matrix(out, rank)))
}

fn bits(t: &Tensor) -> Vec<u32> {
    t.flatten_all().unwrap().to_vec1::<f32>().unwrap().into_iter().map(f32::to_bits).collect()
}

proptest! {
    #[test]
    fn alpha_equal_to_rank_cancels((down, up) in pair()) {
        let rank = down.dims()[0];
        let delta = compute_delta(&down, &up, Some(rank as f32), None, 1.0).unwrap();
        let expected = up.matmul(&down).unwrap();
        prop_assert_eq!(delta.to_vec2::<f32>().unwrap(), expected.to_vec2::<f32>().unwrap());
    }

    #[test]
    fn delta_scales_linearly((down, up) in pair(), scale in prop::sample::select(vec![0.0f32, 0.5, 2.0, -1.0])) {
        let base = compute_delta(&down, &up, None, None, 1.0).unwrap().to_vec2::<f32>().unwrap();
        let scaled = compute_delta(&down, &up, None, None, scale).unwrap().to_vec2::<f32>().unwrap();
        for (row_b, row_s) in base.iter().zip(&scaled) {
            for (b, s) in row_b.iter().zip(row_s) {
                prop_assert!((b * scale - s).abs() < 1e-4);
            }
        }
    }

    #[test]
    fn mismatched_patch_leaves_dense_weight_untouched(
        (down, up) in pair(),
        weight in int_matrix(4, 4),
    ) {
        prop_assume!(up.dims()[0] != 4 || down.dims()[1] != 4);
        let mut layer = DenseLinear::new(weight.clone(), None).unwrap();
        let result = layer.apply_delta(&LowRankPatch::new("p", down, up));
        prop_assert!(result.is_err());
        prop_assert_eq!(bits(&layer.weight().unwrap()), bits(&weight));
    }

    #[test]
    fn mismatched_patch_leaves_compressed_layers_untouched(
        (down, up) in pair(),
        weight in int_matrix(4, 8),
    ) {
        prop_assume!(up.dims()[0] != 4 || down.dims()[1] != 8);
        let patch = LowRankPatch::new("p", down, up);

        let mut merged = QuantizedLinear::from_float(&weight, None).unwrap();
        let before = bits(&merged.weight().unwrap());
        prop_assert!(merged.apply_delta(&patch).is_err());
        prop_assert!(!merged.is_merged());
        prop_assert_eq!(bits(&merged.weight().unwrap()), before);

        let mut additive = AdditiveLinear::from_float(&weight, None).unwrap();
        prop_assert!(additive.apply_delta(&patch).is_err());
        prop_assert!(additive.patches().unwrap().is_empty());
    }
}
