//! Utility functions for ternary block quantization

/// Per-block scale: mean absolute value, floored so all-zero blocks stay finite
pub fn absmean_scale(block: &[f32]) -> f32 {
    if block.is_empty() {
        return 1.0;
    }
    let mean = block.iter().map(|x| x.abs()).sum::<f32>() / block.len() as f32;
    if mean > f32::EPSILON { mean } else { 1.0 }
}

/// Scales for consecutive blocks of `block_size` elements
pub fn calculate_block_scales(data: &[f32], block_size: usize) -> Vec<f32> {
    data.chunks(block_size).map(absmean_scale).collect()
}

/// Round `value / scale` into the ternary set {-1, 0, 1}
pub fn quantize_ternary(value: f32, scale: f32) -> i8 {
    (value / scale).round().clamp(-1.0, 1.0) as i8
}

/// Pack ternary codes, four per byte, low bits first. Code `q` is stored as `q + 1`.
pub fn pack_ternary(codes: &[i8]) -> Vec<u8> {
    codes
        .chunks(4)
        .map(|chunk| {
            chunk
                .iter()
                .enumerate()
                .fold(0u8, |byte, (i, &q)| byte | (((q.clamp(-1, 1) + 1) as u8) << (i * 2)))
        })
        .collect()
}

/// Inverse of [`pack_ternary`]; stops after `len` codes
pub fn unpack_ternary(packed: &[u8], len: usize) -> Vec<i8> {
    packed
        .iter()
        .flat_map(|&byte| (0..4).map(move |i| ((byte >> (i * 2)) & 0b11) as i8 - 1))
        .take(len)
        .collect()
}
