//! Tensor name parsing for LoRA checkpoints

use serde::Serialize;

/// Reserved name of the model-wide alpha map
pub const NETWORK_ALPHAS: &str = "network_alphas";

/// Which half of a low-rank pair a tensor is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// `[rank, in]`
    Down,
    /// `[out, rank]`
    Up,
}

/// Ordered indicator table; the first indicator found on a boundary wins
const INDICATORS: [(&str, Direction); 8] = [
    ("lora_down", Direction::Down),
    ("lora_A", Direction::Down),
    ("lora.down", Direction::Down),
    ("lora_a", Direction::Down),
    ("lora_up", Direction::Up),
    ("lora_B", Direction::Up),
    ("lora.up", Direction::Up),
    ("lora_b", Direction::Up),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedKey {
    pub base_module_path: String,
    pub direction: Direction,
    pub param_type: String,
}

/// `network_alphas` itself or anything under `network_alphas.`
pub fn is_network_alpha_key(name: &str) -> bool {
    name == NETWORK_ALPHAS
        || name.strip_prefix(NETWORK_ALPHAS).is_some_and(|rest| rest.starts_with('.'))
}

/// Per-path alpha tensors end in an `alpha` segment
pub fn is_alpha_key(name: &str) -> bool {
    name.rsplit('.').next() == Some("alpha")
}

/// Whether the name carries a down/up indicator
pub fn has_indicator(name: &str) -> bool {
    find_indicator(name).is_some()
}

/// Split `name` into module path, direction and parameter type.
///
/// Returns `None` for names without an indicator and for the reserved
/// network alpha map.
pub fn parse_key(name: &str) -> Option<ParsedKey> {
    if is_network_alpha_key(name) {
        return None;
    }
    let (start, indicator, direction) = find_indicator(name)?;

    let base = name[..start].trim_matches(|c| c == '.' || c == '_');
    if base.is_empty() {
        return None;
    }
    let rest = name[start + indicator.len()..].trim_matches('.');
    let param_type = if rest.is_empty() { "weight" } else { rest };

    Some(ParsedKey {
        base_module_path: base.to_string(),
        direction,
        param_type: param_type.to_string(),
    })
}

fn find_indicator(name: &str) -> Option<(usize, &'static str, Direction)> {
    INDICATORS.iter().find_map(|&(indicator, direction)| {
        name.match_indices(indicator)
            .map(|(start, _)| start)
            .find(|&start| on_boundary(name, start, indicator.len()))
            .map(|start| (start, indicator, direction))
    })
}

fn on_boundary(name: &str, start: usize, len: usize) -> bool {
    let before = name[..start].chars().next_back();
    let after = name[start + len..].chars().next();
    matches!(before, None | Some('.') | Some('_')) && matches!(after, None | Some('.'))
}
