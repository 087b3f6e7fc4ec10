//! End-to-end adapter lifecycle against small models with exact values.

use candle_core::{Device, Tensor};
use lorapatch_common::LoraConfig;
use lorapatch_lora::{AdapterSource, LoadStats, LoraManager};
use lorapatch_models::{AdditiveLinear, DenseLinear, Module};

const H: usize = 4;

fn dev() -> Device {
    Device::Cpu
}

fn mat(rows: usize, cols: usize, f: impl Fn(usize, usize) -> f32) -> Tensor {
    let data: Vec<f32> = (0..rows * cols).map(|i| f(i / cols, i % cols)).collect();
    Tensor::from_vec(data, (rows, cols), &dev()).unwrap()
}

fn dense(out: usize, inp: usize) -> Module {
    Module::layer(DenseLinear::new(mat(out, inp, |r, c| (r + c) as f32), None).unwrap())
}

fn additive(out: usize, inp: usize) -> Module {
    let w = mat(out, inp, |r, c| if (r + c) % 2 == 0 { 1.0 } else { -1.0 });
    Module::layer(AdditiveLinear::from_float(&w, None).unwrap())
}

/// `blocks.0.proj` (8x4) plus an attention block with a fused qkv (3H x H)
fn model(make: fn(usize, usize) -> Module) -> Module {
    let attn = Module::block().with("qkv", make(3 * H, H)).with("proj", make(H, H));
    let block = Module::block().with("proj", make(8, 4)).with("attn", attn);
    Module::block().with("blocks", Module::list(vec![block]))
}

fn down() -> Tensor {
    mat(2, 4, |r, c| if r == 0 { c as f32 } else { 1.0 - c as f32 })
}

fn up(out: usize) -> Tensor {
    mat(out, 2, |r, c| if c == 0 { 1.0 } else { r as f32 - 2.0 })
}

fn pair_source(path: &str, out: usize) -> AdapterSource {
    AdapterSource::from_tensors([
        (format!("{path}.lora_down.weight"), down()),
        (format!("{path}.lora_up.weight"), up(out)),
    ])
}

fn weight_at(manager: &LoraManager, path: &str) -> Vec<Vec<f32>> {
    manager.model().layer_at(path).unwrap().weight().unwrap().to_vec2::<f32>().unwrap()
}

fn forward_at(manager: &LoraManager, path: &str, x: &Tensor) -> Vec<Vec<f32>> {
    manager.model().layer_at(path).unwrap().forward(x).unwrap().to_vec2::<f32>().unwrap()
}

fn record_names(manager: &LoraManager) -> Vec<String> {
    let mut names = Vec::new();
    manager.model().visit_layers(|_, layer| {
        if let Some(patches) = layer.patches() {
            names.extend(patches.names().map(str::to_string));
        }
    });
    names
}

#[test]
fn dense_layer_gains_exactly_up_times_down() {
    let mut manager = LoraManager::with_defaults(model(dense));
    let before = weight_at(&manager, "blocks.0.proj");

    let source = pair_source("blocks.0.proj", 8)
        .with_metadata([("lora_alpha".to_string(), "2".to_string())]);
    let stats = manager.load(&source, Some(1.0), Some("style")).unwrap();
    assert_eq!(stats, LoadStats { applied: 1, failed: 0, skipped: 0 });

    let product = up(8).matmul(&down()).unwrap().to_vec2::<f32>().unwrap();
    let after = weight_at(&manager, "blocks.0.proj");
    for r in 0..8 {
        for c in 0..4 {
            assert_eq!(after[r][c], before[r][c] + product[r][c]);
        }
    }
    assert_eq!(manager.get_state("style").unwrap().merged_layers, 1);
}

#[test]
fn down_only_source_skips_every_key() {
    let mut manager = LoraManager::with_defaults(model(dense));
    let source = AdapterSource::from_tensors([(
        "blocks.0.proj.lora_down.weight".to_string(),
        down(),
    )]);
    let stats = manager.load(&source, None, Some("half")).unwrap();
    assert_eq!(stats, LoadStats { applied: 0, failed: 0, skipped: source.len() });
    assert!(manager.is_loaded("half"));
}

#[test]
fn mixed_outcomes_are_counted_per_path() {
    let mut manager = LoraManager::with_defaults(model(dense));
    let source = AdapterSource::from_tensors([
        ("blocks.0.proj.lora_down.weight".to_string(), down()),
        ("blocks.0.proj.lora_up.weight".to_string(), up(8)),
        ("blocks.0.attn.proj.lora_down.weight".to_string(), down()),
        ("blocks.0.attn.proj.lora_up.weight".to_string(), up(7)),
        ("blocks.0.mlp.fc1.lora_down.weight".to_string(), down()),
        ("blocks.0.mlp.fc1.lora_up.weight".to_string(), up(8)),
        ("text_encoder.layers.0.q_proj.lora_down.weight".to_string(), down()),
        ("text_encoder.layers.0.q_proj.lora_up.weight".to_string(), up(8)),
    ]);
    let stats = manager.load(&source, None, Some("mixed")).unwrap();
    assert_eq!(stats, LoadStats { applied: 1, failed: 1, skipped: 2 });
}

#[test]
fn disable_then_enable_restores_identical_output() {
    let mut manager = LoraManager::with_defaults(model(additive));
    let x = mat(3, 4, |r, c| (r * 4 + c) as f32 * 0.25);
    let base = forward_at(&manager, "blocks.0.proj", &x);

    manager.load(&pair_source("blocks.0.proj", 8), None, Some("style")).unwrap();
    let patched = forward_at(&manager, "blocks.0.proj", &x);
    assert_ne!(patched, base);

    assert!(manager.set_enabled("style", false));
    assert_eq!(forward_at(&manager, "blocks.0.proj", &x), base);
    assert!(!manager.get_state("style").unwrap().enabled);

    assert!(manager.set_enabled("style", true));
    assert_eq!(forward_at(&manager, "blocks.0.proj", &x), patched);
}

#[test]
fn zero_scale_removes_contribution_but_keeps_adapter() {
    let mut manager = LoraManager::with_defaults(model(additive));
    let x = mat(2, 4, |r, c| (r + c) as f32);
    let base = forward_at(&manager, "blocks.0.proj", &x);

    manager.load(&pair_source("blocks.0.proj", 8), Some(1.5), Some("style")).unwrap();
    assert!(manager.set_scale("style", 0.0));

    let out = forward_at(&manager, "blocks.0.proj", &x);
    for (a, b) in out.iter().flatten().zip(base.iter().flatten()) {
        assert!((a - b).abs() < 1e-5);
    }
    let state = manager.get_state("style").unwrap();
    assert!(state.enabled);
    assert_eq!(state.scale, 0.0);
    assert_eq!(manager.list_names(), vec!["style"]);
}

#[test]
fn remove_clears_records_including_slices() {
    let mut manager = LoraManager::with_defaults(model(additive));
    let source = AdapterSource::from_tensors([
        ("blocks.0.attn.to_q.lora_down.weight".to_string(), down()),
        ("blocks.0.attn.to_q.lora_up.weight".to_string(), up(H)),
        ("blocks.0.attn.to_v.lora_down.weight".to_string(), down()),
        ("blocks.0.attn.to_v.lora_up.weight".to_string(), up(H)),
        ("blocks.0.proj.lora_down.weight".to_string(), down()),
        ("blocks.0.proj.lora_up.weight".to_string(), up(8)),
    ]);
    let stats = manager.load(&source, None, Some("style")).unwrap();
    assert_eq!(stats.applied, 3);
    assert_eq!(record_names(&manager), vec!["style_q", "style_v", "style"]);

    assert!(manager.set_enabled("style", false));
    assert!(manager.remove("style"));
    assert!(manager.list_names().is_empty());
    assert!(record_names(&manager).is_empty());
    assert!(!manager.remove("style"));
}

#[test]
fn query_adapter_leaves_key_and_value_rows_of_fused_weight() {
    let mut manager = LoraManager::with_defaults(model(dense));
    let before = weight_at(&manager, "blocks.0.attn.qkv");

    let stats = manager.load(&pair_source("blocks.0.attn.to_q", H), None, Some("q")).unwrap();
    assert_eq!(stats.applied, 1);

    let after = weight_at(&manager, "blocks.0.attn.qkv");
    assert_eq!(after[H..], before[H..]);
    assert_ne!(after[..H], before[..H]);
}

#[test]
fn output_projection_suffix_targets_proj() {
    let mut manager = LoraManager::with_defaults(model(dense));
    let before = weight_at(&manager, "blocks.0.attn.proj");
    let source = AdapterSource::from_tensors([
        ("blocks.0.attn.to_out.0.lora_down.weight".to_string(), down()),
        ("blocks.0.attn.to_out.0.lora_up.weight".to_string(), up(H)),
    ]);
    assert_eq!(manager.load(&source, None, None).unwrap().applied, 1);
    assert_ne!(weight_at(&manager, "blocks.0.attn.proj"), before);
}

#[test]
fn reload_replaces_instead_of_stacking() {
    let mut manager = LoraManager::with_defaults(model(additive));
    let x = mat(1, 4, |_, c| c as f32);
    manager.load(&pair_source("blocks.0.proj", 8), None, Some("style")).unwrap();
    let once = forward_at(&manager, "blocks.0.proj", &x);

    manager.load(&pair_source("blocks.0.proj", 8), None, Some("style")).unwrap();
    assert_eq!(forward_at(&manager, "blocks.0.proj", &x), once);
    assert_eq!(record_names(&manager), vec!["style"]);
}

#[test]
fn reload_of_merged_adapter_is_rejected_without_stacking() {
    let mut manager = LoraManager::with_defaults(model(dense));
    manager.load(&pair_source("blocks.0.proj", 8), None, Some("style")).unwrap();
    let once = weight_at(&manager, "blocks.0.proj");

    let err = manager.load(&pair_source("blocks.0.proj", 8), None, Some("style")).unwrap_err();
    assert!(matches!(err, lorapatch_common::LoraError::Validation(_)));
    assert_eq!(weight_at(&manager, "blocks.0.proj"), once);
    assert_eq!(manager.list_names(), vec!["style"]);
    assert_eq!(manager.get_state("style").unwrap().merged_layers, 1);
}

#[test]
fn two_paths_onto_one_additive_layer_count_one_failure() {
    let mut manager = LoraManager::with_defaults(model(additive));
    let x = mat(1, 4, |_, c| c as f32);
    manager.load(&pair_source("blocks.0.attn.proj", H), None, Some("single")).unwrap();
    let single = forward_at(&manager, "blocks.0.attn.proj", &x);
    manager.remove("single");

    let source = AdapterSource::from_tensors([
        ("blocks.0.attn.proj.lora_down.weight".to_string(), down()),
        ("blocks.0.attn.proj.lora_up.weight".to_string(), up(H)),
        ("blocks.0.attn.to_out.0.lora_down.weight".to_string(), down()),
        ("blocks.0.attn.to_out.0.lora_up.weight".to_string(), up(H)),
    ]);
    let stats = manager.load(&source, None, Some("style")).unwrap();
    assert_eq!(stats, LoadStats { applied: 1, failed: 1, skipped: 0 });
    assert_eq!(record_names(&manager), vec!["style"]);
    assert_eq!(forward_at(&manager, "blocks.0.attn.proj", &x), single);
}

#[test]
fn merged_adapters_cannot_be_undone_by_remove() {
    let mut manager = LoraManager::with_defaults(model(dense));
    manager.load(&pair_source("blocks.0.proj", 8), None, Some("style")).unwrap();
    let merged = weight_at(&manager, "blocks.0.proj");

    assert!(!manager.remove("style"));
    assert!(!manager.is_loaded("style"));
    assert_eq!(weight_at(&manager, "blocks.0.proj"), merged);
}

#[test]
fn set_all_and_remove_all() {
    let mut manager = LoraManager::with_defaults(model(additive));
    manager.load(&pair_source("blocks.0.proj", 8), None, Some("a")).unwrap();
    manager.load(&pair_source("blocks.0.attn.proj", H), None, Some("b")).unwrap();

    manager.set_all_enabled(false);
    assert!(manager.list_names().iter().all(|n| !manager.get_state(n).unwrap().enabled));

    assert_eq!(manager.remove_all(), 2);
    assert!(manager.list_names().is_empty());
    assert!(record_names(&manager).is_empty());
}

#[test]
fn unknown_names_report_false() {
    let mut manager = LoraManager::with_defaults(model(additive));
    assert!(!manager.set_enabled("ghost", true));
    assert!(!manager.set_scale("ghost", 2.0));
    assert!(!manager.remove("ghost"));
    assert!(manager.get_state("ghost").is_none());
}

#[test]
fn configured_fused_names_are_used() {
    let attn = Module::block().with("in_proj", dense(3 * H, H));
    let model = Module::block().with("attn", attn);
    let config = LoraConfig { fused_qkv_name: "in_proj".to_string(), ..LoraConfig::default() };
    let mut manager = LoraManager::new(model, config).unwrap();
    let stats = manager.load(&pair_source("attn.k_proj", H), None, None).unwrap();
    assert_eq!(stats.applied, 1);
}
