//! Adapter files on disk: decoding, metadata, naming and hard failures.

use std::collections::HashMap;
use std::io::Write;

use candle_core::{DType, Device, Tensor};
use lorapatch_lora::{AdapterSource, LoadStats, LoraManager, SourceOrigin, extract_lora_pairs};
use lorapatch_models::{DenseLinear, Module};
use tempfile::TempDir;

fn model() -> Module {
    let w = Tensor::zeros((8, 4), DType::F32, &Device::Cpu).unwrap();
    let block = Module::block().with("proj", Module::layer(DenseLinear::new(w, None).unwrap()));
    Module::block().with("blocks", Module::list(vec![block]))
}

fn adapter_tensors(dtype: DType) -> Vec<(String, Tensor)> {
    let down = Tensor::ones((2, 4), DType::F32, &Device::Cpu).unwrap().to_dtype(dtype).unwrap();
    let up = Tensor::ones((8, 2), DType::F32, &Device::Cpu).unwrap().to_dtype(dtype).unwrap();
    vec![
        ("unet.blocks.0.proj.lora_down.weight".to_string(), down),
        ("unet.blocks.0.proj.lora_up.weight".to_string(), up),
    ]
}

fn write_safetensors(dir: &TempDir, file: &str, metadata: Option<HashMap<String, String>>) -> std::path::PathBuf {
    let path = dir.path().join(file);
    let tensors = adapter_tensors(DType::F16);
    safetensors::serialize_to_file(tensors.iter().map(|(k, v)| (k.as_str(), v)), &metadata, &path)
        .unwrap();
    path
}

#[test]
fn safetensors_with_metadata_alpha() {
    let dir = TempDir::new().unwrap();
    let metadata = HashMap::from([("ss_network_alpha".to_string(), "1".to_string())]);
    let path = write_safetensors(&dir, "style.safetensors", Some(metadata));

    let source = AdapterSource::from_file(&path).unwrap();
    assert_eq!(source.len(), 2);
    assert_eq!(source.origin(), &SourceOrigin::File(path.clone()));
    assert_eq!(source.default_alpha(), Some(1.0));

    let prefixes = lorapatch_common::LoraConfig::default().known_prefixes;
    let pairs = extract_lora_pairs(&source, None, &prefixes).unwrap();
    assert_eq!(pairs["blocks.0.proj"].alpha, Some(1.0));
}

#[test]
fn file_stem_names_the_adapter_and_half_precision_is_converted() {
    let dir = TempDir::new().unwrap();
    let path = write_safetensors(&dir, "watercolor.safetensors", None);

    let mut manager = LoraManager::with_defaults(model());
    let stats = manager.load_file(&path, Some(0.5), None).unwrap();
    assert_eq!(stats, LoadStats { applied: 1, failed: 0, skipped: 0 });
    assert_eq!(manager.list_names(), vec!["watercolor"]);

    // ones(8,2) @ ones(2,4) = 2, scaled by 0.5 * alpha/rank = 0.5
    let w = manager.model().layer_at("blocks.0.proj").unwrap().weight().unwrap();
    assert!(w.to_vec2::<f32>().unwrap().iter().flatten().all(|v| *v == 1.0));

    let state = manager.get_state("watercolor").unwrap();
    assert_eq!(state.source, path.display().to_string());
}

#[test]
fn candle_saved_file_loads() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("plain.safetensors");
    let tensors: HashMap<String, Tensor> = adapter_tensors(DType::F32).into_iter().collect();
    candle_core::safetensors::save(&tensors, &path).unwrap();

    let source = AdapterSource::from_file(&path).unwrap();
    assert!(source.metadata().is_empty());
    assert_eq!(source.default_name().as_deref(), Some("plain"));
}

#[test]
fn unsupported_extension_is_a_hard_failure() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("adapter.onnx");
    std::fs::write(&path, b"not an adapter").unwrap();

    let mut manager = LoraManager::with_defaults(model());
    let err = manager.load_file(&path, None, None).unwrap_err();
    assert!(err.is_source_failure());
    assert!(manager.list_names().is_empty());
}

#[test]
fn corrupt_safetensors_is_a_hard_failure() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("broken.safetensors");
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(&[0xff; 16]).unwrap();
    drop(file);

    let err = AdapterSource::from_file(&path).unwrap_err();
    assert!(err.is_source_failure());
    assert!(err.to_string().contains("broken.safetensors"));
}

#[test]
fn missing_files_are_io_failures() {
    let err = AdapterSource::from_file("/nonexistent/adapter.safetensors").unwrap_err();
    assert!(err.is_source_failure());
    let err = AdapterSource::from_file("/nonexistent/adapter.pt").unwrap_err();
    assert!(err.is_source_failure());
}
