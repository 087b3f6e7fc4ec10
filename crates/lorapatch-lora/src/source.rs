//! Adapter sources: in-memory maps or decoded checkpoint files

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use crate::keys::{NETWORK_ALPHAS, is_network_alpha_key};
use candle_core::{DType, Device, Tensor};
use lorapatch_common::{Result, SourceError};
use memmap2::Mmap;
use tracing::{debug, info};

/// Metadata keys holding a default alpha, in lookup order
const DEFAULT_ALPHA_KEYS: [&str; 3] = ["lora_alpha", "alpha", "ss_network_alpha"];

/// Container formats recognized by extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterFormat {
    SafeTensors,
    /// Pickled state dict (`.pt`, `.pth`, `.bin`, `.ckpt`)
    Pickle,
}

impl AdapterFormat {
    pub fn from_path(path: &Path) -> Result<Self> {
        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
        match extension.to_lowercase().as_str() {
            "safetensors" => Ok(Self::SafeTensors),
            "pt" | "pth" | "bin" | "ckpt" => Ok(Self::Pickle),
            _ => Err(SourceError::UnsupportedFormat { path: path.display().to_string() }.into()),
        }
    }
}

/// Where a source came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceOrigin {
    Memory,
    File(PathBuf),
}

impl std::fmt::Display for SourceOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Memory => f.write_str("<memory>"),
            Self::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Tensor name to tensor map plus optional string metadata
#[derive(Debug, Clone)]
pub struct AdapterSource {
    tensors: BTreeMap<String, Tensor>,
    metadata: BTreeMap<String, String>,
    origin: SourceOrigin,
}

impl AdapterSource {
    pub fn from_tensors(tensors: impl IntoIterator<Item = (String, Tensor)>) -> Self {
        Self {
            tensors: tensors.into_iter().collect(),
            metadata: BTreeMap::new(),
            origin: SourceOrigin::Memory,
        }
    }

    pub fn with_metadata(mut self, metadata: impl IntoIterator<Item = (String, String)>) -> Self {
        self.metadata.extend(metadata);
        self
    }

    /// Decode a checkpoint file, picking the decoder by extension.
    ///
    /// Tensors are loaded on the CPU; they are moved to the model's device
    /// when applied.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let format = AdapterFormat::from_path(path)?;
        let decode = |e: &dyn std::fmt::Display| SourceError::Decode {
            path: path.display().to_string(),
            reason: e.to_string(),
        };

        let (tensors, metadata): (BTreeMap<String, Tensor>, BTreeMap<String, String>) = match format {
            AdapterFormat::SafeTensors => {
                let file = File::open(path)?;
                // SAFETY: read-only mapping, dropped before this function returns
                let mmap = unsafe { Mmap::map(&file) }?;
                let tensors =
                    candle_core::safetensors::load_buffer(&mmap, &Device::Cpu).map_err(|e| decode(&e))?;
                let (_, header) =
                    safetensors::SafeTensors::read_metadata(&mmap).map_err(|e| decode(&e))?;
                let metadata = header.metadata().clone().unwrap_or_default();
                (tensors.into_iter().collect(), metadata.into_iter().collect())
            }
            AdapterFormat::Pickle => {
                if !path.exists() {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("{} not found", path.display()),
                    )
                    .into());
                }
                let tensors = candle_core::pickle::read_all(path).map_err(|e| decode(&e))?;
                (tensors.into_iter().collect(), BTreeMap::new())
            }
        };

        info!(
            path = %path.display(),
            tensors = tensors.len(),
            metadata_keys = metadata.len(),
            "decoded adapter source"
        );
        Ok(Self { tensors, metadata, origin: SourceOrigin::File(path.to_path_buf()) })
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    /// Tensors in name order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.tensors.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    pub fn origin(&self) -> &SourceOrigin {
        &self.origin
    }

    /// File stem for file sources
    pub fn default_name(&self) -> Option<String> {
        match &self.origin {
            SourceOrigin::File(path) => {
                path.file_stem().and_then(|s| s.to_str()).map(str::to_string)
            }
            SourceOrigin::Memory => None,
        }
    }

    /// Alpha applying to every pair without a more specific one
    pub fn default_alpha(&self) -> Option<f32> {
        DEFAULT_ALPHA_KEYS.iter().find_map(|key| {
            let raw = self.metadata.get(*key)?;
            match raw.trim().parse::<f32>() {
                Ok(alpha) if alpha.is_finite() => Some(alpha),
                _ => {
                    debug!(key = *key, value = %raw, "ignoring non-numeric alpha metadata");
                    None
                }
            }
        })
    }

    /// Model-wide alpha map, from `network_alphas.<path>` tensors and the
    /// `network_alphas` metadata entry. Tensor entries win on conflict.
    pub fn network_alphas(&self) -> Result<BTreeMap<String, f32>> {
        let mut alphas = BTreeMap::new();

        if let Some(raw) = self.metadata.get(NETWORK_ALPHAS) {
            let parsed: BTreeMap<String, f32> = serde_json::from_str(raw).map_err(|e| {
                SourceError::Metadata { reason: format!("{NETWORK_ALPHAS}: {e}") }
            })?;
            alphas.extend(parsed);
        }

        for (name, tensor) in self.iter().filter(|(name, _)| is_network_alpha_key(name)) {
            let Some(path) = name.strip_prefix(NETWORK_ALPHAS).and_then(|p| p.strip_prefix('.'))
            else {
                continue;
            };
            match scalar_value(tensor) {
                Some(alpha) => {
                    alphas.insert(path.to_string(), alpha);
                }
                None => debug!(tensor = name, "ignoring non-scalar network alpha"),
            }
        }
        Ok(alphas)
    }
}

/// Value of a one-element tensor of any float or integer dtype
pub(crate) fn scalar_value(tensor: &Tensor) -> Option<f32> {
    if tensor.elem_count() != 1 {
        return None;
    }
    let values = tensor.to_dtype(DType::F32).ok()?.flatten_all().ok()?.to_vec1::<f32>().ok()?;
    values.first().copied()
}
