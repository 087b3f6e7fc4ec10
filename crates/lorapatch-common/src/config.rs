//! Engine configuration with TOML, environment variable, and default sources.

use std::path::Path;
use std::{env, fs};

use candle_core::Device;
use serde::{Deserialize, Serialize};

// ── Errors ──────────────────────────────────────────────────────────

/// Errors produced by configuration loading or validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("invalid environment variable value for {key}: {value}")]
    InvalidEnvVar { key: String, value: String },
}

// ── TOML wrapper ────────────────────────────────────────────────────

/// Wrapper used for the `[lora]` table in TOML files.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TomlWrapper {
    lora: LoraConfig,
}

// ── LoraConfig ──────────────────────────────────────────────────────

/// Configuration for adapter parsing, resolution and lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoraConfig {
    /// Scale used when a load call does not pass one
    pub default_scale: f32,
    /// Shared key prefixes that are detected and stripped from tensor names
    pub known_prefixes: Vec<String>,
    /// First path segments that address a text-encoder component
    pub text_encoder_roots: Vec<String>,
    /// Name of the module holding the fused query/key/value projection
    pub fused_qkv_name: String,
    /// Name the output-projection suffix is rewritten to on fallback
    pub fused_out_name: String,
    /// Remove stale records before re-loading an adapter under a used name
    pub replace_on_reload: bool,
    /// Run the device memory reclamation pass after removals
    pub reclaim_memory: bool,
    /// Target device: `cpu` or `cuda:<ordinal>`
    pub device: String,
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self {
            default_scale: 1.0,
            known_prefixes: [
                "base_model.model.",
                "unet.",
                "transformer.",
                "model.diffusion_model.",
                "diffusion_model.",
            ]
            .map(String::from)
            .to_vec(),
            text_encoder_roots: [
                "text_encoder",
                "text_encoder_2",
                "text_model",
                "cond_stage_model",
                "te",
                "te1",
                "te2",
            ]
            .map(String::from)
            .to_vec(),
            fused_qkv_name: "qkv".to_string(),
            fused_out_name: "proj".to_string(),
            replace_on_reload: true,
            reclaim_memory: true,
            device: "cpu".to_string(),
        }
    }
}

impl LoraConfig {
    // ── Constructors ────────────────────────────────────────────

    /// Load configuration from a TOML file at `path`.
    ///
    /// The file is expected to contain a `[lora]` table. If the file
    /// does not exist, returns `Ok(Self::default())`.
    pub fn from_toml(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::warn!("Config file not found: {}; using defaults", path.display());
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)?;
        let wrapper: TomlWrapper = toml::from_str(&text)?;
        wrapper.lora.validate()?;
        Ok(wrapper.lora)
    }

    /// Serialize to a TOML string (wrapped in `[lora]`).
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        let wrapper = TomlWrapper { lora: self.clone() };
        Ok(toml::to_string_pretty(&wrapper)?)
    }

    /// Apply `LORAPATCH_*` environment overrides on top of `self`.
    pub fn with_env_overrides(mut self) -> Result<Self, ConfigError> {
        if let Ok(v) = env::var("LORAPATCH_DEFAULT_SCALE") {
            self.default_scale = v.parse().map_err(|_| ConfigError::InvalidEnvVar {
                key: "LORAPATCH_DEFAULT_SCALE".to_string(),
                value: v.clone(),
            })?;
        }
        if let Ok(v) = env::var("LORAPATCH_DEVICE") {
            self.device = v;
        }
        if let Ok(v) = env::var("LORAPATCH_REPLACE_ON_RELOAD") {
            self.replace_on_reload = Self::parse_env_bool("LORAPATCH_REPLACE_ON_RELOAD", &v)?;
        }
        if let Ok(v) = env::var("LORAPATCH_RECLAIM_MEMORY") {
            self.reclaim_memory = Self::parse_env_bool("LORAPATCH_RECLAIM_MEMORY", &v)?;
        }
        self.validate()?;
        Ok(self)
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_env_overrides()
    }

    // ── Validation ──────────────────────────────────────────────

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.default_scale.is_finite() {
            return Err(ConfigError::Validation(format!(
                "default_scale must be finite, got {}",
                self.default_scale
            )));
        }
        if self.fused_qkv_name.is_empty() || self.fused_qkv_name.contains('.') {
            return Err(ConfigError::Validation(format!(
                "fused_qkv_name must be a single path segment, got '{}'",
                self.fused_qkv_name
            )));
        }
        if self.fused_out_name.is_empty() {
            return Err(ConfigError::Validation("fused_out_name must not be empty".to_string()));
        }
        if let Some(prefix) = self.known_prefixes.iter().find(|p| p.is_empty()) {
            return Err(ConfigError::Validation(format!("empty known prefix: '{prefix}'")));
        }
        self.parse_device()?;
        Ok(())
    }

    /// Resolve the configured device string into a candle device.
    pub fn device(&self) -> Result<Device, ConfigError> {
        match self.parse_device()? {
            None => Ok(Device::Cpu),
            Some(ordinal) => Device::new_cuda(ordinal)
                .map_err(|e| ConfigError::Validation(format!("cuda:{ordinal}: {e}"))),
        }
    }

    /// `None` for CPU, `Some(ordinal)` for CUDA.
    fn parse_device(&self) -> Result<Option<usize>, ConfigError> {
        match self.device.to_ascii_lowercase().as_str() {
            "cpu" => Ok(None),
            "cuda" => Ok(Some(0)),
            other => match other.strip_prefix("cuda:").map(str::parse::<usize>) {
                Some(Ok(ordinal)) => Ok(Some(ordinal)),
                _ => Err(ConfigError::Validation(format!("unknown device: '{}'", self.device))),
            },
        }
    }

    fn parse_env_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
        match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidEnvVar { key: key.to_string(), value: value.to_string() }),
        }
    }
}
