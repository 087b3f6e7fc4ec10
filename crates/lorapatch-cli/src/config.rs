//! CLI configuration: engine settings plus logging

use anyhow::{Context, Result, bail};
use lorapatch_common::LoraConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
const LOG_FORMATS: [&str; 3] = ["pretty", "compact", "json"];

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// pretty, compact or json
    pub format: String,
    pub timestamps: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), format: "pretty".to_string(), timestamps: true }
    }
}

/// Complete CLI configuration file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub lora: LoraConfig,
    pub logging: LoggingConfig,
}

impl CliConfig {
    /// Read a TOML file; a missing file yields the defaults
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&text)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let text = toml::to_string_pretty(self).context("Failed to serialize configuration")?;
        std::fs::write(path.as_ref(), text)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))
    }

    pub fn validate(&self) -> Result<()> {
        self.lora.validate()?;
        if !LOG_LEVELS.contains(&self.logging.level.to_ascii_lowercase().as_str()) {
            bail!("Invalid log level '{}', expected one of {:?}", self.logging.level, LOG_LEVELS);
        }
        if !LOG_FORMATS.contains(&self.logging.format.as_str()) {
            bail!("Invalid log format '{}', expected one of {:?}", self.logging.format, LOG_FORMATS);
        }
        Ok(())
    }
}

/// Layers the config file, `LORAPATCH_*` environment variables and
/// command-line flags, in increasing priority
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: CliConfig,
    device: Option<String>,
    log_level: Option<String>,
    log_format: Option<String>,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self { config: CliConfig::load_from_file(path)?, ..Self::default() })
    }

    pub fn device(mut self, device: Option<String>) -> Self {
        self.device = device.or(self.device);
        self
    }

    pub fn log_level(mut self, level: Option<String>) -> Self {
        self.log_level = level.or(self.log_level);
        self
    }

    pub fn log_format(mut self, format: Option<String>) -> Self {
        self.log_format = format.or(self.log_format);
        self
    }

    pub fn build(self) -> Result<CliConfig> {
        let mut config = self.config;
        config.lora =
            config.lora.with_env_overrides().context("Invalid LORAPATCH_* environment override")?;
        if let Some(device) = self.device {
            config.lora.device = device;
        }
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }
        if let Some(format) = self.log_format {
            config.logging.format = format;
        }
        config.validate()?;
        Ok(config)
    }
}
