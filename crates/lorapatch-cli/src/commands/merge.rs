//! Merge an adapter into a dense checkpoint and write the result

use anyhow::{Context, Result, bail};
use clap::Args;
use lorapatch_lora::{LoadStats, LoraManager};
use lorapatch_models::Module;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{info, warn};

use crate::config::CliConfig;

/// Merge command arguments
#[derive(Args, Debug)]
pub struct MergeCommand {
    /// Base model weights (.safetensors)
    #[arg(short, long, value_name = "MODEL")]
    pub model: PathBuf,

    /// Adapter file
    #[arg(short, long, value_name = "ADAPTER")]
    pub adapter: PathBuf,

    /// Adapter scale (defaults to the configured default_scale)
    #[arg(short, long)]
    pub scale: Option<f32>,

    /// Output file (.safetensors)
    #[arg(short, long, value_name = "OUTPUT")]
    pub output: PathBuf,

    /// Fail when any pair fails to apply
    #[arg(long, default_value_t = false)]
    pub strict: bool,
}

impl MergeCommand {
    pub fn execute(&self, config: &CliConfig) -> Result<()> {
        let stats = self.run(config)?;
        println!("{}", serde_json::to_string(&stats)?);
        Ok(())
    }

    pub fn run(&self, config: &CliConfig) -> Result<LoadStats> {
        if self.output == self.model {
            bail!("Refusing to overwrite the input model: {}", self.model.display());
        }
        let device = config.lora.device()?;

        let weights = candle_core::safetensors::load(&self.model, &device)
            .with_context(|| format!("Failed to load model: {}", self.model.display()))?;
        let model = Module::from_weights(weights)?;
        info!(model = %self.model.display(), layers = model.layer_paths().len(), "loaded model");

        let mut manager = LoraManager::new(model, config.lora.clone())?;
        let stats = manager
            .load_file(&self.adapter, self.scale, None)
            .with_context(|| format!("Failed to load adapter: {}", self.adapter.display()))?;

        if stats.applied == 0 {
            warn!(adapter = %self.adapter.display(), "no adapter pair matched the model");
        }
        if self.strict && stats.failed > 0 {
            bail!("{} adapter pairs failed to apply", stats.failed);
        }

        let tensors: HashMap<String, candle_core::Tensor> =
            manager.into_model().named_tensors()?.into_iter().collect();
        candle_core::safetensors::save(&tensors, &self.output)
            .with_context(|| format!("Failed to write {}", self.output.display()))?;
        info!(output = %self.output.display(), tensors = tensors.len(), "wrote merged model");
        Ok(stats)
    }
}
