//! Adapter inspection: what pairs a file holds and how they would be read

use anyhow::{Context, Result};
use clap::Args;
use lorapatch_lora::keys::{has_indicator, is_alpha_key, is_network_alpha_key};
use lorapatch_lora::pairs::detect_prefix;
use lorapatch_lora::{AdapterSource, extract_lora_pairs};
use serde::Serialize;
use std::path::PathBuf;
use tracing::debug;

use crate::config::CliConfig;

/// Inspect command arguments
#[derive(Args, Debug)]
pub struct InspectCommand {
    /// Adapter file (.safetensors, .pt, .pth, .bin, .ckpt)
    #[arg(value_name = "ADAPTER")]
    pub adapter: PathBuf,

    /// Output format as JSON
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PairSummary {
    pub module_path: String,
    pub rank: usize,
    pub in_features: usize,
    pub out_features: usize,
    pub alpha: Option<f32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InspectReport {
    pub source: String,
    pub tensors: usize,
    pub lora_keys: usize,
    pub alpha_keys: usize,
    pub prefix: Option<String>,
    pub default_alpha: Option<f32>,
    pub pairs: Vec<PairSummary>,
}

impl InspectCommand {
    pub fn execute(&self, config: &CliConfig) -> Result<()> {
        let report = self.report(config)?;
        if self.json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            print_report(&report);
        }
        Ok(())
    }

    pub fn report(&self, config: &CliConfig) -> Result<InspectReport> {
        let source = AdapterSource::from_file(&self.adapter)
            .with_context(|| format!("Failed to read adapter: {}", self.adapter.display()))?;
        let prefixes = &config.lora.known_prefixes;
        let pairs = extract_lora_pairs(&source, None, prefixes)?;
        debug!(pairs = pairs.len(), "extracted pairs");

        Ok(InspectReport {
            source: source.origin().to_string(),
            tensors: source.len(),
            lora_keys: source.names().filter(|n| !is_network_alpha_key(n) && has_indicator(n)).count(),
            alpha_keys: source.names().filter(|n| is_network_alpha_key(n) || is_alpha_key(n)).count(),
            prefix: detect_prefix(&source, prefixes).map(str::to_string),
            default_alpha: source.default_alpha(),
            pairs: pairs
                .values()
                .map(|p| PairSummary {
                    module_path: p.module_path.clone(),
                    rank: p.rank(),
                    in_features: p.in_features(),
                    out_features: p.out_features(),
                    alpha: p.alpha,
                })
                .collect(),
        })
    }
}

fn print_report(report: &InspectReport) {
    println!("Adapter: {}", report.source);
    println!("Tensors: {} ({} LoRA, {} alpha)", report.tensors, report.lora_keys, report.alpha_keys);
    if let Some(prefix) = &report.prefix {
        println!("Prefix:  {prefix}");
    }
    if let Some(alpha) = report.default_alpha {
        println!("Alpha:   {alpha}");
    }
    println!("Pairs:   {}", report.pairs.len());
    for pair in &report.pairs {
        let alpha = pair.alpha.map_or_else(|| "-".to_string(), |a| a.to_string());
        println!(
            "  {:<48} rank {:>3}  {:>5} -> {:<5} alpha {}",
            pair.module_path, pair.rank, pair.in_features, pair.out_features, alpha
        );
    }
}
