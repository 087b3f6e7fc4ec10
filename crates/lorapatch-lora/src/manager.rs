//! Adapter lifecycle: load, toggle, rescale and remove named adapters
//!
//! The manager only keeps per-adapter bookkeeping. Physical records live in
//! the layers themselves and every operation fans out by walking the model
//! graph at call time.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use crate::apply::{ApplyOutcome, SkipReason, apply_pair};
use crate::pairs::extract_lora_pairs;
use crate::source::AdapterSource;
use candle_core::Device;
use lorapatch_common::{LoraConfig, LoraError, Result};
use lorapatch_models::{Module, SLICE_SUFFIXES};
use serde::Serialize;
use tracing::{debug, info, warn};

/// Per-load counts of pairs applied, failed and skipped
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoadStats {
    pub applied: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl LoadStats {
    pub fn record(&mut self, outcome: &ApplyOutcome) {
        match outcome {
            ApplyOutcome::Applied(_) => self.applied += 1,
            ApplyOutcome::Failed(_) => self.failed += 1,
            ApplyOutcome::Skipped(_) => self.skipped += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.applied + self.failed + self.skipped
    }
}

/// Bookkeeping for one loaded adapter
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdapterState {
    /// File path, or `<memory>`
    pub source: String,
    pub scale: f32,
    pub stats: LoadStats,
    pub enabled: bool,
    /// Layers that merged the adapter destructively; `remove` cannot undo these
    pub merged_layers: usize,
}

/// Owns a model graph and the named adapters applied to it.
///
/// All operations take `&mut self`; callers sharing a manager across threads
/// wrap it in their own lock.
#[derive(Debug)]
pub struct LoraManager {
    model: Module,
    adapters: BTreeMap<String, AdapterState>,
    config: LoraConfig,
    device: Device,
}

impl LoraManager {
    pub fn new(model: Module, config: LoraConfig) -> Result<Self> {
        config.validate()?;
        let device = config.device()?;
        Ok(Self { model, adapters: BTreeMap::new(), config, device })
    }

    /// Default configuration on the CPU. Equivalent to `new(model, LoraConfig::default())`,
    /// which cannot fail because the defaults validate and name the CPU.
    pub fn with_defaults(model: Module) -> Self {
        Self { model, adapters: BTreeMap::new(), config: LoraConfig::default(), device: Device::Cpu }
    }

    pub fn model(&self) -> &Module {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut Module {
        &mut self.model
    }

    pub fn into_model(self) -> Module {
        self.model
    }

    pub fn config(&self) -> &LoraConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Decode `path` and load it; the file stem names the adapter unless `name` is given
    pub fn load_file(
        &mut self,
        path: impl AsRef<Path>,
        scale: Option<f32>,
        name: Option<&str>,
    ) -> Result<LoadStats> {
        let source = AdapterSource::from_file(path)?;
        self.load(&source, scale, name)
    }

    /// Apply every complete pair in `source` under `name`.
    ///
    /// Per-pair problems are counted, never returned. Errors are limited to
    /// source-level decode problems and reusing a loaded name when
    /// `replace_on_reload` is off or the earlier load merged into any layer.
    pub fn load(
        &mut self,
        source: &AdapterSource,
        scale: Option<f32>,
        name: Option<&str>,
    ) -> Result<LoadStats> {
        let name = match name.map(str::to_string).or_else(|| source.default_name()) {
            Some(name) => name,
            None => self.next_memory_name(),
        };
        let scale = scale.unwrap_or(self.config.default_scale);

        if self.adapters.contains_key(&name) && !self.config.replace_on_reload {
            return Err(LoraError::Validation(format!("adapter '{name}' is already loaded")));
        }
        if let Some(state) = self.adapters.get(&name).filter(|s| s.merged_layers > 0) {
            return Err(LoraError::Validation(format!(
                "adapter '{name}' is merged into {} layers; reload the model before loading it again",
                state.merged_layers
            )));
        }

        let pairs = extract_lora_pairs(source, None, &self.config.known_prefixes)?;

        if self.adapters.contains_key(&name) {
            let removed = self.remove_records(&name);
            info!(adapter = %name, removed, "replacing previously loaded adapter");
        }

        let mut stats = LoadStats::default();
        let mut merged_layers = 0;
        let mut text_encoder_skips = 0;
        let mut claimed = BTreeSet::new();

        if pairs.is_empty() {
            stats.skipped = source.len();
        }
        for pair in pairs.values() {
            let outcome = apply_pair(
                &mut self.model,
                pair,
                &name,
                scale,
                &self.config,
                &self.device,
                &mut claimed,
            );
            match &outcome {
                ApplyOutcome::Applied(kind) if kind.is_destructive() => merged_layers += 1,
                ApplyOutcome::Skipped(SkipReason::TextEncoder) => text_encoder_skips += 1,
                _ => {}
            }
            stats.record(&outcome);
        }

        if text_encoder_skips > 0 {
            info!(adapter = %name, count = text_encoder_skips, "skipped text encoder modules");
        }
        info!(
            adapter = %name,
            applied = stats.applied,
            failed = stats.failed,
            skipped = stats.skipped,
            "loaded adapter"
        );

        self.adapters.insert(
            name,
            AdapterState {
                source: source.origin().to_string(),
                scale,
                stats,
                enabled: true,
                merged_layers,
            },
        );
        Ok(stats)
    }

    /// Toggle every record of `name`; true if any record was found
    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> bool {
        let mut touched = 0;
        self.model.visit_layers_mut(|_, layer| {
            if let Some(patches) = layer.patches_mut() {
                touched += patches.set_enabled(name, enabled);
            }
        });
        if let Some(state) = self.adapters.get_mut(name) {
            state.enabled = enabled;
        }
        debug!(adapter = name, enabled, records = touched, "set adapter enabled");
        touched > 0
    }

    pub fn set_all_enabled(&mut self, enabled: bool) {
        self.model.visit_layers_mut(|_, layer| {
            if let Some(patches) = layer.patches_mut() {
                patches.set_all_enabled(enabled);
            }
        });
        for state in self.adapters.values_mut() {
            state.enabled = enabled;
        }
    }

    /// Update the scale of every record of `name`; takes effect on the next forward pass
    pub fn set_scale(&mut self, name: &str, scale: f32) -> bool {
        let mut touched = 0;
        self.model.visit_layers_mut(|_, layer| {
            if let Some(patches) = layer.patches_mut() {
                touched += patches.set_scale(name, scale);
            }
        });
        if let Some(state) = self.adapters.get_mut(name) {
            state.scale = scale;
        }
        debug!(adapter = name, scale, records = touched, "set adapter scale");
        touched > 0
    }

    /// Remove every record of `name` and forget it; true if any record was removed
    pub fn remove(&mut self, name: &str) -> bool {
        if let Some(state) = self.adapters.get(name).filter(|s| s.merged_layers > 0) {
            warn!(
                adapter = name,
                merged_layers = state.merged_layers,
                "merged layers keep this adapter until the model is reloaded"
            );
        }
        let removed = self.remove_records(name);
        self.adapters.remove(name);
        self.reclaim_memory();
        removed > 0
    }

    /// Remove every record from every layer; returns the number removed
    pub fn remove_all(&mut self) -> usize {
        let mut removed = 0;
        self.model.visit_layers_mut(|_, layer| {
            if let Some(patches) = layer.patches_mut() {
                removed += patches.clear();
            }
        });
        self.adapters.clear();
        self.reclaim_memory();
        removed
    }

    pub fn list_names(&self) -> Vec<String> {
        self.adapters.keys().cloned().collect()
    }

    pub fn get_state(&self, name: &str) -> Option<AdapterState> {
        self.adapters.get(name).cloned()
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.adapters.contains_key(name)
    }

    /// Drop the physical records `name`, `name_q`, `name_k` and `name_v`
    fn remove_records(&mut self, name: &str) -> usize {
        let physical: Vec<String> = std::iter::once(name.to_string())
            .chain(SLICE_SUFFIXES.iter().map(|s| format!("{name}{s}")))
            .collect();

        let mut removed = 0;
        self.model.visit_layers_mut(|path, layer| {
            if layer.patches().is_none() {
                return;
            }
            for record in &physical {
                match layer.remove_delta(record) {
                    Ok(true) => removed += 1,
                    Ok(false) => {}
                    Err(e) => debug!(layer = path, record = %record, reason = %e, "cannot remove"),
                }
            }
        });
        removed
    }

    fn next_memory_name(&self) -> String {
        (0..)
            .map(|n| format!("adapter_{n}"))
            .find(|candidate| !self.adapters.contains_key(candidate))
            .unwrap_or_else(|| "adapter".to_string())
    }

    fn reclaim_memory(&self) {
        if !self.config.reclaim_memory {
            return;
        }
        match self.device.synchronize() {
            Ok(()) => debug!(device = ?self.device, "synchronized device after removal"),
            Err(e) => debug!(device = ?self.device, reason = %e, "device synchronization failed"),
        }
    }
}
