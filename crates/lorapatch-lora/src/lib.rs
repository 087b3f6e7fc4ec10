//! Runtime low-rank adapter patching
//!
//! Adapters are read from an [`AdapterSource`], split into per-module
//! [`LoraPair`]s, resolved against a live [`lorapatch_models::Module`] graph
//! (including fused q/k/v projections) and applied according to each target
//! layer's capability. [`LoraManager`] ties it together behind a small
//! load / toggle / rescale / remove surface.
//!
//! ```no_run
//! use lorapatch_common::LoraConfig;
//! use lorapatch_lora::LoraManager;
//! # fn demo(model: lorapatch_models::Module) -> lorapatch_common::Result<()> {
//! let mut manager = LoraManager::new(model, LoraConfig::default())?;
//! let stats = manager.load_file("style.safetensors", Some(0.8), None)?;
//! println!("applied {} pairs", stats.applied);
//! manager.set_enabled("style", false);
//! # Ok(())
//! # }
//! ```

pub mod apply;
pub mod keys;
pub mod manager;
pub mod pairs;
pub mod resolve;
pub mod source;

pub use apply::{ApplyOutcome, SkipReason, apply_pair};
pub use keys::{Direction, ParsedKey, parse_key};
pub use manager::{AdapterState, LoadStats, LoraManager};
pub use pairs::{LoraPair, extract_lora_pairs};
pub use resolve::{ResolvedTarget, resolve};
pub use source::{AdapterFormat, AdapterSource, SourceOrigin};
