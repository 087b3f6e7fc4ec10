//! Common types and utilities for the lorapatch adapter engine
//!
//! This crate provides the foundational pieces shared across the workspace:
//! the error taxonomy, the engine configuration, and a handful of tensor
//! helpers used by both the layer implementations and the adapter loader.

pub mod config;
pub mod error;
pub mod tensor;

pub use config::{ConfigError, LoraConfig};
pub use error::*;
pub use tensor::{as_matrix, max_abs_diff, to_f32_matrix};
