//! Patchable model graph for the lorapatch engine
//!
//! A [`Module`] tree holds the live layers of an already-built network. Each
//! layer declares what it can do with a low-rank patch through the [`Layer`]
//! capability trait: merge it into a dense weight, merge it into a cached
//! dequantized view, or keep it as a named, toggleable record.

pub mod delta;
pub mod layers;
pub mod module;
pub mod patch;
pub mod registry;

pub use delta::{compute_delta, effective_scale, pad_rows};
pub use layers::{AdditiveLinear, DenseLinear, Layer, LayerKind, QuantizedLinear, RmsNorm};
pub use module::Module;
pub use patch::{LowRankPatch, SliceSpec};
pub use registry::{AppliedRecord, PatchRegistry, SLICE_SUFFIXES};
