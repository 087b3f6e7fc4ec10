//! CLI subcommands

pub mod inspect;
pub mod merge;

pub use inspect::InspectCommand;
pub use merge::MergeCommand;
