//! lorapatch CLI library
//!
//! Exposes the command and configuration modules for testing.

pub mod commands;
pub mod config;
