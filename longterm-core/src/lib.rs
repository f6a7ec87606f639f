//! Core shared library for the long-term goals workspace.
//!
//! This crate exposes the ambient primitives the engine depends on:
//! canonical errors, configuration loading and logging setup.

pub mod config;
pub mod errors;
pub mod logging;

pub use config::{load_core_config, CoreConfig, Environment, ZoneSetting};
pub use errors::{ConfigError, CoreError, Result as CoreResult};
