//! Shared types, error model, and configuration documents for imgflow.
//!
//! This crate is the foundation depended on by all other imgflow crates.
//! It provides:
//! - [`PipelineError`], the unified error type
//! - Domain types ([`StageName`], [`ImageShape`], [`ScoreReport`])
//! - Configuration documents ([`SettingsDocument`], [`ParametersDocument`])

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    DEFAULT_PARAMS_FILE, DEFAULT_SETTINGS_FILE, ParamValue, ParametersDocument, SettingsDocument,
};
pub use error::{PipelineError, Result};
pub use types::{ImageShape, ScoreReport, StageName};
