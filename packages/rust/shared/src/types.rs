//! Core domain types shared across the pipeline crates.

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

// ---------------------------------------------------------------------------
// StageName
// ---------------------------------------------------------------------------

/// Identifier of one of the four fixed pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    Ingestion,
    BasePrep,
    Training,
    Evaluation,
}

impl StageName {
    /// All stages in execution order.
    pub const ALL: [StageName; 4] = [
        StageName::Ingestion,
        StageName::BasePrep,
        StageName::Training,
        StageName::Evaluation,
    ];

    /// Identifier used in config, CLI and the run-state ledger.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ingestion => "ingestion",
            Self::BasePrep => "base_prep",
            Self::Training => "training",
            Self::Evaluation => "evaluation",
        }
    }

    /// Zero-based position in the fixed execution order.
    pub fn position(self) -> usize {
        match self {
            Self::Ingestion => 0,
            Self::BasePrep => 1,
            Self::Training => 2,
            Self::Evaluation => 3,
        }
    }
}

impl std::fmt::Display for StageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StageName {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| {
                PipelineError::config(format!(
                    "unknown stage `{s}`: expected one of ingestion, base_prep, training, evaluation"
                ))
            })
    }
}

// ---------------------------------------------------------------------------
// ImageShape
// ---------------------------------------------------------------------------

/// Input image geometry expected by the model (`[height, width, channels]`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageShape {
    pub height: u32,
    pub width: u32,
    /// 1 (grayscale) or 3 (RGB).
    pub channels: u32,
}

impl ImageShape {
    /// Build a shape, rejecting zero dimensions and unsupported channel counts.
    pub fn new(height: u32, width: u32, channels: u32) -> Result<Self> {
        if height == 0 || width == 0 {
            return Err(PipelineError::config(format!(
                "image_size must have non-zero height and width, got [{height}, {width}, {channels}]"
            )));
        }
        if channels != 1 && channels != 3 {
            return Err(PipelineError::config(format!(
                "image_size channels must be 1 or 3, got {channels}"
            )));
        }
        Ok(Self {
            height,
            width,
            channels,
        })
    }
}

// ---------------------------------------------------------------------------
// ScoreReport
// ---------------------------------------------------------------------------

/// Evaluation summary written to the score file. The key set is fixed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreReport {
    /// Mean cross-entropy over the validation split.
    pub loss: f64,
    /// Fraction of validation samples classified correctly.
    pub accuracy: f64,
}
