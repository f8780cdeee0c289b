//! Fully-resolved, per-stage configuration snapshots.
//!
//! Every path here is absolute and every hyperparameter is typed. Schemas are
//! produced once per run by [`ConfigurationResolver`](crate::resolver::ConfigurationResolver)
//! and never mutated afterwards.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use sha2::{Digest, Sha256};
use url::Url;

use imgflow_shared::{ImageShape, ParamValue, PipelineError, Result, StageName};
use imgflow_tracking::TrackingTarget;

/// Data acquisition: download and unpack the source archive.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestionConfig {
    pub root_dir: PathBuf,
    pub source_url: Url,
    pub local_data_file: PathBuf,
    pub unzip_dir: PathBuf,
}

/// Base model assembly: base network, freezing, classification head.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BasePrepConfig {
    pub root_dir: PathBuf,
    pub base_model_path: PathBuf,
    pub updated_base_model_path: PathBuf,
    pub architecture: String,
    pub image_size: ImageShape,
    pub include_top: bool,
    pub weights: Option<String>,
    pub classes: u32,
    pub learning_rate: f64,
    pub freeze_all: bool,
    pub freeze_till: Option<u32>,
    pub seed: u64,
}

/// Fitting the prepared model on the ingested dataset.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainingConfig {
    pub root_dir: PathBuf,
    pub trained_model_path: PathBuf,
    pub updated_base_model_path: PathBuf,
    pub training_data: PathBuf,
    pub image_size: ImageShape,
    pub epochs: u32,
    pub batch_size: u32,
    pub augmentation: bool,
    pub learning_rate: f64,
    /// Fraction of each class used for training.
    pub split_ratio: f64,
    pub seed: u64,
}

/// Scoring the checkpoint on the recomputed validation split.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationConfig {
    pub path_of_model: PathBuf,
    pub training_data: PathBuf,
    pub scores_path: PathBuf,
    pub image_size: ImageShape,
    /// Validation samples scored per batch.
    pub batch_size: u32,
    pub split_ratio: f64,
    pub seed: u64,
    /// Every hyperparameter, reported alongside the scores.
    pub all_params: BTreeMap<String, ParamValue>,
}

/// Experiment tracking destination.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackingConfig {
    pub target: TrackingTarget,
    pub experiment: Option<String>,
}

/// One resolved stage configuration.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "stage", content = "config", rename_all = "snake_case")]
pub enum ConfigSchema {
    Ingestion(IngestionConfig),
    BasePrep(BasePrepConfig),
    Training(TrainingConfig),
    Evaluation(EvaluationConfig),
}

impl ConfigSchema {
    /// Stage this configuration belongs to.
    pub fn stage(&self) -> StageName {
        match self {
            Self::Ingestion(_) => StageName::Ingestion,
            Self::BasePrep(_) => StageName::BasePrep,
            Self::Training(_) => StageName::Training,
            Self::Evaluation(_) => StageName::Evaluation,
        }
    }

    /// Canonical JSON encoding; identical inputs give identical bytes.
    pub fn to_canonical_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| PipelineError::config(format!("cannot serialize {} config: {e}", self.stage())))
    }

    /// SHA-256 of the canonical encoding, recorded in the run-state ledger.
    pub fn fingerprint(&self) -> Result<String> {
        let mut hasher = Sha256::new();
        hasher.update(self.to_canonical_json()?.as_bytes());
        Ok(format!("{:x}", hasher.finalize()))
    }
}

// ---------------------------------------------------------------------------
// Artifact layout
// ---------------------------------------------------------------------------

/// Declared outputs that stages hand to one another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    IngestedData,
    BaseModel,
    Checkpoint,
    ScoreSummary,
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::IngestedData => "ingested data",
            Self::BaseModel => "prepared base model",
            Self::Checkpoint => "trained checkpoint",
            Self::ScoreSummary => "score summary",
        })
    }
}

/// Fixed locations of every declared artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactLayout {
    pub ingested_data: PathBuf,
    /// Dataset directory that training and evaluation read.
    pub dataset: PathBuf,
    pub base_model: PathBuf,
    pub checkpoint: PathBuf,
    pub score_summary: PathBuf,
}

impl ArtifactLayout {
    pub fn path(&self, kind: ArtifactKind) -> &Path {
        match kind {
            ArtifactKind::IngestedData => &self.ingested_data,
            ArtifactKind::BaseModel => &self.base_model,
            ArtifactKind::Checkpoint => &self.checkpoint,
            ArtifactKind::ScoreSummary => &self.score_summary,
        }
    }

    /// Where consuming stages read `kind` from. Differs from [`Self::path`]
    /// only for ingested data, which is read from the training dataset dir.
    pub fn input_path(&self, kind: ArtifactKind) -> &Path {
        match kind {
            ArtifactKind::IngestedData => &self.dataset,
            _ => self.path(kind),
        }
    }

    /// Whether producing `kind` also populates the location consumers read.
    pub fn producer_covers_input(&self, kind: ArtifactKind) -> bool {
        self.input_path(kind).starts_with(self.path(kind))
    }

    /// Whether the artifact exists where consumers read it: a non-empty
    /// directory for ingested data, a non-empty file otherwise.
    pub fn is_present(&self, kind: ArtifactKind) -> bool {
        let path = self.input_path(kind);
        match kind {
            ArtifactKind::IngestedData => dir_is_non_empty(path),
            _ => std::fs::metadata(path).is_ok_and(|m| m.is_file() && m.len() > 0),
        }
    }
}

/// True when `path` is a directory with at least one entry.
pub fn dir_is_non_empty(path: &Path) -> bool {
    std::fs::read_dir(path).is_ok_and(|mut entries| entries.next().is_some())
}
