//! Stage runners and the fixed stage descriptor table.
//!
//! Each runner owns its resolved [`ConfigSchema`] and the collaborators it
//! needs; the orchestrator only sees the [`StageRunner`] trait.

pub mod base_prep;
pub mod evaluation;
pub mod ingestion;
pub mod training;

use std::sync::Arc;

use imgflow_model::{ModelTrainer, SoftmaxTrainer};
use imgflow_shared::{Result, ScoreReport, StageName};
use imgflow_tracking::MetricsSink;

use crate::run_state::StageRecord;
use crate::schema::{ArtifactKind, ConfigSchema};

pub use base_prep::BasePrepRunner;
pub use evaluation::EvaluationRunner;
pub use ingestion::{Fetcher, IngestionRunner, SourceFetcher, extract_archive};
pub use training::TrainingRunner;

// ---------------------------------------------------------------------------
// Descriptor table
// ---------------------------------------------------------------------------

/// Static declaration of a stage's inputs and outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageDescriptor {
    pub name: StageName,
    pub requires: &'static [ArtifactKind],
    pub produces: &'static [ArtifactKind],
}

/// The pipeline, in execution order.
pub const PIPELINE: [StageDescriptor; 4] = [
    StageDescriptor {
        name: StageName::Ingestion,
        requires: &[],
        produces: &[ArtifactKind::IngestedData],
    },
    StageDescriptor {
        name: StageName::BasePrep,
        requires: &[],
        produces: &[ArtifactKind::BaseModel],
    },
    StageDescriptor {
        name: StageName::Training,
        requires: &[ArtifactKind::IngestedData, ArtifactKind::BaseModel],
        produces: &[ArtifactKind::Checkpoint],
    },
    StageDescriptor {
        name: StageName::Evaluation,
        requires: &[ArtifactKind::IngestedData, ArtifactKind::Checkpoint],
        produces: &[ArtifactKind::ScoreSummary],
    },
];

/// Descriptor for `stage`.
pub fn descriptor(stage: StageName) -> &'static StageDescriptor {
    &PIPELINE[stage.position()]
}

// ---------------------------------------------------------------------------
// Runner contract
// ---------------------------------------------------------------------------

/// What a stage did.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    Completed,
    Skipped { reason: String },
    Scored(ScoreReport),
}

/// Per-invocation context handed to a runner.
pub struct StageContext<'a> {
    pub run_id: &'a str,
    /// Ledger entry from the previous attempt at this stage, if any.
    pub previous: Option<&'a StageRecord>,
    pub sink: &'a dyn MetricsSink,
    pub experiment: Option<&'a str>,
}

/// One executable pipeline stage.
pub trait StageRunner {
    fn stage(&self) -> StageName;

    fn execute(&self, ctx: &StageContext<'_>) -> Result<StageOutcome>;
}

/// External capabilities the runners delegate to.
#[derive(Clone)]
pub struct Collaborators {
    pub fetcher: Arc<dyn Fetcher>,
    pub trainer: Arc<dyn ModelTrainer>,
}

impl Collaborators {
    /// HTTP/file fetcher and the built-in softmax trainer.
    pub fn standard() -> Result<Self> {
        Ok(Self {
            fetcher: Arc::new(SourceFetcher::new()?),
            trainer: Arc::new(SoftmaxTrainer),
        })
    }
}

/// Build the runner owning `schema`.
pub fn runner_for(schema: ConfigSchema, collaborators: &Collaborators) -> Box<dyn StageRunner> {
    match schema {
        ConfigSchema::Ingestion(config) => {
            Box::new(IngestionRunner::new(config, Arc::clone(&collaborators.fetcher)))
        }
        ConfigSchema::BasePrep(config) => Box::new(BasePrepRunner::new(config)),
        ConfigSchema::Training(config) => {
            Box::new(TrainingRunner::new(config, Arc::clone(&collaborators.trainer)))
        }
        ConfigSchema::Evaluation(config) => {
            Box::new(EvaluationRunner::new(config, Arc::clone(&collaborators.trainer)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_table_is_in_execution_order() {
        for (i, d) in PIPELINE.iter().enumerate() {
            assert_eq!(d.name.position(), i);
            assert_eq!(descriptor(d.name), d);
        }
    }

    #[test]
    fn every_requirement_is_produced_upstream() {
        for (i, d) in PIPELINE.iter().enumerate() {
            for req in d.requires {
                assert!(
                    PIPELINE[..i].iter().any(|up| up.produces.contains(req)),
                    "{} requires {req} which no earlier stage produces",
                    d.name
                );
            }
        }
    }
}
