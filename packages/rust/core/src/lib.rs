//! Core pipeline for imgflow: configuration resolution, stage runners,
//! the run-state ledger and the orchestrator.

pub mod orchestrator;
pub mod resolver;
pub mod run_state;
pub mod schema;
pub mod stages;

#[cfg(test)]
pub(crate) mod test_support;

pub use orchestrator::{
    PipelineOrchestrator, PipelineState, ProgressReporter, RunSummary, SilentProgress,
    StageFailure, StageSelector,
};
pub use resolver::{ConfigurationResolver, RUN_STATE_FILE};
pub use run_state::{OutputRecord, RunState, RunStateStore, StageRecord, StageStatus};
pub use schema::{
    ArtifactKind, ArtifactLayout, BasePrepConfig, ConfigSchema, EvaluationConfig,
    IngestionConfig, TrackingConfig, TrainingConfig,
};
pub use stages::{
    Collaborators, Fetcher, PIPELINE, SourceFetcher, StageContext, StageDescriptor, StageOutcome,
    StageRunner,
};
