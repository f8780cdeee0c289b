//! Runs the selected stages in order and keeps the run-state ledger current.
//!
//! 1. Resolve every selected stage's configuration
//! 2. Validate the plan against the descriptor table and the artifact store
//! 3. Execute stages one by one, stopping at the first failure

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, instrument, warn};
use uuid::Uuid;

use imgflow_shared::{PipelineError, Result, ScoreReport, StageName};
use imgflow_tracking::MetricsSink;

use crate::resolver::ConfigurationResolver;
use crate::run_state::{OutputRecord, RunStateStore, StageStatus};
use crate::schema::{ArtifactLayout, ConfigSchema};
use crate::stages::{Collaborators, StageContext, StageOutcome, descriptor, runner_for};

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

/// Where the orchestrator is in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    NotStarted,
    Ingesting,
    Preparing,
    Training,
    Evaluating,
    Done,
    Failed,
}

impl PipelineState {
    /// State entered while `stage` runs.
    pub fn running(stage: StageName) -> Self {
        match stage {
            StageName::Ingestion => Self::Ingesting,
            StageName::BasePrep => Self::Preparing,
            StageName::Training => Self::Training,
            StageName::Evaluation => Self::Evaluating,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    fn rank(self) -> usize {
        match self {
            Self::NotStarted => 0,
            Self::Ingesting => 1,
            Self::Preparing => 2,
            Self::Training => 3,
            Self::Evaluating => 4,
            Self::Done | Self::Failed => 5,
        }
    }

    /// Forward-only: any later state, or `Failed` from a non-terminal state.
    pub fn can_transition_to(self, next: Self) -> bool {
        !self.is_terminal() && (next == Self::Failed || next.rank() > self.rank())
    }
}

/// Which stages a run covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageSelector {
    All,
    Single(StageName),
}

impl StageSelector {
    pub fn stages(self) -> Vec<StageName> {
        match self {
            Self::All => StageName::ALL.to_vec(),
            Self::Single(stage) => vec![stage],
        }
    }
}

impl std::str::FromStr for StageSelector {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "all" => Ok(Self::All),
            other => other.parse().map(Self::Single),
        }
    }
}

impl std::fmt::Display for StageSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::All => f.write_str("all"),
            Self::Single(stage) => write!(f, "{stage}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// A stage's error, unmodified, tagged with the stage it came from.
#[derive(Debug, thiserror::Error)]
#[error("stage {stage} failed ({}): {source}", .source.kind())]
pub struct StageFailure {
    pub stage: StageName,
    pub source: PipelineError,
}

impl StageFailure {
    pub fn new(stage: StageName, source: PipelineError) -> Self {
        Self { stage, source }
    }

    pub fn kind(&self) -> &'static str {
        self.source.kind()
    }
}

/// Result of a successful run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: String,
    pub outcomes: Vec<(StageName, StageOutcome)>,
    pub scores: Option<ScoreReport>,
    pub elapsed: Duration,
}

/// Stage boundary callbacks.
pub trait ProgressReporter: Send + Sync {
    fn stage_started(&self, stage: StageName, index: usize, total: usize);
    fn stage_finished(&self, stage: StageName, outcome: &StageOutcome, elapsed: Duration);
    fn stage_failed(&self, stage: StageName, error: &PipelineError);
    fn done(&self, summary: &RunSummary);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn stage_started(&self, _stage: StageName, _index: usize, _total: usize) {}
    fn stage_finished(&self, _stage: StageName, _outcome: &StageOutcome, _elapsed: Duration) {}
    fn stage_failed(&self, _stage: StageName, _error: &PipelineError) {}
    fn done(&self, _summary: &RunSummary) {}
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct PipelineOrchestrator {
    resolver: ConfigurationResolver,
    collaborators: Collaborators,
    sink: Arc<dyn MetricsSink>,
    experiment: Option<String>,
    state: PipelineState,
    history: Vec<PipelineState>,
}

impl PipelineOrchestrator {
    pub fn new(
        resolver: ConfigurationResolver,
        collaborators: Collaborators,
        sink: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            resolver,
            collaborators,
            sink,
            experiment: None,
            state: PipelineState::NotStarted,
            history: vec![PipelineState::NotStarted],
        }
    }

    /// Experiment name attached to every metrics record.
    pub fn with_experiment(mut self, experiment: Option<String>) -> Self {
        self.experiment = experiment;
        self
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Every state entered so far, starting with `NotStarted`.
    pub fn history(&self) -> &[PipelineState] {
        &self.history
    }

    fn transition(&mut self, next: PipelineState) {
        if self.state.can_transition_to(next) {
            self.state = next;
            self.history.push(next);
        } else {
            warn!(from = ?self.state, to = ?next, "ignoring out-of-order state transition");
        }
    }

    fn fail(&mut self, stage: StageName, error: PipelineError) -> StageFailure {
        self.transition(PipelineState::Failed);
        StageFailure::new(stage, error)
    }

    /// Run the selected stages.
    #[instrument(skip_all, fields(selector = %selector))]
    pub fn run(
        &mut self,
        selector: StageSelector,
        progress: &dyn ProgressReporter,
    ) -> std::result::Result<RunSummary, StageFailure> {
        let start = Instant::now();
        let stages = selector.stages();
        let first = stages[0];

        // --- Resolve everything up front ---
        let mut schemas: Vec<ConfigSchema> = Vec::with_capacity(stages.len());
        for &stage in &stages {
            match self.resolver.resolve(stage) {
                Ok(schema) => schemas.push(schema),
                Err(e) => return Err(self.fail(stage, e)),
            }
        }

        let layout = match self.resolver.artifact_layout() {
            Ok(layout) => layout,
            Err(e) => return Err(self.fail(first, e)),
        };
        if let Err((stage, e)) = validate_plan(&stages, &layout) {
            return Err(self.fail(stage, e));
        }

        let mut ledger = match self
            .resolver
            .run_state_path()
            .and_then(|path| RunStateStore::open(&path))
        {
            Ok(ledger) => ledger,
            Err(e) => return Err(self.fail(first, e)),
        };

        let run_id = Uuid::now_v7().to_string();
        info!(%run_id, stages = stages.len(), "starting pipeline run");

        // --- Execute ---
        let mut outcomes = Vec::with_capacity(schemas.len());
        let mut scores = None;
        let total = schemas.len();

        for (index, schema) in schemas.into_iter().enumerate() {
            let stage = schema.stage();
            self.transition(PipelineState::running(stage));
            progress.stage_started(stage, index, total);
            info!(%stage, "stage started");
            let stage_start = Instant::now();

            match self.run_stage(schema, &layout, &mut ledger, &run_id) {
                Ok(outcome) => {
                    let elapsed = stage_start.elapsed();
                    info!(%stage, elapsed_ms = elapsed.as_millis() as u64, ?outcome, "stage finished");
                    progress.stage_finished(stage, &outcome, elapsed);
                    if let StageOutcome::Scored(report) = &outcome {
                        scores = Some(*report);
                    }
                    outcomes.push((stage, outcome));
                }
                Err(e) => {
                    warn!(%stage, kind = e.kind(), error = %e, "stage failed");
                    progress.stage_failed(stage, &e);
                    return Err(self.fail(stage, e));
                }
            }
        }

        self.transition(PipelineState::Done);
        let summary = RunSummary {
            run_id,
            outcomes,
            scores,
            elapsed: start.elapsed(),
        };
        info!(elapsed_ms = summary.elapsed.as_millis() as u64, "pipeline complete");
        progress.done(&summary);
        Ok(summary)
    }

    fn run_stage(
        &self,
        schema: ConfigSchema,
        layout: &ArtifactLayout,
        ledger: &mut RunStateStore,
        run_id: &str,
    ) -> Result<StageOutcome> {
        let stage = schema.stage();
        let desc = descriptor(stage);

        // Inputs must exist now, not just be planned.
        if let Some(missing) = desc.requires.iter().find(|kind| !layout.is_present(**kind)) {
            return Err(PipelineError::Dependency {
                stage: stage.to_string(),
                artifact: missing.to_string(),
                path: layout.input_path(*missing).to_path_buf(),
            });
        }

        let previous = ledger.record(stage).cloned();
        ledger.mark_running(stage, run_id, &schema.fingerprint()?)?;

        let runner = runner_for(schema, &self.collaborators);
        let ctx = StageContext {
            run_id,
            previous: previous.as_ref(),
            sink: self.sink.as_ref(),
            experiment: self.experiment.as_deref(),
        };

        match runner.execute(&ctx) {
            Ok(outcome) => {
                let outputs = desc
                    .produces
                    .iter()
                    .filter_map(|kind| OutputRecord::capture(layout.path(*kind)).transpose())
                    .collect::<Result<Vec<_>>>()?;
                let status = match outcome {
                    StageOutcome::Skipped { .. } => StageStatus::Skipped,
                    _ => StageStatus::Completed,
                };
                ledger.mark_finished(stage, status, outputs)?;
                Ok(outcome)
            }
            Err(e) => {
                if let Err(ledger_err) = ledger.mark_failed(stage, &e) {
                    warn!(%stage, error = %ledger_err, "could not record failure in run state");
                }
                Err(e)
            }
        }
    }
}

/// Every requirement of a selected stage must be produced by an earlier
/// selected stage at the location it is read from, or already be present
/// in the artifact store.
fn validate_plan(
    stages: &[StageName],
    layout: &ArtifactLayout,
) -> std::result::Result<(), (StageName, PipelineError)> {
    for (i, &stage) in stages.iter().enumerate() {
        for &kind in descriptor(stage).requires {
            let planned = layout.producer_covers_input(kind)
                && stages[..i]
                    .iter()
                    .any(|upstream| descriptor(*upstream).produces.contains(&kind));
            if !planned && !layout.is_present(kind) {
                return Err((
                    stage,
                    PipelineError::Dependency {
                        stage: stage.to_string(),
                        artifact: kind.to_string(),
                        path: layout.input_path(kind).to_path_buf(),
                    },
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use imgflow_model::{Evaluation, ModelArtifact, ModelTrainer, Sample, SoftmaxTrainer, TrainOptions};
    use imgflow_tracking::NullSink;

    use crate::test_support::{PARAMS_YAML, RecordingSink, write_project};
    use crate::test_support::temp_dir;

    /// Delegates to the softmax trainer and counts calls.
    #[derive(Default)]
    struct SpyTrainer {
        trains: AtomicUsize,
    }

    impl ModelTrainer for SpyTrainer {
        fn train(
            &self,
            model: ModelArtifact,
            class_names: &[String],
            train: &[Sample],
            options: &TrainOptions,
        ) -> Result<ModelArtifact> {
            self.trains.fetch_add(1, Ordering::SeqCst);
            SoftmaxTrainer.train(model, class_names, train, options)
        }

        fn evaluate(&self, model: &ModelArtifact, samples: &[Sample]) -> Result<Evaluation> {
            SoftmaxTrainer.evaluate(model, samples)
        }
    }

    /// Records stage boundaries.
    #[derive(Default)]
    struct Boundaries(Mutex<Vec<String>>);

    impl ProgressReporter for Boundaries {
        fn stage_started(&self, stage: StageName, _index: usize, _total: usize) {
            self.0.lock().unwrap().push(format!("start:{stage}"));
        }
        fn stage_finished(&self, stage: StageName, _outcome: &StageOutcome, _elapsed: Duration) {
            self.0.lock().unwrap().push(format!("end:{stage}"));
        }
        fn stage_failed(&self, stage: StageName, _error: &PipelineError) {
            self.0.lock().unwrap().push(format!("fail:{stage}"));
        }
        fn done(&self, _summary: &RunSummary) {
            self.0.lock().unwrap().push("done".into());
        }
    }

    fn orchestrator(
        root: &std::path::Path,
        trainer: Arc<dyn ModelTrainer>,
        sink: Arc<dyn MetricsSink>,
    ) -> PipelineOrchestrator {
        let resolver = ConfigurationResolver::from_files(
            root,
            std::path::Path::new("config/config.yaml"),
            std::path::Path::new("params.yaml"),
        )
        .unwrap();
        let mut collaborators = Collaborators::standard().unwrap();
        collaborators.trainer = trainer;
        PipelineOrchestrator::new(resolver, collaborators, sink)
    }

    fn ledger(root: &std::path::Path) -> RunStateStore {
        RunStateStore::open(&root.join("artifacts/run_state.json")).unwrap()
    }

    #[test]
    fn selector_parsing() {
        assert_eq!("all".parse::<StageSelector>().unwrap(), StageSelector::All);
        assert_eq!(
            "training".parse::<StageSelector>().unwrap(),
            StageSelector::Single(StageName::Training)
        );
        assert!("deploy".parse::<StageSelector>().is_err());
        assert_eq!(StageSelector::Single(StageName::BasePrep).to_string(), "base_prep");
    }

    #[test]
    fn transitions_are_forward_only() {
        use PipelineState::*;
        assert!(NotStarted.can_transition_to(Ingesting));
        assert!(Preparing.can_transition_to(Evaluating));
        assert!(Training.can_transition_to(Failed));
        assert!(!Training.can_transition_to(Preparing));
        assert!(!Failed.can_transition_to(Done));
        assert!(!Done.can_transition_to(Failed));
    }

    #[test]
    fn stage_failure_message_names_stage_and_kind() {
        let failure = StageFailure::new(StageName::BasePrep, PipelineError::config("bad classes"));
        assert_eq!(
            failure.to_string(),
            "stage base_prep failed (ConfigurationError): configuration error: bad classes"
        );
        assert_eq!(failure.kind(), "ConfigurationError");
    }

    #[test]
    fn end_to_end_run() {
        let root = temp_dir("e2e");
        write_project(&root, PARAMS_YAML);
        let sink = Arc::new(RecordingSink::default());
        let progress = Boundaries::default();

        let mut orch = orchestrator(&root, Arc::new(SoftmaxTrainer), sink.clone())
            .with_experiment(Some("e2e".into()));
        let summary = orch.run(StageSelector::All, &progress).unwrap();

        assert_eq!(orch.state(), PipelineState::Done);
        assert_eq!(
            orch.history(),
            [
                PipelineState::NotStarted,
                PipelineState::Ingesting,
                PipelineState::Preparing,
                PipelineState::Training,
                PipelineState::Evaluating,
                PipelineState::Done,
            ]
        );
        assert_eq!(summary.outcomes.len(), 4);

        let checkpoint = root.join("artifacts/training/model.json");
        assert!(std::fs::metadata(&checkpoint).unwrap().len() > 0);

        let scores: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(root.join("scores.json")).unwrap()).unwrap();
        assert!(scores["loss"].is_f64());
        assert!(scores["accuracy"].is_f64());
        assert!(summary.scores.is_some());

        let events = progress.0.lock().unwrap().clone();
        assert_eq!(events.first().map(String::as_str), Some("start:ingestion"));
        assert_eq!(events.last().map(String::as_str), Some("done"));

        let stages: Vec<String> = sink.records().iter().map(|r| r.stage.clone()).collect();
        assert_eq!(stages, vec!["training", "evaluation"]);

        let ledger = ledger(&root);
        for stage in StageName::ALL {
            let record = ledger.record(stage).unwrap();
            assert_eq!(record.status, StageStatus::Completed);
            assert_eq!(record.run_id, summary.run_id);
            assert_eq!(record.fingerprint.len(), 64);
        }
        assert_eq!(ledger.record(StageName::Ingestion).unwrap().outputs[0].files, 20);
    }

    #[test]
    fn rerun_skips_ingestion() {
        let root = temp_dir("e2e");
        write_project(&root, PARAMS_YAML);

        orchestrator(&root, Arc::new(SoftmaxTrainer), Arc::new(NullSink))
            .run(StageSelector::All, &SilentProgress)
            .unwrap();
        // The source archive is gone; only a skip can succeed.
        std::fs::remove_file(root.join("source/dataset.tar.gz")).unwrap();

        let summary = orchestrator(&root, Arc::new(SoftmaxTrainer), Arc::new(NullSink))
            .run(StageSelector::Single(StageName::Ingestion), &SilentProgress)
            .unwrap();
        assert!(matches!(summary.outcomes[0].1, StageOutcome::Skipped { .. }));
        assert_eq!(
            ledger(&root).record(StageName::Ingestion).unwrap().status,
            StageStatus::Skipped
        );
    }

    #[test]
    fn zero_classes_stops_before_training() {
        let root = temp_dir("e2e");
        write_project(&root, &PARAMS_YAML.replace("classes: 2\n", "classes: 0\n"));
        let trainer = Arc::new(SpyTrainer::default());

        let mut orch = orchestrator(&root, trainer.clone(), Arc::new(NullSink));
        let failure = orch.run(StageSelector::All, &SilentProgress).unwrap_err();

        assert_eq!(failure.stage, StageName::BasePrep);
        assert_eq!(failure.kind(), "ConfigurationError");
        assert_eq!(orch.state(), PipelineState::Failed);
        assert_eq!(trainer.trains.load(Ordering::SeqCst), 0);
        assert!(!root.join("artifacts/training/model.json").exists());

        let ledger = ledger(&root);
        assert_eq!(ledger.record(StageName::Ingestion).unwrap().status, StageStatus::Completed);
        let failed = ledger.record(StageName::BasePrep).unwrap();
        assert_eq!(failed.status, StageStatus::Failed);
        assert_eq!(failed.error_kind.as_deref(), Some("ConfigurationError"));
        assert!(ledger.record(StageName::Training).is_none());
    }

    #[test]
    fn training_alone_needs_upstream_artifacts() {
        let root = temp_dir("e2e");
        write_project(&root, PARAMS_YAML);

        let mut orch = orchestrator(&root, Arc::new(SoftmaxTrainer), Arc::new(NullSink));
        let failure = orch
            .run(StageSelector::Single(StageName::Training), &SilentProgress)
            .unwrap_err();

        assert_eq!(failure.stage, StageName::Training);
        assert_eq!(failure.kind(), "DependencyError");
        assert_eq!(orch.state(), PipelineState::Failed);
        assert!(ledger(&root).state().stages.is_empty());
    }

    #[test]
    fn single_stages_run_after_upstream() {
        let root = temp_dir("e2e");
        write_project(&root, PARAMS_YAML);

        for stage in StageName::ALL {
            orchestrator(&root, Arc::new(SoftmaxTrainer), Arc::new(NullSink))
                .run(StageSelector::Single(stage), &SilentProgress)
                .unwrap();
        }
        assert!(root.join("scores.json").is_file());
    }

    #[test]
    fn resolution_errors_fail_before_any_stage_runs() {
        let root = temp_dir("e2e");
        write_project(&root, &PARAMS_YAML.replace("epochs: 1\n", "epochs: 1.5\n"));

        let mut orch = orchestrator(&root, Arc::new(SoftmaxTrainer), Arc::new(NullSink));
        let failure = orch.run(StageSelector::All, &SilentProgress).unwrap_err();
        assert_eq!(failure.stage, StageName::Training);
        assert_eq!(failure.kind(), "ConfigurationError");
        assert!(!root.join("artifacts/data_ingestion/dataset").exists());
        assert_eq!(orch.history(), [PipelineState::NotStarted, PipelineState::Failed]);
    }

    #[test]
    fn dataset_outside_ingestion_output_is_dependency_error() {
        let root = temp_dir("e2e");
        write_project(&root, PARAMS_YAML);
        let settings = root.join("config/config.yaml");
        let content = std::fs::read_to_string(&settings).unwrap().replace(
            "training_data: artifacts/data_ingestion/dataset",
            "training_data: artifacts/elsewhere",
        );
        std::fs::write(&settings, content).unwrap();

        // Ingestion never populates the dataset dir, so the plan is rejected up front.
        let mut orch = orchestrator(&root, Arc::new(SoftmaxTrainer), Arc::new(NullSink));
        let failure = orch.run(StageSelector::All, &SilentProgress).unwrap_err();
        assert_eq!(failure.stage, StageName::Training);
        assert_eq!(failure.kind(), "DependencyError");
        assert!(!root.join("artifacts/data_ingestion/dataset").exists());

        for stage in [StageName::Ingestion, StageName::BasePrep] {
            orchestrator(&root, Arc::new(SoftmaxTrainer), Arc::new(NullSink))
                .run(StageSelector::Single(stage), &SilentProgress)
                .unwrap();
        }
        let spy = Arc::new(SpyTrainer::default());
        let failure = orchestrator(&root, spy.clone(), Arc::new(NullSink))
            .run(StageSelector::Single(StageName::Training), &SilentProgress)
            .unwrap_err();
        assert_eq!(failure.kind(), "DependencyError");
        match &failure.source {
            PipelineError::Dependency { path, .. } => {
                assert!(path.ends_with("artifacts/elsewhere"));
            }
            other => panic!("expected dependency error, got {other:?}"),
        }
        assert_eq!(spy.trains.load(Ordering::SeqCst), 0);
    }
}
