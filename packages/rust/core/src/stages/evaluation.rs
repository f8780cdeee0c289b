//! Evaluation: score the checkpoint on the held-out split and write `scores.json`.

use std::path::Path;
use std::sync::Arc;

use tracing::{info, instrument};

use imgflow_model::{Dataset, Evaluation, ModelArtifact, ModelTrainer};
use imgflow_shared::{PipelineError, Result, ScoreReport, StageName};
use imgflow_tracking::MetricsRecord;

use crate::schema::EvaluationConfig;
use crate::stages::{StageContext, StageOutcome, StageRunner};

pub struct EvaluationRunner {
    config: EvaluationConfig,
    trainer: Arc<dyn ModelTrainer>,
}

impl EvaluationRunner {
    pub fn new(config: EvaluationConfig, trainer: Arc<dyn ModelTrainer>) -> Self {
        Self { config, trainer }
    }

    /// Score the checkpoint on the recomputed validation split.
    pub fn evaluate(&self) -> Result<ScoreReport> {
        let cfg = &self.config;
        let model = ModelArtifact::load(&cfg.path_of_model)?;
        if model.input_shape != cfg.image_size {
            return Err(PipelineError::Model(format!(
                "checkpoint expects {:?} images but image_size is {:?}; retrain first",
                model.input_shape, cfg.image_size
            )));
        }
        let dataset = Dataset::scan(&cfg.training_data)?;

        if !model.class_names.is_empty() && model.class_names != dataset.class_names {
            return Err(PipelineError::Training(format!(
                "dataset classes {:?} differ from the checkpoint's {:?}",
                dataset.class_names, model.class_names
            )));
        }

        let split = dataset.partition(cfg.split_ratio, cfg.seed);
        if split.validation.is_empty() {
            return Err(PipelineError::Training("validation split is empty".into()));
        }

        let mut batches = Vec::new();
        for batch in split.validation.chunks(cfg.batch_size.max(1) as usize) {
            batches.push(self.trainer.evaluate(&model, batch)?);
        }
        let scored = combine(&batches);
        info!(
            samples = scored.samples,
            loss = scored.loss,
            accuracy = scored.accuracy,
            "checkpoint scored"
        );

        Ok(ScoreReport {
            loss: scored.loss,
            accuracy: scored.accuracy,
        })
    }
}

/// Sample-weighted mean of per-batch scores.
fn combine(batches: &[Evaluation]) -> Evaluation {
    let samples: usize = batches.iter().map(|b| b.samples).sum();
    let weighted = |f: fn(&Evaluation) -> f64| {
        batches.iter().map(|b| f(b) * b.samples as f64).sum::<f64>() / samples.max(1) as f64
    };
    Evaluation {
        loss: weighted(|b| b.loss),
        accuracy: weighted(|b| b.accuracy),
        samples,
    }
}

/// Write the score report as pretty JSON (temp file, then rename).
pub fn save_scores(path: &Path, report: &ScoreReport) -> Result<()> {
    let content = serde_json::to_string_pretty(report)
        .map_err(|e| PipelineError::io(path, std::io::Error::other(e)))?;
    let temp = path.with_extension("json.tmp");
    std::fs::write(&temp, content).map_err(|e| PipelineError::io(&temp, e))?;
    std::fs::rename(&temp, path).map_err(|e| PipelineError::io(path, e))
}

impl StageRunner for EvaluationRunner {
    fn stage(&self) -> StageName {
        StageName::Evaluation
    }

    #[instrument(skip_all, fields(stage = "evaluation", model = %self.config.path_of_model.display()))]
    fn execute(&self, ctx: &StageContext<'_>) -> Result<StageOutcome> {
        let report = self.evaluate()?;
        save_scores(&self.config.scores_path, &report)?;

        let params = self
            .config
            .all_params
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect();
        ctx.sink.emit(
            MetricsRecord::new(ctx.run_id, self.stage().as_str(), ctx.experiment.map(String::from))
                .with_params(params)
                .with_metric("loss", report.loss)
                .with_metric("accuracy", report.accuracy),
        );

        Ok(StageOutcome::Scored(report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use imgflow_model::{DenseHead, SoftmaxTrainer};
    use imgflow_shared::{ImageShape, ParamValue};

    use crate::test_support::{RecordingSink, temp_dir, write_dataset};

    /// Checkpoint whose head separates the dark class from the bright one.
    fn perfect_checkpoint(path: &Path) {
        let shape = ImageShape::new(16, 16, 3).unwrap();
        let mut model = ModelArtifact::base("grid-pool-4", shape, None).unwrap();
        let width = model.feature_width();
        model.head = Some(DenseHead {
            units: 2,
            input_width: width,
            weights: vec![vec![-1.0; width], vec![1.0; width]],
            bias: vec![0.5 * width as f32, -0.5 * width as f32],
        });
        model.class_names = vec!["dark".into(), "light".into()];
        model.save(path).unwrap();
    }

    fn config(root: &Path) -> EvaluationConfig {
        EvaluationConfig {
            path_of_model: root.join("model.json"),
            training_data: root.join("dataset"),
            scores_path: root.join("scores.json"),
            image_size: ImageShape::new(16, 16, 3).unwrap(),
            batch_size: 4,
            split_ratio: 0.8,
            seed: 42,
            all_params: BTreeMap::from([("epochs".to_string(), ParamValue::Int(1))]),
        }
    }

    #[test]
    fn perfect_model_scores_full_accuracy() {
        let root = temp_dir("evaluation");
        write_dataset(&root.join("dataset"), &["dark", "light"], 5);
        perfect_checkpoint(&root.join("model.json"));
        let sink = RecordingSink::default();

        let runner = EvaluationRunner::new(config(&root), Arc::new(SoftmaxTrainer));
        let outcome = runner
            .execute(&StageContext {
                run_id: "run-test",
                previous: None,
                sink: &sink,
                experiment: None,
            })
            .unwrap();

        let StageOutcome::Scored(report) = outcome else {
            panic!("expected a score report");
        };
        assert_eq!(report.accuracy, 1.0);
        assert!(report.loss >= 0.0);

        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(root.join("scores.json")).unwrap()).unwrap();
        let mut keys: Vec<&str> = written.as_object().unwrap().keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(keys, ["accuracy", "loss"]);

        let records = sink.records();
        assert_eq!(records[0].params["epochs"], serde_json::json!(1));
        assert_eq!(records[0].metrics["accuracy"], 1.0);
    }

    #[test]
    fn empty_validation_split_is_training_error() {
        let root = temp_dir("evaluation");
        write_dataset(&root.join("dataset"), &["dark", "light"], 1);
        perfect_checkpoint(&root.join("model.json"));

        let err = EvaluationRunner::new(config(&root), Arc::new(SoftmaxTrainer))
            .evaluate()
            .unwrap_err();
        assert_eq!(err.kind(), "TrainingError");
    }

    #[test]
    fn class_names_must_match_checkpoint() {
        let root = temp_dir("evaluation");
        write_dataset(&root.join("dataset"), &["cats", "dogs"], 5);
        perfect_checkpoint(&root.join("model.json"));

        let err = EvaluationRunner::new(config(&root), Arc::new(SoftmaxTrainer))
            .evaluate()
            .unwrap_err();
        assert_eq!(err.kind(), "TrainingError");
    }

    #[test]
    fn image_size_change_is_model_error() {
        let root = temp_dir("evaluation");
        write_dataset(&root.join("dataset"), &["dark", "light"], 5);
        perfect_checkpoint(&root.join("model.json"));

        let mut cfg = config(&root);
        cfg.image_size = ImageShape::new(32, 32, 3).unwrap();
        let err = EvaluationRunner::new(cfg, Arc::new(SoftmaxTrainer))
            .evaluate()
            .unwrap_err();
        assert_eq!(err.kind(), "ModelError");
        assert!(!root.join("scores.json").exists());
    }

    #[test]
    fn batch_size_does_not_change_scores() {
        let root = temp_dir("evaluation");
        write_dataset(&root.join("dataset"), &["dark", "light"], 10);
        perfect_checkpoint(&root.join("model.json"));

        let score = |batch_size| {
            let mut cfg = config(&root);
            cfg.batch_size = batch_size;
            EvaluationRunner::new(cfg, Arc::new(SoftmaxTrainer)).evaluate().unwrap()
        };
        let single = score(1);
        let whole = score(64);
        assert!((single.loss - whole.loss).abs() < 1e-9);
        assert_eq!(single.accuracy, whole.accuracy);
    }
}
