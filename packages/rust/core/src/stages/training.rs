//! Training: fit the prepared model on the training split and save the checkpoint.

use std::sync::Arc;

use serde_json::json;
use tracing::{info, instrument};

use imgflow_model::{Dataset, ModelArtifact, ModelTrainer, TrainOptions};
use imgflow_shared::{PipelineError, Result, StageName};
use imgflow_tracking::MetricsRecord;

use crate::schema::TrainingConfig;
use crate::stages::{StageContext, StageOutcome, StageRunner};

pub struct TrainingRunner {
    config: TrainingConfig,
    trainer: Arc<dyn ModelTrainer>,
}

impl TrainingRunner {
    pub fn new(config: TrainingConfig, trainer: Arc<dyn ModelTrainer>) -> Self {
        Self { config, trainer }
    }

    fn options(&self) -> TrainOptions {
        TrainOptions {
            epochs: self.config.epochs,
            batch_size: self.config.batch_size,
            learning_rate: self.config.learning_rate,
            augmentation: self.config.augmentation,
            seed: self.config.seed,
        }
    }
}

impl StageRunner for TrainingRunner {
    fn stage(&self) -> StageName {
        StageName::Training
    }

    #[instrument(skip_all, fields(stage = "training", data = %self.config.training_data.display()))]
    fn execute(&self, ctx: &StageContext<'_>) -> Result<StageOutcome> {
        let cfg = &self.config;

        let model = ModelArtifact::load(&cfg.updated_base_model_path)?;
        if model.input_shape != cfg.image_size {
            return Err(PipelineError::Model(format!(
                "prepared model expects {:?} images but image_size is {:?}; rerun base_prep",
                model.input_shape, cfg.image_size
            )));
        }

        let dataset = Dataset::scan(&cfg.training_data)?;
        let split = dataset.partition(cfg.split_ratio, cfg.seed);
        info!(
            classes = dataset.class_count(),
            train = split.train.len(),
            validation = split.validation.len(),
            "dataset partitioned"
        );

        let options = self.options();
        let trained = self
            .trainer
            .train(model, &dataset.class_names, &split.train, &options)?;
        trained.save(&cfg.trained_model_path)?;

        let mut record = MetricsRecord::new(ctx.run_id, self.stage().as_str(), ctx.experiment.map(String::from))
            .with_param("epochs", json!(cfg.epochs))
            .with_param("batch_size", json!(cfg.batch_size))
            .with_param("learning_rate", json!(cfg.learning_rate))
            .with_param("augmentation", json!(cfg.augmentation))
            .with_param("split_ratio", json!(cfg.split_ratio))
            .with_param("seed", json!(cfg.seed))
            .with_metric("train_samples", split.train.len() as f64);
        if let Some(summary) = &trained.training {
            record = record
                .with_metric("train_loss", summary.loss)
                .with_metric("train_accuracy", summary.accuracy);
        }
        ctx.sink.emit(record);

        Ok(StageOutcome::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    use imgflow_model::SoftmaxTrainer;
    use imgflow_shared::ImageShape;
    use imgflow_tracking::NullSink;

    use crate::test_support::{RecordingSink, temp_dir, write_dataset};

    fn prepare(root: &Path, classes: usize) -> TrainingConfig {
        let shape = ImageShape::new(16, 16, 3).unwrap();
        let mut model = ModelArtifact::base("grid-pool-4", shape, None).unwrap();
        model.attach_head(classes, 1);
        model.save(&root.join("prepared.json")).unwrap();

        TrainingConfig {
            root_dir: root.to_path_buf(),
            trained_model_path: root.join("model.json"),
            updated_base_model_path: root.join("prepared.json"),
            training_data: root.join("dataset"),
            image_size: shape,
            epochs: 2,
            batch_size: 4,
            augmentation: true,
            learning_rate: 0.5,
            split_ratio: 0.8,
            seed: 42,
        }
    }

    fn ctx(sink: &dyn imgflow_tracking::MetricsSink) -> StageContext<'_> {
        StageContext {
            run_id: "run-test",
            previous: None,
            sink,
            experiment: Some("exp"),
        }
    }

    #[test]
    fn trains_and_reports_metrics() {
        let root = temp_dir("training");
        write_dataset(&root.join("dataset"), &["cats", "dogs"], 5);
        let cfg = prepare(&root, 2);
        let sink = RecordingSink::default();

        let runner = TrainingRunner::new(cfg.clone(), Arc::new(SoftmaxTrainer));
        runner.execute(&ctx(&sink)).unwrap();

        let checkpoint = ModelArtifact::load(&cfg.trained_model_path).unwrap();
        assert_eq!(checkpoint.class_names, vec!["cats", "dogs"]);
        assert_eq!(checkpoint.training.unwrap().epochs, 2);

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].stage, "training");
        assert_eq!(records[0].experiment.as_deref(), Some("exp"));
        assert_eq!(records[0].metrics["train_samples"], 8.0);
        assert!(records[0].metrics.contains_key("train_loss"));
    }

    #[test]
    fn class_count_mismatch_is_training_error() {
        let root = temp_dir("training");
        write_dataset(&root.join("dataset"), &["a", "b", "c"], 3);
        let cfg = prepare(&root, 2);

        let err = TrainingRunner::new(cfg.clone(), Arc::new(SoftmaxTrainer))
            .execute(&ctx(&NullSink))
            .unwrap_err();
        assert_eq!(err.kind(), "TrainingError");
        assert!(!cfg.trained_model_path.exists());
    }

    #[test]
    fn missing_dataset_is_training_error() {
        let root = temp_dir("training");
        let cfg = prepare(&root, 2);
        let err = TrainingRunner::new(cfg, Arc::new(SoftmaxTrainer))
            .execute(&ctx(&NullSink))
            .unwrap_err();
        assert_eq!(err.kind(), "TrainingError");
    }

    #[test]
    fn image_size_change_requires_new_base() {
        let root = temp_dir("training");
        write_dataset(&root.join("dataset"), &["cats", "dogs"], 2);
        let mut cfg = prepare(&root, 2);
        cfg.image_size = ImageShape::new(32, 32, 3).unwrap();
        let err = TrainingRunner::new(cfg, Arc::new(SoftmaxTrainer))
            .execute(&ctx(&NullSink))
            .unwrap_err();
        assert_eq!(err.kind(), "ModelError");
    }
}
