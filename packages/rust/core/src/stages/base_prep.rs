//! Base model preparation: base network, freezing, fresh classification head.

use tracing::{info, instrument};

use imgflow_model::{FreezePolicy, ModelArtifact, OptimizerSpec};
use imgflow_shared::{PipelineError, Result, StageName};

use crate::schema::BasePrepConfig;
use crate::stages::{StageContext, StageOutcome, StageRunner};

/// Optimizer recorded with the prepared model.
const OPTIMIZER: &str = "sgd";

pub struct BasePrepRunner {
    config: BasePrepConfig,
}

impl BasePrepRunner {
    pub fn new(config: BasePrepConfig) -> Self {
        Self { config }
    }

    fn validate(&self) -> Result<()> {
        if self.config.classes <= 1 {
            return Err(PipelineError::config(format!(
                "parameter `classes` must be at least 2, got {}",
                self.config.classes
            )));
        }
        if self.config.include_top {
            return Err(PipelineError::config(
                "parameter `include_top` must be false: a new classification head replaces the original top",
            ));
        }
        Ok(())
    }
}

impl StageRunner for BasePrepRunner {
    fn stage(&self) -> StageName {
        StageName::BasePrep
    }

    #[instrument(skip_all, fields(stage = "base_prep", architecture = %self.config.architecture))]
    fn execute(&self, _ctx: &StageContext<'_>) -> Result<StageOutcome> {
        self.validate()?;
        let cfg = &self.config;

        let mut model = ModelArtifact::base(&cfg.architecture, cfg.image_size, cfg.weights.clone())?;
        model.save(&cfg.base_model_path)?;

        model.freeze(FreezePolicy::from_params(cfg.freeze_all, cfg.freeze_till));
        model.attach_head(cfg.classes as usize, cfg.seed);
        model.optimizer = Some(OptimizerSpec {
            kind: OPTIMIZER.to_string(),
            learning_rate: cfg.learning_rate,
        });
        model.save(&cfg.updated_base_model_path)?;

        let structure = model.structure();
        info!(
            layers = structure.layer_count,
            frozen = ?structure.frozen_ranges,
            outputs = structure.output_width,
            "prepared base model"
        );
        Ok(StageOutcome::Completed)
    }
}
