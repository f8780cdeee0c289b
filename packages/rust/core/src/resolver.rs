//! Turns the settings and parameters documents into per-stage schemas.
//!
//! Relative paths are resolved against a single project root. Resolving a
//! stage creates the directories that stage will write into; nothing else
//! touches the filesystem.

use std::path::{Path, PathBuf};

use tracing::{debug, instrument};
use url::Url;

use imgflow_model::DEFAULT_ARCHITECTURE;
use imgflow_shared::{ParametersDocument, PipelineError, Result, SettingsDocument, StageName};
use imgflow_tracking::{Credentials, TrackingTarget};

use crate::schema::{
    ArtifactLayout, BasePrepConfig, ConfigSchema, EvaluationConfig, IngestionConfig,
    TrackingConfig, TrainingConfig,
};

/// File name of the run-state ledger under the artifacts root.
pub const RUN_STATE_FILE: &str = "run_state.json";

/// Resolves stage configuration from the two loaded documents.
#[derive(Debug, Clone)]
pub struct ConfigurationResolver {
    root: PathBuf,
    settings: SettingsDocument,
    params: ParametersDocument,
}

impl ConfigurationResolver {
    /// Build a resolver over already loaded documents.
    pub fn new(root: &Path, settings: SettingsDocument, params: ParametersDocument) -> Result<Self> {
        let root = std::path::absolute(root).map_err(|e| PipelineError::io(root, e))?;
        Ok(Self {
            root,
            settings,
            params,
        })
    }

    /// Load both documents (paths relative to `root` unless absolute) and build a resolver.
    pub fn from_files(root: &Path, settings_file: &Path, params_file: &Path) -> Result<Self> {
        let settings = SettingsDocument::load(&root.join(settings_file))?;
        let params = ParametersDocument::load(&root.join(params_file))?;
        Self::new(root, settings, params)
    }

    /// Absolute project root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The loaded parameters document.
    pub fn params(&self) -> &ParametersDocument {
        &self.params
    }

    /// Resolve the configuration for one stage.
    #[instrument(skip(self), fields(root = %self.root.display()))]
    pub fn resolve(&self, stage: StageName) -> Result<ConfigSchema> {
        let schema = match stage {
            StageName::Ingestion => ConfigSchema::Ingestion(self.ingestion()?),
            StageName::BasePrep => ConfigSchema::BasePrep(self.base_prep()?),
            StageName::Training => ConfigSchema::Training(self.training()?),
            StageName::Evaluation => ConfigSchema::Evaluation(self.evaluation()?),
        };
        debug!(%stage, "resolved stage configuration");
        Ok(schema)
    }

    pub fn ingestion(&self) -> Result<IngestionConfig> {
        let raw_url = self.settings.require_str("data_ingestion.source_url")?;
        let source_url = Url::parse(raw_url).map_err(|e| {
            PipelineError::config(format!("data_ingestion.source_url `{raw_url}` is not a valid URI: {e}"))
        })?;
        if !matches!(source_url.scheme(), "http" | "https" | "file") {
            return Err(PipelineError::config(format!(
                "data_ingestion.source_url scheme `{}` is not supported (use http, https or file)",
                source_url.scheme()
            )));
        }

        let config = IngestionConfig {
            root_dir: self.path("data_ingestion.root_dir")?,
            source_url,
            local_data_file: self.path("data_ingestion.local_data_file")?,
            unzip_dir: self.path("data_ingestion.unzip_dir")?,
        };

        self.ensure_dir(&config.root_dir)?;
        self.ensure_parent(&config.local_data_file)?;
        self.ensure_parent(&config.unzip_dir)?;
        Ok(config)
    }

    pub fn base_prep(&self) -> Result<BasePrepConfig> {
        let architecture = self
            .params
            .optional_text("base_architecture")?
            .unwrap_or_else(|| DEFAULT_ARCHITECTURE.to_string());

        let config = BasePrepConfig {
            root_dir: self.path("prepare_base_model.root_dir")?,
            base_model_path: self.path("prepare_base_model.base_model_path")?,
            updated_base_model_path: self.path("prepare_base_model.updated_base_model_path")?,
            architecture,
            image_size: self.params.require_shape("image_size")?,
            include_top: self.params.require_bool("include_top")?,
            weights: self.params.optional_text("weights")?,
            classes: self.params.require_u32("classes")?,
            learning_rate: self.learning_rate()?,
            freeze_all: self.params.require_bool("freeze_all")?,
            freeze_till: self.params.optional_u32("freeze_till")?,
            seed: self.params.require_u64("seed")?,
        };

        self.ensure_dir(&config.root_dir)?;
        self.ensure_parent(&config.base_model_path)?;
        self.ensure_parent(&config.updated_base_model_path)?;
        Ok(config)
    }

    pub fn training(&self) -> Result<TrainingConfig> {
        let config = TrainingConfig {
            root_dir: self.path("training.root_dir")?,
            trained_model_path: self.path("training.trained_model_path")?,
            updated_base_model_path: self.path("prepare_base_model.updated_base_model_path")?,
            training_data: self.path("training.training_data")?,
            image_size: self.params.require_shape("image_size")?,
            epochs: self.positive_u32("epochs")?,
            batch_size: self.positive_u32("batch_size")?,
            augmentation: self.params.require_bool("augmentation")?,
            learning_rate: self.learning_rate()?,
            split_ratio: self.split_ratio()?,
            seed: self.params.require_u64("seed")?,
        };

        self.ensure_dir(&config.root_dir)?;
        self.ensure_parent(&config.trained_model_path)?;
        Ok(config)
    }

    pub fn evaluation(&self) -> Result<EvaluationConfig> {
        let config = EvaluationConfig {
            path_of_model: self.path("training.trained_model_path")?,
            training_data: self.path("training.training_data")?,
            scores_path: self.path("evaluation.scores_path")?,
            image_size: self.params.require_shape("image_size")?,
            batch_size: self.positive_u32("batch_size")?,
            split_ratio: self.split_ratio()?,
            seed: self.params.require_u64("seed")?,
            all_params: self.params.all().clone(),
        };

        self.ensure_parent(&config.scores_path)?;
        Ok(config)
    }

    /// Locations of every declared artifact. No directories are created.
    pub fn artifact_layout(&self) -> Result<ArtifactLayout> {
        Ok(ArtifactLayout {
            ingested_data: self.path("data_ingestion.unzip_dir")?,
            dataset: self.path("training.training_data")?,
            base_model: self.path("prepare_base_model.updated_base_model_path")?,
            checkpoint: self.path("training.trained_model_path")?,
            score_summary: self.path("evaluation.scores_path")?,
        })
    }

    /// Location of the run-state ledger; creates the artifacts root.
    pub fn run_state_path(&self) -> Result<PathBuf> {
        let artifacts_root = self.path("artifacts_root")?;
        self.ensure_dir(&artifacts_root)?;
        Ok(artifacts_root.join(RUN_STATE_FILE))
    }

    /// Optional experiment tracking target. Absent section means tracking is off.
    pub fn tracking(&self) -> Result<Option<TrackingConfig>> {
        let Some(uri) = self.settings.optional_str("tracking.uri")? else {
            return Ok(None);
        };

        let target = if uri.starts_with("http://") || uri.starts_with("https://") {
            let endpoint = Url::parse(uri).map_err(|e| {
                PipelineError::config(format!("tracking.uri `{uri}` is not a valid URI: {e}"))
            })?;
            TrackingTarget::Http {
                endpoint,
                credentials: self.credentials()?,
            }
        } else if let Some(stripped) = uri.strip_prefix("file://") {
            TrackingTarget::File {
                path: self.absolute(stripped),
            }
        } else {
            TrackingTarget::File {
                path: self.absolute(uri),
            }
        };

        if let TrackingTarget::File { path } = &target {
            self.ensure_parent(path)?;
        }

        Ok(Some(TrackingConfig {
            target,
            experiment: self.settings.optional_str("tracking.experiment")?.map(String::from),
        }))
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn absolute(&self, raw: &str) -> PathBuf {
        self.root.join(raw)
    }

    fn path(&self, key: &str) -> Result<PathBuf> {
        Ok(self.absolute(self.settings.require_str(key)?))
    }

    /// Credentials come from the environment variables named in the settings.
    fn credentials(&self) -> Result<Option<Credentials>> {
        let read = |key: &str| -> Result<Option<String>> {
            Ok(self
                .settings
                .optional_str(key)?
                .and_then(|var| std::env::var(var).ok())
                .filter(|value| !value.is_empty()))
        };

        Ok(match (read("tracking.username_env")?, read("tracking.password_env")?) {
            (Some(username), Some(password)) => Some(Credentials { username, password }),
            _ => None,
        })
    }

    fn learning_rate(&self) -> Result<f64> {
        let lr = self.params.require_f64("learning_rate")?;
        if !(lr.is_finite() && lr > 0.0) {
            return Err(PipelineError::config(format!(
                "parameter `learning_rate` must be positive, got {lr}"
            )));
        }
        Ok(lr)
    }

    fn split_ratio(&self) -> Result<f64> {
        let ratio = self.params.require_f64("split_ratio")?;
        if !(ratio > 0.0 && ratio < 1.0) {
            return Err(PipelineError::config(format!(
                "parameter `split_ratio` must be strictly between 0 and 1, got {ratio}"
            )));
        }
        Ok(ratio)
    }

    fn positive_u32(&self, key: &str) -> Result<u32> {
        match self.params.require_u32(key)? {
            0 => Err(PipelineError::config(format!("parameter `{key}` must be at least 1"))),
            n => Ok(n),
        }
    }

    fn ensure_dir(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir).map_err(|e| {
            PipelineError::config(format!("cannot create directory {}: {e}", dir.display()))
        })
    }

    fn ensure_parent(&self, path: &Path) -> Result<()> {
        match path.parent() {
            Some(parent) => self.ensure_dir(parent),
            None => Ok(()),
        }
    }
}
