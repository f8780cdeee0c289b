//! Checkpoint loading and single-image prediction.
//!
//! This is the contract the inference endpoint relies on: any checkpoint
//! written by the training stage loads here.

use std::path::Path;

use serde::Serialize;

use imgflow_shared::{PipelineError, Result};

use crate::architecture::ModelArtifact;
use crate::features::FeatureExtractor;
use crate::trainer::argmax;

/// Predicted label for one image.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    pub label: String,
    pub class_index: usize,
    pub confidence: f64,
}

/// A trained checkpoint ready to classify images.
#[derive(Debug, Clone)]
pub struct Classifier {
    model: ModelArtifact,
    extractor: FeatureExtractor,
}

impl Classifier {
    /// Load a trained checkpoint.
    pub fn load(path: &Path) -> Result<Self> {
        Self::from_model(ModelArtifact::load(path)?)
    }

    /// Wrap an in-memory trained model.
    pub fn from_model(model: ModelArtifact) -> Result<Self> {
        let head = model.require_head()?;
        if model.class_names.len() != head.units {
            return Err(PipelineError::Model(format!(
                "checkpoint has {} class names for {} outputs; was it trained?",
                model.class_names.len(),
                head.units
            )));
        }
        let extractor = FeatureExtractor::for_model(&model)?;
        Ok(Self { model, extractor })
    }

    /// Class names in output order.
    pub fn class_names(&self) -> &[String] {
        &self.model.class_names
    }

    /// Classify an encoded image (PNG, JPEG, BMP or GIF bytes).
    pub fn predict(&self, encoded: &[u8]) -> Result<Prediction> {
        let img = image::load_from_memory(encoded)
            .map_err(|e| PipelineError::Model(format!("cannot decode input image: {e}")))?;
        let features = self.extractor.extract(&img);
        let probs = self.model.require_head()?.probabilities(&features);
        let class_index = argmax(&probs);

        Ok(Prediction {
            label: self.model.class_names[class_index].clone(),
            class_index,
            confidence: probs[class_index],
        })
    }

    /// Classify an image file.
    pub fn predict_path(&self, path: &Path) -> Result<Prediction> {
        let bytes = std::fs::read(path).map_err(|e| PipelineError::io(path, e))?;
        self.predict(&bytes)
    }
}
