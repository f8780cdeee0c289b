//! Model artifact format and the built-in base architectures.
//!
//! A model is persisted as a single JSON document: the base network's layer
//! stack (with per-layer trainable flags), an optional dense classification
//! head, and training metadata. Base models, prepared models and trained
//! checkpoints all share this format.

use std::ops::Range;
use std::path::Path;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use imgflow_shared::{ImageShape, PipelineError, Result};

/// Current version of the model artifact format.
pub const MODEL_FORMAT_VERSION: u32 = 1;

/// Base architecture used when the parameters do not name one.
pub const DEFAULT_ARCHITECTURE: &str = "grid-pool-8";

/// Base architectures this crate can build, by name.
pub const BUILTIN_ARCHITECTURES: &[(&str, u32)] = &[
    ("grid-pool-4", 4),
    ("grid-pool-8", 8),
    ("grid-pool-16", 16),
];

// ---------------------------------------------------------------------------
// Layers
// ---------------------------------------------------------------------------

/// Operation performed by a base layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LayerKind {
    Input,
    Resize { height: u32, width: u32 },
    Normalize,
    GridPool { grid: u32 },
    Flatten,
}

/// One layer of the base network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerSpec {
    pub name: String,
    pub kind: LayerKind,
    /// Number of scalar outputs this layer produces per image.
    pub output_width: usize,
    pub trainable: bool,
}

/// Dense softmax classification head.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseHead {
    pub units: usize,
    pub input_width: usize,
    /// Row-major `[units][input_width]`.
    pub weights: Vec<Vec<f32>>,
    pub bias: Vec<f32>,
}

impl DenseHead {
    /// Xavier-uniform initialisation driven by `seed`.
    pub fn initialise(units: usize, input_width: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let limit = (6.0 / (units + input_width) as f64).sqrt() as f32;
        let weights = (0..units)
            .map(|_| {
                (0..input_width)
                    .map(|_| rng.gen_range(-limit..=limit))
                    .collect()
            })
            .collect();

        Self {
            units,
            input_width,
            weights,
            bias: vec![0.0; units],
        }
    }

    /// Raw class scores for one feature vector.
    pub fn logits(&self, features: &[f32]) -> Vec<f64> {
        self.weights
            .iter()
            .zip(&self.bias)
            .map(|(row, b)| {
                row.iter()
                    .zip(features)
                    .map(|(w, x)| f64::from(*w) * f64::from(*x))
                    .sum::<f64>()
                    + f64::from(*b)
            })
            .collect()
    }

    /// Class probabilities for one feature vector.
    pub fn probabilities(&self, features: &[f32]) -> Vec<f64> {
        softmax(&self.logits(features))
    }
}

/// Numerically stable softmax.
pub fn softmax(logits: &[f64]) -> Vec<f64> {
    let max = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = logits.iter().map(|l| (l - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Optimizer settings recorded with the prepared model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerSpec {
    pub kind: String,
    pub learning_rate: f64,
}

/// Summary of the last training run, stored in checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSummary {
    pub epochs: u32,
    pub train_samples: usize,
    pub loss: f64,
    pub accuracy: f64,
}

// ---------------------------------------------------------------------------
// Freezing
// ---------------------------------------------------------------------------

/// Which base layers stay fixed during training.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreezePolicy {
    /// Every base layer is frozen.
    All,
    /// All but the last `n` base layers are frozen.
    AllButLast(usize),
    /// Nothing is frozen.
    None,
}

impl FreezePolicy {
    /// Map the `freeze_all` / `freeze_till` hyperparameters to a policy.
    pub fn from_params(freeze_all: bool, freeze_till: Option<u32>) -> Self {
        match (freeze_all, freeze_till) {
            (true, _) => Self::All,
            (false, Some(n)) if n > 0 => Self::AllButLast(n as usize),
            _ => Self::None,
        }
    }
}

// ---------------------------------------------------------------------------
// ModelArtifact
// ---------------------------------------------------------------------------

/// Structural description used to compare two artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelStructure {
    pub layer_count: usize,
    pub frozen_ranges: Vec<Range<usize>>,
    pub output_width: usize,
}

/// The persisted model document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub format_version: u32,
    pub architecture: String,
    pub input_shape: ImageShape,
    /// Name of the pretrained weight set the base was built from, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weights: Option<String>,
    pub layers: Vec<LayerSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head: Option<DenseHead>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimizer: Option<OptimizerSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub class_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub training: Option<TrainingSummary>,
}

impl ModelArtifact {
    /// Build a headless base network from the built-in registry.
    pub fn base(name: &str, shape: ImageShape, weights: Option<String>) -> Result<Self> {
        let grid = BUILTIN_ARCHITECTURES
            .iter()
            .find(|(known, _)| *known == name)
            .map(|(_, grid)| *grid)
            .ok_or_else(|| {
                let known: Vec<&str> = BUILTIN_ARCHITECTURES.iter().map(|(n, _)| *n).collect();
                PipelineError::config(format!(
                    "unknown base architecture `{name}`: expected one of {}",
                    known.join(", ")
                ))
            })?;

        if grid > shape.height || grid > shape.width {
            return Err(PipelineError::config(format!(
                "base architecture `{name}` needs images of at least {grid}x{grid}, got {}x{}",
                shape.height, shape.width
            )));
        }

        let channels = shape.channels as usize;
        let pixels = shape.height as usize * shape.width as usize * channels;
        let pooled = (grid * grid) as usize * channels;

        let layer = |name: &str, kind: LayerKind, output_width: usize| LayerSpec {
            name: name.to_string(),
            kind,
            output_width,
            trainable: true,
        };

        Ok(Self {
            format_version: MODEL_FORMAT_VERSION,
            architecture: name.to_string(),
            input_shape: shape,
            weights,
            layers: vec![
                layer("input", LayerKind::Input, pixels),
                layer(
                    "resize",
                    LayerKind::Resize {
                        height: shape.height,
                        width: shape.width,
                    },
                    pixels,
                ),
                layer("normalize", LayerKind::Normalize, pixels),
                layer("grid_pool", LayerKind::GridPool { grid }, pooled),
                layer("flatten", LayerKind::Flatten, pooled),
            ],
            head: None,
            optimizer: None,
            class_names: Vec::new(),
            training: None,
        })
    }

    /// Width of the base network's output (the head's input).
    pub fn feature_width(&self) -> usize {
        self.layers.last().map_or(0, |l| l.output_width)
    }

    /// Width of the model's final output.
    pub fn output_width(&self) -> usize {
        self.head.as_ref().map_or(self.feature_width(), |h| h.units)
    }

    /// Apply a freeze policy to the base layers.
    pub fn freeze(&mut self, policy: FreezePolicy) {
        let len = self.layers.len();
        let frozen = match policy {
            FreezePolicy::All => len,
            FreezePolicy::AllButLast(n) => len.saturating_sub(n),
            FreezePolicy::None => 0,
        };
        for (i, layer) in self.layers.iter_mut().enumerate() {
            layer.trainable = i >= frozen;
        }
    }

    /// Append a freshly initialised classification head.
    pub fn attach_head(&mut self, classes: usize, seed: u64) {
        self.head = Some(DenseHead::initialise(classes, self.feature_width(), seed));
    }

    /// Layer count, frozen layer ranges and output width.
    pub fn structure(&self) -> ModelStructure {
        let mut frozen_ranges = Vec::new();
        let mut start = None;
        for (i, layer) in self.layers.iter().enumerate() {
            match (layer.trainable, start) {
                (false, None) => start = Some(i),
                (true, Some(s)) => {
                    frozen_ranges.push(s..i);
                    start = None;
                }
                _ => {}
            }
        }
        if let Some(s) = start {
            frozen_ranges.push(s..self.layers.len());
        }

        ModelStructure {
            layer_count: self.layers.len() + usize::from(self.head.is_some()),
            frozen_ranges,
            output_width: self.output_width(),
        }
    }

    /// Borrow the head, failing if the model has none.
    pub fn require_head(&self) -> Result<&DenseHead> {
        self.head
            .as_ref()
            .ok_or_else(|| PipelineError::Model("model has no classification head".into()))
    }

    /// Load a model artifact from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;
        let model: Self = serde_json::from_str(&content).map_err(|e| {
            PipelineError::Model(format!("invalid model file {}: {e}", path.display()))
        })?;

        if model.format_version != MODEL_FORMAT_VERSION {
            return Err(PipelineError::Model(format!(
                "unsupported model format_version: {} (expected {MODEL_FORMAT_VERSION})",
                model.format_version
            )));
        }
        if let Some(head) = &model.head {
            let consistent = head.input_width == model.feature_width()
                && head.weights.len() == head.units
                && head.bias.len() == head.units
                && head.weights.iter().all(|row| row.len() == head.input_width);
            if !consistent {
                return Err(PipelineError::Model(format!(
                    "model head in {} does not match its base network",
                    path.display()
                )));
            }
        }
        Ok(model)
    }

    /// Write the model atomically (temp file, then rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))?;
        }
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| PipelineError::Model(format!("failed to serialize model: {e}")))?;

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "model.json".into());
        let temp = path.with_file_name(format!(".{file_name}.tmp"));

        std::fs::write(&temp, content).map_err(|e| PipelineError::io(&temp, e))?;
        std::fs::rename(&temp, path).map_err(|e| PipelineError::io(path, e))?;

        debug!(path = %path.display(), layers = self.layers.len(), "model saved");
        Ok(())
    }
}
