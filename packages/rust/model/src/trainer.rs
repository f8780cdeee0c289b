//! The model trainer capability: fitting a prepared model and scoring it.
//!
//! [`ModelTrainer`] is the seam the pipeline talks to. [`SoftmaxTrainer`] is
//! the built-in implementation: the base network is a fixed feature
//! extractor and only the dense head is fitted, with mini-batch SGD on
//! softmax cross-entropy.

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use tracing::{debug, info, instrument};

use imgflow_shared::{PipelineError, Result};

use crate::architecture::{DenseHead, ModelArtifact, TrainingSummary};
use crate::dataset::Sample;
use crate::features::FeatureExtractor;

/// Probability floor used when taking logs.
const MIN_PROBABILITY: f64 = 1e-12;

/// Hyperparameters for one training run.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainOptions {
    pub epochs: u32,
    pub batch_size: u32,
    pub learning_rate: f64,
    /// Add horizontally mirrored copies of the training images.
    pub augmentation: bool,
    pub seed: u64,
}

/// Loss and accuracy over a set of samples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    pub loss: f64,
    pub accuracy: f64,
    pub samples: usize,
}

/// Fits and scores models.
pub trait ModelTrainer: Send + Sync {
    /// Train `model` on `train` and return the fitted checkpoint.
    fn train(
        &self,
        model: ModelArtifact,
        class_names: &[String],
        train: &[Sample],
        options: &TrainOptions,
    ) -> Result<ModelArtifact>;

    /// Score `model` on `samples`.
    fn evaluate(&self, model: &ModelArtifact, samples: &[Sample]) -> Result<Evaluation>;
}

/// Built-in trainer fitting the dense head only.
#[derive(Debug, Clone, Copy, Default)]
pub struct SoftmaxTrainer;

struct Example {
    features: Vec<f32>,
    label: usize,
}

fn featurize(
    extractor: &FeatureExtractor,
    samples: &[Sample],
    augmentation: bool,
) -> Result<Vec<Example>> {
    let mut examples = Vec::with_capacity(samples.len() * if augmentation { 2 } else { 1 });
    for sample in samples {
        examples.push(Example {
            features: extractor.extract_path(&sample.path, false)?,
            label: sample.label,
        });
        if augmentation {
            examples.push(Example {
                features: extractor.extract_path(&sample.path, true)?,
                label: sample.label,
            });
        }
    }
    Ok(examples)
}

fn score(head: &DenseHead, examples: &[Example]) -> Evaluation {
    let mut loss = 0.0;
    let mut correct = 0usize;

    for example in examples {
        let probs = head.probabilities(&example.features);
        loss -= probs[example.label].max(MIN_PROBABILITY).ln();
        if argmax(&probs) == example.label {
            correct += 1;
        }
    }

    let n = examples.len() as f64;
    Evaluation {
        loss: loss / n,
        accuracy: correct as f64 / n,
        samples: examples.len(),
    }
}

/// Index of the largest value; ties resolve to the lowest index.
pub fn argmax(values: &[f64]) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f64::NEG_INFINITY), |(best, best_v), (i, v)| {
            if *v > best_v { (i, *v) } else { (best, best_v) }
        })
        .0
}

fn sgd_step(head: &mut DenseHead, batch: &[&Example], learning_rate: f64) {
    let mut grad_w = vec![vec![0.0f64; head.input_width]; head.units];
    let mut grad_b = vec![0.0f64; head.units];

    for example in batch {
        let probs = head.probabilities(&example.features);
        for (k, p) in probs.iter().enumerate() {
            let delta = p - if k == example.label { 1.0 } else { 0.0 };
            grad_b[k] += delta;
            for (g, x) in grad_w[k].iter_mut().zip(&example.features) {
                *g += delta * f64::from(*x);
            }
        }
    }

    let step = learning_rate / batch.len() as f64;
    for k in 0..head.units {
        for (w, g) in head.weights[k].iter_mut().zip(&grad_w[k]) {
            *w -= (step * g) as f32;
        }
        head.bias[k] -= (step * grad_b[k]) as f32;
    }
}

impl ModelTrainer for SoftmaxTrainer {
    #[instrument(skip_all, fields(architecture = %model.architecture, samples = train.len()))]
    fn train(
        &self,
        mut model: ModelArtifact,
        class_names: &[String],
        train: &[Sample],
        options: &TrainOptions,
    ) -> Result<ModelArtifact> {
        let units = model.require_head()?.units;
        if units != class_names.len() {
            return Err(PipelineError::Training(format!(
                "dataset has {} classes but the model head has {units} outputs",
                class_names.len()
            )));
        }
        if train.is_empty() {
            return Err(PipelineError::Training("training split is empty".into()));
        }
        if options.epochs == 0 || options.batch_size == 0 {
            return Err(PipelineError::config("epochs and batch_size must be at least 1"));
        }

        let extractor = FeatureExtractor::for_model(&model)?;
        let examples = featurize(&extractor, train, options.augmentation)?;
        info!(examples = examples.len(), features = extractor.width(), "features extracted");

        let mut rng = StdRng::seed_from_u64(options.seed);
        let mut order: Vec<usize> = (0..examples.len()).collect();
        let head = model
            .head
            .as_mut()
            .ok_or_else(|| PipelineError::Model("model has no classification head".into()))?;

        for epoch in 1..=options.epochs {
            order.shuffle(&mut rng);
            for chunk in order.chunks(options.batch_size as usize) {
                let batch: Vec<&Example> = chunk.iter().map(|&i| &examples[i]).collect();
                sgd_step(head, &batch, options.learning_rate);
            }
            let epoch_score = score(head, &examples);
            debug!(epoch, loss = epoch_score.loss, accuracy = epoch_score.accuracy, "epoch complete");
        }

        let final_score = score(head, &examples);
        model.class_names = class_names.to_vec();
        model.training = Some(TrainingSummary {
            epochs: options.epochs,
            train_samples: examples.len(),
            loss: final_score.loss,
            accuracy: final_score.accuracy,
        });

        info!(
            loss = final_score.loss,
            accuracy = final_score.accuracy,
            "training complete"
        );
        Ok(model)
    }

    #[instrument(skip_all, fields(architecture = %model.architecture, samples = samples.len()))]
    fn evaluate(&self, model: &ModelArtifact, samples: &[Sample]) -> Result<Evaluation> {
        if samples.is_empty() {
            return Err(PipelineError::Training("validation split is empty".into()));
        }
        let head = model.require_head()?;
        if let Some(label) = samples.iter().map(|s| s.label).find(|l| *l >= head.units) {
            return Err(PipelineError::Training(format!(
                "sample label {label} is outside the model's {} outputs",
                head.units
            )));
        }

        let extractor = FeatureExtractor::for_model(model)?;
        let examples = featurize(&extractor, samples, false)?;
        Ok(score(head, &examples))
    }
}
