//! Model trainer capability for imgflow.
//!
//! Everything the pipeline needs from "the model" lives behind this crate:
//! base architectures and the persisted model format ([`ModelArtifact`]),
//! labelled dataset scanning and deterministic partitioning ([`Dataset`]),
//! fitting and scoring ([`ModelTrainer`], [`SoftmaxTrainer`]), and checkpoint
//! prediction ([`Classifier`]).

pub mod architecture;
pub mod dataset;
pub mod features;
pub mod predict;
pub mod trainer;

pub use architecture::{
    BUILTIN_ARCHITECTURES, DEFAULT_ARCHITECTURE, DenseHead, FreezePolicy, LayerKind, LayerSpec,
    MODEL_FORMAT_VERSION, ModelArtifact, ModelStructure, OptimizerSpec, TrainingSummary,
};
pub use dataset::{Dataset, IMAGE_EXTENSIONS, Sample, Split};
pub use features::FeatureExtractor;
pub use predict::{Classifier, Prediction};
pub use trainer::{Evaluation, ModelTrainer, SoftmaxTrainer, TrainOptions};
