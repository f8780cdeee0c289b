//! Labelled image datasets laid out as one subdirectory per class.
//!
//! ```text
//! <root>/
//! ├── Normal/
//! │   ├── img-001.png
//! │   └── ...
//! └── Tumor/
//!     └── ...
//! ```
//!
//! Classes are the sorted subdirectory names that contain at least one image.
//! Partitioning is stratified per class and driven by a fixed seed, so the
//! same seed and the same files always give the same split.

use std::path::{Path, PathBuf};

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use tracing::{debug, warn};
use walkdir::WalkDir;

use imgflow_shared::{PipelineError, Result};

/// File extensions recognised as images.
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "gif"];

/// One labelled image.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Sample {
    pub path: PathBuf,
    /// Index into [`Dataset::class_names`].
    pub label: usize,
}

/// Train/validation partition of a dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Split {
    pub train: Vec<Sample>,
    pub validation: Vec<Sample>,
}

/// All samples found under a dataset root.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub root: PathBuf,
    pub class_names: Vec<String>,
    pub samples: Vec<Sample>,
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

impl Dataset {
    /// Scan a dataset root. Fails with a training error when there is nothing to learn from.
    pub fn scan(root: &Path) -> Result<Self> {
        if !root.is_dir() {
            return Err(PipelineError::Training(format!(
                "dataset directory {} does not exist",
                root.display()
            )));
        }

        let mut class_dirs: Vec<(String, PathBuf)> = std::fs::read_dir(root)
            .map_err(|e| PipelineError::io(root, e))?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                (!name.starts_with('.')).then(|| (name, entry.path()))
            })
            .collect();

        if class_dirs.is_empty() {
            return Err(PipelineError::Training(format!(
                "dataset directory {} has no class subdirectories",
                root.display()
            )));
        }
        class_dirs.sort();

        let mut class_names = Vec::new();
        let mut samples = Vec::new();

        for (name, dir) in class_dirs {
            let images: Vec<PathBuf> = WalkDir::new(&dir)
                .sort_by_file_name()
                .into_iter()
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.file_type().is_file() && is_image(entry.path()))
                .map(|entry| entry.into_path())
                .collect();

            if images.is_empty() {
                warn!(class = %name, "class directory contains no images, ignoring");
                continue;
            }

            let label = class_names.len();
            debug!(class = %name, label, images = images.len(), "found class");
            class_names.push(name);
            samples.extend(images.into_iter().map(|path| Sample { path, label }));
        }

        if class_names.is_empty() {
            return Err(PipelineError::Training(format!(
                "dataset directory {} has no class subdirectories containing images",
                root.display()
            )));
        }

        Ok(Self {
            root: root.to_path_buf(),
            class_names,
            samples,
        })
    }

    /// Number of recognised classes.
    pub fn class_count(&self) -> usize {
        self.class_names.len()
    }

    /// Deterministic stratified split; `train_ratio` is the training fraction.
    ///
    /// Each class contributes `round(n * train_ratio)` training samples (at
    /// least one when the class is non-empty); the rest go to validation.
    pub fn partition(&self, train_ratio: f64, seed: u64) -> Split {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut train = Vec::new();
        let mut validation = Vec::new();

        for label in 0..self.class_count() {
            let mut members: Vec<&Sample> =
                self.samples.iter().filter(|s| s.label == label).collect();
            members.shuffle(&mut rng);

            let n = members.len();
            let n_train = ((n as f64 * train_ratio).round() as usize).clamp(1.min(n), n);

            train.extend(members[..n_train].iter().map(|s| (*s).clone()));
            validation.extend(members[n_train..].iter().map(|s| (*s).clone()));
        }

        Split { train, validation }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Write a small two-colour dataset: `per_class` images in each of `classes`.
    pub(crate) fn write_dataset(root: &Path, classes: &[&str], per_class: usize) {
        for (c, class) in classes.iter().enumerate() {
            let dir = root.join(class);
            std::fs::create_dir_all(&dir).unwrap();
            let value = if c % 2 == 0 { 20u8 } else { 235u8 };
            for i in 0..per_class {
                let img = image::RgbImage::from_pixel(16, 16, image::Rgb([value, value, value]));
                img.save(dir.join(format!("img-{i:03}.png"))).unwrap();
            }
        }
    }

    pub(crate) fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("imgflow-{tag}-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn scan_finds_sorted_classes() {
        let root = temp_dir("dataset");
        write_dataset(&root, &["tumor", "normal"], 3);
        std::fs::write(root.join("tumor").join("notes.txt"), "ignore me").unwrap();

        let dataset = Dataset::scan(&root).unwrap();
        assert_eq!(dataset.class_names, vec!["normal", "tumor"]);
        assert_eq!(dataset.samples.len(), 6);
        assert!(dataset.samples.iter().all(|s| is_image(&s.path)));
    }

    #[test]
    fn scan_missing_dir_is_training_error() {
        let root = temp_dir("dataset").join("nope");
        assert_eq!(Dataset::scan(&root).unwrap_err().kind(), "TrainingError");
    }

    #[test]
    fn scan_empty_dir_is_training_error() {
        let root = temp_dir("dataset");
        let err = Dataset::scan(&root).unwrap_err();
        assert_eq!(err.kind(), "TrainingError");
    }

    #[test]
    fn scan_class_dirs_without_images_is_training_error() {
        let root = temp_dir("dataset");
        std::fs::create_dir_all(root.join("a")).unwrap();
        std::fs::write(root.join("a").join("readme.md"), "x").unwrap();
        assert_eq!(Dataset::scan(&root).unwrap_err().kind(), "TrainingError");
    }

    #[test]
    fn partition_is_reproducible() {
        let root = temp_dir("dataset");
        write_dataset(&root, &["a", "b"], 5);
        let dataset = Dataset::scan(&root).unwrap();

        let first = dataset.partition(0.8, 42);
        let second = Dataset::scan(&root).unwrap().partition(0.8, 42);
        assert_eq!(first, second);
        assert_eq!(first.train.len(), 8);
        assert_eq!(first.validation.len(), 2);
    }

    #[test]
    fn partition_is_stratified() {
        let root = temp_dir("dataset");
        write_dataset(&root, &["a", "b"], 5);
        let split = Dataset::scan(&root).unwrap().partition(0.8, 1);

        for label in 0..2 {
            assert_eq!(split.validation.iter().filter(|s| s.label == label).count(), 1);
        }
    }

    #[test]
    fn partition_seed_changes_split() {
        let root = temp_dir("dataset");
        write_dataset(&root, &["a", "b"], 10);
        let dataset = Dataset::scan(&root).unwrap();

        let splits: Vec<Split> = (0..5).map(|seed| dataset.partition(0.5, seed)).collect();
        assert!(splits.windows(2).any(|w| w[0] != w[1]));
    }

    #[test]
    fn single_image_class_keeps_one_for_training() {
        let root = temp_dir("dataset");
        write_dataset(&root, &["a"], 1);
        let split = Dataset::scan(&root).unwrap().partition(0.1, 3);
        assert_eq!(split.train.len(), 1);
        assert!(split.validation.is_empty());
    }
}
