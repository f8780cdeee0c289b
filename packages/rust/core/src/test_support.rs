//! Fixtures shared by the unit tests in this crate.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use flate2::Compression;
use flate2::write::GzEncoder;
use url::Url;

use imgflow_tracking::{MetricsRecord, MetricsSink};

pub(crate) const SOURCE_PLACEHOLDER: &str = "file:///tmp/imgflow-fixtures/dataset.tar.gz";

pub(crate) const SETTINGS_YAML: &str = "\
artifacts_root: artifacts
data_ingestion:
  root_dir: artifacts/data_ingestion
  source_url: file:///tmp/imgflow-fixtures/dataset.tar.gz
  local_data_file: artifacts/data_ingestion/data.tar.gz
  unzip_dir: artifacts/data_ingestion/dataset
prepare_base_model:
  root_dir: artifacts/prepare_base_model
  base_model_path: artifacts/prepare_base_model/base_model.json
  updated_base_model_path: artifacts/prepare_base_model/base_model_updated.json
training:
  root_dir: artifacts/training
  trained_model_path: artifacts/training/model.json
  training_data: artifacts/data_ingestion/dataset
evaluation:
  scores_path: scores.json
";

pub(crate) const PARAMS_YAML: &str = "\
image_size: [16, 16, 3]
base_architecture: grid-pool-4
include_top: false
weights: imagenet
classes: 2
learning_rate: 0.5
freeze_all: true
freeze_till: null
epochs: 1
batch_size: 4
augmentation: false
split_ratio: 0.8
seed: 42
";

pub(crate) fn temp_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("imgflow-{tag}-{}", uuid::Uuid::now_v7()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// Brightness of class `index`: even classes dark, odd classes light.
fn shade(index: usize) -> u8 {
    if index % 2 == 0 { 20 } else { 235 }
}

fn png(value: u8) -> Vec<u8> {
    let img = image::RgbImage::from_pixel(16, 16, image::Rgb([value, value, value]));
    let mut bytes = Cursor::new(Vec::new());
    img.write_to(&mut bytes, image::ImageFormat::Png).unwrap();
    bytes.into_inner()
}

/// One directory per class holding `per_class` solid-colour PNGs.
pub(crate) fn write_dataset(root: &Path, classes: &[&str], per_class: usize) {
    for (c, class) in classes.iter().enumerate() {
        let dir = root.join(class);
        std::fs::create_dir_all(&dir).unwrap();
        let bytes = png(shade(c));
        for i in 0..per_class {
            std::fs::write(dir.join(format!("img-{i:03}.png")), &bytes).unwrap();
        }
    }
}

/// The same layout as [`write_dataset`], packed as a tar.gz archive.
pub(crate) fn write_dataset_archive(path: &Path, classes: &[&str], per_class: usize) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    let enc = GzEncoder::new(std::fs::File::create(path).unwrap(), Compression::default());
    let mut tar = tar::Builder::new(enc);

    for (c, class) in classes.iter().enumerate() {
        let bytes = png(shade(c));
        for i in 0..per_class {
            let mut header = tar::Header::new_gnu();
            header.set_size(bytes.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            tar.append_data(&mut header, format!("{class}/img-{i:03}.png"), bytes.as_slice())
                .unwrap();
        }
    }
    tar.into_inner().unwrap().finish().unwrap();
}

/// Lay out a project under `root`: settings, `params`, and a 2 x 10 image
/// source archive at `source/dataset.tar.gz`.
pub(crate) fn write_project(root: &Path, params: &str) {
    let archive = root.join("source/dataset.tar.gz");
    write_dataset_archive(&archive, &["cats", "dogs"], 10);

    let source = Url::from_file_path(&archive).unwrap();
    let settings = SETTINGS_YAML.replace(SOURCE_PLACEHOLDER, source.as_str());

    std::fs::create_dir_all(root.join("config")).unwrap();
    std::fs::write(root.join("config/config.yaml"), settings).unwrap();
    std::fs::write(root.join("params.yaml"), params).unwrap();
}

/// Keeps every record it is given.
#[derive(Default)]
pub(crate) struct RecordingSink(Mutex<Vec<MetricsRecord>>);

impl RecordingSink {
    pub(crate) fn records(&self) -> Vec<MetricsRecord> {
        self.0.lock().unwrap().clone()
    }
}

impl MetricsSink for RecordingSink {
    fn emit(&self, record: MetricsRecord) {
        self.0.lock().unwrap().push(record);
    }
}
