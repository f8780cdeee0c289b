//! Runs a model's base layers over an image to produce a feature vector.

use std::path::Path;

use image::DynamicImage;
use image::imageops::FilterType;

use imgflow_shared::{PipelineError, Result};

use crate::architecture::{LayerKind, ModelArtifact};

/// Feature extractor compiled from a model's base layer stack.
#[derive(Debug, Clone)]
pub struct FeatureExtractor {
    height: u32,
    width: u32,
    channels: u32,
    grid: u32,
    normalize: bool,
}

impl FeatureExtractor {
    /// Compile the base layers of `model`.
    pub fn for_model(model: &ModelArtifact) -> Result<Self> {
        let shape = model.input_shape;
        let mut extractor = Self {
            height: shape.height,
            width: shape.width,
            channels: shape.channels,
            grid: 0,
            normalize: false,
        };

        for layer in &model.layers {
            match layer.kind {
                LayerKind::Input | LayerKind::Flatten => {}
                LayerKind::Resize { height, width } => {
                    extractor.height = height;
                    extractor.width = width;
                }
                LayerKind::Normalize => extractor.normalize = true,
                LayerKind::GridPool { grid } => extractor.grid = grid,
            }
        }

        if extractor.grid == 0 || extractor.grid > extractor.height || extractor.grid > extractor.width
        {
            return Err(PipelineError::Model(format!(
                "architecture `{}` has no usable pooling layer",
                model.architecture
            )));
        }
        Ok(extractor)
    }

    /// Number of features produced per image.
    pub fn width(&self) -> usize {
        (self.grid * self.grid * self.channels) as usize
    }

    /// Decode and featurize an image file, optionally mirrored horizontally.
    pub fn extract_path(&self, path: &Path, mirror: bool) -> Result<Vec<f32>> {
        let img = image::open(path).map_err(|e| {
            PipelineError::Training(format!("cannot decode image {}: {e}", path.display()))
        })?;
        let img = if mirror { img.fliph() } else { img };
        Ok(self.extract(&img))
    }

    /// Featurize an already decoded image.
    pub fn extract(&self, img: &DynamicImage) -> Vec<f32> {
        let resized = img.resize_exact(self.width, self.height, FilterType::Triangle);
        let channels = self.channels as usize;
        let pixels: Vec<u8> = if channels == 1 {
            resized.to_luma8().into_raw()
        } else {
            resized.to_rgb8().into_raw()
        };

        let scale = if self.normalize { 1.0 / 255.0 } else { 1.0 };
        let (h, w, g) = (
            self.height as usize,
            self.width as usize,
            self.grid as usize,
        );
        let mut features = Vec::with_capacity(self.width());

        for gy in 0..g {
            let (y0, y1) = (gy * h / g, (gy + 1) * h / g);
            for gx in 0..g {
                let (x0, x1) = (gx * w / g, (gx + 1) * w / g);
                let count = ((y1 - y0) * (x1 - x0)) as f32;
                for c in 0..channels {
                    let mut sum = 0.0f32;
                    for y in y0..y1 {
                        for x in x0..x1 {
                            sum += f32::from(pixels[(y * w + x) * channels + c]);
                        }
                    }
                    features.push(sum / count * scale);
                }
            }
        }

        features
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use imgflow_shared::ImageShape;

    fn model(channels: u32) -> ModelArtifact {
        ModelArtifact::base("grid-pool-4", ImageShape::new(16, 16, channels).unwrap(), None)
            .unwrap()
    }

    #[test]
    fn width_matches_model() {
        let m = model(3);
        let extractor = FeatureExtractor::for_model(&m).unwrap();
        assert_eq!(extractor.width(), m.feature_width());
    }

    #[test]
    fn uniform_image_gives_uniform_features() {
        let extractor = FeatureExtractor::for_model(&model(3)).unwrap();
        let img = DynamicImage::ImageRgb8(image::RgbImage::from_pixel(
            40,
            20,
            image::Rgb([255, 255, 255]),
        ));
        let features = extractor.extract(&img);
        assert_eq!(features.len(), 48);
        assert!(features.iter().all(|f| (f - 1.0).abs() < 1e-6));
    }

    #[test]
    fn grayscale_model_uses_one_channel() {
        let extractor = FeatureExtractor::for_model(&model(1)).unwrap();
        let img = DynamicImage::ImageRgb8(image::RgbImage::new(16, 16));
        assert_eq!(extractor.extract(&img).len(), 16);
    }

    #[test]
    fn mirroring_flips_columns() {
        let extractor = FeatureExtractor::for_model(&model(1)).unwrap();
        let mut img = image::GrayImage::new(16, 16);
        for y in 0..16 {
            for x in 0..4 {
                img.put_pixel(x, y, image::Luma([255]));
            }
        }
        let plain = extractor.extract(&DynamicImage::ImageLuma8(img.clone()));
        let mirrored = extractor.extract(&DynamicImage::ImageLuma8(img).fliph());
        assert!(plain[0] > 0.9);
        assert!(mirrored[0] < 0.1);
        assert!(mirrored[3] > 0.9);
    }

    #[test]
    fn model_without_pooling_is_rejected() {
        let mut m = model(3);
        m.layers.retain(|l| !matches!(l.kind, LayerKind::GridPool { .. }));
        assert_eq!(FeatureExtractor::for_model(&m).unwrap_err().kind(), "ModelError");
    }
}
