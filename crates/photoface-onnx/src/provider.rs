use crate::detector::{DetectorError, FaceDetector, ACCURATE_INPUT_SIZE, FAST_INPUT_SIZE};
use crate::embedder::{EmbedderError, FaceEmbedder};
use crate::{DETECTOR_MODEL_FILE, EMBEDDER_MODEL_FILE};
use image::DynamicImage;
use photoface_core::{DetectionModel, EmbeddingProvider, EmbeddingSpace, FaceEncoding, FaceLocation, ProviderError};
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("embedder: {0}")]
    Embedder(#[from] EmbedderError),
}

/// Euclidean match threshold for L2-normalized ArcFace embeddings.
///
/// Matches a cosine similarity of 0.40: on unit vectors the distance is
/// `sqrt(2 * (1 - cos))`, so 0.40 gives 1.095, rounded up.
pub const ARCFACE_TOLERANCE: f32 = 1.1;

/// Metric of the ArcFace embeddings, usable without loading any model.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArcFaceSpace;

impl EmbeddingSpace for ArcFaceSpace {
    fn default_tolerance(&self) -> f32 {
        ARCFACE_TOLERANCE
    }
}

/// SCRFD + ArcFace provider. Each session sits behind its own mutex, so scan
/// workers can detect in one photo while another is being embedded.
pub struct OnnxProvider {
    detector: Mutex<FaceDetector>,
    embedder: Mutex<FaceEmbedder>,
}

impl OnnxProvider {
    /// Load both models from `model_dir`.
    pub fn load(model_dir: &Path) -> Result<Self, LoadError> {
        let detector = FaceDetector::load(&model_dir.join(DETECTOR_MODEL_FILE))?;
        let embedder = FaceEmbedder::load(&model_dir.join(EMBEDDER_MODEL_FILE))?;
        Ok(Self {
            detector: Mutex::new(detector),
            embedder: Mutex::new(embedder),
        })
    }
}

fn input_size(model: DetectionModel) -> usize {
    match model {
        DetectionModel::Fast => FAST_INPUT_SIZE,
        DetectionModel::Accurate => ACCURATE_INPUT_SIZE,
    }
}

impl EmbeddingSpace for OnnxProvider {
    fn distance(&self, a: &FaceEncoding, b: &FaceEncoding) -> f32 {
        ArcFaceSpace.distance(a, b)
    }

    fn default_tolerance(&self) -> f32 {
        ArcFaceSpace.default_tolerance()
    }
}

impl EmbeddingProvider for OnnxProvider {
    fn detect_faces(
        &self,
        image: &DynamicImage,
        model: DetectionModel,
    ) -> Result<Vec<FaceLocation>, ProviderError> {
        let rgb = image.to_rgb8();
        let detections = self
            .detector
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .detect(&rgb, input_size(model))
            .map_err(|e| ProviderError::Detection(e.to_string()))?;

        let locations: Vec<FaceLocation> = detections
            .iter()
            .filter_map(|d| d.to_location(rgb.width(), rgb.height()))
            .collect();
        tracing::debug!(faces = locations.len(), %model, "faces detected");
        Ok(locations)
    }

    fn compute_encodings(
        &self,
        image: &DynamicImage,
        locations: &[FaceLocation],
    ) -> Result<Vec<FaceEncoding>, ProviderError> {
        if locations.is_empty() {
            return Ok(Vec::new());
        }
        let rgb = image.to_rgb8();
        let mut embedder = self.embedder.lock().unwrap_or_else(PoisonError::into_inner);
        locations
            .iter()
            .map(|location| {
                embedder
                    .embed(&rgb, location)
                    .map_err(|e| ProviderError::Encoding(e.to_string()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_size_per_model() {
        assert_eq!(input_size(DetectionModel::Fast), 320);
        assert_eq!(input_size(DetectionModel::Accurate), 640);
    }

    fn unit_at(degrees: f32) -> FaceEncoding {
        let r = degrees.to_radians();
        FaceEncoding::new(vec![r.cos(), r.sin()])
    }

    #[test]
    fn test_arcface_tolerance_matches_cosine_threshold() {
        let origin = unit_at(0.0);
        // cos(63°) ≈ 0.454, cos(70°) ≈ 0.342.
        assert!(ArcFaceSpace.distance(&origin, &unit_at(63.0)) <= ArcFaceSpace.default_tolerance());
        assert!(ArcFaceSpace.distance(&origin, &unit_at(70.0)) > ArcFaceSpace.default_tolerance());
        assert!(ArcFaceSpace.default_tolerance() > photoface_core::recognize::DEFAULT_TOLERANCE);
    }

    #[test]
    fn test_load_reports_missing_detector() {
        let dir = std::env::temp_dir().join("photoface-onnx-no-models");
        match OnnxProvider::load(&dir) {
            Err(LoadError::Detector(DetectorError::ModelNotFound(path))) => {
                assert!(path.ends_with(DETECTOR_MODEL_FILE));
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("loaded models from an empty directory"),
        }
    }
}
