//! Embedding provider seam.
//!
//! Face detection and embedding are supplied from outside the core; the scan
//! and recognition engines only see these traits. [`EmbeddingSpace`] carries
//! the metric on its own so clustering can run without loading a detector.

use crate::recognize::DEFAULT_TOLERANCE;
use crate::types::{DetectionModel, FaceEncoding, FaceLocation};
use image::DynamicImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("face detection failed: {0}")]
    Detection(String),
    #[error("face encoding failed: {0}")]
    Encoding(String),
    #[error("provider returned {encodings} encodings for {locations} face locations")]
    CountMismatch { locations: usize, encodings: usize },
    #[error("encoding {index} contains NaN or infinite values")]
    NonFinite { index: usize },
}

/// Metric of an embedding model: how far apart two encodings are and which
/// distance still means "same person".
pub trait EmbeddingSpace: Send + Sync {
    /// Distance between two encodings of this model.
    fn distance(&self, a: &FaceEncoding, b: &FaceEncoding) -> f32 {
        a.distance(b)
    }

    /// Match and clustering threshold used when the caller sets none.
    fn default_tolerance(&self) -> f32 {
        DEFAULT_TOLERANCE
    }
}

/// Plain Euclidean space with the 128-d dlib-style calibration.
#[derive(Debug, Clone, Copy, Default)]
pub struct Euclidean;

impl EmbeddingSpace for Euclidean {}

/// Detects faces in an image and turns each into a fixed-length embedding.
///
/// Implementations are shared across scan workers, so every method takes
/// `&self`; providers with mutable inference state guard it internally.
pub trait EmbeddingProvider: EmbeddingSpace {
    /// Find face bounding boxes in `image`.
    fn detect_faces(
        &self,
        image: &DynamicImage,
        model: DetectionModel,
    ) -> Result<Vec<FaceLocation>, ProviderError>;

    /// Compute one encoding per location, in the same order.
    fn compute_encodings(
        &self,
        image: &DynamicImage,
        locations: &[FaceLocation],
    ) -> Result<Vec<FaceEncoding>, ProviderError>;
}

/// Detect and encode all faces in `image`, pairing each encoding with its box.
///
/// An encoding with a NaN or infinite component fails the whole photo.
pub fn detect_and_encode<P: EmbeddingProvider + ?Sized>(
    provider: &P,
    image: &DynamicImage,
    model: DetectionModel,
) -> Result<Vec<(FaceEncoding, FaceLocation)>, ProviderError> {
    let locations = provider.detect_faces(image, model)?;
    if locations.is_empty() {
        return Ok(Vec::new());
    }

    let encodings = provider.compute_encodings(image, &locations)?;
    if encodings.len() != locations.len() {
        return Err(ProviderError::CountMismatch {
            locations: locations.len(),
            encodings: encodings.len(),
        });
    }
    if let Some(index) = encodings.iter().position(|e| !e.is_finite()) {
        return Err(ProviderError::NonFinite { index });
    }

    Ok(encodings.into_iter().zip(locations).collect())
}
