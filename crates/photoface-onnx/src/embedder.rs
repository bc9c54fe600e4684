//! ArcFace face embedder via ONNX Runtime.
//!
//! Faces are cut out of the photo by bounding box (with a margin), resized
//! to 112x112 and turned into an L2-normalized 512-d embedding.

use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use photoface_core::{FaceEncoding, FaceLocation};
use std::path::Path;
use thiserror::Error;

const ARCFACE_INPUT_SIZE: u32 = 112;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5;
const ARCFACE_EMBEDDING_DIM: usize = 512;
/// Extra context around the detector box, as a fraction of its longer side.
const CROP_MARGIN: f32 = 0.2;

#[derive(Error, Debug)]
pub enum EmbedderError {
    #[error("model file not found: {0} — download w600k_r50.onnx from insightface buffalo_l")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face box {0:?} is empty or outside the image")]
    EmptyCrop(FaceLocation),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

pub struct FaceEmbedder {
    session: Session,
}

impl FaceEmbedder {
    pub fn load(model_path: &Path) -> Result<Self, EmbedderError> {
        if !model_path.exists() {
            return Err(EmbedderError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self { session })
    }

    /// Embed the face at `location` in `image`.
    pub fn embed(&mut self, image: &RgbImage, location: &FaceLocation) -> Result<FaceEncoding, EmbedderError> {
        let crop = crop_face(image, location).ok_or(EmbedderError::EmptyCrop(*location))?;
        let input = preprocess(&crop);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbedderError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(EmbedderError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        Ok(FaceEncoding::new(l2_normalize(raw.to_vec())))
    }
}

/// Square crop around the face box, grown by [`CROP_MARGIN`], clipped to the
/// image and resized to the network input.
fn crop_face(image: &RgbImage, location: &FaceLocation) -> Option<RgbImage> {
    let (iw, ih) = image.dimensions();
    if location.width() == 0 || location.height() == 0 || location.left >= iw || location.top >= ih {
        return None;
    }

    let side = location.width().max(location.height()) as f32 * (1.0 + 2.0 * CROP_MARGIN);
    let cx = (location.left + location.right) as f32 / 2.0;
    let cy = (location.top + location.bottom) as f32 / 2.0;

    let x0 = (cx - side / 2.0).max(0.0) as u32;
    let y0 = (cy - side / 2.0).max(0.0) as u32;
    let x1 = ((cx + side / 2.0).ceil() as u32).min(iw);
    let y1 = ((cy + side / 2.0).ceil() as u32).min(ih);
    if x1 <= x0 || y1 <= y0 {
        return None;
    }

    let cut = imageops::crop_imm(image, x0, y0, x1 - x0, y1 - y0).to_image();
    Some(imageops::resize(&cut, ARCFACE_INPUT_SIZE, ARCFACE_INPUT_SIZE, FilterType::Triangle))
}

/// 112x112 RGB crop into an NCHW tensor with ArcFace's symmetric normalization.
fn preprocess(crop: &RgbImage) -> Array4<f32> {
    let size = ARCFACE_INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in crop.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        if x >= size || y >= size {
            continue;
        }
        for c in 0..3 {
            tensor[[0, c, y, x]] = (pixel[c] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
        }
    }
    tensor
}

fn l2_normalize(mut values: Vec<f32>) -> Vec<f32> {
    let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        values.iter_mut().for_each(|v| *v /= norm);
    }
    values
}
