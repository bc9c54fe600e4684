//! photoface-onnx — face detection (SCRFD) and face embeddings (ArcFace)
//! running on ONNX Runtime, exposed as a photoface-core
//! [`EmbeddingProvider`](photoface_core::EmbeddingProvider).

pub mod detector;
pub mod embedder;
pub mod provider;

pub use provider::{ArcFaceSpace, LoadError, OnnxProvider, ARCFACE_TOLERANCE};

use std::path::PathBuf;

/// SCRFD detector file expected in the model directory.
pub const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";
/// ArcFace embedder file expected in the model directory.
pub const EMBEDDER_MODEL_FILE: &str = "w600k_r50.onnx";

/// `$XDG_DATA_HOME/photoface/models`, or `~/.local/share/photoface/models`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("photoface")
        .join("models")
}
