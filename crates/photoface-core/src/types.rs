use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Face embedding vector (128-dimensional for dlib-style models, 512 for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FaceEncoding(pub Vec<f32>);

impl FaceEncoding {
    pub fn new(values: Vec<f32>) -> Self {
        Self(values)
    }

    pub fn values(&self) -> &[f32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// False if any component is NaN or infinite.
    pub fn is_finite(&self) -> bool {
        self.0.iter().all(|v| v.is_finite())
    }

    /// Euclidean distance between two embeddings.
    ///
    /// Embeddings of different length are compared over their common prefix.
    pub fn distance(&self, other: &FaceEncoding) -> f32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// Face bounding box in source-image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FaceLocation {
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
    pub left: u32,
}

impl FaceLocation {
    pub fn new(top: u32, right: u32, bottom: u32, left: u32) -> Self {
        Self {
            top,
            right,
            bottom,
            left,
        }
    }

    pub fn width(&self) -> u32 {
        self.right.saturating_sub(self.left)
    }

    pub fn height(&self) -> u32 {
        self.bottom.saturating_sub(self.top)
    }

    /// Clamp the box so it lies inside a `width` x `height` image.
    pub fn clamp_to(self, width: u32, height: u32) -> Self {
        let max_x = width.saturating_sub(1);
        let max_y = height.saturating_sub(1);
        Self {
            top: self.top.min(max_y),
            right: self.right.min(max_x),
            bottom: self.bottom.min(max_y),
            left: self.left.min(max_x),
        }
    }
}

/// Stable identifier of an unlabeled face. Never reused within a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FaceId(pub u64);

impl fmt::Display for FaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A detected face that has not been attributed to anyone yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnlabeledFace {
    /// Photo path relative to the scanned root, `/`-separated.
    pub photo: String,
    pub encoding: FaceEncoding,
    pub location: FaceLocation,
}

/// A named face inside a photo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignedFace {
    pub name: String,
    pub location: FaceLocation,
}

/// Cached counters, recomputed on every save. Never the source of truth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreMetadata {
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub person_count: usize,
    pub photo_count: usize,
    pub face_count: usize,
}

impl StoreMetadata {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            created_at: now,
            last_updated: now,
            person_count: 0,
            photo_count: 0,
            face_count: 0,
        }
    }
}

impl Default for StoreMetadata {
    fn default() -> Self {
        Self::new()
    }
}

/// Detection quality hint handed to the embedding provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionModel {
    /// Cheaper detection at reduced input resolution.
    #[default]
    Fast,
    /// Full-resolution detection; slower, finds smaller faces.
    Accurate,
}

impl std::str::FromStr for DetectionModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fast" | "hog" => Ok(Self::Fast),
            "accurate" | "cnn" => Ok(Self::Accurate),
            other => Err(format!("unknown detection model: {other} (expected fast or accurate)")),
        }
    }
}

impl fmt::Display for DetectionModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fast => f.write_str("fast"),
            Self::Accurate => f.write_str("accurate"),
        }
    }
}
