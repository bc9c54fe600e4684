//! photoface-core — face database, clustering and recognition engine.
//!
//! Keeps a persistent store of labeled and unlabeled face encodings, fills
//! it by scanning photo trees through an [`EmbeddingProvider`], groups the
//! unlabeled backlog into identity clusters and re-derives which people
//! appear in which photos.

pub mod cluster;
pub mod label;
pub mod organize;
pub mod provider;
pub mod recognize;
pub mod scan;
pub mod store;
pub mod types;

pub use cluster::{cluster, cluster_store};
pub use label::{interactive_label, label_cluster, label_single, LabelDecision, LabelOptions, NamePrompt};
pub use provider::{EmbeddingProvider, EmbeddingSpace, Euclidean, ProviderError};
pub use recognize::{recognize, Gallery, MatchResult, Matcher, NearestMatcher, RecognizeOptions};
pub use scan::{scan, ScanOptions, ScanReport};
pub use store::{Checkpointer, FaceStore, LabelError, LoadStatus, StoreError, StoreHandle};
pub use types::{AssignedFace, DetectionModel, FaceEncoding, FaceId, FaceLocation, UnlabeledFace};
