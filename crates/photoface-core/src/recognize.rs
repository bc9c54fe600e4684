//! Recognition of faces against the labeled gallery.
//!
//! Photo assignments are rebuilt from scratch: `photo_faces` is cleared,
//! every photo is re-detected through the provider, and each face is matched
//! against the flattened list of labeled encodings. Unmatched faces go to
//! the unlabeled backlog unless an identical entry is already there.

use crate::provider::{EmbeddingProvider, EmbeddingSpace};
use crate::scan::{analyze_photo, find_photos, photo_key, PhotoError, ScanError};
use crate::store::{Checkpointer, FaceStore, StoreError, StoreHandle};
use crate::types::{AssignedFace, DetectionModel, FaceEncoding, FaceLocation};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

/// Default match threshold in Euclidean units, calibrated for 128-d
/// dlib-style embeddings. Providers with other models override
/// [`EmbeddingSpace::default_tolerance`].
pub const DEFAULT_TOLERANCE: f32 = 0.6;

#[derive(Error, Debug)]
pub enum RecognizeError {
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error("saving face database: {0}")]
    Store(#[from] StoreError),
}

/// Labeled encodings flattened into (name, encoding) pairs, in name order
/// and then insertion order.
#[derive(Debug, Clone, Default)]
pub struct Gallery {
    entries: Vec<(String, FaceEncoding)>,
}

impl Gallery {
    pub fn from_labeled(labeled: &BTreeMap<String, Vec<FaceEncoding>>) -> Self {
        let entries = labeled
            .iter()
            .flat_map(|(name, encodings)| encodings.iter().map(move |e| (name.clone(), e.clone())))
            .collect();
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Result of matching one encoding against a gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub matched: bool,
    /// Distance to the nearest gallery encoding (infinite for an empty gallery).
    pub distance: f32,
    /// Name of the nearest encoding, set only when `matched`.
    pub name: Option<String>,
}

/// Strategy for comparing an encoding against a gallery.
pub trait Matcher {
    fn compare(&self, query: &FaceEncoding, gallery: &Gallery, threshold: f32) -> MatchResult;
}

/// Nearest-neighbor matcher over the distance of an [`EmbeddingSpace`].
///
/// The threshold is inclusive. Equal distances keep the earliest gallery entry.
pub struct NearestMatcher<'a, S: ?Sized> {
    space: &'a S,
}

impl<'a, S: EmbeddingSpace + ?Sized> NearestMatcher<'a, S> {
    pub fn new(space: &'a S) -> Self {
        Self { space }
    }
}

impl<S: EmbeddingSpace + ?Sized> Matcher for NearestMatcher<'_, S> {
    fn compare(&self, query: &FaceEncoding, gallery: &Gallery, threshold: f32) -> MatchResult {
        let mut best_distance = f32::INFINITY;
        let mut best_idx: Option<usize> = None;

        for (i, (_, encoding)) in gallery.entries.iter().enumerate() {
            let distance = self.space.distance(query, encoding);
            if distance < best_distance {
                best_distance = distance;
                best_idx = Some(i);
            }
        }

        match best_idx {
            Some(idx) if best_distance <= threshold => MatchResult {
                matched: true,
                distance: best_distance,
                name: Some(gallery.entries[idx].0.clone()),
            },
            _ => MatchResult {
                matched: false,
                distance: best_distance,
                name: None,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecognizeOptions {
    /// Match threshold; `None` uses the provider's calibrated default.
    pub tolerance: Option<f32>,
    pub model: DetectionModel,
    /// Forced checkpoint after this many photos.
    pub checkpoint_every: usize,
}

impl Default for RecognizeOptions {
    fn default() -> Self {
        Self {
            tolerance: None,
            model: DetectionModel::Fast,
            checkpoint_every: 10,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecognizeReport {
    /// Set when there were no labeled encodings and nothing was done.
    pub no_gallery: bool,
    /// Threshold the run matched with.
    pub tolerance: f32,
    pub photos: usize,
    pub failed: usize,
    pub matched_faces: usize,
    pub unmatched_faces: usize,
    /// Unmatched faces that were not already in the backlog.
    pub new_unlabeled: usize,
}

/// Split one photo's detections into assigned names and unmatched faces.
pub fn match_photo_faces<M: Matcher + ?Sized>(
    matcher: &M,
    gallery: &Gallery,
    faces: Vec<(FaceEncoding, FaceLocation)>,
    tolerance: f32,
) -> (Vec<AssignedFace>, Vec<(FaceEncoding, FaceLocation)>) {
    let mut assigned = Vec::new();
    let mut unmatched = Vec::new();

    for (encoding, location) in faces {
        match matcher.compare(&encoding, gallery, tolerance).name {
            Some(name) => assigned.push(AssignedFace { name, location }),
            None => unmatched.push((encoding, location)),
        }
    }

    (assigned, unmatched)
}

/// Record one photo's recognition result in the store.
fn apply_photo(
    store: &mut FaceStore,
    key: &str,
    assigned: Vec<AssignedFace>,
    unmatched: Vec<(FaceEncoding, FaceLocation)>,
    report: &mut RecognizeReport,
) {
    report.photos += 1;
    report.matched_faces += assigned.len();
    report.unmatched_faces += unmatched.len();

    store.set_photo_faces(key, assigned);
    for (encoding, location) in unmatched {
        if !store.contains_unlabeled(key, &encoding, &location) {
            store.add_unlabeled(key, encoding, location);
            report.new_unlabeled += 1;
        }
    }
}

/// Clear `photo_faces` and rebuild it from per-photo detections.
///
/// `detections` is consumed lazily, so a provider behind it runs outside the
/// store lock. Failed photos are counted and leave no assignment.
fn rebuild_photo_faces<M, I>(
    handle: &StoreHandle,
    checkpointer: &mut Checkpointer,
    matcher: &M,
    gallery: &Gallery,
    detections: I,
    tolerance: f32,
    checkpoint_every: usize,
) -> Result<RecognizeReport, StoreError>
where
    M: Matcher + ?Sized,
    I: IntoIterator<Item = (String, Result<Vec<(FaceEncoding, FaceLocation)>, PhotoError>)>,
{
    handle.with(|store| store.reset_photo_faces());

    let mut report = RecognizeReport {
        tolerance,
        ..RecognizeReport::default()
    };
    let every = checkpoint_every.max(1);
    for (i, (key, detected)) in detections.into_iter().enumerate() {
        match detected {
            Ok(faces) => {
                let (assigned, unmatched) = match_photo_faces(matcher, gallery, faces, tolerance);
                tracing::info!(
                    n = i + 1,
                    photo = %key,
                    matched = assigned.len(),
                    unmatched = unmatched.len(),
                    "recognize: photo processed"
                );
                handle.with(|store| apply_photo(store, &key, assigned, unmatched, &mut report));
            }
            Err(e) => {
                report.failed += 1;
                tracing::warn!(photo = %key, error = %e, "recognize: photo skipped");
            }
        }
        checkpointer.checkpoint(handle, (i + 1) % every == 0);
    }

    checkpointer.save(handle, true)?;
    Ok(report)
}

/// Re-detect every photo under `root` and rebuild `photo_faces` from the
/// labeled gallery. A no-op when nothing is labeled yet.
pub fn recognize<P: EmbeddingProvider + ?Sized>(
    handle: &StoreHandle,
    checkpointer: &mut Checkpointer,
    provider: &P,
    root: &Path,
    options: &RecognizeOptions,
) -> Result<RecognizeReport, RecognizeError> {
    let tolerance = options.tolerance.unwrap_or_else(|| provider.default_tolerance());
    let gallery = handle.with(|store| Gallery::from_labeled(store.labeled()));
    if gallery.is_empty() {
        tracing::info!("recognize: no labeled faces yet; label some faces first");
        return Ok(RecognizeReport {
            no_gallery: true,
            tolerance,
            ..RecognizeReport::default()
        });
    }

    let photos = find_photos(root)?;
    tracing::info!(
        photos = photos.len(),
        gallery = gallery.len(),
        tolerance,
        model = %options.model,
        "recognize: starting"
    );

    let detections = photos
        .iter()
        .map(|path| (photo_key(root, path), analyze_photo(provider, path, options.model)));
    let report = rebuild_photo_faces(
        handle,
        checkpointer,
        &NearestMatcher::new(provider),
        &gallery,
        detections,
        tolerance,
        options.checkpoint_every,
    )?;

    tracing::info!(
        photos = report.photos,
        matched = report.matched_faces,
        unmatched = report.unmatched_faces,
        failed = report.failed,
        "recognize: complete"
    );
    Ok(report)
}
