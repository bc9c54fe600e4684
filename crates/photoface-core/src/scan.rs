//! Photo tree scanning.
//!
//! Walks a photo directory, runs the embedding provider on every photo not
//! yet scanned and appends the detected faces to the unlabeled backlog.
//! Provider calls happen outside the store lock; each photo's faces are
//! appended in one locked step, so they stay contiguous.

use crate::provider::{detect_and_encode, EmbeddingProvider, ProviderError};
use crate::store::{Checkpointer, StoreError, StoreHandle};
use crate::types::{DetectionModel, FaceEncoding, FaceLocation};
use image::{DynamicImage, ImageReader};
use std::fs::File;
use std::io::BufReader;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use thiserror::Error;

/// Raster formats picked up by the scan, compared case-insensitively.
pub const PHOTO_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "bmp", "gif"];

const DEFAULT_PARALLEL_THRESHOLD: usize = 10;
const DEFAULT_CHECKPOINT_EVERY: usize = 20;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("photo directory not found: {0}")]
    RootNotFound(PathBuf),
    #[error("cannot read directory {path}: {source}")]
    Walk {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("saving face database: {0}")]
    Store(#[from] StoreError),
}

/// Why a single photo produced no faces. Never aborts a batch.
#[derive(Error, Debug)]
pub enum PhotoError {
    #[error("cannot open: {0}")]
    Open(#[from] std::io::Error),
    #[error("not a recognized image format")]
    NotAnImage,
    #[error("cannot decode: {0}")]
    Decode(#[from] image::ImageError),
    #[error("provider: {0}")]
    Provider(#[from] ProviderError),
    #[error("provider panicked")]
    ProviderPanicked,
}

#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Re-process photos that were already scanned.
    pub force_rescan: bool,
    /// Use a worker pool when there are enough photos.
    pub parallel: bool,
    pub model: DetectionModel,
    /// Worker count; 0 means one per available CPU.
    pub workers: usize,
    /// Candidate count at or below which the scan stays sequential.
    pub parallel_threshold: usize,
    /// Forced checkpoint after this many processed photos.
    pub checkpoint_every: usize,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            force_rescan: false,
            parallel: true,
            model: DetectionModel::Fast,
            workers: 0,
            parallel_threshold: DEFAULT_PARALLEL_THRESHOLD,
            checkpoint_every: DEFAULT_CHECKPOINT_EVERY,
        }
    }
}

/// Counts reported by a scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// Photos found under the root.
    pub found: usize,
    /// Photos skipped because they were already scanned.
    pub skipped: usize,
    /// Photos that went through the provider (with or without faces).
    pub processed: usize,
    /// Photos that could not be decoded or analyzed.
    pub failed: usize,
    /// Faces appended to the unlabeled backlog.
    pub new_faces: usize,
}

/// All photos under `root`, recursively, sorted by path.
pub fn find_photos(root: &Path) -> Result<Vec<PathBuf>, ScanError> {
    if !root.is_dir() {
        return Err(ScanError::RootNotFound(root.to_path_buf()));
    }

    let mut photos = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let entries = std::fs::read_dir(&dir).map_err(|source| ScanError::Walk {
            path: dir.clone(),
            source,
        })?;
        for entry in entries {
            let entry = entry.map_err(|source| ScanError::Walk {
                path: dir.clone(),
                source,
            })?;
            let path = entry.path();
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if file_type.is_dir() {
                pending.push(path);
            } else if has_photo_extension(&path) {
                photos.push(path);
            }
        }
    }

    photos.sort();
    Ok(photos)
}

fn has_photo_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| PHOTO_EXTENSIONS.iter().any(|known| ext.eq_ignore_ascii_case(known)))
        .unwrap_or(false)
}

/// Store key of a photo: its path relative to `root`, `/`-separated.
pub fn photo_key(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Open `path`, check by content that it really is an image and decode it.
pub fn load_photo(path: &Path) -> Result<DynamicImage, PhotoError> {
    // Not ImageReader::open: that trusts the extension when sniffing fails.
    let reader = ImageReader::new(BufReader::new(File::open(path)?)).with_guessed_format()?;
    if reader.format().is_none() {
        return Err(PhotoError::NotAnImage);
    }
    Ok(reader.decode()?)
}

/// Decode `path` and run the provider on it.
pub fn analyze_photo<P: EmbeddingProvider + ?Sized>(
    provider: &P,
    path: &Path,
    model: DetectionModel,
) -> Result<Vec<(FaceEncoding, FaceLocation)>, PhotoError> {
    let image = load_photo(path)?;
    let faces = panic::catch_unwind(AssertUnwindSafe(|| detect_and_encode(provider, &image, model)))
        .map_err(|_| PhotoError::ProviderPanicked)??;
    Ok(faces)
}

struct PhotoResult {
    key: String,
    outcome: Result<usize, PhotoError>,
}

fn process_photo<P: EmbeddingProvider + ?Sized>(
    handle: &StoreHandle,
    provider: &P,
    root: &Path,
    path: &Path,
    options: &ScanOptions,
) -> PhotoResult {
    let key = photo_key(root, path);
    let outcome = analyze_photo(provider, path, options.model).map(|faces| {
        handle.with(|store| {
            let faces: Vec<_> = if options.force_rescan {
                store.remove_unlabeled_for_photo(&key);
                // Faces already named in this photo stay out of the backlog.
                faces
                    .into_iter()
                    .filter(|(_, location)| !store.is_assigned(&key, location))
                    .collect()
            } else {
                faces
            };
            let count = faces.len();
            store.add_photo_faces(&key, faces);
            store.mark_scanned(&key);
            count
        })
    });
    PhotoResult { key, outcome }
}

/// Tallies results on the coordinating thread and drives checkpoints.
struct Progress<'a> {
    total: usize,
    checkpoint_every: usize,
    report: ScanReport,
    handle: &'a StoreHandle,
    checkpointer: &'a mut Checkpointer,
}

impl Progress<'_> {
    fn record(&mut self, result: PhotoResult) {
        let done = self.report.processed + self.report.failed + 1;
        match result.outcome {
            Ok(faces) => {
                self.report.processed += 1;
                self.report.new_faces += faces;
                tracing::info!(
                    n = done,
                    total = self.total,
                    photo = %result.key,
                    faces,
                    "scan: photo processed"
                );
            }
            Err(e) => {
                self.report.failed += 1;
                tracing::warn!(
                    n = done,
                    total = self.total,
                    photo = %result.key,
                    error = %e,
                    "scan: photo skipped"
                );
            }
        }

        let every = self.checkpoint_every.max(1);
        self.checkpointer.checkpoint(self.handle, done % every == 0);
    }
}

/// Scan `root` and append every newly found face to the unlabeled backlog.
///
/// Per-photo failures are counted, never returned. Only a missing root, an
/// unreadable directory or the final save fail the scan.
pub fn scan<P: EmbeddingProvider + ?Sized>(
    handle: &StoreHandle,
    checkpointer: &mut Checkpointer,
    provider: &P,
    root: &Path,
    options: &ScanOptions,
) -> Result<ScanReport, ScanError> {
    let photos = find_photos(root)?;
    let found = photos.len();

    let candidates: Vec<PathBuf> = if options.force_rescan {
        photos
    } else {
        handle.with(|store| {
            photos
                .into_iter()
                .filter(|p| !store.is_scanned(&photo_key(root, p)))
                .collect()
        })
    };

    let workers = worker_count(options, candidates.len());
    tracing::info!(
        root = %root.display(),
        found,
        to_process = candidates.len(),
        workers,
        model = %options.model,
        "scan: starting"
    );

    let mut progress = Progress {
        total: candidates.len(),
        checkpoint_every: options.checkpoint_every,
        report: ScanReport {
            found,
            skipped: found - candidates.len(),
            ..ScanReport::default()
        },
        handle,
        checkpointer,
    };

    if workers > 1 {
        run_parallel(handle, provider, root, &candidates, options, workers, &mut progress);
    } else {
        for path in &candidates {
            let result = process_photo(handle, provider, root, path, options);
            progress.record(result);
        }
    }

    let report = progress.report;
    checkpointer.save(handle, true)?;

    tracing::info!(
        processed = report.processed,
        failed = report.failed,
        skipped = report.skipped,
        new_faces = report.new_faces,
        unlabeled = handle.with(|s| s.unlabeled_len()),
        "scan: complete"
    );
    Ok(report)
}

fn worker_count(options: &ScanOptions, candidates: usize) -> usize {
    if !options.parallel || candidates <= options.parallel_threshold {
        return 1;
    }
    let wanted = if options.workers == 0 {
        thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
    } else {
        options.workers
    };
    wanted.min(candidates).max(1)
}

/// Fan photos out to `workers` scoped threads; results come back over a
/// channel so checkpoints are taken by this thread alone.
fn run_parallel<P: EmbeddingProvider + ?Sized>(
    handle: &StoreHandle,
    provider: &P,
    root: &Path,
    candidates: &[PathBuf],
    options: &ScanOptions,
    workers: usize,
    progress: &mut Progress<'_>,
) {
    let next = AtomicUsize::new(0);
    let (tx, rx) = mpsc::channel::<PhotoResult>();

    thread::scope(|scope| {
        for _ in 0..workers {
            let tx = tx.clone();
            let next = &next;
            scope.spawn(move || loop {
                let i = next.fetch_add(1, Ordering::Relaxed);
                let Some(path) = candidates.get(i) else {
                    break;
                };
                let result = process_photo(handle, provider, root, path, options);
                if tx.send(result).is_err() {
                    break;
                }
            });
        }
        drop(tx);

        for result in rx {
            progress.record(result);
        }
    });
}
