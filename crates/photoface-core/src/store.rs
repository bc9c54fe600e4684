//! Face store — labeled encodings, the unlabeled backlog and per-photo
//! assignments, persisted as one schema-versioned JSON document.
//!
//! Writes go to `<db>.tmp` first and are renamed over the database, so a
//! crash mid-write leaves either the old or the new file intact.

use crate::types::{AssignedFace, FaceEncoding, FaceId, FaceLocation, StoreMetadata, UnlabeledFace};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Current on-disk schema version.
pub const STORE_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("store format: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported store version {found} (this build reads version {STORE_VERSION})")]
    UnsupportedVersion { found: u32 },
    #[error("refusing to save a non-finite encoding ({0})")]
    NonFiniteEncoding(String),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum LabelError {
    #[error("name must not be empty")]
    EmptyName,
    #[error("no unlabeled face at index {index} ({len} unlabeled)")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("unknown unlabeled face {0}")]
    UnknownFace(FaceId),
    #[error("no faces given")]
    NoFaces,
}

/// How [`FaceStore::load`] obtained its store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadStatus {
    Loaded,
    /// No database file yet; a fresh store was created.
    Missing,
    /// The file could not be read or parsed; a fresh store replaces it.
    Corrupt(String),
}

#[derive(Debug)]
pub struct LoadOutcome {
    pub store: FaceStore,
    pub status: LoadStatus,
}

/// The face database aggregate.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceStore {
    labeled: BTreeMap<String, Vec<FaceEncoding>>,
    photo_faces: BTreeMap<String, Vec<AssignedFace>>,
    unlabeled: BTreeMap<FaceId, UnlabeledFace>,
    /// Photos that went through the provider, including those with no faces.
    scanned: BTreeSet<String>,
    next_id: u64,
    metadata: StoreMetadata,
}

impl Default for FaceStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FaceStore {
    pub fn new() -> Self {
        Self {
            labeled: BTreeMap::new(),
            photo_faces: BTreeMap::new(),
            unlabeled: BTreeMap::new(),
            scanned: BTreeSet::new(),
            next_id: 0,
            metadata: StoreMetadata::new(),
        }
    }

    // --- Unlabeled backlog ---

    /// Append a face to the unlabeled backlog. No duplicate check.
    pub fn add_unlabeled(
        &mut self,
        photo: impl Into<String>,
        encoding: FaceEncoding,
        location: FaceLocation,
    ) -> FaceId {
        let id = FaceId(self.next_id);
        self.next_id += 1;
        self.unlabeled.insert(
            id,
            UnlabeledFace {
                photo: photo.into(),
                encoding,
                location,
            },
        );
        id
    }

    /// Append all faces of one photo as a contiguous run of ids.
    pub fn add_photo_faces(
        &mut self,
        photo: &str,
        faces: Vec<(FaceEncoding, FaceLocation)>,
    ) -> Vec<FaceId> {
        faces
            .into_iter()
            .map(|(encoding, location)| self.add_unlabeled(photo, encoding, location))
            .collect()
    }

    /// Drop every unlabeled face that came from `photo`. Returns how many went.
    pub fn remove_unlabeled_for_photo(&mut self, photo: &str) -> usize {
        let before = self.unlabeled.len();
        self.unlabeled.retain(|_, face| face.photo != photo);
        before - self.unlabeled.len()
    }

    /// True if an identical entry is already in the backlog.
    pub fn contains_unlabeled(
        &self,
        photo: &str,
        encoding: &FaceEncoding,
        location: &FaceLocation,
    ) -> bool {
        self.unlabeled.values().any(|face| {
            face.photo == photo && face.location == *location && face.encoding == *encoding
        })
    }

    /// Unlabeled faces in insertion order. Position in this view is the
    /// display index used by [`label_face`](Self::label_face).
    pub fn unlabeled(&self) -> impl Iterator<Item = (FaceId, &UnlabeledFace)> + '_ {
        self.unlabeled.iter().map(|(id, face)| (*id, face))
    }

    /// Ids of the unlabeled backlog in display order.
    pub fn unlabeled_ids(&self) -> Vec<FaceId> {
        self.unlabeled.keys().copied().collect()
    }

    pub fn unlabeled_len(&self) -> usize {
        self.unlabeled.len()
    }

    pub fn unlabeled_face(&self, id: FaceId) -> Option<&UnlabeledFace> {
        self.unlabeled.get(&id)
    }

    pub fn unlabeled_at(&self, index: usize) -> Option<(FaceId, &UnlabeledFace)> {
        self.unlabeled().nth(index)
    }

    pub fn face_id_at(&self, index: usize) -> Option<FaceId> {
        self.unlabeled.keys().nth(index).copied()
    }

    // --- Labeling ---

    /// Label the unlabeled face at display `index`.
    ///
    /// Returns false, without touching the store, when the index is out of
    /// range or the name is blank.
    pub fn label_face(&mut self, index: usize, name: &str) -> bool {
        match self.face_id_at(index) {
            Some(id) => self.label_faces(&[id], name).is_ok(),
            None => false,
        }
    }

    /// Move every face in `ids` from the backlog to `name`, all or nothing.
    ///
    /// Faces are addressed by id, so the batch is unaffected by the order of
    /// `ids` or by removals earlier in the batch. Duplicate ids count once.
    pub fn label_faces(&mut self, ids: &[FaceId], name: &str) -> Result<usize, LabelError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(LabelError::EmptyName);
        }
        if ids.is_empty() {
            return Err(LabelError::NoFaces);
        }

        let ids: BTreeSet<FaceId> = ids.iter().copied().collect();
        if let Some(missing) = ids.iter().find(|id| !self.unlabeled.contains_key(id)) {
            return Err(LabelError::UnknownFace(*missing));
        }

        for id in &ids {
            let Some(face) = self.unlabeled.remove(id) else {
                continue;
            };
            self.labeled
                .entry(name.to_string())
                .or_default()
                .push(face.encoding);
            self.photo_faces
                .entry(face.photo)
                .or_default()
                .push(AssignedFace {
                    name: name.to_string(),
                    location: face.location,
                });
        }

        Ok(ids.len())
    }

    pub fn labeled(&self) -> &BTreeMap<String, Vec<FaceEncoding>> {
        &self.labeled
    }

    pub fn people(&self) -> impl Iterator<Item = &str> + '_ {
        self.labeled.keys().map(String::as_str)
    }

    pub fn encodings_for(&self, name: &str) -> &[FaceEncoding] {
        self.labeled.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    // --- Photo assignments ---

    pub fn photo_faces(&self) -> &BTreeMap<String, Vec<AssignedFace>> {
        &self.photo_faces
    }

    /// True if `photo` already has a named face at exactly `location`.
    pub fn is_assigned(&self, photo: &str, location: &FaceLocation) -> bool {
        self.photo_faces
            .get(photo)
            .is_some_and(|faces| faces.iter().any(|f| f.location == *location))
    }

    pub fn reset_photo_faces(&mut self) {
        self.photo_faces.clear();
    }

    /// Replace the assignments of one photo. An empty list removes the entry.
    pub fn set_photo_faces(&mut self, photo: &str, faces: Vec<AssignedFace>) {
        if faces.is_empty() {
            self.photo_faces.remove(photo);
        } else {
            self.photo_faces.insert(photo.to_string(), faces);
        }
    }

    // --- Scan bookkeeping ---

    pub fn mark_scanned(&mut self, photo: &str) {
        self.scanned.insert(photo.to_string());
    }

    /// A photo counts as scanned if it has assignments or went through a scan.
    pub fn is_scanned(&self, photo: &str) -> bool {
        self.photo_faces.contains_key(photo) || self.scanned.contains(photo)
    }

    pub fn scanned_count(&self) -> usize {
        self.scanned.len()
    }

    // --- Metadata ---

    pub fn metadata(&self) -> &StoreMetadata {
        &self.metadata
    }

    /// Recompute the cached counters and stamp `last_updated`.
    pub fn refresh_metadata(&mut self) {
        self.metadata.last_updated = Utc::now();
        self.metadata.person_count = self.labeled.len();
        self.metadata.photo_count = self.photo_faces.len();
        self.metadata.face_count = self.labeled.values().map(Vec::len).sum();
    }

    fn adopt_metadata(&mut self, other: &StoreMetadata) {
        self.metadata = other.clone();
    }

    // --- Persistence ---

    /// Load the store at `path`. Never fails: a missing file yields a fresh
    /// store, and an unreadable one is copied to `<db>.corrupt` and replaced
    /// by a fresh store.
    pub fn load(path: &Path) -> LoadOutcome {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no face database yet; starting empty");
                return LoadOutcome {
                    store: Self::new(),
                    status: LoadStatus::Missing,
                };
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "face database unreadable; starting empty");
                return LoadOutcome {
                    store: Self::new(),
                    status: LoadStatus::Corrupt(e.to_string()),
                };
            }
        };

        match Self::from_bytes(&bytes) {
            Ok(store) => {
                tracing::info!(
                    path = %path.display(),
                    people = store.labeled.len(),
                    unlabeled = store.unlabeled.len(),
                    photos = store.photo_faces.len(),
                    "face database loaded"
                );
                LoadOutcome {
                    store,
                    status: LoadStatus::Loaded,
                }
            }
            Err(e) => {
                let backup = sibling_path(path, "corrupt");
                match fs::copy(path, &backup) {
                    Ok(_) => tracing::warn!(
                        path = %path.display(),
                        backup = %backup.display(),
                        error = %e,
                        "face database corrupt; kept a copy and starting empty"
                    ),
                    Err(copy_err) => tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        backup_error = %copy_err,
                        "face database corrupt and could not be backed up; starting empty"
                    ),
                }
                LoadOutcome {
                    store: Self::new(),
                    status: LoadStatus::Corrupt(e.to_string()),
                }
            }
        }
    }

    /// Refresh metadata and write the store atomically to `path`.
    ///
    /// Fails without touching `path` if any encoding holds NaN or infinity;
    /// JSON has no representation for either.
    pub fn save_to(&mut self, path: &Path) -> Result<(), StoreError> {
        self.check_finite()?;
        self.refresh_metadata();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let tmp = sibling_path(path, "tmp");
        let written = self.write_file(&tmp);
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }

    fn check_finite(&self) -> Result<(), StoreError> {
        for (name, encodings) in &self.labeled {
            if encodings.iter().any(|e| !e.is_finite()) {
                return Err(StoreError::NonFiniteEncoding(format!("labeled as {name}")));
            }
        }
        if let Some((id, face)) = self.unlabeled.iter().find(|(_, f)| !f.encoding.is_finite()) {
            return Err(StoreError::NonFiniteEncoding(format!(
                "unlabeled face {id} from {}",
                face.photo
            )));
        }
        Ok(())
    }

    fn write_file(&self, path: &Path) -> Result<(), StoreError> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, &self.to_file())?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StoreError> {
        let header: VersionHeader = serde_json::from_slice(bytes)?;
        if header.version != STORE_VERSION {
            return Err(StoreError::UnsupportedVersion {
                found: header.version,
            });
        }
        let file: StoreFile = serde_json::from_slice(bytes)?;
        Ok(Self::from_file(file))
    }

    fn to_file(&self) -> StoreFile {
        StoreFile {
            version: STORE_VERSION,
            metadata: self.metadata.clone(),
            labeled: self.labeled.clone(),
            photo_faces: self.photo_faces.clone(),
            unlabeled: self
                .unlabeled
                .iter()
                .map(|(id, face)| StoredFace {
                    id: *id,
                    face: face.clone(),
                })
                .collect(),
            scanned: self.scanned.iter().cloned().collect(),
            next_id: self.next_id,
        }
    }

    fn from_file(file: StoreFile) -> Self {
        let unlabeled: BTreeMap<FaceId, UnlabeledFace> = file
            .unlabeled
            .into_iter()
            .map(|stored| (stored.id, stored.face))
            .collect();
        // Ids must never be reused, even if next_id was lost or edited.
        let floor = unlabeled.keys().next_back().map_or(0, |id| id.0 + 1);

        Self {
            labeled: file.labeled,
            photo_faces: file.photo_faces,
            unlabeled,
            scanned: file.scanned.into_iter().collect(),
            next_id: file.next_id.max(floor),
            metadata: file.metadata,
        }
    }
}

/// `<path>.<suffix>` next to `path`.
fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

#[derive(Deserialize)]
struct VersionHeader {
    version: u32,
}

#[derive(Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    metadata: StoreMetadata,
    labeled: BTreeMap<String, Vec<FaceEncoding>>,
    photo_faces: BTreeMap<String, Vec<AssignedFace>>,
    unlabeled: Vec<StoredFace>,
    #[serde(default)]
    scanned: Vec<String>,
    next_id: u64,
}

#[derive(Serialize, Deserialize)]
struct StoredFace {
    id: FaceId,
    #[serde(flatten)]
    face: UnlabeledFace,
}

/// Clone-safe, mutex-guarded handle to the one shared store.
///
/// Hold the lock only for in-memory mutation; never across provider calls
/// or disk writes.
#[derive(Clone, Default)]
pub struct StoreHandle {
    inner: Arc<Mutex<FaceStore>>,
}

impl StoreHandle {
    pub fn new(store: FaceStore) -> Self {
        Self {
            inner: Arc::new(Mutex::new(store)),
        }
    }

    /// Run `f` with exclusive access to the store.
    pub fn with<R>(&self, f: impl FnOnce(&mut FaceStore) -> R) -> R {
        // Every mutation is all-or-nothing, so a poisoned store is still consistent.
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Copy of the current store, taken under the lock.
    pub fn snapshot(&self) -> FaceStore {
        self.with(|store| store.clone())
    }
}

/// Saves a [`StoreHandle`] at most once per interval unless forced.
pub struct Checkpointer {
    path: PathBuf,
    interval: Duration,
    last_save: Instant,
}

impl Checkpointer {
    pub fn new(path: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            path: path.into(),
            interval,
            last_save: Instant::now(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Save if `force` or the interval has elapsed. Returns whether a write
    /// happened. The store lock is held only while taking the snapshot.
    pub fn save(&mut self, handle: &StoreHandle, force: bool) -> Result<bool, StoreError> {
        if !force && self.last_save.elapsed() <= self.interval {
            return Ok(false);
        }

        let started = Instant::now();
        let mut snapshot = handle.snapshot();
        snapshot.save_to(&self.path)?;
        handle.with(|store| store.adopt_metadata(snapshot.metadata()));
        self.last_save = Instant::now();

        tracing::debug!(
            path = %self.path.display(),
            unlabeled = snapshot.unlabeled_len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "face database saved"
        );
        Ok(true)
    }

    /// Mid-operation checkpoint: failures are logged, never propagated, and
    /// the in-memory store stays as it is so a later save can retry.
    pub fn checkpoint(&mut self, handle: &StoreHandle, force: bool) -> bool {
        match self.save(handle, force) {
            Ok(saved) => saved,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "checkpoint failed; will retry");
                false
            }
        }
    }
}
