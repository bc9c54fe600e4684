//! End-to-end runs over synthetic photos.
//!
//! Photos are solid-color 16px tiles laid side by side. The test provider
//! reports one face per tile whose top-left pixel is not black, with the
//! tile color (divided by 100) as its encoding.

use image::{DynamicImage, Rgb, RgbImage};
use photoface_core::label::{interactive_label, LabelDecision, LabelOptions, NamePrompt};
use photoface_core::organize::build_export;
use photoface_core::provider::{EmbeddingProvider, EmbeddingSpace, ProviderError};
use photoface_core::recognize::{recognize, RecognizeOptions};
use photoface_core::scan::{scan, ScanOptions};
use photoface_core::store::{Checkpointer, FaceStore, LoadStatus, StoreHandle};
use photoface_core::types::{AssignedFace, DetectionModel, FaceEncoding, FaceLocation, UnlabeledFace};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

const TILE: u32 = 16;

struct TileProvider;

impl TileProvider {
    fn tiles(image: &DynamicImage) -> Vec<(FaceLocation, Rgb<u8>)> {
        let rgb = image.to_rgb8();
        (0..rgb.width() / TILE)
            .filter_map(|i| {
                let left = i * TILE;
                let color = *rgb.get_pixel(left, 0);
                (color != Rgb([0, 0, 0])).then(|| (FaceLocation::new(2, left + TILE - 2, TILE - 2, left + 2), color))
            })
            .collect()
    }
}

impl EmbeddingSpace for TileProvider {}

impl EmbeddingProvider for TileProvider {
    fn detect_faces(
        &self,
        image: &DynamicImage,
        _model: DetectionModel,
    ) -> Result<Vec<FaceLocation>, ProviderError> {
        Ok(Self::tiles(image).into_iter().map(|(loc, _)| loc).collect())
    }

    fn compute_encodings(
        &self,
        image: &DynamicImage,
        locations: &[FaceLocation],
    ) -> Result<Vec<FaceEncoding>, ProviderError> {
        let tiles = Self::tiles(image);
        locations
            .iter()
            .map(|loc| {
                tiles
                    .iter()
                    .find(|(l, _)| l == loc)
                    .map(|(_, c)| encoding_of(*c))
                    .ok_or_else(|| ProviderError::Encoding(format!("unknown location {loc:?}")))
            })
            .collect()
    }
}

/// Panics on any photo with a pure-green first tile.
struct FragileProvider;

impl EmbeddingSpace for FragileProvider {}

impl EmbeddingProvider for FragileProvider {
    fn detect_faces(
        &self,
        image: &DynamicImage,
        model: DetectionModel,
    ) -> Result<Vec<FaceLocation>, ProviderError> {
        if *image.to_rgb8().get_pixel(0, 0) == Rgb([0, 255, 0]) {
            panic!("detector crashed");
        }
        TileProvider.detect_faces(image, model)
    }

    fn compute_encodings(
        &self,
        image: &DynamicImage,
        locations: &[FaceLocation],
    ) -> Result<Vec<FaceEncoding>, ProviderError> {
        TileProvider.compute_encodings(image, locations)
    }
}

/// Returns a NaN encoding for every pure-blue tile.
struct GlitchyProvider;

impl EmbeddingSpace for GlitchyProvider {}

impl EmbeddingProvider for GlitchyProvider {
    fn detect_faces(
        &self,
        image: &DynamicImage,
        model: DetectionModel,
    ) -> Result<Vec<FaceLocation>, ProviderError> {
        TileProvider.detect_faces(image, model)
    }

    fn compute_encodings(
        &self,
        image: &DynamicImage,
        locations: &[FaceLocation],
    ) -> Result<Vec<FaceEncoding>, ProviderError> {
        let glitch = encoding_of(Rgb([0, 0, 255]));
        Ok(TileProvider
            .compute_encodings(image, locations)?
            .into_iter()
            .map(|e| if e == glitch { FaceEncoding::new(vec![f32::NAN, 0.0, 0.0]) } else { e })
            .collect())
    }
}

/// Records how many unlabeled faces the database file holds each time a
/// photo reaches the detector.
struct WatchingProvider {
    db: PathBuf,
    seen: Mutex<Vec<Option<usize>>>,
}

impl EmbeddingSpace for WatchingProvider {}

impl EmbeddingProvider for WatchingProvider {
    fn detect_faces(
        &self,
        image: &DynamicImage,
        model: DetectionModel,
    ) -> Result<Vec<FaceLocation>, ProviderError> {
        let on_disk = fs::read(&self.db)
            .ok()
            .map(|bytes| FaceStore::from_bytes(&bytes).unwrap().unlabeled_len());
        self.seen.lock().unwrap().push(on_disk);
        TileProvider.detect_faces(image, model)
    }

    fn compute_encodings(
        &self,
        image: &DynamicImage,
        locations: &[FaceLocation],
    ) -> Result<Vec<FaceEncoding>, ProviderError> {
        TileProvider.compute_encodings(image, locations)
    }
}

fn encoding_of(color: Rgb<u8>) -> FaceEncoding {
    FaceEncoding::new(color.0.iter().map(|&c| c as f32 / 100.0).collect())
}

fn tile_location(i: u32) -> FaceLocation {
    FaceLocation::new(2, i * TILE + TILE - 2, TILE - 2, i * TILE + 2)
}

fn write_photo(root: &Path, rel: &str, colors: &[[u8; 3]]) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    let mut image = RgbImage::new(TILE * colors.len() as u32, TILE);
    for (i, color) in colors.iter().enumerate() {
        for y in 0..TILE {
            for x in 0..TILE {
                image.put_pixel(i as u32 * TILE + x, y, Rgb(*color));
            }
        }
    }
    image.save(path).unwrap();
}

struct Fixture {
    photos: tempfile::TempDir,
    _data: tempfile::TempDir,
    handle: StoreHandle,
    checkpointer: Checkpointer,
}

fn fixture() -> Fixture {
    let photos = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    let checkpointer = Checkpointer::new(data.path().join("face_database.json"), Duration::from_secs(3600));
    Fixture {
        photos,
        _data: data,
        handle: StoreHandle::new(FaceStore::new()),
        checkpointer,
    }
}

fn sequential() -> ScanOptions {
    ScanOptions {
        parallel: false,
        ..ScanOptions::default()
    }
}

#[test]
fn rescan_without_force_finds_nothing_new() {
    let mut fx = fixture();
    let root = fx.photos.path();
    write_photo(root, "alice.png", &[[100, 0, 0]]);
    write_photo(root, "family/pair.png", &[[100, 0, 0], [0, 0, 200]]);
    write_photo(root, "family/empty.png", &[[0, 0, 0]]);
    fs::write(root.join("broken.jpg"), b"not an image at all").unwrap();
    fs::write(root.join("readme.txt"), b"ignored").unwrap();

    let first = scan(&fx.handle, &mut fx.checkpointer, &TileProvider, root, &sequential()).unwrap();
    assert_eq!(first.found, 4);
    assert_eq!(first.processed, 3);
    assert_eq!(first.failed, 1);
    assert_eq!(first.new_faces, 3);

    let second = scan(&fx.handle, &mut fx.checkpointer, &TileProvider, root, &sequential()).unwrap();
    assert_eq!(second.new_faces, 0);
    assert_eq!(second.processed, 0);
    // The zero-face photo is remembered; the broken file is retried.
    assert_eq!(second.skipped, 3);
    assert_eq!(second.failed, 1);

    let saved = FaceStore::load(fx.checkpointer.path());
    assert_eq!(saved.status, LoadStatus::Loaded);
    assert_eq!(saved.store.unlabeled_len(), 3);
}

#[test]
fn forced_rescan_replaces_backlog_of_rescanned_photos() {
    let mut fx = fixture();
    let root = fx.photos.path();
    write_photo(root, "a.png", &[[100, 0, 0], [0, 100, 0]]);
    write_photo(root, "b.png", &[[0, 0, 100]]);

    scan(&fx.handle, &mut fx.checkpointer, &TileProvider, root, &sequential()).unwrap();
    let forced = ScanOptions {
        force_rescan: true,
        ..sequential()
    };
    let report = scan(&fx.handle, &mut fx.checkpointer, &TileProvider, root, &forced).unwrap();

    assert_eq!(report.processed, 2);
    assert_eq!(report.new_faces, 3);
    assert_eq!(fx.handle.with(|s| s.unlabeled_len()), 3);
}

#[test]
fn forced_rescan_keeps_labeled_faces_out_of_backlog() {
    let mut fx = fixture();
    let root = fx.photos.path();
    write_photo(root, "a.png", &[[100, 0, 0], [0, 100, 0]]);

    scan(&fx.handle, &mut fx.checkpointer, &TileProvider, root, &sequential()).unwrap();
    fx.handle.with(|s| assert!(s.label_face(0, "Alice")));

    let forced = ScanOptions {
        force_rescan: true,
        ..sequential()
    };
    let report = scan(&fx.handle, &mut fx.checkpointer, &TileProvider, root, &forced).unwrap();

    assert_eq!(report.new_faces, 1);
    fx.handle.with(|s| {
        let backlog: Vec<FaceLocation> = s.unlabeled().map(|(_, f)| f.location).collect();
        assert_eq!(backlog, [tile_location(1)]);
        assert_eq!(s.encodings_for("Alice").len(), 1);
        assert_eq!(s.photo_faces()["a.png"].len(), 1);
    });
}

#[test]
fn non_finite_encoding_fails_only_its_photo() {
    let mut fx = fixture();
    let root = fx.photos.path();
    write_photo(root, "keep.png", &[[100, 0, 0]]);
    scan(&fx.handle, &mut fx.checkpointer, &GlitchyProvider, root, &sequential()).unwrap();

    write_photo(root, "glitch.png", &[[0, 0, 255]]);
    let report = scan(&fx.handle, &mut fx.checkpointer, &GlitchyProvider, root, &sequential()).unwrap();
    assert_eq!(report.processed, 0);
    assert_eq!(report.failed, 1);
    assert_eq!(report.new_faces, 0);

    let saved = FaceStore::load(fx.checkpointer.path());
    assert_eq!(saved.status, LoadStatus::Loaded);
    let photos: Vec<String> = saved.store.unlabeled().map(|(_, f)| f.photo.clone()).collect();
    assert_eq!(photos, ["keep.png"]);
    assert!(!saved.store.is_scanned("glitch.png"));
}

#[test]
fn scan_checkpoints_while_running() {
    let photos = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    let db = data.path().join("face_database.json");
    for (i, rel) in ["1.png", "2.png", "3.png"].iter().enumerate() {
        write_photo(photos.path(), rel, &[[10 * (i as u8 + 1), 0, 0]]);
    }

    let handle = StoreHandle::new(FaceStore::new());
    // Only cadence checkpoints can write before the scan ends.
    let mut checkpointer = Checkpointer::new(&db, Duration::from_secs(3600));
    let provider = WatchingProvider {
        db: db.clone(),
        seen: Mutex::new(Vec::new()),
    };
    let options = ScanOptions {
        checkpoint_every: 1,
        ..sequential()
    };

    scan(&handle, &mut checkpointer, &provider, photos.path(), &options).unwrap();
    assert_eq!(*provider.seen.lock().unwrap(), [None, Some(1), Some(2)]);
}

#[test]
fn parallel_scan_keeps_each_photo_contiguous() {
    let mut fx = fixture();
    let root = fx.photos.path();
    for i in 0..24u8 {
        write_photo(root, &format!("batch/{i:02}.png"), &[[i + 1, 0, 0], [0, i + 1, 0], [0, 0, i + 1]]);
    }
    let options = ScanOptions {
        parallel: true,
        workers: 4,
        parallel_threshold: 10,
        checkpoint_every: 5,
        ..ScanOptions::default()
    };

    let report = scan(&fx.handle, &mut fx.checkpointer, &TileProvider, root, &options).unwrap();
    assert_eq!(report.processed, 24);
    assert_eq!(report.new_faces, 72);

    let faces: Vec<(u64, String)> = fx
        .handle
        .with(|s| s.unlabeled().map(|(id, f)| (id.0, f.photo.clone())).collect());
    assert_eq!(faces.len(), 72);
    for run in faces.chunks(3) {
        assert!(run.iter().all(|(_, photo)| *photo == run[0].1), "interleaved run: {run:?}");
        assert_eq!(run[2].0 - run[0].0, 2);
    }
}

#[test]
fn provider_panic_is_contained() {
    let mut fx = fixture();
    let root = fx.photos.path();
    write_photo(root, "ok.png", &[[100, 0, 0]]);
    write_photo(root, "crash.png", &[[0, 255, 0]]);

    let report = scan(&fx.handle, &mut fx.checkpointer, &FragileProvider, root, &sequential()).unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.new_faces, 1);
}

#[test]
fn recognize_without_labels_reports_no_gallery() {
    let mut fx = fixture();
    write_photo(fx.photos.path(), "a.png", &[[100, 0, 0]]);
    let report = recognize(
        &fx.handle,
        &mut fx.checkpointer,
        &TileProvider,
        fx.photos.path(),
        &RecognizeOptions::default(),
    )
    .unwrap();
    assert!(report.no_gallery);
    assert_eq!(report.photos, 0);
}

#[test]
fn recognize_matches_at_half_distance() {
    // labeled = {Alice: [E1]}, unlabeled = [(photoA, E2, loc1)], distance(E1, E2) = 0.5.
    let mut fx = fixture();
    let root = fx.photos.path();
    write_photo(root, "photoA.png", &[[150, 0, 0]]);

    let e1 = encoding_of(Rgb([100, 0, 0]));
    let e2 = encoding_of(Rgb([150, 0, 0]));
    assert_eq!(e1.distance(&e2), 0.5);
    let loc1 = tile_location(0);

    fx.handle.with(|s| {
        s.add_unlabeled("elsewhere.png", e1.clone(), loc1);
        assert!(s.label_face(0, "Alice"));
        s.add_unlabeled("photoA.png", e2.clone(), loc1);
    });
    let backlog: Vec<UnlabeledFace> = fx.handle.with(|s| s.unlabeled().map(|(_, f)| f.clone()).collect());

    let report = recognize(
        &fx.handle,
        &mut fx.checkpointer,
        &TileProvider,
        root,
        &RecognizeOptions::default(),
    )
    .unwrap();

    assert_eq!(report.matched_faces, 1);
    fx.handle.with(|s| {
        assert_eq!(s.photo_faces().len(), 1);
        assert_eq!(
            s.photo_faces()["photoA.png"],
            vec![AssignedFace {
                name: "Alice".into(),
                location: loc1
            }]
        );
        let after: Vec<UnlabeledFace> = s.unlabeled().map(|(_, f)| f.clone()).collect();
        assert_eq!(after, backlog);
    });
}

struct Answers(Vec<&'static str>);

impl NamePrompt for Answers {
    fn ask(&mut self, _no: usize, _total: usize, _size: usize, _sample: &[UnlabeledFace]) -> LabelDecision {
        match self.0.first().copied() {
            None => LabelDecision::Stop,
            Some(answer) => {
                self.0.remove(0);
                if answer.is_empty() {
                    LabelDecision::Skip
                } else {
                    LabelDecision::Name(answer.to_string())
                }
            }
        }
    }
}

#[test]
fn scan_cluster_label_recognize_export() {
    let mut fx = fixture();
    let root = fx.photos.path();
    // "Red" person: encodings near [1.0, 0, 0]; "blue" person near [0, 0, 1.0].
    write_photo(root, "2020/beach.png", &[[100, 0, 0], [0, 0, 100]]);
    write_photo(root, "2020/hike.png", &[[110, 0, 0]]);
    write_photo(root, "2021/party.png", &[[0, 0, 105], [95, 0, 0]]);
    write_photo(root, "2021/stranger.png", &[[0, 250, 0]]);

    scan(&fx.handle, &mut fx.checkpointer, &TileProvider, root, &sequential()).unwrap();
    assert_eq!(fx.handle.with(|s| s.unlabeled_len()), 6);

    // Largest cluster first: red (3 faces), blue (2), stranger (1).
    let mut prompt = Answers(vec!["Rita", "Bea", ""]);
    let session = interactive_label(
        &fx.handle,
        &mut fx.checkpointer,
        &TileProvider,
        &mut prompt,
        &LabelOptions::default(),
    );
    assert_eq!(session.clusters, 3);
    assert_eq!(session.labeled_faces, 5);
    assert_eq!(session.remaining, 1);

    let report = recognize(
        &fx.handle,
        &mut fx.checkpointer,
        &TileProvider,
        root,
        &RecognizeOptions {
            tolerance: Some(0.6),
            ..RecognizeOptions::default()
        },
    )
    .unwrap();
    assert_eq!(report.photos, 4);
    assert_eq!(report.matched_faces, 5);
    assert_eq!(report.unmatched_faces, 1);
    assert_eq!(report.new_unlabeled, 0);

    let saved = FaceStore::load(fx.checkpointer.path()).store;
    let export = build_export(&saved);
    assert_eq!(export.people["Rita"].photo_count, 3);
    assert_eq!(export.people["Bea"].photos, ["2020/beach.png", "2021/party.png"]);
    assert_eq!(export.photos["2021/party.png"].people, ["Bea", "Rita"]);
    assert!(!export.photos.contains_key("2021/stranger.png"));
    assert_eq!(saved.metadata().person_count, 2);
    assert_eq!(saved.metadata().photo_count, 3);
    assert_eq!(saved.metadata().face_count, 5);
}
