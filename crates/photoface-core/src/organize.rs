//! Outputs built from the store: JSON export, per-person photo folders,
//! annotated copies, single-face crops and cluster previews.

use crate::store::FaceStore;
use crate::types::{FaceId, FaceLocation, UnlabeledFace};
use image::imageops::{self, FilterType};
use image::{DynamicImage, Rgb, RgbImage};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

const OUTLINE_COLOR: Rgb<u8> = Rgb([0, 0, 255]);
const OUTLINE_WIDTH: u32 = 2;

/// Edge of one face tile in a cluster preview.
pub const COMPOSITE_TILE: u32 = 150;
/// Tiles per row in a cluster preview.
pub const COMPOSITE_COLUMNS: u32 = 3;
const COMPOSITE_BACKGROUND: Rgb<u8> = Rgb([255, 255, 255]);

#[derive(Error, Debug)]
pub enum OrganizeError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("image: {0}")]
    Image(#[from] image::ImageError),
    #[error("export: {0}")]
    Json(#[from] serde_json::Error),
    #[error("no unlabeled face at index {index} ({len} unlabeled)")]
    NoSuchFace { index: usize, len: usize },
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> OrganizeError + '_ {
    move |source| OrganizeError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Export document consumed by other tools. Field names are stable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FaceExport {
    pub people: BTreeMap<String, PersonExport>,
    pub photos: BTreeMap<String, PhotoExport>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersonExport {
    pub photo_count: usize,
    pub photos: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhotoExport {
    pub people: Vec<String>,
}

/// Names per photo, each listed once, in order of first appearance.
fn people_in_photos(store: &FaceStore) -> BTreeMap<&str, Vec<&str>> {
    store
        .photo_faces()
        .iter()
        .map(|(photo, faces)| {
            let mut names: Vec<&str> = Vec::new();
            for face in faces {
                if !names.contains(&face.name.as_str()) {
                    names.push(&face.name);
                }
            }
            (photo.as_str(), names)
        })
        .collect()
}

/// Photos per person, each photo listed once.
fn photos_by_person(store: &FaceStore) -> BTreeMap<String, Vec<String>> {
    let mut by_person: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (photo, names) in people_in_photos(store) {
        for name in names {
            by_person.entry(name.to_string()).or_default().push(photo.to_string());
        }
    }
    by_person
}

/// Build the export document. Every labeled person appears, even with no photos.
pub fn build_export(store: &FaceStore) -> FaceExport {
    let mut export = FaceExport::default();
    for name in store.people() {
        export.people.insert(name.to_string(), PersonExport::default());
    }

    for (photo, names) in people_in_photos(store) {
        for name in &names {
            let person = export.people.entry(name.to_string()).or_default();
            person.photo_count += 1;
            person.photos.push(photo.to_string());
        }
        export.photos.insert(
            photo.to_string(),
            PhotoExport {
                people: names.iter().map(|n| n.to_string()).collect(),
            },
        );
    }
    export
}

/// Write the export document as pretty-printed JSON.
pub fn export_json(store: &FaceStore, path: &Path) -> Result<FaceExport, OrganizeError> {
    let export = build_export(store);
    let json = serde_json::to_string_pretty(&export)?;
    fs::write(path, json).map_err(io_err(path))?;
    tracing::info!(path = %path.display(), people = export.people.len(), photos = export.photos.len(), "face data exported");
    Ok(export)
}

/// Make a person's name safe to use as a single path component.
pub fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => cleaned,
    }
}

/// Reserve an output name not yet in `taken`, appending `_2`, `_3`, ... to
/// `stem` until it is free. Compared case-insensitively.
fn claim_name(taken: &mut HashSet<String>, stem: &str, ext: Option<&str>) -> String {
    let with_ext = |stem: &str| match ext {
        Some(ext) => format!("{stem}.{ext}"),
        None => stem.to_string(),
    };

    let mut name = with_ext(stem);
    let mut n = 2;
    while !taken.insert(name.to_lowercase()) {
        name = with_ext(&format!("{stem}_{n}"));
        n += 1;
    }
    name
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupReport {
    pub people: usize,
    pub copied: usize,
    pub missing: usize,
    pub failed: usize,
}

/// Copy each person's photos into `output_dir/<name>/<name>_<n>.<ext>`.
///
/// Names that sanitize to the same folder get `_2`, `_3`, ... suffixes.
/// Missing or uncopyable sources are counted and skipped.
pub fn group_by_person(
    store: &FaceStore,
    photo_root: &Path,
    output_dir: &Path,
) -> Result<GroupReport, OrganizeError> {
    fs::create_dir_all(output_dir).map_err(io_err(output_dir))?;

    let by_person = photos_by_person(store);
    let mut report = GroupReport {
        people: by_person.len(),
        ..GroupReport::default()
    };

    let mut dirs = HashSet::new();
    for (name, photos) in &by_person {
        let safe = claim_name(&mut dirs, &sanitize_name(name), None);
        let person_dir = output_dir.join(&safe);
        fs::create_dir_all(&person_dir).map_err(io_err(&person_dir))?;
        tracing::info!(person = %name, photos = photos.len(), dir = %person_dir.display(), "grouping photos");

        for (i, photo) in photos.iter().enumerate() {
            let src = photo_root.join(photo);
            if !src.is_file() {
                tracing::warn!(photo = %src.display(), "group: source photo not found");
                report.missing += 1;
                continue;
            }

            let file_name = match src.extension().and_then(|e| e.to_str()) {
                Some(ext) => format!("{safe}_{}.{ext}", i + 1),
                None => format!("{safe}_{}", i + 1),
            };
            let dst = person_dir.join(file_name);
            match fs::copy(&src, &dst) {
                Ok(_) => report.copied += 1,
                Err(e) => {
                    tracing::warn!(photo = %src.display(), error = %e, "group: copy failed");
                    report.failed += 1;
                }
            }
        }
    }

    Ok(report)
}

/// Draw a rectangle outline, clipped to the image.
fn draw_outline(image: &mut RgbImage, location: FaceLocation, color: Rgb<u8>, width: u32) {
    let (w, h) = image.dimensions();
    if w == 0 || h == 0 {
        return;
    }
    let loc = location.clamp_to(w, h);

    for t in 0..width {
        let top = (loc.top + t).min(h - 1);
        let bottom = loc.bottom.saturating_sub(t);
        let left = (loc.left + t).min(w - 1);
        let right = loc.right.saturating_sub(t);
        for x in loc.left..=loc.right {
            image.put_pixel(x, top, color);
            image.put_pixel(x, bottom, color);
        }
        for y in loc.top..=loc.bottom {
            image.put_pixel(left, y, color);
            image.put_pixel(right, y, color);
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VisualizeReport {
    pub written: usize,
    pub failed: usize,
}

/// Write `annotated_<photo>` copies with every assigned face outlined.
///
/// Subdirectories are flattened with `_`; paths that flatten to the same
/// name get `_2`, `_3`, ... suffixes.
pub fn visualize(
    store: &FaceStore,
    photo_root: &Path,
    output_dir: &Path,
) -> Result<VisualizeReport, OrganizeError> {
    fs::create_dir_all(output_dir).map_err(io_err(output_dir))?;
    let mut report = VisualizeReport::default();
    let mut taken = HashSet::new();

    for (photo, faces) in store.photo_faces() {
        let src = photo_root.join(photo);
        let flat = photo.replace('/', "_");
        let (stem, ext) = match flat.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
            _ => (flat.as_str(), None),
        };
        let dst = output_dir.join(claim_name(&mut taken, &format!("annotated_{stem}"), ext));

        let written = image::open(&src).map(|img| img.to_rgb8()).and_then(|mut rgb| {
            for face in faces {
                draw_outline(&mut rgb, face.location, OUTLINE_COLOR, OUTLINE_WIDTH);
            }
            rgb.save(&dst)
        });

        match written {
            Ok(()) => report.written += 1,
            Err(e) => {
                tracing::warn!(photo = %src.display(), error = %e, "visualize: photo skipped");
                report.failed += 1;
            }
        }
    }

    Ok(report)
}

fn crop_face(image: &DynamicImage, location: FaceLocation) -> DynamicImage {
    let loc = location.clamp_to(image.width(), image.height());
    image.crop_imm(loc.left, loc.top, loc.width().max(1), loc.height().max(1))
}

/// Save the crop of the unlabeled face at display `index` to `out`.
pub fn save_face_crop(
    store: &FaceStore,
    photo_root: &Path,
    index: usize,
    out: &Path,
) -> Result<FaceId, OrganizeError> {
    let (id, face) = store.unlabeled_at(index).ok_or(OrganizeError::NoSuchFace {
        index,
        len: store.unlabeled_len(),
    })?;

    let image = image::open(photo_root.join(&face.photo))?;
    crop_face(&image, face.location).save(out)?;

    tracing::info!(face = %id, photo = %face.photo, out = %out.display(), "face crop saved");
    Ok(id)
}

/// Tile crops of `faces` into a white grid of [`COMPOSITE_TILE`]-pixel
/// squares, [`COMPOSITE_COLUMNS`] per row, and save it to `out`.
///
/// Faces whose photo cannot be opened are left out. With none left, a blank
/// single row is written. Returns how many faces were placed.
pub fn save_cluster_composite(
    faces: &[UnlabeledFace],
    photo_root: &Path,
    out: &Path,
) -> Result<usize, OrganizeError> {
    let mut tiles = Vec::new();
    for face in faces {
        match image::open(photo_root.join(&face.photo)) {
            Ok(image) => {
                let crop = crop_face(&image, face.location).to_rgb8();
                tiles.push(imageops::resize(&crop, COMPOSITE_TILE, COMPOSITE_TILE, FilterType::Triangle));
            }
            Err(e) => tracing::warn!(photo = %face.photo, error = %e, "composite: face skipped"),
        }
    }

    let rows = (tiles.len() as u32).div_ceil(COMPOSITE_COLUMNS).max(1);
    let mut composite = RgbImage::from_pixel(
        COMPOSITE_TILE * COMPOSITE_COLUMNS,
        COMPOSITE_TILE * rows,
        COMPOSITE_BACKGROUND,
    );
    for (i, tile) in tiles.iter().enumerate() {
        let i = i as u32;
        let x = (i % COMPOSITE_COLUMNS) * COMPOSITE_TILE;
        let y = (i / COMPOSITE_COLUMNS) * COMPOSITE_TILE;
        imageops::replace(&mut composite, tile, i64::from(x), i64::from(y));
    }

    if let Some(parent) = out.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err(parent))?;
    }
    composite.save(out)?;
    tracing::debug!(faces = tiles.len(), out = %out.display(), "cluster composite saved");
    Ok(tiles.len())
}
