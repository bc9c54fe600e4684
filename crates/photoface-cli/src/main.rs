use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use photoface_core::label::LabelOptions;
use photoface_core::organize;
use photoface_core::recognize::RecognizeOptions;
use photoface_core::{Checkpointer, DetectionModel, FaceStore, LabelDecision, LoadStatus, ScanOptions, StoreHandle};
use photoface_onnx::{ArcFaceSpace, OnnxProvider};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod config;
mod prompt;

use config::Config;
use prompt::{Preview, TerminalPrompt};

#[derive(Parser)]
#[command(name = "photoface", about = "Find, label and organize the people in your photos")]
struct Cli {
    /// Face database file (overrides config)
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    /// Directory with det_10g.onnx and w600k_r50.onnx (overrides config)
    #[arg(long, global = true)]
    model_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Detect faces in a photo tree and add them to the unlabeled backlog
    Scan {
        photos_dir: PathBuf,
        /// Re-process photos that were already scanned
        #[arg(long)]
        force_rescan: bool,
        /// Spread the scan over a worker pool
        #[arg(long)]
        parallel: bool,
        /// Detection model: fast (hog) or accurate (cnn)
        #[arg(long, default_value = "fast")]
        model: DetectionModel,
    },
    /// Label one unlabeled face by its index in `list`
    Label { index: usize, name: String },
    /// List unlabeled faces and known people
    List,
    /// Save the crop of an unlabeled face to an image file
    Show {
        photos_dir: PathBuf,
        index: usize,
        #[arg(long)]
        out: PathBuf,
    },
    /// Cluster unlabeled faces and name them cluster by cluster
    Interactive {
        /// Clustering threshold (default: calibrated for the ArcFace model)
        #[arg(long)]
        tolerance: Option<f32>,
        /// Photo tree the faces came from; enables the cluster preview image
        #[arg(long)]
        photos_dir: Option<PathBuf>,
        /// Where to write the preview of each cluster's faces
        #[arg(long, default_value = "cluster_preview.png")]
        preview: PathBuf,
    },
    /// Work out which known people appear in which photos
    Recognize {
        photos_dir: PathBuf,
        /// Match threshold (default: calibrated for the ArcFace model)
        #[arg(long)]
        tolerance: Option<f32>,
        /// Detection model: fast (hog) or accurate (cnn); use the one the scan used
        #[arg(long, default_value = "fast")]
        model: DetectionModel,
    },
    /// Copy photos into one folder per person
    Group { photos_dir: PathBuf, output_dir: PathBuf },
    /// Write the people/photos index as JSON
    Export {
        #[arg(long, default_value = "face_data.json")]
        output: PathBuf,
    },
    /// Write copies of recognized photos with faces outlined
    Visualize { photos_dir: PathBuf, output_dir: PathBuf },
    /// Show database counts
    Status,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = Config::load()?;
    if let Some(db) = cli.db {
        config.db_path = db;
    }
    if let Some(dir) = cli.model_dir {
        config.model_dir = dir;
    }

    let handle = open_store(&config.db_path);
    let mut checkpointer = Checkpointer::new(config.db_path.clone(), Duration::from_secs(config.autosave_interval_secs));

    run(cli.command, &config, &handle, &mut checkpointer)?;

    checkpointer
        .save(&handle, true)
        .with_context(|| format!("saving face database {}", config.db_path.display()))?;
    Ok(())
}

fn open_store(path: &Path) -> StoreHandle {
    let outcome = FaceStore::load(path);
    match &outcome.status {
        LoadStatus::Loaded => tracing::debug!(path = %path.display(), "face database loaded"),
        LoadStatus::Missing => tracing::info!(path = %path.display(), "no face database yet, starting fresh"),
        LoadStatus::Corrupt(reason) => {
            eprintln!(
                "warning: face database {} could not be read ({reason}); starting fresh, old file kept as .corrupt",
                path.display()
            );
        }
    }
    StoreHandle::new(outcome.store)
}

fn load_provider(config: &Config) -> Result<OnnxProvider> {
    OnnxProvider::load(&config.model_dir)
        .with_context(|| format!("loading face models from {}", config.model_dir.display()))
}

/// A `--tolerance` flag wins over the config; with neither, the provider's
/// calibrated default applies.
fn recognize_options(config: &Config, tolerance: Option<f32>, model: DetectionModel) -> RecognizeOptions {
    RecognizeOptions {
        tolerance: tolerance.or(config.tolerance),
        model,
        checkpoint_every: config.checkpoint_every,
    }
}

fn run(command: Commands, config: &Config, handle: &StoreHandle, checkpointer: &mut Checkpointer) -> Result<()> {
    match command {
        Commands::Scan {
            photos_dir,
            force_rescan,
            parallel,
            model,
        } => {
            let provider = load_provider(config)?;
            let options = ScanOptions {
                force_rescan,
                parallel,
                model,
                workers: config.workers,
                parallel_threshold: config.parallel_threshold,
                checkpoint_every: config.checkpoint_every,
            };
            let report = photoface_core::scan(handle, checkpointer, &provider, &photos_dir, &options)?;
            println!(
                "Found {} photos: {} processed, {} already scanned, {} failed, {} new faces",
                report.found, report.processed, report.skipped, report.failed, report.new_faces
            );
        }
        Commands::Label { index, name } => match prompt::parse_answer(Some(&name)) {
            LabelDecision::Name(name) => {
                let id = photoface_core::label_single(handle, checkpointer, index, &name)?;
                println!("Labeled face {index} ({id}) as {name}");
            }
            _ => println!("Face {index} left unlabeled"),
        },
        Commands::List => handle.with(|store| {
            println!("Unlabeled faces: {}", store.unlabeled_len());
            for (index, (_, face)) in store.unlabeled().enumerate() {
                println!("  [{index}] {}", face.photo);
            }
            println!("People:");
            for name in store.people() {
                println!("  {name}: {} face(s)", store.encodings_for(name).len());
            }
        }),
        Commands::Show { photos_dir, index, out } => {
            let id = handle.with(|store| organize::save_face_crop(store, &photos_dir, index, &out))?;
            println!("Saved face {index} ({id}) to {}", out.display());
        }
        Commands::Interactive {
            tolerance,
            photos_dir,
            preview,
        } => {
            let options = LabelOptions {
                tolerance: tolerance.or(config.tolerance),
                min_samples: config.min_cluster_samples,
                max_faces_per_prompt: config.max_faces_per_prompt,
            };
            let stdin = std::io::stdin();
            let mut prompt = TerminalPrompt::new(stdin.lock(), std::io::stdout());
            if let Some(photo_root) = photos_dir {
                prompt = prompt.with_preview(Preview {
                    photo_root,
                    path: preview,
                });
            }
            let report =
                photoface_core::interactive_label(handle, checkpointer, &ArcFaceSpace, &mut prompt, &options);
            println!(
                "\nLabeled {} face(s) in {} of {} cluster(s); {} face(s) still unlabeled",
                report.labeled_faces, report.labeled_clusters, report.clusters, report.remaining
            );
        }
        Commands::Recognize {
            photos_dir,
            tolerance,
            model,
        } => {
            let provider = load_provider(config)?;
            let options = recognize_options(config, tolerance, model);
            let report = photoface_core::recognize(handle, checkpointer, &provider, &photos_dir, &options)?;
            if report.no_gallery {
                println!("No labeled faces yet. Label some faces first.");
            } else {
                println!(
                    "Recognized {} face(s) in {} photo(s) at tolerance {}; {} unmatched ({} new), {} failed",
                    report.matched_faces,
                    report.photos,
                    report.tolerance,
                    report.unmatched_faces,
                    report.new_unlabeled,
                    report.failed
                );
            }
        }
        Commands::Group { photos_dir, output_dir } => {
            let report = handle.with(|store| organize::group_by_person(store, &photos_dir, &output_dir))?;
            println!(
                "Grouped {} person(s): {} photo(s) copied, {} missing, {} failed",
                report.people, report.copied, report.missing, report.failed
            );
        }
        Commands::Export { output } => {
            let export = handle.with(|store| organize::export_json(store, &output))?;
            println!(
                "Exported {} person(s) across {} photo(s) to {}",
                export.people.len(),
                export.photos.len(),
                output.display()
            );
        }
        Commands::Visualize { photos_dir, output_dir } => {
            let report = handle.with(|store| organize::visualize(store, &photos_dir, &output_dir))?;
            println!("Wrote {} annotated photo(s), {} failed", report.written, report.failed);
        }
        Commands::Status => handle.with(|store| {
            store.refresh_metadata();
            let meta = store.metadata();
            println!("Database:        {}", config.db_path.display());
            println!("People:          {}", meta.person_count);
            println!("Labeled faces:   {}", meta.face_count);
            println!("Photos tagged:   {}", meta.photo_count);
            println!("Unlabeled faces: {}", store.unlabeled_len());
            println!("Scanned photos:  {}", store.scanned_count());
            println!("Created:         {}", meta.created_at.to_rfc3339());
        }),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recognize_takes_model_flag() {
        let cli = Cli::try_parse_from(["photoface", "recognize", "/photos", "--model", "accurate"]).unwrap();
        match cli.command {
            Commands::Recognize {
                model, tolerance, ..
            } => {
                assert_eq!(model, DetectionModel::Accurate);
                assert_eq!(tolerance, None);
            }
            _ => panic!("parsed the wrong subcommand"),
        }
    }

    #[test]
    fn test_recognize_options_follow_config() {
        let config = Config {
            checkpoint_every: 7,
            tolerance: Some(0.9),
            ..Config::default()
        };
        let options = recognize_options(&config, None, DetectionModel::Accurate);
        assert_eq!(options.checkpoint_every, 7);
        assert_eq!(options.tolerance, Some(0.9));
        assert_eq!(options.model, DetectionModel::Accurate);

        let options = recognize_options(&Config::default(), Some(1.2), DetectionModel::Fast);
        assert_eq!(options.tolerance, Some(1.2));
    }
}
