use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Settings shared by every subcommand.
///
/// Loaded from defaults, then the TOML file, then `PHOTOFACE_*` variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Path to the face database JSON file.
    pub db_path: PathBuf,
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// Distance threshold for clustering and recognition. Unset means the
    /// embedding model's calibrated default.
    pub tolerance: Option<f32>,
    /// Minimum seconds between two non-forced checkpoints.
    pub autosave_interval_secs: u64,
    /// Force a checkpoint after this many scanned photos.
    pub checkpoint_every: usize,
    /// Parallel scans only fan out above this many photos.
    pub parallel_threshold: usize,
    /// Scan worker threads; 0 picks the available parallelism.
    pub workers: usize,
    pub min_cluster_samples: usize,
    /// Faces shown per cluster in interactive labeling.
    pub max_faces_per_prompt: usize,
}

/// Config file contents. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    db_path: Option<PathBuf>,
    model_dir: Option<PathBuf>,
    tolerance: Option<f32>,
    autosave_interval_secs: Option<u64>,
    checkpoint_every: Option<usize>,
    parallel_threshold: Option<usize>,
    workers: Option<usize>,
    min_cluster_samples: Option<usize>,
    max_faces_per_prompt: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: xdg_dir("XDG_DATA_HOME", ".local/share").join("face_database.json"),
            model_dir: photoface_onnx::default_model_dir(),
            tolerance: None,
            autosave_interval_secs: 60,
            checkpoint_every: 20,
            parallel_threshold: 10,
            workers: 0,
            min_cluster_samples: 1,
            max_faces_per_prompt: 5,
        }
    }
}

impl Config {
    /// Load the config from the real file system and environment.
    pub fn load() -> Result<Self> {
        let path = std::env::var("PHOTOFACE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_config_path());

        let mut config = Self::default();
        if path.exists() {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading config {}", path.display()))?;
            config.apply_file(&text).with_context(|| format!("parsing config {}", path.display()))?;
            tracing::debug!(path = %path.display(), "config file loaded");
        }
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn apply_file(&mut self, text: &str) -> Result<()> {
        let file: FileConfig = toml::from_str(text)?;
        if let Some(v) = file.db_path {
            self.db_path = v;
        }
        if let Some(v) = file.model_dir {
            self.model_dir = v;
        }
        if let Some(v) = file.tolerance {
            self.tolerance = Some(v);
        }
        if let Some(v) = file.autosave_interval_secs {
            self.autosave_interval_secs = v;
        }
        if let Some(v) = file.checkpoint_every {
            self.checkpoint_every = v;
        }
        if let Some(v) = file.parallel_threshold {
            self.parallel_threshold = v;
        }
        if let Some(v) = file.workers {
            self.workers = v;
        }
        if let Some(v) = file.min_cluster_samples {
            self.min_cluster_samples = v;
        }
        if let Some(v) = file.max_faces_per_prompt {
            self.max_faces_per_prompt = v;
        }
        Ok(())
    }

    /// Override from `PHOTOFACE_*` variables. Unparsable values are ignored.
    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("PHOTOFACE_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = var("PHOTOFACE_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = var("PHOTOFACE_TOLERANCE").and_then(|v| v.trim().parse().ok()) {
            self.tolerance = Some(v);
        }
        self.autosave_interval_secs = env_parse(&var, "PHOTOFACE_AUTOSAVE_INTERVAL_SECS", self.autosave_interval_secs);
        self.checkpoint_every = env_parse(&var, "PHOTOFACE_CHECKPOINT_EVERY", self.checkpoint_every);
        self.parallel_threshold = env_parse(&var, "PHOTOFACE_PARALLEL_THRESHOLD", self.parallel_threshold);
        self.workers = env_parse(&var, "PHOTOFACE_WORKERS", self.workers);
        self.min_cluster_samples = env_parse(&var, "PHOTOFACE_MIN_CLUSTER_SAMPLES", self.min_cluster_samples);
        self.max_faces_per_prompt = env_parse(&var, "PHOTOFACE_MAX_FACES_PER_PROMPT", self.max_faces_per_prompt);
    }
}

fn env_parse<T: FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str, current: T) -> T {
    var(key).and_then(|v| v.trim().parse().ok()).unwrap_or(current)
}

/// `$<xdg_var>/photoface`, falling back to `$HOME/<fallback>/photoface`.
fn xdg_dir(xdg_var: &str, fallback: &str) -> PathBuf {
    std::env::var(xdg_var)
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            Path::new(&home).join(fallback)
        })
        .join("photoface")
}

fn default_config_path() -> PathBuf {
    xdg_dir("XDG_CONFIG_HOME", ".config").join("config.toml")
}
