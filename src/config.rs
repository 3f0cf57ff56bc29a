use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::faces::clustering::{DEFAULT_EPSILON, DEFAULT_MIN_POINTS, DEFAULT_TIMEOUT};
use crate::faces::detector::DEFAULT_SIDECAR_SUFFIX;
use crate::faces::processor::{DEFAULT_BATCH_SIZE, DEFAULT_WORKERS};
use crate::faces::{ClusterParams, IngestOptions};

/// Environment variable that overrides the config file location.
pub const CONFIG_ENV: &str = "FACEGROUP_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Expected embedding dimension. Pins the dataset dimension before the
    /// first face is stored; left unset, the first face decides.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_dim: Option<usize>,

    #[serde(default)]
    pub scanner: ScannerConfig,

    #[serde(default)]
    pub ingest: IngestConfig,

    #[serde(default)]
    pub clustering: ClusteringConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    #[serde(default = "default_image_extensions")]
    pub image_extensions: Vec<String>,

    /// Include an MD5 of the file contents in each photo's signature.
    #[serde(default)]
    pub hash_contents: bool,

    /// Read image headers to record width and height.
    #[serde(default = "default_probe_dimensions")]
    pub probe_dimensions: bool,

    /// Suffix of the detection sidecar written next to each photo.
    #[serde(default = "default_sidecar_suffix")]
    pub sidecar_suffix: String,
}

fn default_image_extensions() -> Vec<String> {
    vec![
        "jpg".to_string(),
        "jpeg".to_string(),
        "png".to_string(),
        "gif".to_string(),
        "webp".to_string(),
        "heic".to_string(),
        "heif".to_string(),
        "tif".to_string(),
        "tiff".to_string(),
    ]
}

fn default_probe_dimensions() -> bool {
    true
}

fn default_sidecar_suffix() -> String {
    DEFAULT_SIDECAR_SUFFIX.to_string()
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            image_extensions: default_image_extensions(),
            hash_contents: false,
            probe_dimensions: default_probe_dimensions(),
            sidecar_suffix: default_sidecar_suffix(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_workers() -> usize {
    DEFAULT_WORKERS
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            workers: default_workers(),
        }
    }
}

impl IngestConfig {
    pub fn options(&self, resume: bool) -> IngestOptions {
        IngestOptions {
            resume,
            batch_size: self.batch_size,
            workers: self.workers,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusteringConfig {
    #[serde(default = "default_epsilon")]
    pub epsilon: f32,

    #[serde(default = "default_min_points")]
    pub min_points: usize,

    /// Run timeout in seconds; 0 disables it.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_epsilon() -> f32 {
    DEFAULT_EPSILON
}

fn default_min_points() -> usize {
    DEFAULT_MIN_POINTS
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT.as_secs()
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            epsilon: default_epsilon(),
            min_points: default_min_points(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl ClusteringConfig {
    pub fn params(&self) -> ClusterParams {
        ClusterParams {
            epsilon: self.epsilon,
            min_points: self.min_points,
            timeout: (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs)),
        }
    }
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("facegroup")
        .join("facegroup.db")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            embedding_dim: None,
            scanner: ScannerConfig::default(),
            ingest: IngestConfig::default(),
            clustering: ClusteringConfig::default(),
        }
    }
}

impl Config {
    /// Load from `FACEGROUP_CONFIG` or the default location, creating a
    /// default file on first use.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("parsing config {}", path.display()))?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("writing config {}", path.display()))?;

        Ok(())
    }

    pub fn config_path() -> PathBuf {
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }

    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("facegroup")
    }
}
