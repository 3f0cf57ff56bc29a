pub mod discovery;
pub mod hashing;

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};

use crate::config::ScannerConfig;
use crate::db::PhotoIdentity;
use crate::error::Result;

pub use discovery::discover_images;

/// Format used for file modification times in photo signatures.
pub const MTIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// The photo walker: enumerates photo identities for one ingestion run.
pub trait PhotoSource {
    /// Human-readable description of what is enumerated (logged and stored with the run).
    fn scope(&self) -> String;

    fn photos(&self) -> Result<Vec<PhotoIdentity>>;
}

/// Walks a directory tree for image files.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
    config: ScannerConfig,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>, config: ScannerConfig) -> Self {
        Self {
            root: root.into(),
            config,
        }
    }

    fn identify(&self, path: &Path) -> std::io::Result<PhotoIdentity> {
        let metadata = std::fs::metadata(path)?;
        let mut photo = PhotoIdentity::new(path, metadata.len());

        if let Ok(modified) = metadata.modified() {
            let modified: DateTime<Utc> = modified.into();
            photo = photo.with_modified_at(modified.format(MTIME_FORMAT).to_string());
        }

        if self.config.hash_contents {
            photo = photo.with_content_hash(hashing::md5_file(path)?);
        }

        if self.config.probe_dimensions {
            match image::image_dimensions(path) {
                Ok((width, height)) => photo = photo.with_dimensions(width, height),
                Err(e) => tracing::debug!(path = %path.display(), error = %e, "No image dimensions"),
            }
        }

        Ok(photo)
    }
}

impl PhotoSource for DirectorySource {
    fn scope(&self) -> String {
        self.root.to_string_lossy().to_string()
    }

    fn photos(&self) -> Result<Vec<PhotoIdentity>> {
        let paths = discover_images(&self.root, &self.config.image_extensions)?;
        let mut photos = Vec::with_capacity(paths.len());

        for path in paths {
            match self.identify(&path) {
                Ok(photo) => photos.push(photo),
                // Reported as an ingestion failure; the next run tries again.
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Photo unreadable");
                    photos.push(PhotoIdentity::unreadable(path, e.to_string()));
                }
            }
        }

        tracing::debug!(root = %self.root.display(), count = photos.len(), "Photos enumerated");
        Ok(photos)
    }
}
