use serde::Deserialize;
use std::path::PathBuf;
use thiserror::Error;

use crate::db::{BoundingBox, PhotoIdentity};

/// A detected face with bounding box and embedding
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub embedding: Vec<f32>,
}

/// A per-photo detection failure. The photo is recorded as failed and retried
/// by the next ingestion run; other photos are unaffected.
#[derive(Debug, Error)]
pub enum DetectError {
    #[error("unreadable: {0}")]
    Unreadable(String),

    #[error("invalid detector output: {0}")]
    Invalid(String),

    #[error("{0}")]
    Other(String),
}

/// Detection and embedding collaborator.
///
/// Implementations must be callable from several worker threads at once.
/// Returning an empty list means the photo has no faces, which is not an error.
pub trait FaceDetector: Send + Sync {
    fn detect(&self, photo: &PhotoIdentity) -> Result<Vec<DetectedFace>, DetectError>;
}

pub const DEFAULT_SIDECAR_SUFFIX: &str = ".faces.json";

/// Reads detections written next to each photo by an external tool.
///
/// For `IMG_001.jpg` the detections live in `IMG_001.jpg.faces.json`, a JSON
/// array of `{ "bbox": {..}, "confidence": .., "embedding": [..] }`.
#[derive(Debug, Clone)]
pub struct SidecarDetector {
    suffix: String,
}

impl SidecarDetector {
    pub fn new(suffix: impl Into<String>) -> Self {
        Self {
            suffix: suffix.into(),
        }
    }

    fn sidecar_path(&self, photo: &PhotoIdentity) -> PathBuf {
        let mut path = photo.path.clone().into_os_string();
        path.push(&self.suffix);
        PathBuf::from(path)
    }
}

impl Default for SidecarDetector {
    fn default() -> Self {
        Self::new(DEFAULT_SIDECAR_SUFFIX)
    }
}

impl FaceDetector for SidecarDetector {
    fn detect(&self, photo: &PhotoIdentity) -> Result<Vec<DetectedFace>, DetectError> {
        let path = self.sidecar_path(photo);
        let contents = std::fs::read_to_string(&path)
            .map_err(|e| DetectError::Unreadable(format!("{}: {}", path.display(), e)))?;
        serde_json::from_str(&contents)
            .map_err(|e| DetectError::Invalid(format!("{}: {}", path.display(), e)))
    }
}
