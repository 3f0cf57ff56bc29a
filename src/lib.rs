//! Resumable face ingestion and correction-aware identity clustering for photo libraries.
//!
//! Photos are enumerated by a [`PhotoSource`], faces come from a
//! [`FaceDetector`], and everything is kept in a SQLite database. Clustering
//! runs on demand through [`Library::recluster`] and keeps cluster identities,
//! names and representatives stable across runs.

pub mod config;
pub mod db;
pub mod error;
pub mod faces;
pub mod library;
pub mod logging;
pub mod scanner;

pub use db::{
    BoundingBox, ClusterDetail, ClusterSummary, ClusteringRun, Correction, CorrectionKind, Face,
    FaceWithPhoto, Photo, PhotoIdentity, Stats,
};
pub use error::{Error, Result};
pub use faces::{
    ClusterParams, ClusteringReport, DetectError, DetectedFace, FaceDetector, FaceProcessor,
    IngestFailure, IngestOptions, IngestReport, IngestStatus, SidecarDetector,
};
pub use library::{ClusterQuery, Library};
pub use scanner::{DirectorySource, PhotoSource};
