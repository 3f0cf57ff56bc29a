pub mod clustering;
mod dbscan;
pub mod detector;
pub mod processor;
pub(crate) mod reconcile;

pub use clustering::{cluster_faces, ClusterParams, ClusteringReport};
pub use detector::{DetectError, DetectedFace, FaceDetector, SidecarDetector};
pub use processor::{FaceProcessor, IngestFailure, IngestOptions, IngestReport, IngestStatus};
