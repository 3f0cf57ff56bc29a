//! The face library: one handle over the store, ingestion and clustering.
//!
//! Every operation the outer layers (CLI, HTTP) need is a method here. None of
//! the mutations triggers a clustering run; corrections take effect at the
//! next explicit [`Library::recluster`].

use std::path::Path;
use std::sync::Arc;

use crate::db::runs::RecordedFailure;
use crate::db::{
    ClusterDetail, ClusterSummary, Correction, Database, Face, Photo, Stats,
};
use crate::error::{Error, Result};
use crate::faces::{
    cluster_faces, ClusterParams, ClusteringReport, FaceDetector, FaceProcessor, IngestOptions,
    IngestReport,
};
use crate::scanner::PhotoSource;

pub const DEFAULT_PAGE_SIZE: usize = 100;
pub const MAX_PAGE_SIZE: usize = 1000;

/// Filter and page for [`Library::list_clusters`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterQuery {
    pub min_members: usize,
    pub offset: usize,
    pub limit: usize,
}

impl Default for ClusterQuery {
    fn default() -> Self {
        Self {
            min_members: 1,
            offset: 0,
            limit: DEFAULT_PAGE_SIZE,
        }
    }
}

impl ClusterQuery {
    pub fn validate(&self) -> Result<()> {
        if self.min_members < 1 {
            return Err(Error::Validation("min_members must be at least 1".into()));
        }
        if self.limit < 1 || self.limit > MAX_PAGE_SIZE {
            return Err(Error::Validation(format!(
                "limit must be between 1 and {}",
                MAX_PAGE_SIZE
            )));
        }
        Ok(())
    }
}

pub struct Library {
    db: Database,
}

impl Library {
    /// Open (or create) the library database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::open(path)?;
        db.initialize()?;
        tracing::debug!(path = %path.display(), "Library opened");
        Ok(Self { db })
    }

    /// A throwaway in-memory library. Ingestion runs on the calling thread.
    pub fn open_in_memory() -> Result<Self> {
        let db = Database::open_in_memory()?;
        db.initialize()?;
        Ok(Self { db })
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Fix the dataset embedding dimension before any face is stored.
    ///
    /// Fails with a validation error if faces were already stored with a
    /// different dimension.
    pub fn pin_embedding_dim(&self, dim: usize) -> Result<()> {
        if dim == 0 {
            return Err(Error::Validation("embedding dimension must be positive".into()));
        }
        let tx = self.db.write_transaction()?;
        match crate::db::embedding_dim(&tx)? {
            Some(stored) if stored == dim => {}
            Some(stored) => {
                return Err(Error::Validation(format!(
                    "configured embedding dimension {} does not match stored dimension {}",
                    dim, stored
                )));
            }
            None => crate::db::set_embedding_dim(&tx, dim)?,
        }
        tx.commit()?;
        Ok(())
    }

    // ========================================================================
    // Runs
    // ========================================================================

    pub fn ingest(
        &self,
        source: &dyn PhotoSource,
        detector: Arc<dyn FaceDetector>,
        options: IngestOptions,
    ) -> Result<IngestReport> {
        FaceProcessor::new(detector, options).ingest(&self.db, source)
    }

    /// Ingest with a configured processor (cancel flag, status channel).
    pub fn ingest_with(&self, processor: &FaceProcessor, source: &dyn PhotoSource) -> Result<IngestReport> {
        processor.ingest(&self.db, source)
    }

    pub fn recluster(&self, params: &ClusterParams) -> Result<ClusteringReport> {
        cluster_faces(&self.db, params)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn list_clusters(&self, query: &ClusterQuery) -> Result<Vec<ClusterSummary>> {
        query.validate()?;
        self.db.list_clusters(query.min_members, query.offset, query.limit)
    }

    pub fn get_cluster(&self, cluster_id: i64) -> Result<ClusterDetail> {
        self.db.get_cluster(cluster_id)
    }

    pub fn clusters_by_name(&self, name: &str) -> Result<Vec<ClusterSummary>> {
        self.db.clusters_by_name(name)
    }

    pub fn get_face(&self, face_id: i64) -> Result<Face> {
        self.db.get_face(face_id)
    }

    pub fn get_photo(&self, photo_id: i64) -> Result<Photo> {
        self.db.get_photo(photo_id)
    }

    pub fn faces_for_photo(&self, photo_id: i64) -> Result<Vec<Face>> {
        self.db.faces_for_photo(photo_id)
    }

    pub fn get_correction(&self, face_id: i64) -> Result<Option<Correction>> {
        self.db.get_correction(face_id)
    }

    pub fn list_corrections(&self) -> Result<Vec<Correction>> {
        self.db.list_corrections()
    }

    pub fn ingest_failures(&self) -> Result<Vec<RecordedFailure>> {
        self.db.ingest_failures()
    }

    pub fn stats(&self) -> Result<Stats> {
        self.db.stats()
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    pub fn rename_cluster(&self, cluster_id: i64, name: &str) -> Result<ClusterSummary> {
        self.db.rename_cluster(cluster_id, name)
    }

    pub fn set_representative(&self, cluster_id: i64, face_id: i64) -> Result<ClusterSummary> {
        self.db.set_representative(cluster_id, face_id)
    }

    pub fn record_exclude(&self, face_id: i64) -> Result<Correction> {
        self.db.record_exclude(face_id)
    }

    pub fn record_forced_assign(&self, face_id: i64, person_name: &str) -> Result<Correction> {
        self.db.record_forced_assign(face_id, person_name)
    }

    pub fn remove_correction(&self, face_id: i64) -> Result<Correction> {
        self.db.remove_correction(face_id)
    }

    /// Delete every photo, face, cluster and correction.
    pub fn reset(&self) -> Result<()> {
        self.db.reset()
    }
}
