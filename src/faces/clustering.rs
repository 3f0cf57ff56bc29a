//! Correction-aware reclustering.
//!
//! A run reads one snapshot (active faces, forced assignments, previous
//! clusters), groups it in memory, reconciles the groups with the previous
//! cluster identities, and publishes everything in a single write
//! transaction. At most one run is in flight; the run holds the
//! `recluster` advisory lock for its whole duration.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use super::dbscan::{dbscan, groups, l2_norm};
use super::reconcile::reconcile;
use crate::db::clusters::{load_prior_clusters, write_snapshot};
use crate::db::corrections::load_forced_assignments;
use crate::db::faces::load_active_embeddings;
use crate::db::runs::{insert_clustering_run, record_clustering_counts};
use crate::db::{Database, RunLock};
use crate::error::{Error, Result};

pub const RECLUSTER_LOCK: &str = "recluster";

pub const DEFAULT_EPSILON: f32 = 0.5;
pub const DEFAULT_MIN_POINTS: usize = 3;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

/// Parameters for one clustering run
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClusterParams {
    /// Neighborhood radius on unit-length embeddings.
    pub epsilon: f32,
    /// Minimum neighborhood size of a core point, the point itself included.
    pub min_points: usize,
    /// Fail the run once it has taken this long. `None` never times out.
    pub timeout: Option<Duration>,
}

impl Default for ClusterParams {
    fn default() -> Self {
        Self {
            epsilon: DEFAULT_EPSILON,
            min_points: DEFAULT_MIN_POINTS,
            timeout: Some(DEFAULT_TIMEOUT),
        }
    }
}

impl ClusterParams {
    pub fn validate(&self) -> Result<()> {
        if !self.epsilon.is_finite() || self.epsilon <= 0.0 {
            return Err(Error::Validation(format!(
                "epsilon must be a positive number, got {}",
                self.epsilon
            )));
        }
        if self.min_points < 1 {
            return Err(Error::Validation("min_points must be at least 1".into()));
        }
        Ok(())
    }
}

/// Result of a committed clustering run
#[derive(Debug, Clone, Default, Serialize)]
pub struct ClusteringReport {
    /// Snapshot generation written by this run
    pub run_id: i64,
    /// Clusters present after the run
    pub clusters: usize,
    pub clusters_created: usize,
    /// Clusters that kept a previous identity
    pub clusters_inherited: usize,
    /// Previous clusters that received no members
    pub clusters_deleted: usize,
    pub faces_clustered: usize,
    /// Faces placed by a forced assignment
    pub forced_faces: usize,
    /// Automatic faces left without a cluster
    pub noise_faces: usize,
}

struct Deadline {
    at: Option<Instant>,
    timeout: Duration,
}

impl Deadline {
    fn new(timeout: Option<Duration>) -> Self {
        Self {
            at: timeout.map(|t| Instant::now() + t),
            timeout: timeout.unwrap_or_default(),
        }
    }

    fn expired(&self) -> bool {
        self.at.is_some_and(|at| Instant::now() >= at)
    }

    fn check(&self) -> Result<()> {
        if self.expired() {
            Err(Error::Timeout(self.timeout))
        } else {
            Ok(())
        }
    }
}

/// Recluster every non-excluded face and publish the result.
///
/// Fails with [`Error::Validation`] before touching the database when the
/// parameters are out of range, with [`Error::Conflict`] when another run holds
/// the lock, and with [`Error::Timeout`] when the deadline passes; in every
/// failure case nothing is written and the lock is released.
pub fn cluster_faces(db: &Database, params: &ClusterParams) -> Result<ClusteringReport> {
    params.validate()?;
    let deadline = Deadline::new(params.timeout);
    let lock = RunLock::try_acquire(db, RECLUSTER_LOCK, params.timeout)?;

    tracing::info!(
        epsilon = params.epsilon,
        min_points = params.min_points,
        "Clustering started"
    );

    let (faces, forced, prior) = {
        let tx = db.read_transaction()?;
        let faces = load_active_embeddings(&tx)?;
        let forced = load_forced_assignments(&tx)?;
        let prior = load_prior_clusters(&tx)?;
        tx.commit()?;
        (faces, forced, prior)
    };
    deadline.check()?;

    let forced_by_face: HashMap<i64, String> = forced.into_iter().collect();
    let mut forced_groups: BTreeMap<String, Vec<i64>> = BTreeMap::new();
    let mut pool_ids = Vec::with_capacity(faces.len());
    let mut vectors = Vec::with_capacity(faces.len());

    for face in faces {
        match forced_by_face.get(&face.id) {
            Some(name) => forced_groups.entry(name.clone()).or_default().push(face.id),
            None => {
                let mut embedding = face.embedding;
                l2_norm(&mut embedding);
                pool_ids.push(face.id);
                vectors.push(embedding);
            }
        }
    }
    let forced_faces: usize = forced_groups.values().map(Vec::len).sum();

    tracing::debug!(
        automatic = pool_ids.len(),
        forced = forced_faces,
        previous_clusters = prior.len(),
        "Snapshot loaded"
    );

    let labels = dbscan(&vectors, params.epsilon, params.min_points, || deadline.expired())
        .ok_or(Error::Timeout(deadline.timeout))?;
    let noise_faces = labels.iter().filter(|label| label.is_none()).count();
    let auto_groups: Vec<Vec<i64>> = groups(&labels)
        .into_iter()
        .map(|group| group.into_iter().map(|i| pool_ids[i]).collect())
        .collect();

    let plan = reconcile(auto_groups, &forced_groups, &prior);
    deadline.check()?;

    let tx = db.write_transaction()?;
    lock.verify(&tx)?;
    let run_id = insert_clustering_run(&tx, params.epsilon as f64, params.min_points)?;
    let written = write_snapshot(&tx, run_id, &plan)?;
    record_clustering_counts(
        &tx,
        run_id,
        written.clusters_written,
        written.faces_assigned,
        forced_faces,
        noise_faces,
    )?;
    deadline.check()?;
    tx.commit()?;
    drop(lock);

    let report = ClusteringReport {
        run_id,
        clusters: written.clusters_written,
        clusters_created: written.clusters_created,
        clusters_inherited: written.clusters_inherited,
        clusters_deleted: written.clusters_deleted,
        faces_clustered: written.faces_assigned,
        forced_faces,
        noise_faces,
    };

    tracing::info!(
        run_id,
        clusters = report.clusters,
        created = report.clusters_created,
        deleted = report.clusters_deleted,
        noise = report.noise_faces,
        "Clustering committed"
    );

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{BoundingBox, PhotoIdentity};
    use crate::faces::detector::DetectedFace;

    fn face(embedding: Vec<f32>) -> DetectedFace {
        DetectedFace {
            bbox: BoundingBox { x: 0, y: 0, width: 8, height: 8 },
            confidence: 0.8,
            embedding,
        }
    }

    /// Three faces near the x axis and one on the y axis
    fn db_with_faces() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();
        let photo = db
            .register_photos(&[PhotoIdentity::new("/p.jpg", 1)])
            .unwrap()
            .photo_ids[0];
        db.commit_photo_faces(
            photo,
            &[
                face(vec![1.0, 0.0]),
                face(vec![0.99, 0.05]),
                face(vec![0.98, 0.1]),
                face(vec![0.0, 1.0]),
            ],
        )
        .unwrap();
        db
    }

    fn params(epsilon: f32, min_points: usize) -> ClusterParams {
        ClusterParams {
            epsilon,
            min_points,
            timeout: None,
        }
    }

    #[test]
    fn test_validation_happens_before_any_read() {
        // No schema: any database access would fail with a database error.
        let db = Database::open_in_memory().unwrap();
        for bad in [params(0.0, 3), params(-1.0, 3), params(f32::NAN, 3), params(0.5, 0)] {
            assert!(matches!(cluster_faces(&db, &bad), Err(Error::Validation(_))));
        }
    }

    #[test]
    fn test_basic_run() {
        let db = db_with_faces();
        let report = cluster_faces(&db, &params(0.5, 3)).unwrap();

        assert_eq!(report.clusters, 1);
        assert_eq!(report.clusters_created, 1);
        assert_eq!(report.faces_clustered, 3);
        assert_eq!(report.noise_faces, 1);
        assert!(db.get_face(4).unwrap().cluster_id.is_none());

        let last = db.last_clustering_run().unwrap().unwrap();
        assert_eq!(last.id, report.run_id);
        assert_eq!(last.faces_clustered, 3);
    }

    #[test]
    fn test_rerun_keeps_identity() {
        let db = db_with_faces();
        let first = cluster_faces(&db, &params(0.5, 3)).unwrap();
        let id = db.list_clusters(1, 0, 10).unwrap()[0].id;

        let second = cluster_faces(&db, &params(0.5, 3)).unwrap();
        assert!(second.run_id > first.run_id);
        assert_eq!(second.clusters_inherited, 1);
        assert_eq!(db.list_clusters(1, 0, 10).unwrap()[0].id, id);
    }

    #[test]
    fn test_held_lock_conflicts() {
        let db = db_with_faces();
        let _held = RunLock::try_acquire(&db, RECLUSTER_LOCK, None).unwrap();
        let err = cluster_faces(&db, &params(0.5, 3)).unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_timeout_rolls_back_and_releases_lock() {
        let db = db_with_faces();
        let timed = ClusterParams {
            timeout: Some(Duration::ZERO),
            ..params(0.5, 3)
        };
        assert!(matches!(cluster_faces(&db, &timed), Err(Error::Timeout(_))));
        assert!(db.last_clustering_run().unwrap().is_none());
        assert!(db.list_clusters(1, 0, 10).unwrap().is_empty());

        // Lock released: a normal run goes through.
        assert!(cluster_faces(&db, &params(0.5, 3)).is_ok());
    }
}
