//! Run bookkeeping: ingestion checkpoints, recorded failures, and committed clustering runs.

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use super::Database;
use crate::error::Result;

/// A committed clustering run. Its id is the snapshot generation carried by clusters.
#[derive(Debug, Clone, Serialize)]
pub struct ClusteringRun {
    pub id: i64,
    pub epsilon: f64,
    pub min_points: usize,
    pub committed_at: String,
    pub clusters: usize,
    pub faces_clustered: usize,
    pub forced_faces: usize,
    pub noise_faces: usize,
}

/// Counters written to the `ingest_runs` row after each batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct IngestCheckpoint {
    pub photos_processed: usize,
    pub faces_detected: usize,
    pub failures: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestRunStatus {
    Completed,
    Cancelled,
}

impl IngestRunStatus {
    fn as_str(self) -> &'static str {
        match self {
            IngestRunStatus::Completed => "completed",
            IngestRunStatus::Cancelled => "cancelled",
        }
    }
}

/// A photo whose last ingestion attempt failed
#[derive(Debug, Clone, Serialize)]
pub struct RecordedFailure {
    pub photo_id: i64,
    pub error: String,
    pub attempts: i64,
    pub last_attempt_at: String,
}

impl Database {
    pub fn begin_ingest_run(&self, scope: &str, resume: bool, photos_total: usize) -> Result<i64> {
        self.conn().execute(
            "INSERT INTO ingest_runs (scope, resume, photos_total) VALUES (?, ?, ?)",
            params![scope, resume, photos_total as i64],
        )?;
        Ok(self.conn().last_insert_rowid())
    }

    pub fn checkpoint_ingest_run(&self, run_id: i64, checkpoint: &IngestCheckpoint) -> Result<()> {
        self.conn().execute(
            r#"
            UPDATE ingest_runs SET
                photos_processed = ?, faces_detected = ?, failures = ?,
                updated_at = CURRENT_TIMESTAMP
            WHERE id = ?
            "#,
            params![
                checkpoint.photos_processed as i64,
                checkpoint.faces_detected as i64,
                checkpoint.failures as i64,
                run_id,
            ],
        )?;
        Ok(())
    }

    pub fn finish_ingest_run(&self, run_id: i64, status: IngestRunStatus) -> Result<()> {
        self.conn().execute(
            "UPDATE ingest_runs SET status = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
            params![status.as_str(), run_id],
        )?;
        Ok(())
    }

    /// Record (or bump) the failure row for a photo. Cleared by its next successful commit.
    pub fn record_ingest_failure(&self, photo_id: i64, error: &str) -> Result<()> {
        self.conn().execute(
            r#"
            INSERT INTO ingest_failures (photo_id, error) VALUES (?, ?)
            ON CONFLICT(photo_id) DO UPDATE SET
                error = excluded.error,
                attempts = attempts + 1,
                last_attempt_at = CURRENT_TIMESTAMP
            "#,
            params![photo_id, error],
        )?;
        Ok(())
    }

    pub fn ingest_failures(&self) -> Result<Vec<RecordedFailure>> {
        let mut stmt = self.conn().prepare(
            "SELECT photo_id, error, attempts, last_attempt_at FROM ingest_failures ORDER BY photo_id",
        )?;
        let failures = stmt
            .query_map([], |row| {
                Ok(RecordedFailure {
                    photo_id: row.get(0)?,
                    error: row.get(1)?,
                    attempts: row.get(2)?,
                    last_attempt_at: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(failures)
    }

    pub fn last_clustering_run(&self) -> Result<Option<ClusteringRun>> {
        last_clustering_run(self.conn())
    }
}

pub(crate) fn last_clustering_run(conn: &Connection) -> Result<Option<ClusteringRun>> {
    Ok(conn
        .query_row(
            r#"
            SELECT id, epsilon, min_points, committed_at, clusters, faces_clustered, forced_faces, noise_faces
            FROM clustering_runs ORDER BY id DESC LIMIT 1
            "#,
            [],
            |row| {
                Ok(ClusteringRun {
                    id: row.get(0)?,
                    epsilon: row.get(1)?,
                    min_points: row.get::<_, i64>(2)? as usize,
                    committed_at: row.get(3)?,
                    clusters: row.get::<_, i64>(4)? as usize,
                    faces_clustered: row.get::<_, i64>(5)? as usize,
                    forced_faces: row.get::<_, i64>(6)? as usize,
                    noise_faces: row.get::<_, i64>(7)? as usize,
                })
            },
        )
        .optional()?)
}

/// Insert the run row that opens a new snapshot generation. Returns its id.
pub(crate) fn insert_clustering_run(conn: &Connection, epsilon: f64, min_points: usize) -> Result<i64> {
    conn.execute(
        "INSERT INTO clustering_runs (epsilon, min_points) VALUES (?, ?)",
        params![epsilon, min_points as i64],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Record what a run wrote. Called in the same transaction as the insert.
pub(crate) fn record_clustering_counts(
    conn: &Connection,
    run_id: i64,
    clusters: usize,
    faces_clustered: usize,
    forced_faces: usize,
    noise_faces: usize,
) -> Result<()> {
    conn.execute(
        r#"
        UPDATE clustering_runs SET clusters = ?, faces_clustered = ?, forced_faces = ?, noise_faces = ?
        WHERE id = ?
        "#,
        params![
            clusters as i64,
            faces_clustered as i64,
            forced_faces as i64,
            noise_faces as i64,
            run_id,
        ],
    )?;
    Ok(())
}
