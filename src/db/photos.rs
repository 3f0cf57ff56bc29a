//! Photo identities and the per-photo processed checkpoint.

use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;
use std::path::PathBuf;

use super::runs::ClusteringRun;
use super::Database;
use crate::error::{Error, Result};

/// A photo as reported by the walker: path plus content signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhotoIdentity {
    pub path: PathBuf,
    pub size_bytes: u64,
    /// File mtime as `YYYY-MM-DDTHH:MM:SS` (UTC).
    pub modified_at: Option<String>,
    pub content_hash: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Why the file could not be read while enumerating. Such a photo is
    /// registered but fails ingestion instead of reaching the detector.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unreadable: Option<String>,
}

impl PhotoIdentity {
    pub fn new(path: impl Into<PathBuf>, size_bytes: u64) -> Self {
        Self {
            path: path.into(),
            size_bytes,
            modified_at: None,
            content_hash: None,
            width: None,
            height: None,
            unreadable: None,
        }
    }

    /// A discovered file whose signature could not be taken.
    pub fn unreadable(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self {
            unreadable: Some(reason.into()),
            ..Self::new(path, 0)
        }
    }

    pub fn with_modified_at(mut self, modified_at: impl Into<String>) -> Self {
        self.modified_at = Some(modified_at.into());
        self
    }

    pub fn with_content_hash(mut self, hash: impl Into<String>) -> Self {
        self.content_hash = Some(hash.into());
        self
    }

    pub fn with_dimensions(mut self, width: u32, height: u32) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }

    /// Whether a stored signature still describes this file.
    /// Hashes are only compared when both sides have one.
    fn matches_signature(
        &self,
        size_bytes: i64,
        modified_at: Option<&str>,
        content_hash: Option<&str>,
    ) -> bool {
        if self.size_bytes as i64 != size_bytes || self.modified_at.as_deref() != modified_at {
            return false;
        }
        match (self.content_hash.as_deref(), content_hash) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }

    fn filename(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    fn directory(&self) -> String {
        self.path
            .parent()
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}

/// A stored photo row
#[derive(Debug, Clone, Serialize)]
pub struct Photo {
    pub id: i64,
    pub path: String,
    pub filename: String,
    pub directory: String,
    pub size_bytes: i64,
    pub modified_at: Option<String>,
    pub content_hash: Option<String>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub processed: bool,
    pub face_count: i64,
    pub processed_at: Option<String>,
}

/// Outcome of registering a batch of discovered identities.
#[derive(Debug, Clone, Default)]
pub struct Registration {
    /// Photo ids, in the same order as the registered identities.
    pub photo_ids: Vec<i64>,
    pub new_photos: usize,
    /// Known paths whose signature changed; they were re-queued.
    pub changed_photos: usize,
}

/// Aggregate counts for dashboards
#[derive(Debug, Clone, Default, Serialize)]
pub struct Stats {
    pub total_photos: i64,
    pub processed_photos: i64,
    pub total_faces: i64,
    pub excluded_faces: i64,
    pub total_clusters: i64,
    pub named_clusters: i64,
    pub corrections: i64,
    pub ingest_failures: i64,
    pub last_clustering_run: Option<ClusteringRun>,
}

const PHOTO_COLUMNS: &str = "id, path, filename, directory, size_bytes, modified_at, content_hash, \
     width, height, processed, face_count, processed_at";

fn photo_from_row(row: &Row<'_>) -> rusqlite::Result<Photo> {
    Ok(Photo {
        id: row.get(0)?,
        path: row.get(1)?,
        filename: row.get(2)?,
        directory: row.get(3)?,
        size_bytes: row.get(4)?,
        modified_at: row.get(5)?,
        content_hash: row.get(6)?,
        width: row.get(7)?,
        height: row.get(8)?,
        processed: row.get(9)?,
        face_count: row.get(10)?,
        processed_at: row.get(11)?,
    })
}

impl Database {
    /// Upsert discovered identities by path in one transaction.
    ///
    /// A known path whose signature changed loses its faces and is marked
    /// unprocessed, so the next ingestion treats it as new content. An
    /// unreadable identity never changes a stored signature.
    pub fn register_photos(&self, photos: &[PhotoIdentity]) -> Result<Registration> {
        let tx = self.write_transaction()?;
        let mut registration = Registration {
            photo_ids: Vec::with_capacity(photos.len()),
            ..Default::default()
        };

        {
            let mut select = tx.prepare_cached(
                "SELECT id, size_bytes, modified_at, content_hash FROM photos WHERE path = ?",
            )?;
            let mut insert = tx.prepare_cached(
                r#"
                INSERT INTO photos (path, filename, directory, size_bytes, modified_at, content_hash, width, height)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )?;
            let mut delete_faces = tx.prepare_cached("DELETE FROM faces WHERE photo_id = ?")?;
            let mut requeue = tx.prepare_cached(
                r#"
                UPDATE photos SET
                    size_bytes = ?, modified_at = ?, content_hash = ?, width = ?, height = ?,
                    processed = 0, face_count = 0, processed_at = NULL
                WHERE id = ?
                "#,
            )?;

            for photo in photos {
                let path_str = photo.path.to_string_lossy();
                let existing = select
                    .query_row([path_str.as_ref()], |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, Option<String>>(2)?,
                            row.get::<_, Option<String>>(3)?,
                        ))
                    })
                    .optional()?;

                match existing {
                    None => {
                        insert.execute(params![
                            path_str.as_ref(),
                            photo.filename(),
                            photo.directory(),
                            photo.size_bytes as i64,
                            photo.modified_at,
                            photo.content_hash,
                            photo.width,
                            photo.height,
                        ])?;
                        registration.photo_ids.push(tx.last_insert_rowid());
                        registration.new_photos += 1;
                    }
                    Some((id, size, mtime, hash)) => {
                        if photo.unreadable.is_none()
                            && !photo.matches_signature(size, mtime.as_deref(), hash.as_deref())
                        {
                            delete_faces.execute([id])?;
                            requeue.execute(params![
                                photo.size_bytes as i64,
                                photo.modified_at,
                                photo.content_hash,
                                photo.width,
                                photo.height,
                                id,
                            ])?;
                            registration.changed_photos += 1;
                            tracing::debug!(path = %path_str, "Photo content changed, re-queued");
                        }
                        registration.photo_ids.push(id);
                    }
                }
            }
        }

        tx.commit()?;
        Ok(registration)
    }

    /// The subset of `photo_ids` that still lack the processed flag.
    pub fn unprocessed_among(&self, photo_ids: &[i64]) -> Result<Vec<i64>> {
        let mut stmt = self
            .conn()
            .prepare_cached("SELECT processed FROM photos WHERE id = ?")?;
        let mut pending = Vec::new();
        for &id in photo_ids {
            let processed: Option<bool> = stmt.query_row([id], |row| row.get(0)).optional()?;
            if processed == Some(false) {
                pending.push(id);
            }
        }
        Ok(pending)
    }

    /// Clear processed flags and faces for a rescan scope, atomically.
    /// Returns the number of faces removed.
    pub fn reset_photos_for_rescan(&self, photo_ids: &[i64]) -> Result<usize> {
        let tx = self.write_transaction()?;
        let mut removed = 0;
        {
            let mut delete_faces = tx.prepare_cached("DELETE FROM faces WHERE photo_id = ?")?;
            let mut reset = tx.prepare_cached(
                "UPDATE photos SET processed = 0, face_count = 0, processed_at = NULL WHERE id = ?",
            )?;
            for &id in photo_ids {
                removed += delete_faces.execute([id])?;
                reset.execute([id])?;
            }
        }
        tx.commit()?;
        Ok(removed)
    }

    pub fn get_photo(&self, photo_id: i64) -> Result<Photo> {
        self.conn()
            .query_row(
                &format!("SELECT {} FROM photos WHERE id = ?", PHOTO_COLUMNS),
                [photo_id],
                photo_from_row,
            )
            .optional()?
            .ok_or_else(|| Error::not_found("photo", photo_id))
    }

    pub fn find_photo_by_path(&self, path: &str) -> Result<Option<Photo>> {
        Ok(self
            .conn()
            .query_row(
                &format!("SELECT {} FROM photos WHERE path = ?", PHOTO_COLUMNS),
                [path],
                photo_from_row,
            )
            .optional()?)
    }

    /// Aggregate counts. Read in one transaction so the numbers agree.
    pub fn stats(&self) -> Result<Stats> {
        let tx = self.read_transaction()?;
        let count = |sql: &str| -> Result<i64> { Ok(tx.query_row(sql, [], |row| row.get(0))?) };

        let stats = Stats {
            total_photos: count("SELECT COUNT(*) FROM photos")?,
            processed_photos: count("SELECT COUNT(*) FROM photos WHERE processed = 1")?,
            total_faces: count("SELECT COUNT(*) FROM faces")?,
            excluded_faces: count("SELECT COUNT(*) FROM faces WHERE excluded = 1")?,
            total_clusters: count(
                "SELECT COUNT(*) FROM clusters c WHERE EXISTS (SELECT 1 FROM faces f WHERE f.cluster_id = c.id)",
            )?,
            named_clusters: count(
                "SELECT COUNT(*) FROM clusters c WHERE c.name IS NOT NULL \
                 AND EXISTS (SELECT 1 FROM faces f WHERE f.cluster_id = c.id)",
            )?,
            corrections: count("SELECT COUNT(*) FROM corrections")?,
            ingest_failures: count("SELECT COUNT(*) FROM ingest_failures")?,
            last_clustering_run: super::runs::last_clustering_run(&tx)?,
        };
        tx.commit()?;
        Ok(stats)
    }
}
