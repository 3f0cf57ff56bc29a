//! Face rows: per-photo commit, lookups, and the embedding snapshot used for clustering.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::Database;
use crate::error::{Error, Result};
use crate::faces::detector::DetectedFace;

/// Bounding box for a detected face
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

/// A detected face in a photo
#[derive(Debug, Clone, Serialize)]
pub struct Face {
    pub id: i64,
    pub photo_id: i64,
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub embedding_dim: usize,
    pub excluded: bool,
    pub cluster_id: Option<i64>,
}

/// Face with associated photo path for display
#[derive(Debug, Clone, Serialize)]
pub struct FaceWithPhoto {
    #[serde(flatten)]
    pub face: Face,
    pub photo_path: String,
    pub photo_filename: String,
}

/// A non-excluded face as loaded for a clustering run.
#[derive(Debug, Clone)]
pub(crate) struct FaceEmbedding {
    pub id: i64,
    pub embedding: Vec<f32>,
}

pub(crate) const FACE_COLUMNS: &str =
    "f.id, f.photo_id, f.bbox_x, f.bbox_y, f.bbox_w, f.bbox_h, f.confidence, f.embedding_dim, f.excluded, f.cluster_id";

pub(crate) fn face_from_row(row: &Row<'_>) -> rusqlite::Result<Face> {
    let dim: i64 = row.get(7)?;
    Ok(Face {
        id: row.get(0)?,
        photo_id: row.get(1)?,
        bbox: BoundingBox {
            x: row.get(2)?,
            y: row.get(3)?,
            width: row.get(4)?,
            height: row.get(5)?,
        },
        confidence: row.get(6)?,
        embedding_dim: dim.max(0) as usize,
        excluded: row.get(8)?,
        cluster_id: row.get(9)?,
    })
}

impl Database {
    /// Store a photo's detected faces and flip its processed flag in one transaction.
    ///
    /// Returns `Ok(None)` without writing anything when the photo is already
    /// processed, which happens when another worker committed it first.
    /// The first face ever stored fixes the dataset embedding dimension; a face
    /// with a different dimension fails the whole photo with a corruption error.
    pub fn commit_photo_faces(&self, photo_id: i64, faces: &[DetectedFace]) -> Result<Option<usize>> {
        let tx = self.write_transaction()?;

        let processed: Option<bool> = tx
            .query_row("SELECT processed FROM photos WHERE id = ?", [photo_id], |row| row.get(0))
            .optional()?;
        match processed {
            None => return Err(Error::not_found("photo", photo_id)),
            Some(true) => return Ok(None),
            Some(false) => {}
        }

        if let Some(first) = faces.first() {
            let expected = match super::embedding_dim(&tx)? {
                Some(dim) => dim,
                None => {
                    let dim = first.embedding.len();
                    super::set_embedding_dim(&tx, dim)?;
                    dim
                }
            };
            if let Some(bad) = faces.iter().find(|f| f.embedding.len() != expected) {
                return Err(Error::Corruption(format!(
                    "embedding has {} dimensions, dataset uses {}",
                    bad.embedding.len(),
                    expected
                )));
            }
        }

        {
            let mut insert = tx.prepare_cached(
                r#"
                INSERT INTO faces (photo_id, bbox_x, bbox_y, bbox_w, bbox_h, confidence, embedding, embedding_dim)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )?;
            for face in faces {
                insert.execute(params![
                    photo_id,
                    face.bbox.x,
                    face.bbox.y,
                    face.bbox.width,
                    face.bbox.height,
                    face.confidence,
                    embedding_to_bytes(&face.embedding),
                    face.embedding.len() as i64,
                ])?;
            }
        }

        tx.execute(
            r#"
            UPDATE photos SET processed = 1, face_count = ?, processed_at = CURRENT_TIMESTAMP
            WHERE id = ?
            "#,
            params![faces.len() as i64, photo_id],
        )?;
        tx.execute("DELETE FROM ingest_failures WHERE photo_id = ?", [photo_id])?;
        tx.commit()?;

        Ok(Some(faces.len()))
    }

    pub fn get_face(&self, face_id: i64) -> Result<Face> {
        self.conn()
            .query_row(
                &format!("SELECT {} FROM faces f WHERE f.id = ?", FACE_COLUMNS),
                [face_id],
                face_from_row,
            )
            .optional()?
            .ok_or_else(|| Error::not_found("face", face_id))
    }

    /// Get all faces for a photo
    pub fn faces_for_photo(&self, photo_id: i64) -> Result<Vec<Face>> {
        // Distinguish "no faces" from "no such photo".
        self.get_photo(photo_id)?;

        let mut stmt = self.conn().prepare(&format!(
            "SELECT {} FROM faces f WHERE f.photo_id = ? ORDER BY f.id",
            FACE_COLUMNS
        ))?;
        let faces = stmt
            .query_map([photo_id], face_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(faces)
    }

    pub fn count_faces(&self) -> Result<i64> {
        Ok(self
            .conn()
            .query_row("SELECT COUNT(*) FROM faces", [], |row| row.get(0))?)
    }
}

/// Load every non-excluded face with a decoded embedding.
///
/// Any stored embedding whose byte length, recorded dimension, or dimension
/// relative to the rest of the dataset disagree is reported as corruption.
pub(crate) fn load_active_embeddings(conn: &Connection) -> Result<Vec<FaceEmbedding>> {
    let dataset_dim = super::embedding_dim(conn)?;

    let mut stmt = conn.prepare(
        "SELECT id, embedding, embedding_dim FROM faces WHERE excluded = 0 ORDER BY id",
    )?;
    let mut rows = stmt.query([])?;

    let mut faces = Vec::new();
    let mut expected = dataset_dim;
    while let Some(row) = rows.next()? {
        let id: i64 = row.get(0)?;
        let bytes: Vec<u8> = row.get(1)?;
        let stored_dim: i64 = row.get(2)?;

        let embedding = bytes_to_embedding(&bytes).ok_or_else(|| {
            Error::Corruption(format!("face {}: embedding blob of {} bytes", id, bytes.len()))
        })?;
        if embedding.len() as i64 != stored_dim {
            return Err(Error::Corruption(format!(
                "face {}: embedding has {} values but records dimension {}",
                id,
                embedding.len(),
                stored_dim
            )));
        }
        match expected {
            Some(dim) if dim != embedding.len() => {
                return Err(Error::Corruption(format!(
                    "face {}: embedding has {} dimensions, dataset uses {}",
                    id,
                    embedding.len(),
                    dim
                )));
            }
            Some(_) => {}
            None => expected = Some(embedding.len()),
        }

        faces.push(FaceEmbedding { id, embedding });
    }

    Ok(faces)
}

// ============================================================================
// Helper functions
// ============================================================================

/// Convert f32 slice to bytes for storage
pub(crate) fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for &val in embedding {
        bytes.extend_from_slice(&val.to_le_bytes());
    }
    bytes
}

/// Convert bytes back to f32 vector. `None` if the length is not a multiple of 4.
pub(crate) fn bytes_to_embedding(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::PhotoIdentity;

    fn face(embedding: Vec<f32>) -> DetectedFace {
        DetectedFace {
            bbox: BoundingBox { x: 1, y: 2, width: 30, height: 40 },
            confidence: 0.9,
            embedding,
        }
    }

    fn db_with_photo() -> (Database, i64) {
        let db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();
        let ids = db
            .register_photos(&[PhotoIdentity::new("/p/one.jpg", 10)])
            .unwrap()
            .photo_ids;
        (db, ids[0])
    }

    #[test]
    fn test_embedding_bytes() {
        let embedding = vec![0.5, -1.25, 3.0];
        let bytes = embedding_to_bytes(&embedding);
        assert_eq!(bytes.len(), 12);
        assert_eq!(bytes_to_embedding(&bytes), Some(embedding));
        assert_eq!(bytes_to_embedding(&bytes[..5]), None);
    }

    #[test]
    fn test_commit_sets_processed_once() {
        let (db, photo_id) = db_with_photo();
        let faces = vec![face(vec![1.0, 0.0]), face(vec![0.0, 1.0])];

        assert_eq!(db.commit_photo_faces(photo_id, &faces).unwrap(), Some(2));
        // A second commit of the same photo must not duplicate faces.
        assert_eq!(db.commit_photo_faces(photo_id, &faces).unwrap(), None);

        assert_eq!(db.count_faces().unwrap(), 2);
        assert_eq!(db.embedding_dim().unwrap(), Some(2));
        let photo = db.get_photo(photo_id).unwrap();
        assert!(photo.processed);
        assert_eq!(photo.face_count, 2);
    }

    #[test]
    fn test_commit_zero_faces_is_valid() {
        let (db, photo_id) = db_with_photo();
        assert_eq!(db.commit_photo_faces(photo_id, &[]).unwrap(), Some(0));
        assert!(db.get_photo(photo_id).unwrap().processed);
        assert_eq!(db.embedding_dim().unwrap(), None);
    }

    #[test]
    fn test_commit_rejects_dimension_mismatch_atomically() {
        let (db, photo_id) = db_with_photo();
        let faces = vec![face(vec![1.0, 0.0]), face(vec![1.0, 0.0, 0.0])];

        let err = db.commit_photo_faces(photo_id, &faces).unwrap_err();
        assert!(matches!(err, Error::Corruption(_)));
        assert_eq!(db.count_faces().unwrap(), 0);
        assert!(!db.get_photo(photo_id).unwrap().processed);
        assert_eq!(db.embedding_dim().unwrap(), None);
    }

    #[test]
    fn test_load_active_embeddings_detects_corruption() {
        let (db, photo_id) = db_with_photo();
        db.commit_photo_faces(photo_id, &[face(vec![1.0, 0.0])]).unwrap();
        assert_eq!(load_active_embeddings(db.conn()).unwrap().len(), 1);

        db.conn()
            .execute("UPDATE faces SET embedding = x'0000803F'", [])
            .unwrap();
        assert!(matches!(
            load_active_embeddings(db.conn()),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn test_faces_for_unknown_photo() {
        let (db, _) = db_with_photo();
        assert!(matches!(
            db.faces_for_photo(404),
            Err(Error::NotFound { entity: "photo", .. })
        ));
    }
}
