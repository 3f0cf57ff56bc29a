//! Durable human feedback on faces.
//!
//! At most one correction exists per face; recording a new one replaces the
//! old. Corrections never touch cluster membership directly, they take effect
//! at the next clustering run. The face `excluded` flag mirrors the active
//! correction and is written in the same transaction.

use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use super::{validate_name, Database};
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "person_name", rename_all = "snake_case")]
pub enum CorrectionKind {
    /// The face is not a face (or not wanted) and is never clustered.
    Exclude,
    /// The face belongs to the named person regardless of density.
    ForcedAssign(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct Correction {
    pub face_id: i64,
    #[serde(flatten)]
    pub kind: CorrectionKind,
    pub created_at: String,
}

fn correction_from_row(row: &Row<'_>) -> rusqlite::Result<Correction> {
    let kind: String = row.get(1)?;
    let person_name: Option<String> = row.get(2)?;
    let kind = match (kind.as_str(), person_name) {
        ("exclude", None) => CorrectionKind::Exclude,
        ("forced_assign", Some(name)) => CorrectionKind::ForcedAssign(name),
        (kind, name) => {
            return Err(rusqlite::Error::FromSqlConversionFailure(
                1,
                Type::Text,
                format!("invalid correction kind {:?} with person name {:?}", kind, name).into(),
            ))
        }
    };
    Ok(Correction {
        face_id: row.get(0)?,
        kind,
        created_at: row.get(3)?,
    })
}

/// Rows that fail to decode are corrupt, not a database failure.
fn decode_error(e: rusqlite::Error) -> Error {
    match e {
        rusqlite::Error::FromSqlConversionFailure(_, _, source) => {
            Error::Corruption(format!("malformed correction: {}", source))
        }
        rusqlite::Error::InvalidColumnType(_, column, _) => {
            Error::Corruption(format!("malformed correction: bad {} column", column))
        }
        other => other.into(),
    }
}

fn read_correction(conn: &Connection, face_id: i64) -> Result<Option<Correction>> {
    conn.query_row(
        "SELECT face_id, kind, person_name, created_at FROM corrections WHERE face_id = ?",
        [face_id],
        correction_from_row,
    )
    .optional()
    .map_err(decode_error)
}

fn ensure_face(conn: &Connection, face_id: i64) -> Result<()> {
    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM faces WHERE id = ?", [face_id], |row| row.get(0))
        .optional()?;
    match exists {
        Some(_) => Ok(()),
        None => Err(Error::not_found("face", face_id)),
    }
}

impl Database {
    pub fn record_exclude(&self, face_id: i64) -> Result<Correction> {
        self.upsert_correction(face_id, CorrectionKind::Exclude)
    }

    /// Force a face into the cluster named `person_name` from the next run on.
    pub fn record_forced_assign(&self, face_id: i64, person_name: &str) -> Result<Correction> {
        let name = validate_name(person_name)?;
        self.upsert_correction(face_id, CorrectionKind::ForcedAssign(name))
    }

    fn upsert_correction(&self, face_id: i64, kind: CorrectionKind) -> Result<Correction> {
        let tx = self.write_transaction()?;
        ensure_face(&tx, face_id)?;

        let (kind_str, person_name, excluded) = match &kind {
            CorrectionKind::Exclude => ("exclude", None, true),
            CorrectionKind::ForcedAssign(name) => ("forced_assign", Some(name.as_str()), false),
        };

        tx.execute(
            r#"
            INSERT INTO corrections (face_id, kind, person_name) VALUES (?, ?, ?)
            ON CONFLICT(face_id) DO UPDATE SET
                kind = excluded.kind,
                person_name = excluded.person_name,
                created_at = CURRENT_TIMESTAMP
            "#,
            params![face_id, kind_str, person_name],
        )?;
        tx.execute(
            "UPDATE faces SET excluded = ? WHERE id = ?",
            params![excluded, face_id],
        )?;

        let correction = read_correction(&tx, face_id)?
            .ok_or_else(|| Error::not_found("correction", face_id))?;
        tx.commit()?;

        tracing::info!(face_id, kind = kind_str, "Correction recorded");
        Ok(correction)
    }

    /// Delete the active correction of a face and return it.
    pub fn remove_correction(&self, face_id: i64) -> Result<Correction> {
        let tx = self.write_transaction()?;
        let correction =
            read_correction(&tx, face_id)?.ok_or_else(|| Error::not_found("correction", face_id))?;

        tx.execute("DELETE FROM corrections WHERE face_id = ?", [face_id])?;
        tx.execute("UPDATE faces SET excluded = 0 WHERE id = ?", [face_id])?;
        tx.commit()?;

        tracing::info!(face_id, "Correction removed");
        Ok(correction)
    }

    pub fn get_correction(&self, face_id: i64) -> Result<Option<Correction>> {
        read_correction(self.conn(), face_id)
    }

    pub fn list_corrections(&self) -> Result<Vec<Correction>> {
        let mut stmt = self.conn().prepare(
            "SELECT face_id, kind, person_name, created_at FROM corrections ORDER BY face_id",
        )?;
        let corrections = stmt
            .query_map([], correction_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(decode_error)?;
        Ok(corrections)
    }
}

/// Active forced assignments as `(face_id, person_name)`, by face id.
pub(crate) fn load_forced_assignments(conn: &Connection) -> Result<Vec<(i64, String)>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT c.face_id, c.person_name FROM corrections c
        JOIN faces f ON f.id = c.face_id
        WHERE c.kind = 'forced_assign' AND f.excluded = 0
        ORDER BY c.face_id
        "#,
    )?;
    let forced = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(decode_error)?;
    Ok(forced)
}
