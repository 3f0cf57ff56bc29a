//! Cluster reads, user mutations, and the snapshot writer used by clustering runs.

use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use serde::Serialize;
use std::collections::BTreeMap;

use super::faces::{face_from_row, FaceWithPhoto, FACE_COLUMNS};
use super::{validate_name, Database};
use crate::error::{Error, Result};
use crate::faces::reconcile::{PlannedCluster, PriorCluster};

/// A cluster with its member count
#[derive(Debug, Clone, Serialize)]
pub struct ClusterSummary {
    pub id: i64,
    pub name: Option<String>,
    pub member_count: usize,
    pub representative_face_id: Option<i64>,
    /// True when the representative was chosen by the user.
    pub representative_pinned: bool,
    /// Clustering run that last wrote this cluster.
    pub run_id: i64,
}

/// A cluster and every member face
#[derive(Debug, Clone, Serialize)]
pub struct ClusterDetail {
    #[serde(flatten)]
    pub summary: ClusterSummary,
    pub members: Vec<FaceWithPhoto>,
}

/// What a clustering commit changed.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct SnapshotWrite {
    pub clusters_written: usize,
    /// Written clusters that kept a previous identity
    pub clusters_inherited: usize,
    pub clusters_created: usize,
    pub faces_assigned: usize,
    /// Previous clusters removed by this write
    pub clusters_deleted: usize,
}

const SUMMARY_SELECT: &str = r#"
    SELECT c.id, c.name, COUNT(f.id), c.representative_face_id, c.representative_pinned, c.run_id
    FROM clusters c
    LEFT JOIN faces f ON f.cluster_id = c.id
"#;

fn summary_from_row(row: &Row<'_>) -> rusqlite::Result<ClusterSummary> {
    Ok(ClusterSummary {
        id: row.get(0)?,
        name: row.get(1)?,
        member_count: row.get::<_, i64>(2)? as usize,
        representative_face_id: row.get(3)?,
        representative_pinned: row.get(4)?,
        run_id: row.get(5)?,
    })
}

fn read_summary(conn: &Connection, cluster_id: i64) -> Result<ClusterSummary> {
    conn.query_row(
        &format!("{} WHERE c.id = ? GROUP BY c.id", SUMMARY_SELECT),
        [cluster_id],
        summary_from_row,
    )
    .optional()?
    .ok_or_else(|| Error::not_found("cluster", cluster_id))
}

impl Database {
    /// Clusters with at least `min_members` faces, ordered by id.
    pub fn list_clusters(
        &self,
        min_members: usize,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<ClusterSummary>> {
        let mut stmt = self.conn().prepare(&format!(
            "{} GROUP BY c.id HAVING COUNT(f.id) >= ? ORDER BY c.id LIMIT ? OFFSET ?",
            SUMMARY_SELECT
        ))?;
        let clusters = stmt
            .query_map(
                params![min_members as i64, limit as i64, offset as i64],
                summary_from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(clusters)
    }

    /// One cluster with its members, read in a single transaction.
    pub fn get_cluster(&self, cluster_id: i64) -> Result<ClusterDetail> {
        let tx = self.read_transaction()?;
        let summary = read_summary(&tx, cluster_id)?;

        let members = {
            let mut stmt = tx.prepare(&format!(
                r#"
                SELECT {}, p.path, p.filename
                FROM faces f
                JOIN photos p ON p.id = f.photo_id
                WHERE f.cluster_id = ?
                ORDER BY f.id
                "#,
                FACE_COLUMNS
            ))?;
            let rows = stmt.query_map([cluster_id], |row| {
                Ok(FaceWithPhoto {
                    face: face_from_row(row)?,
                    photo_path: row.get(10)?,
                    photo_filename: row.get(11)?,
                })
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        tx.commit()?;
        Ok(ClusterDetail { summary, members })
    }

    /// All clusters currently carrying `name`.
    pub fn clusters_by_name(&self, name: &str) -> Result<Vec<ClusterSummary>> {
        let mut stmt = self.conn().prepare(&format!(
            "{} WHERE c.name = ? GROUP BY c.id ORDER BY c.id",
            SUMMARY_SELECT
        ))?;
        let clusters = stmt
            .query_map([name.trim()], summary_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(clusters)
    }

    pub fn rename_cluster(&self, cluster_id: i64, name: &str) -> Result<ClusterSummary> {
        let name = validate_name(name)?;
        let tx = self.write_transaction()?;
        let updated = tx.execute(
            "UPDATE clusters SET name = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
            params![name, cluster_id],
        )?;
        if updated == 0 {
            return Err(Error::not_found("cluster", cluster_id));
        }
        let summary = read_summary(&tx, cluster_id)?;
        tx.commit()?;

        tracing::info!(cluster_id, name = %name, "Cluster renamed");
        Ok(summary)
    }

    /// Pin a member face as the cluster's representative.
    pub fn set_representative(&self, cluster_id: i64, face_id: i64) -> Result<ClusterSummary> {
        let tx = self.write_transaction()?;
        read_summary(&tx, cluster_id)?;

        let member: Option<i64> = tx
            .query_row(
                "SELECT id FROM faces WHERE id = ? AND cluster_id = ?",
                params![face_id, cluster_id],
                |row| row.get(0),
            )
            .optional()?;
        if member.is_none() {
            return Err(Error::not_found("face", face_id));
        }

        tx.execute(
            r#"
            UPDATE clusters SET representative_face_id = ?, representative_pinned = 1,
                updated_at = CURRENT_TIMESTAMP
            WHERE id = ?
            "#,
            params![face_id, cluster_id],
        )?;
        let summary = read_summary(&tx, cluster_id)?;
        tx.commit()?;

        tracing::info!(cluster_id, face_id, "Representative set");
        Ok(summary)
    }
}

/// Every existing cluster with its current members, by id.
pub(crate) fn load_prior_clusters(conn: &Connection) -> Result<Vec<PriorCluster>> {
    let mut clusters: BTreeMap<i64, PriorCluster> = BTreeMap::new();

    let mut stmt = conn.prepare("SELECT id, name FROM clusters ORDER BY id")?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let id: i64 = row.get(0)?;
        clusters.insert(
            id,
            PriorCluster {
                id,
                name: row.get(1)?,
                members: Vec::new(),
            },
        );
    }

    let mut stmt =
        conn.prepare("SELECT id, cluster_id FROM faces WHERE cluster_id IS NOT NULL ORDER BY id")?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let face_id: i64 = row.get(0)?;
        let cluster_id: i64 = row.get(1)?;
        if let Some(cluster) = clusters.get_mut(&cluster_id) {
            cluster.members.push(face_id);
        }
    }

    Ok(clusters.into_values().collect())
}

/// Publish a clustering result as generation `generation`.
///
/// Runs inside the caller's write transaction. Every face pointer is cleared
/// and rewritten; faces excluded since the snapshot was read are skipped.
/// Inherited clusters keep their current name unless the plan forces one.
/// A pinned representative survives if it is still a member; otherwise the
/// highest-confidence member (lowest id on ties) is chosen. Clusters left
/// without members, and every cluster not written by this generation, are
/// deleted.
pub(crate) fn write_snapshot(
    tx: &Transaction<'_>,
    generation: i64,
    plan: &[PlannedCluster],
) -> Result<SnapshotWrite> {
    tx.execute("UPDATE faces SET cluster_id = NULL WHERE cluster_id IS NOT NULL", [])?;

    let mut touch = tx.prepare_cached(
        "UPDATE clusters SET run_id = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
    )?;
    let mut set_name = tx.prepare_cached("UPDATE clusters SET name = ? WHERE id = ?")?;
    let mut insert = tx.prepare_cached("INSERT INTO clusters (name, run_id) VALUES (?, ?)")?;
    let mut assign =
        tx.prepare_cached("UPDATE faces SET cluster_id = ? WHERE id = ? AND excluded = 0")?;
    let mut current_rep = tx.prepare_cached(
        "SELECT representative_face_id, representative_pinned FROM clusters WHERE id = ?",
    )?;
    let mut is_member =
        tx.prepare_cached("SELECT 1 FROM faces WHERE id = ? AND cluster_id = ?")?;
    let mut default_rep = tx.prepare_cached(
        "SELECT id FROM faces WHERE cluster_id = ? ORDER BY confidence DESC, id ASC LIMIT 1",
    )?;
    let mut set_rep = tx.prepare_cached(
        "UPDATE clusters SET representative_face_id = ?, representative_pinned = ? WHERE id = ?",
    )?;
    let mut delete = tx.prepare_cached("DELETE FROM clusters WHERE id = ?")?;

    let mut outcome = SnapshotWrite::default();

    for planned in plan {
        // An inherited id can vanish only through a concurrent reset.
        let inherited = match planned.inherits {
            Some(id) => (touch.execute(params![generation, id])? > 0).then_some(id),
            None => None,
        };
        let cluster_id = match inherited {
            Some(id) => {
                if let Some(name) = &planned.forced_name {
                    set_name.execute(params![name, id])?;
                }
                id
            }
            None => {
                insert.execute(params![planned.forced_name, generation])?;
                tx.last_insert_rowid()
            }
        };

        for &face_id in &planned.members {
            outcome.faces_assigned += assign.execute(params![cluster_id, face_id])?;
        }

        let (rep, pinned): (Option<i64>, bool) =
            current_rep.query_row([cluster_id], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let keep_pinned = match (rep, pinned) {
            (Some(face_id), true) => is_member
                .query_row(params![face_id, cluster_id], |_| Ok(()))
                .optional()?
                .is_some(),
            _ => false,
        };
        if !keep_pinned {
            let fallback: Option<i64> = default_rep
                .query_row([cluster_id], |row| row.get(0))
                .optional()?;
            match fallback {
                Some(face_id) => {
                    set_rep.execute(params![face_id, false, cluster_id])?;
                }
                None => {
                    // Every member was excluded after the snapshot was taken.
                    delete.execute([cluster_id])?;
                    if inherited.is_some() {
                        outcome.clusters_deleted += 1;
                    }
                    continue;
                }
            }
        }

        outcome.clusters_written += 1;
        if inherited.is_some() {
            outcome.clusters_inherited += 1;
        } else {
            outcome.clusters_created += 1;
        }
    }

    outcome.clusters_deleted += tx.execute("DELETE FROM clusters WHERE run_id != ?", [generation])?;
    Ok(outcome)
}
