//! End-to-end scenarios over an on-disk library with a synthetic detector.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use facegroup::db::RunLock;
use facegroup::{
    BoundingBox, ClusterParams, ClusterQuery, DetectError, DetectedFace, Error, FaceDetector,
    FaceProcessor, IngestOptions, Library, PhotoIdentity, PhotoSource,
};
use tempfile::{tempdir, TempDir};

// ============================================================================
// Synthetic collaborators
// ============================================================================

struct MemorySource(Vec<PhotoIdentity>);

impl PhotoSource for MemorySource {
    fn scope(&self) -> String {
        "memory".into()
    }

    fn photos(&self) -> facegroup::Result<Vec<PhotoIdentity>> {
        Ok(self.0.clone())
    }
}

fn source(names: &[&str]) -> MemorySource {
    MemorySource(names.iter().map(|n| photo(n, 100)).collect())
}

fn photo(name: &str, size: u64) -> PhotoIdentity {
    PhotoIdentity::new(PathBuf::from("/photos").join(name), size)
        .with_modified_at("2024-05-01T12:00:00")
}

/// Returns fixed embeddings per file name and records every call.
#[derive(Default)]
struct MemoryDetector {
    faces: HashMap<String, Vec<Vec<f32>>>,
    calls: Mutex<Vec<String>>,
    /// Set this flag once this many photos have been detected.
    cancel_after: Option<(usize, Arc<AtomicBool>)>,
}

impl MemoryDetector {
    fn with(faces: &[(&str, Vec<Vec<f32>>)]) -> Self {
        Self {
            faces: faces
                .iter()
                .map(|(name, embeddings)| (name.to_string(), embeddings.clone()))
                .collect(),
            ..Default::default()
        }
    }

    fn calls(&self) -> Vec<String> {
        let mut calls = self.calls.lock().unwrap().clone();
        calls.sort();
        calls
    }
}

impl FaceDetector for MemoryDetector {
    fn detect(&self, photo: &PhotoIdentity) -> Result<Vec<DetectedFace>, DetectError> {
        let name = photo
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        let mut calls = self.calls.lock().unwrap();
        calls.push(name.clone());
        if let Some((limit, flag)) = &self.cancel_after {
            if calls.len() >= *limit {
                flag.store(true, Ordering::SeqCst);
            }
        }

        Ok(self
            .faces
            .get(&name)
            .map(|embeddings| {
                embeddings
                    .iter()
                    .enumerate()
                    .map(|(i, embedding)| DetectedFace {
                        bbox: BoundingBox { x: 10 * i as i32, y: 0, width: 40, height: 40 },
                        confidence: 0.9 - 0.1 * i as f32,
                        embedding: embedding.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn open() -> (TempDir, Library) {
    let dir = tempdir().unwrap();
    let library = Library::open(&dir.path().join("faces.db")).unwrap();
    (dir, library)
}

fn sequential() -> IngestOptions {
    IngestOptions {
        resume: true,
        batch_size: 2,
        workers: 1,
    }
}

fn params(epsilon: f32, min_points: usize) -> ClusterParams {
    ClusterParams {
        epsilon,
        min_points,
        timeout: None,
    }
}

/// Face ids of a photo, in detection order.
fn faces_of(library: &Library, name: &str) -> Vec<i64> {
    let path = format!("/photos/{}", name);
    let photo = library
        .database()
        .find_photo_by_path(&path)
        .unwrap()
        .unwrap_or_else(|| panic!("{} not registered", path));
    library
        .faces_for_photo(photo.id)
        .unwrap()
        .into_iter()
        .map(|f| f.id)
        .collect()
}

fn face_of(library: &Library, name: &str) -> i64 {
    faces_of(library, name)[0]
}

/// Every cluster as (id, name, sorted member ids).
fn snapshot(library: &Library) -> Vec<(i64, Option<String>, Vec<i64>)> {
    library
        .list_clusters(&ClusterQuery::default())
        .unwrap()
        .into_iter()
        .map(|summary| {
            let detail = library.get_cluster(summary.id).unwrap();
            let mut members: Vec<i64> = detail.members.iter().map(|m| m.face.id).collect();
            members.sort_unstable();
            (summary.id, summary.name, members)
        })
        .collect()
}

const E1: [f32; 3] = [1.0, 0.0, 0.0];
const E2: [f32; 3] = [0.95, 0.31, 0.0];
const E3: [f32; 3] = [0.0, 0.0, 1.0];

fn three_photo_detector() -> Arc<MemoryDetector> {
    Arc::new(MemoryDetector::with(&[
        ("p1.jpg", vec![E1.to_vec()]),
        ("p2.jpg", vec![E2.to_vec()]),
        ("p3.jpg", vec![E3.to_vec()]),
    ]))
}

// ============================================================================
// Scenarios
// ============================================================================

#[test]
fn scenarios_a_through_d() {
    let (_dir, library) = open();
    let detector = three_photo_detector();

    // A: two close faces form one unnamed cluster.
    library
        .ingest(&source(&["p1.jpg", "p2.jpg"]), detector.clone(), sequential())
        .unwrap();
    let (e1, e2) = (face_of(&library, "p1.jpg"), face_of(&library, "p2.jpg"));

    library.recluster(&params(0.5, 2)).unwrap();
    let clusters = snapshot(&library);
    assert_eq!(clusters.len(), 1);
    let (cluster_id, name, members) = clusters[0].clone();
    assert_eq!(name, None);
    assert_eq!(members, vec![e1, e2]);

    // B: a distant face is noise; the cluster keeps its id.
    library
        .ingest(&source(&["p1.jpg", "p2.jpg", "p3.jpg"]), detector.clone(), sequential())
        .unwrap();
    let e3 = face_of(&library, "p3.jpg");
    let report = library.recluster(&params(0.5, 2)).unwrap();
    assert_eq!(report.noise_faces, 1);
    assert_eq!(snapshot(&library), vec![(cluster_id, None, vec![e1, e2])]);
    assert_eq!(library.get_face(e3).unwrap().cluster_id, None);

    // C: excluding E2 leaves E1 alone below min_points; the cluster is deleted.
    library.record_exclude(e2).unwrap();
    // Corrections do not touch membership until the next run.
    assert_eq!(library.get_face(e2).unwrap().cluster_id, Some(cluster_id));
    let report = library.recluster(&params(0.5, 2)).unwrap();
    assert_eq!(report.clusters_deleted, 1);
    assert!(snapshot(&library).is_empty());
    assert!(matches!(
        library.get_cluster(cluster_id),
        Err(Error::NotFound { entity: "cluster", .. })
    ));

    // D: forcing E3 to "Alice" creates that cluster with exactly E3.
    library.record_forced_assign(e3, "Alice").unwrap();
    library.recluster(&params(0.5, 2)).unwrap();
    let clusters = snapshot(&library);
    assert_eq!(clusters.len(), 1);
    assert_eq!(clusters[0].1.as_deref(), Some("Alice"));
    assert_eq!(clusters[0].2, vec![e3]);
    assert_ne!(clusters[0].0, cluster_id, "cluster ids are never reused");
}

#[test]
fn scenario_e_resume_after_interruption() {
    let (_dir, library) = open();
    let names = ["p1.jpg", "p2.jpg", "p3.jpg", "p4.jpg", "p5.jpg"];
    let embeddings: Vec<(&str, Vec<Vec<f32>>)> = names
        .iter()
        .enumerate()
        .map(|(i, n)| (*n, vec![vec![i as f32, 1.0, 0.0], vec![0.0, 1.0, i as f32]]))
        .collect();

    // First run stops after P3 commits.
    let cancel = Arc::new(AtomicBool::new(false));
    let interrupted = Arc::new(MemoryDetector {
        cancel_after: Some((3, cancel.clone())),
        ..MemoryDetector::with(&embeddings)
    });
    let processor = FaceProcessor::new(interrupted.clone(), sequential()).with_cancel_flag(cancel);
    let report = library.ingest_with(&processor, &source(&names)).unwrap();
    assert!(report.cancelled);
    assert_eq!(report.processed, 3);
    assert_eq!(interrupted.calls(), vec!["p1.jpg", "p2.jpg", "p3.jpg"]);

    let before: Vec<_> = names[..3]
        .iter()
        .map(|n| {
            let ids = faces_of(&library, n);
            let faces: Vec<_> = ids.iter().map(|&id| library.get_face(id).unwrap().bbox).collect();
            (ids, faces)
        })
        .collect();

    // Restart: only P4 and P5 are examined.
    let resumed = Arc::new(MemoryDetector::with(&embeddings));
    let report = library
        .ingest(&source(&names), resumed.clone(), sequential())
        .unwrap();
    assert!(!report.cancelled);
    assert_eq!(report.skipped, 3);
    assert_eq!(report.processed, 2);
    assert_eq!(resumed.calls(), vec!["p4.jpg", "p5.jpg"]);

    for (name, (ids, faces)) in names[..3].iter().zip(before) {
        assert_eq!(faces_of(&library, name), ids);
        let now: Vec<_> = ids.iter().map(|&id| library.get_face(id).unwrap().bbox).collect();
        assert_eq!(now, faces);
    }

    // Same total as an uninterrupted run.
    let stats = library.stats().unwrap();
    assert_eq!(stats.total_faces, 10);
    assert_eq!(stats.processed_photos, 5);
}

// ============================================================================
// Properties
// ============================================================================

#[test]
fn ingestion_is_idempotent() {
    let (_dir, library) = open();
    let detector = three_photo_detector();
    let src = source(&["p1.jpg", "p2.jpg", "p3.jpg"]);

    let options = IngestOptions {
        workers: 3,
        batch_size: 1,
        ..Default::default()
    };
    library.ingest(&src, detector.clone(), options).unwrap();
    let before = library.stats().unwrap();

    let report = library.ingest(&src, detector.clone(), options).unwrap();
    let after = library.stats().unwrap();

    assert_eq!(report.processed, 0);
    assert_eq!(report.skipped, 3);
    assert_eq!(before.total_faces, after.total_faces);
    assert_eq!(before.processed_photos, after.processed_photos);
}

#[test]
fn changed_photo_is_reprocessed() {
    let (_dir, library) = open();
    let detector = three_photo_detector();
    library
        .ingest(&source(&["p1.jpg", "p2.jpg"]), detector.clone(), sequential())
        .unwrap();
    let old_face = face_of(&library, "p1.jpg");

    let edited = MemorySource(vec![photo("p1.jpg", 4096), photo("p2.jpg", 100)]);
    let report = library.ingest(&edited, detector.clone(), sequential()).unwrap();

    assert_eq!(report.changed_photos, 1);
    assert_eq!(report.processed, 1);
    assert_eq!(library.stats().unwrap().total_faces, 2);
    assert_ne!(face_of(&library, "p1.jpg"), old_face);
}

#[test]
fn reclustering_is_deterministic() {
    let (_dir, library) = open();
    let detector = Arc::new(MemoryDetector::with(&[
        ("a.jpg", vec![vec![1.0, 0.0], vec![0.0, 1.0]]),
        ("b.jpg", vec![vec![0.98, 0.1], vec![0.1, 0.98]]),
        ("c.jpg", vec![vec![0.97, 0.15], vec![-1.0, 0.0]]),
    ]));
    library
        .ingest(&source(&["a.jpg", "b.jpg", "c.jpg"]), detector, sequential())
        .unwrap();

    library.recluster(&params(0.3, 2)).unwrap();
    let first = snapshot(&library);
    let report = library.recluster(&params(0.3, 2)).unwrap();
    let second = snapshot(&library);

    assert_eq!(first.len(), 2);
    assert_eq!(first, second);
    assert_eq!(report.clusters_created, 0);
    assert_eq!(report.clusters_inherited, 2);
}

#[test]
fn named_cluster_keeps_forced_faces_across_reruns() {
    let (_dir, library) = open();
    let detector = Arc::new(MemoryDetector::with(&[
        ("a.jpg", vec![vec![1.0, 0.0, 0.0]]),
        ("b.jpg", vec![vec![0.98, 0.1, 0.0]]),
        ("c.jpg", vec![vec![0.0, 1.0, 0.0]]),
        ("d.jpg", vec![vec![0.0, 0.0, 1.0]]),
        ("e.jpg", vec![vec![-1.0, 0.0, 0.0]]),
    ]));
    let names = ["a.jpg", "b.jpg", "c.jpg", "d.jpg", "e.jpg"];
    library.ingest(&source(&names), detector, sequential()).unwrap();

    library.recluster(&params(0.5, 2)).unwrap();
    let clusters = snapshot(&library);
    assert_eq!(clusters.len(), 1);
    let alice = clusters[0].0;
    library.rename_cluster(alice, "Alice").unwrap();

    // More forced faces than the cluster has automatic members.
    let forced: Vec<i64> = ["c.jpg", "d.jpg", "e.jpg"]
        .iter()
        .map(|n| face_of(&library, n))
        .collect();
    for &face_id in &forced {
        library.record_forced_assign(face_id, "Alice").unwrap();
    }

    let mut all: Vec<i64> = names.iter().map(|n| face_of(&library, n)).collect();
    all.sort_unstable();

    library.recluster(&params(0.5, 2)).unwrap();
    let first = snapshot(&library);
    assert_eq!(first, vec![(alice, Some("Alice".to_string()), all.clone())]);

    for _ in 0..2 {
        let report = library.recluster(&params(0.5, 2)).unwrap();
        assert_eq!(snapshot(&library), first);
        assert_eq!(report.clusters_created, 0);
        assert_eq!(report.clusters_deleted, 0);
    }
}

#[test]
fn exclusion_and_forced_assignment_hold_for_all_parameters() {
    let (_dir, library) = open();
    let detector = Arc::new(MemoryDetector::with(&[
        ("a.jpg", vec![vec![1.0, 0.0], vec![0.99, 0.1]]),
        ("b.jpg", vec![vec![0.98, 0.2], vec![0.0, 1.0]]),
        ("c.jpg", vec![vec![0.1, 0.99], vec![-1.0, 0.0]]),
    ]));
    library
        .ingest(&source(&["a.jpg", "b.jpg", "c.jpg"]), detector, sequential())
        .unwrap();

    let excluded = faces_of(&library, "a.jpg")[1];
    let forced = faces_of(&library, "c.jpg")[1];
    library.record_exclude(excluded).unwrap();
    library.record_forced_assign(forced, "Zoe").unwrap();

    for epsilon in [0.05, 0.3, 0.8, 2.5] {
        for min_points in [1, 2, 3, 10] {
            library.recluster(&params(epsilon, min_points)).unwrap();

            assert_eq!(library.get_face(excluded).unwrap().cluster_id, None);
            let zoe = library.clusters_by_name("Zoe").unwrap();
            assert_eq!(zoe.len(), 1, "epsilon={} min_points={}", epsilon, min_points);
            assert_eq!(library.get_face(forced).unwrap().cluster_id, Some(zoe[0].id));
        }
    }

    // Removing the correction hands the face back to density placement.
    library.remove_correction(forced).unwrap();
    library.recluster(&params(0.05, 2)).unwrap();
    assert_eq!(library.get_face(forced).unwrap().cluster_id, None);
}

#[test]
fn invalid_parameters_leave_state_unchanged() {
    let (_dir, library) = open();
    library
        .ingest(&source(&["p1.jpg", "p2.jpg"]), three_photo_detector(), sequential())
        .unwrap();
    library.recluster(&params(0.5, 2)).unwrap();
    let before = snapshot(&library);
    let last_run = library.stats().unwrap().last_clustering_run.unwrap().id;

    for bad in [params(0.0, 2), params(0.5, 0), params(-0.5, 2)] {
        assert!(matches!(library.recluster(&bad), Err(Error::Validation(_))));
    }

    assert_eq!(snapshot(&library), before);
    assert_eq!(library.stats().unwrap().last_clustering_run.unwrap().id, last_run);
}

#[test]
fn rename_and_representative_survive_reclustering() {
    let (_dir, library) = open();
    let detector = Arc::new(MemoryDetector::with(&[
        ("a.jpg", vec![vec![1.0, 0.0]]),
        ("b.jpg", vec![vec![0.99, 0.05]]),
        ("c.jpg", vec![vec![0.98, 0.1]]),
    ]));
    library
        .ingest(&source(&["a.jpg", "b.jpg", "c.jpg"]), detector.clone(), sequential())
        .unwrap();
    library.recluster(&params(0.5, 2)).unwrap();

    let cluster = library.list_clusters(&ClusterQuery::default()).unwrap()[0].clone();
    let pick = face_of(&library, "c.jpg");
    library.rename_cluster(cluster.id, "  Grandma ").unwrap();
    library.set_representative(cluster.id, pick).unwrap();

    // New matching face arrives; the identity, name and pin carry over.
    let more = Arc::new(MemoryDetector::with(&[("d.jpg", vec![vec![0.995, 0.07]])]));
    library
        .ingest(&source(&["a.jpg", "b.jpg", "c.jpg", "d.jpg"]), more, sequential())
        .unwrap();
    library.recluster(&params(0.5, 2)).unwrap();

    let after = library.get_cluster(cluster.id).unwrap();
    assert_eq!(after.summary.name.as_deref(), Some("Grandma"));
    assert_eq!(after.summary.representative_face_id, Some(pick));
    assert!(after.summary.representative_pinned);
    assert_eq!(after.members.len(), 4);
    assert_eq!(library.clusters_by_name("Grandma").unwrap().len(), 1);

    // Excluding the pinned face drops the pin at the next run.
    library.record_exclude(pick).unwrap();
    library.recluster(&params(0.5, 2)).unwrap();
    let after = library.get_cluster(cluster.id).unwrap();
    assert_ne!(after.summary.representative_face_id, Some(pick));
    assert!(!after.summary.representative_pinned);
}

#[test]
fn representative_must_be_a_member() {
    let (_dir, library) = open();
    library
        .ingest(&source(&["p1.jpg", "p2.jpg", "p3.jpg"]), three_photo_detector(), sequential())
        .unwrap();
    library.recluster(&params(0.5, 2)).unwrap();
    let cluster = library.list_clusters(&ClusterQuery::default()).unwrap()[0].id;
    let outsider = face_of(&library, "p3.jpg");

    assert!(matches!(
        library.set_representative(cluster, outsider),
        Err(Error::NotFound { entity: "face", .. })
    ));
}

#[test]
fn concurrent_recluster_conflicts() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("faces.db");
    let library = Library::open(&path).unwrap();
    let other = Library::open(&path).unwrap();

    let held = RunLock::try_acquire(other.database(), "recluster", None).unwrap();
    let err = library.recluster(&params(0.5, 2)).unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));

    // Reads and corrections stay available while a run holds the lock.
    assert!(library.stats().is_ok());
    drop(held);
    assert!(library.recluster(&params(0.5, 2)).is_ok());
}

#[test]
fn corrupted_embedding_fails_reclustering() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("faces.db");
    let library = Library::open(&path).unwrap();
    library
        .ingest(&source(&["p1.jpg", "p2.jpg"]), three_photo_detector(), sequential())
        .unwrap();
    library.recluster(&params(0.5, 2)).unwrap();
    let before = snapshot(&library);

    let conn = rusqlite::Connection::open(&path).unwrap();
    conn.execute("UPDATE faces SET embedding = x'00' WHERE id = (SELECT MIN(id) FROM faces)", [])
        .unwrap();

    let err = library.recluster(&params(0.5, 2)).unwrap_err();
    assert!(matches!(err, Error::Corruption(_)));
    assert!(!err.is_retryable());
    assert_eq!(snapshot(&library), before);
}

#[test]
fn reset_clears_everything() {
    let (_dir, library) = open();
    library
        .ingest(&source(&["p1.jpg", "p2.jpg"]), three_photo_detector(), sequential())
        .unwrap();
    library.recluster(&params(0.5, 2)).unwrap();

    library.reset().unwrap();
    let stats = library.stats().unwrap();
    assert_eq!(stats.total_photos, 0);
    assert_eq!(stats.total_faces, 0);
    assert_eq!(stats.total_clusters, 0);
    assert!(stats.last_clustering_run.is_none());
    assert_eq!(library.database().embedding_dim().unwrap(), None);
}
