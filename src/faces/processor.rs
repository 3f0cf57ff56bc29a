use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;

use super::detector::{DetectedFace, FaceDetector};
use crate::db::runs::{IngestCheckpoint, IngestRunStatus};
use crate::db::{Database, PhotoIdentity};
use crate::error::{Error, Result};
use crate::scanner::PhotoSource;

pub const DEFAULT_BATCH_SIZE: usize = 32;
pub const DEFAULT_WORKERS: usize = 4;

/// Status updates during ingestion
#[derive(Debug, Clone)]
pub enum IngestStatus {
    /// Photos registered; `pending` of them will be examined
    Starting { total_photos: usize, pending: usize },
    /// A photo has been examined
    Processing {
        current: usize,
        total: usize,
        path: String,
    },
    /// Found faces in a photo
    FoundFaces { path: String, count: usize },
    /// A photo failed and will be retried by the next run
    Failed { path: String, error: String },
    /// Run finished or was cancelled
    Completed {
        photos_processed: usize,
        faces_found: usize,
        failures: usize,
        cancelled: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestOptions {
    /// Skip photos that are already processed. `false` clears them first.
    pub resume: bool,
    /// Photos per checkpoint
    pub batch_size: usize,
    /// Worker threads per batch
    pub workers: usize,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            resume: true,
            batch_size: DEFAULT_BATCH_SIZE,
            workers: DEFAULT_WORKERS,
        }
    }
}

impl IngestOptions {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Validation("batch_size must be at least 1".into()));
        }
        if self.workers == 0 {
            return Err(Error::Validation("workers must be at least 1".into()));
        }
        Ok(())
    }
}

/// A photo that could not be processed in this run
#[derive(Debug, Clone, Serialize)]
pub struct IngestFailure {
    pub photo_id: i64,
    pub path: String,
    pub error: String,
}

/// Result of an ingestion run
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    pub run_id: i64,
    /// Photos enumerated by the source
    pub discovered: usize,
    pub new_photos: usize,
    /// Known photos whose content changed and were re-queued
    pub changed_photos: usize,
    /// Photos already processed before this run
    pub skipped: usize,
    /// Photos committed by this run
    pub processed: usize,
    /// Photos committed concurrently by someone else
    pub already_processed: usize,
    pub faces_detected: usize,
    pub failures: Vec<IngestFailure>,
    pub cancelled: bool,
}

enum PhotoOutcome {
    Committed { faces: usize },
    AlreadyProcessed,
    Failed(String),
}

struct Examined {
    photo_id: i64,
    path: String,
    outcome: PhotoOutcome,
}

/// Ingestion coordinator: registers photos, runs the detector over the
/// unprocessed ones with a pool of workers, and commits per photo.
pub struct FaceProcessor {
    detector: Arc<dyn FaceDetector>,
    options: IngestOptions,
    cancel_flag: Arc<AtomicBool>,
    status_sender: Option<mpsc::Sender<IngestStatus>>,
}

impl FaceProcessor {
    pub fn new(detector: Arc<dyn FaceDetector>, options: IngestOptions) -> Self {
        Self {
            detector,
            options,
            cancel_flag: Arc::new(AtomicBool::new(false)),
            status_sender: None,
        }
    }

    /// Share a cancel flag with the caller. Setting it stops the run before
    /// the next photo; photos already being committed finish.
    pub fn with_cancel_flag(mut self, cancel_flag: Arc<AtomicBool>) -> Self {
        self.cancel_flag = cancel_flag;
        self
    }

    pub fn with_status_sender(mut self, sender: mpsc::Sender<IngestStatus>) -> Self {
        self.status_sender = Some(sender);
        self
    }

    fn send(&self, status: IngestStatus) {
        if let Some(ref tx) = self.status_sender {
            let _ = tx.send(status);
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel_flag.load(Ordering::Relaxed)
    }

    /// Run one ingestion pass over everything `source` enumerates.
    ///
    /// Per-photo failures are recorded and reported, never returned as errors.
    pub fn ingest(&self, db: &Database, source: &dyn PhotoSource) -> Result<IngestReport> {
        self.options.validate()?;

        let identities = source.photos()?;
        let scope = source.scope();
        let registration = db.register_photos(&identities)?;

        if !self.options.resume {
            let removed = db.reset_photos_for_rescan(&registration.photo_ids)?;
            tracing::info!(scope = %scope, faces_removed = removed, "Full rescan: cleared previous results");
        }

        let pending_ids: HashSet<i64> = db
            .unprocessed_among(&registration.photo_ids)?
            .into_iter()
            .collect();
        let mut seen = HashSet::new();
        let pending: Vec<(i64, PhotoIdentity)> = registration
            .photo_ids
            .iter()
            .zip(identities)
            .filter(|(id, _)| pending_ids.contains(*id) && seen.insert(**id))
            .map(|(id, identity)| (*id, identity))
            .collect();

        let mut report = IngestReport {
            discovered: registration.photo_ids.len(),
            new_photos: registration.new_photos,
            changed_photos: registration.changed_photos,
            skipped: registration.photo_ids.len() - pending.len(),
            ..Default::default()
        };
        report.run_id = db.begin_ingest_run(&scope, self.options.resume, pending.len())?;

        tracing::info!(
            scope = %scope,
            discovered = report.discovered,
            pending = pending.len(),
            workers = self.options.workers,
            "Ingestion started"
        );
        self.send(IngestStatus::Starting {
            total_photos: report.discovered,
            pending: pending.len(),
        });

        let total = pending.len();
        let mut examined = 0;
        for batch in pending.chunks(self.options.batch_size) {
            if self.cancelled() {
                break;
            }
            for result in self.run_batch(db, batch)? {
                examined += 1;
                self.send(IngestStatus::Processing {
                    current: examined,
                    total,
                    path: result.path.clone(),
                });
                self.apply(db, result, &mut report)?;
            }
            db.checkpoint_ingest_run(
                report.run_id,
                &IngestCheckpoint {
                    photos_processed: report.processed,
                    faces_detected: report.faces_detected,
                    failures: report.failures.len(),
                },
            )?;
        }

        report.cancelled = examined < total;
        let status = if report.cancelled {
            IngestRunStatus::Cancelled
        } else {
            IngestRunStatus::Completed
        };
        db.finish_ingest_run(report.run_id, status)?;

        tracing::info!(
            run_id = report.run_id,
            processed = report.processed,
            faces = report.faces_detected,
            failures = report.failures.len(),
            cancelled = report.cancelled,
            "Ingestion finished"
        );
        self.send(IngestStatus::Completed {
            photos_processed: report.processed,
            faces_found: report.faces_detected,
            failures: report.failures.len(),
            cancelled: report.cancelled,
        });

        Ok(report)
    }

    fn apply(&self, db: &Database, result: Examined, report: &mut IngestReport) -> Result<()> {
        match result.outcome {
            PhotoOutcome::Committed { faces } => {
                report.processed += 1;
                report.faces_detected += faces;
                if faces > 0 {
                    self.send(IngestStatus::FoundFaces {
                        path: result.path,
                        count: faces,
                    });
                }
            }
            PhotoOutcome::AlreadyProcessed => {
                tracing::debug!(photo_id = result.photo_id, "Photo committed elsewhere, skipped");
                report.already_processed += 1;
            }
            PhotoOutcome::Failed(error) => {
                tracing::warn!(photo_id = result.photo_id, path = %result.path, error = %error, "Photo failed");
                db.record_ingest_failure(result.photo_id, &error)?;
                self.send(IngestStatus::Failed {
                    path: result.path.clone(),
                    error: error.clone(),
                });
                report.failures.push(IngestFailure {
                    photo_id: result.photo_id,
                    path: result.path,
                    error,
                });
            }
        }
        Ok(())
    }

    /// Examine one batch. File-backed databases get a pool of workers, each
    /// with its own connection; an in-memory database is processed inline.
    fn run_batch(&self, db: &Database, batch: &[(i64, PhotoIdentity)]) -> Result<Vec<Examined>> {
        let detector = self.detector.as_ref();
        let cancel = self.cancel_flag.as_ref();

        let Some(path) = db.path() else {
            let mut results = Vec::with_capacity(batch.len());
            for (photo_id, photo) in batch {
                if cancel.load(Ordering::Relaxed) {
                    break;
                }
                results.push(examine(detector, db, *photo_id, photo));
            }
            return Ok(results);
        };

        let workers = self.options.workers.min(batch.len()).max(1);
        let next = AtomicUsize::new(0);
        let (tx, rx) = mpsc::channel::<Result<Examined>>();

        std::thread::scope(|scope| {
            for _ in 0..workers {
                let tx = tx.clone();
                let next = &next;
                scope.spawn(move || work(detector, cancel, path, batch, next, tx));
            }
            drop(tx);
            rx.into_iter().collect::<Result<Vec<_>>>()
        })
    }
}

fn work(
    detector: &dyn FaceDetector,
    cancel: &AtomicBool,
    path: &Path,
    batch: &[(i64, PhotoIdentity)],
    next: &AtomicUsize,
    tx: mpsc::Sender<Result<Examined>>,
) {
    let conn = match Database::open(path) {
        Ok(conn) => conn,
        Err(e) => {
            let _ = tx.send(Err(e));
            return;
        }
    };
    loop {
        if cancel.load(Ordering::Relaxed) {
            break;
        }
        let i = next.fetch_add(1, Ordering::Relaxed);
        let Some((photo_id, photo)) = batch.get(i) else {
            break;
        };
        if tx.send(Ok(examine(detector, &conn, *photo_id, photo))).is_err() {
            break;
        }
    }
}

/// Detect, validate and commit one photo.
fn examine(detector: &dyn FaceDetector, db: &Database, photo_id: i64, photo: &PhotoIdentity) -> Examined {
    let path = photo.path.to_string_lossy().to_string();
    tracing::debug!(photo_id, path = %path, "Detecting faces");

    if let Some(reason) = &photo.unreadable {
        return Examined {
            photo_id,
            path,
            outcome: PhotoOutcome::Failed(format!("unreadable: {}", reason)),
        };
    }

    let outcome = match detector.detect(photo) {
        Err(e) => PhotoOutcome::Failed(e.to_string()),
        Ok(faces) => match validate_detections(&faces) {
            Err(message) => PhotoOutcome::Failed(message),
            Ok(()) => match db.commit_photo_faces(photo_id, &faces) {
                Ok(Some(count)) => PhotoOutcome::Committed { faces: count },
                Ok(None) => PhotoOutcome::AlreadyProcessed,
                Err(e) => PhotoOutcome::Failed(e.to_string()),
            },
        },
    };

    Examined {
        photo_id,
        path,
        outcome,
    }
}

/// Reject detector output that must never reach the store.
fn validate_detections(faces: &[DetectedFace]) -> std::result::Result<(), String> {
    for (i, face) in faces.iter().enumerate() {
        if face.embedding.is_empty() {
            return Err(format!("face {} has an empty embedding", i));
        }
        if face.embedding.iter().any(|v| !v.is_finite()) {
            return Err(format!("face {} has a non-finite embedding value", i));
        }
        if !face.confidence.is_finite() {
            return Err(format!("face {} has a non-finite confidence", i));
        }
        if face.embedding.len() != faces[0].embedding.len() {
            return Err(format!(
                "face {} has {} dimensions, face 0 has {}",
                i,
                face.embedding.len(),
                faces[0].embedding.len()
            ));
        }
    }
    Ok(())
}
