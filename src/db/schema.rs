pub const SCHEMA: &str = r#"
-- Photos table: one row per discovered photo identity
CREATE TABLE IF NOT EXISTS photos (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    path TEXT NOT NULL UNIQUE,
    filename TEXT NOT NULL,
    directory TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    modified_at TEXT,
    content_hash TEXT,            -- MD5 of the file contents, when hashing is enabled

    width INTEGER,
    height INTEGER,

    -- Face ingestion checkpoint: set atomically with the photo's faces
    processed INTEGER NOT NULL DEFAULT 0,
    face_count INTEGER NOT NULL DEFAULT 0,
    discovered_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    processed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_photos_processed ON photos(processed);
CREATE INDEX IF NOT EXISTS idx_photos_directory ON photos(directory);

-- Clusters: identity collections produced by clustering runs
CREATE TABLE IF NOT EXISTS clusters (
    id INTEGER PRIMARY KEY AUTOINCREMENT,  -- AUTOINCREMENT: ids of deleted clusters are never reused
    name TEXT,                             -- User-assigned person name
    representative_face_id INTEGER,
    representative_pinned INTEGER NOT NULL DEFAULT 0,  -- 1 if set explicitly by the user
    run_id INTEGER NOT NULL,               -- Clustering run that last wrote this cluster
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    FOREIGN KEY (representative_face_id) REFERENCES faces(id) ON DELETE SET NULL
);

CREATE INDEX IF NOT EXISTS idx_clusters_name ON clusters(name);

-- Faces: detected faces with bounding boxes and embeddings
CREATE TABLE IF NOT EXISTS faces (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    photo_id INTEGER NOT NULL,
    bbox_x INTEGER NOT NULL,
    bbox_y INTEGER NOT NULL,
    bbox_w INTEGER NOT NULL,
    bbox_h INTEGER NOT NULL,
    confidence REAL NOT NULL,
    embedding BLOB NOT NULL,       -- float32 array stored as little-endian bytes
    embedding_dim INTEGER NOT NULL,
    excluded INTEGER NOT NULL DEFAULT 0,
    cluster_id INTEGER,            -- Written only by clustering runs
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    FOREIGN KEY (photo_id) REFERENCES photos(id) ON DELETE CASCADE,
    FOREIGN KEY (cluster_id) REFERENCES clusters(id) ON DELETE SET NULL
);

CREATE INDEX IF NOT EXISTS idx_faces_photo ON faces(photo_id);
CREATE INDEX IF NOT EXISTS idx_faces_cluster ON faces(cluster_id);

-- Corrections: durable human feedback, at most one per face
CREATE TABLE IF NOT EXISTS corrections (
    face_id INTEGER PRIMARY KEY,
    kind TEXT NOT NULL CHECK (kind IN ('exclude', 'forced_assign')),
    person_name TEXT,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    CHECK ((kind = 'exclude' AND person_name IS NULL)
        OR (kind = 'forced_assign' AND person_name IS NOT NULL)),
    FOREIGN KEY (face_id) REFERENCES faces(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_corrections_person ON corrections(person_name);

-- Per-photo ingestion failures, retried by the next ingestion run
CREATE TABLE IF NOT EXISTS ingest_failures (
    photo_id INTEGER PRIMARY KEY,
    error TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 1,
    last_attempt_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    FOREIGN KEY (photo_id) REFERENCES photos(id) ON DELETE CASCADE
);

-- Ingestion run history and checkpoints
CREATE TABLE IF NOT EXISTS ingest_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    scope TEXT NOT NULL,
    resume INTEGER NOT NULL,
    started_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    photos_total INTEGER NOT NULL DEFAULT 0,
    photos_processed INTEGER NOT NULL DEFAULT 0,
    faces_detected INTEGER NOT NULL DEFAULT 0,
    failures INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'running'  -- 'running', 'completed', 'cancelled'
);

-- Committed clustering runs; each row is one snapshot generation
CREATE TABLE IF NOT EXISTS clustering_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    epsilon REAL NOT NULL,
    min_points INTEGER NOT NULL,
    committed_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    clusters INTEGER NOT NULL DEFAULT 0,
    faces_clustered INTEGER NOT NULL DEFAULT 0,
    forced_faces INTEGER NOT NULL DEFAULT 0,
    noise_faces INTEGER NOT NULL DEFAULT 0
);

-- Advisory run locks
CREATE TABLE IF NOT EXISTS engine_locks (
    name TEXT PRIMARY KEY,
    token TEXT NOT NULL,
    acquired_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    expires_at INTEGER             -- Epoch milliseconds
);

CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// Tables cleared by a full reset, children first.
pub const RESET_TABLES: &[&str] = &[
    "corrections",
    "ingest_failures",
    "faces",
    "clusters",
    "photos",
    "ingest_runs",
    "clustering_runs",
    "engine_locks",
    "settings",
];
