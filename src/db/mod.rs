//! Vector store backed by SQLite and sqlite-vec.
//!
//! One database file per indexed root. Documents and their chunks live in
//! ordinary tables; similarity is computed with sqlite-vec's
//! `vec_distance_cosine` over every candidate chunk (exact brute-force scan).
//!
//! The database runs in WAL mode behind an r2d2 pool: a reader on one
//! connection keeps seeing the last committed state while another connection
//! replaces a document's chunk set inside a single transaction.
use std::path::{Path, PathBuf};
use std::sync::{Mutex, Once};

use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, ErrorCode, params};
use sqlite_vec::sqlite3_vec_init;
use thiserror::Error;
use tracing::info;

pub mod documents;
pub mod models;
pub mod search;

pub type SqlitePool = r2d2::Pool<SqliteConnectionManager>;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS documents (
    path TEXT PRIMARY KEY,
    content_hash TEXT NOT NULL,
    last_modified DATETIME NOT NULL,
    size_bytes INTEGER NOT NULL,
    mime_type TEXT NOT NULL,
    extractor TEXT NOT NULL,
    indexed_at DATETIME NOT NULL
);

CREATE TABLE IF NOT EXISTS chunks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    document_path TEXT NOT NULL,
    ordinal INTEGER NOT NULL,
    text TEXT NOT NULL,
    embedding BLOB NOT NULL,
    char_count INTEGER NOT NULL,
    UNIQUE (document_path, ordinal),
    FOREIGN KEY (document_path) REFERENCES documents(path) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_chunks_document ON chunks(document_path);
"#;

/// Applied to every pooled connection.
const CONNECTION_PRAGMAS: &str = r#"
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;

static INIT_VEC: Once = Once::new();

/// Initialize the sqlite-vec extension. Safe to call multiple times.
fn init_sqlite_vec() {
    INIT_VEC.call_once(|| unsafe {
        rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
            sqlite3_vec_init as *const (),
        )));
    });
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("vector store is closed")]
    Closed,

    #[error("embedding has {actual} dimensions, store expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("index was built for {stored}-dimensional embeddings, opened with {requested}")]
    IncompatibleIndex { stored: usize, requested: usize },

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl StoreError {
    /// Whether the backend itself is unusable, as opposed to one write
    /// being rejected. Fatal errors abort an indexing run.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Closed | Self::Pool(_) | Self::IncompatibleIndex { .. } | Self::Task(_) => true,
            Self::Sqlite(e) => matches!(
                e.sqlite_error_code(),
                Some(
                    ErrorCode::CannotOpen
                        | ErrorCode::NotADatabase
                        | ErrorCode::DatabaseCorrupt
                        | ErrorCode::ReadOnly
                        | ErrorCode::SystemIoFailure
                        | ErrorCode::DiskFull
                )
            ),
            Self::DimensionMismatch { .. } | Self::InvalidQuery(_) => false,
        }
    }
}

/// Handle to one index database.
///
/// `close` drops the pool; every later call fails with
/// [`StoreError::Closed`].
pub struct VectorStore {
    pool: Mutex<Option<SqlitePool>>,
    path: PathBuf,
    dimensions: usize,
}

impl VectorStore {
    /// Open (or create) the index at `path` for `dimensions`-wide embeddings.
    pub fn open<P: AsRef<Path>>(
        path: P,
        dimensions: usize,
        pool_size: u32,
    ) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        info!("Initializing vector store: {}", path.display());

        // Register sqlite-vec extension globally
        init_sqlite_vec();

        let manager = SqliteConnectionManager::file(&path)
            .with_init(|conn| conn.execute_batch(CONNECTION_PRAGMAS));
        let pool = r2d2::Pool::builder()
            .max_size(pool_size.max(1))
            .build(manager)?;

        {
            let conn = pool.get()?;
            let vec_version: String =
                conn.query_row("SELECT vec_version()", [], |row| row.get(0))?;
            info!("sqlite-vec version: {}", vec_version);

            let journal: String =
                conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
            info!("journal mode: {}", journal);

            conn.execute_batch(SCHEMA_SQL)?;
            check_dimensions(&conn, dimensions)?;
        }

        info!("Vector store initialized successfully");

        Ok(Self {
            pool: Mutex::new(Some(pool)),
            path,
            dimensions,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Release the backing storage. Idempotent.
    pub fn close(&self) {
        let mut guard = match self.pool.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if guard.take().is_some() {
            info!("Closed vector store: {}", self.path.display());
        }
    }

    pub fn is_closed(&self) -> bool {
        match self.pool.lock() {
            Ok(guard) => guard.is_none(),
            Err(poisoned) => poisoned.into_inner().is_none(),
        }
    }

    fn pool(&self) -> Result<SqlitePool, StoreError> {
        let guard = match self.pool.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.clone().ok_or(StoreError::Closed)
    }

    /// Run blocking SQLite work on a pooled connection off the async runtime.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool()?;
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            f(&mut conn)
        })
        .await?
    }

    pub(crate) fn check_embedding(&self, embedding: &[f32]) -> Result<(), StoreError> {
        if embedding.len() != self.dimensions {
            return Err(StoreError::DimensionMismatch {
                expected: self.dimensions,
                actual: embedding.len(),
            });
        }
        Ok(())
    }
}

impl Drop for VectorStore {
    fn drop(&mut self) {
        self.close();
    }
}

/// Record the embedding width on first open; refuse a different one later.
fn check_dimensions(conn: &Connection, dimensions: usize) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR IGNORE INTO meta (key, value) VALUES ('dimensions', ?)",
        params![dimensions.to_string()],
    )?;
    let stored: String = conn.query_row(
        "SELECT value FROM meta WHERE key = 'dimensions'",
        [],
        |row| row.get(0),
    )?;
    let stored: usize = stored.parse().unwrap_or(0);
    if stored != dimensions {
        return Err(StoreError::IncompatibleIndex {
            stored,
            requested: dimensions,
        });
    }
    Ok(())
}

/// Helper to serialize a float32 vector into the little-endian blob layout
/// sqlite-vec reads.
pub fn serialize_vector(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}
