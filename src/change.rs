/// Content-hash based change detection.
///
/// A file counts as changed only when its content digest differs from the
/// stored one. Modification time is recorded for reporting but never decides
/// the outcome on its own, so a `touch` does not trigger re-embedding.
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tracing::debug;

/// Read buffer used while streaming a file through the digest.
const HASH_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum ChangeError {
    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl ChangeError {
    fn from_io(path: &Path, source: std::io::Error) -> Self {
        if source.kind() == ErrorKind::NotFound {
            Self::FileNotFound(path.display().to_string())
        } else {
            Self::Io {
                path: path.display().to_string(),
                source,
            }
        }
    }
}

/// Freshly computed view of a file on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileMetadata {
    pub path: String,
    pub hash: String,
    pub last_modified: DateTime<Utc>,
    pub size_bytes: u64,
    pub last_checked: DateTime<Utc>,
}

/// What a caller previously stored about a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFileState {
    pub hash: String,
    pub last_modified: DateTime<Utc>,
}

/// Stateless change detector. Cheap to copy around.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChangeDetector;

impl ChangeDetector {
    pub fn new() -> Self {
        Self
    }

    /// Stream the file through an MD5 digest and return it as lowercase hex.
    pub async fn hash(&self, path: &Path) -> Result<String, ChangeError> {
        let mut file = tokio::fs::File::open(path)
            .await
            .map_err(|e| ChangeError::from_io(path, e))?;

        let mut ctx = md5::Context::new();
        let mut buf = vec![0u8; HASH_BUFFER_SIZE];
        loop {
            let n = file
                .read(&mut buf)
                .await
                .map_err(|e| ChangeError::from_io(path, e))?;
            if n == 0 {
                break;
            }
            ctx.consume(&buf[..n]);
        }

        Ok(format!("{:x}", ctx.compute()))
    }

    /// Hash plus size and modification time.
    pub async fn metadata(&self, path: &Path) -> Result<FileMetadata, ChangeError> {
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| ChangeError::from_io(path, e))?;
        let last_modified: DateTime<Utc> = meta
            .modified()
            .map_err(|e| ChangeError::from_io(path, e))?
            .into();
        let hash = self.hash(path).await?;

        Ok(FileMetadata {
            path: path.display().to_string(),
            hash,
            last_modified,
            size_bytes: meta.len(),
            last_checked: Utc::now(),
        })
    }

    /// Whether the file differs from what was stored.
    ///
    /// Missing files are always reported as changed so callers purge them.
    /// `stored_modified` only shows up in the debug log; an mtime bump with
    /// identical content is not a change.
    pub async fn has_changed(
        &self,
        path: &Path,
        stored_hash: &str,
        stored_modified: DateTime<Utc>,
    ) -> Result<bool, ChangeError> {
        let current = match self.hash(path).await {
            Ok(h) => h,
            Err(ChangeError::FileNotFound(_)) => return Ok(true),
            Err(e) => return Err(e),
        };

        let changed = current != stored_hash;
        debug!(
            path = %path.display(),
            changed,
            stored_modified = %stored_modified,
            "change check"
        );
        Ok(changed)
    }

    /// Run [`has_changed`](Self::has_changed) over many paths.
    ///
    /// Paths absent from `stored` are new and therefore changed. A path that
    /// cannot be read is reported as changed as well; the indexer will record
    /// the actual read failure when it tries to extract it.
    pub async fn batch_check(
        &self,
        paths: &[String],
        stored: &HashMap<String, StoredFileState>,
    ) -> HashMap<String, bool> {
        let mut out = HashMap::with_capacity(paths.len());
        for path in paths {
            let changed = match stored.get(path) {
                None => true,
                Some(state) => self
                    .has_changed(Path::new(path), &state.hash, state.last_modified)
                    .await
                    .unwrap_or(true),
            };
            out.insert(path.clone(), changed);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::{Duration, SystemTime};
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_hash_is_stable_and_content_addressed() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        fs::write(&a, "hello world").unwrap();
        fs::write(&b, "hello world").unwrap();

        let detector = ChangeDetector::new();
        let ha = detector.hash(&a).await.unwrap();
        let hb = detector.hash(&b).await.unwrap();
        assert_eq!(ha, hb);
        assert_eq!(ha, "5eb63bbbe01eeed093cb22bb8f5acdc3");
        assert_eq!(ha.len(), 32);
    }

    #[tokio::test]
    async fn test_hash_streams_large_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("big.bin");
        // Spans several read buffers
        let data = vec![7u8; HASH_BUFFER_SIZE * 3 + 17];
        fs::write(&path, &data).unwrap();

        let detector = ChangeDetector::new();
        let streamed = detector.hash(&path).await.unwrap();
        assert_eq!(streamed, format!("{:x}", md5::compute(&data)));
    }

    #[tokio::test]
    async fn test_hash_missing_file() {
        let detector = ChangeDetector::new();
        let err = detector
            .hash(Path::new("/definitely/not/here.txt"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChangeError::FileNotFound(_)));
    }

    #[tokio::test]
    async fn test_metadata() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("m.txt");
        fs::write(&path, "12345").unwrap();

        let meta = ChangeDetector::new().metadata(&path).await.unwrap();
        assert_eq!(meta.size_bytes, 5);
        assert_eq!(meta.hash, format!("{:x}", md5::compute(b"12345")));
        assert!(meta.last_checked >= meta.last_modified);
    }

    #[tokio::test]
    async fn test_touch_without_content_change_is_not_a_change() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.txt");
        fs::write(&path, "same content").unwrap();

        let detector = ChangeDetector::new();
        let before = detector.metadata(&path).await.unwrap();

        let later = SystemTime::now() + Duration::from_secs(3600);
        filetime::set_file_mtime(&path, filetime::FileTime::from_system_time(later)).unwrap();

        let changed = detector
            .has_changed(&path, &before.hash, before.last_modified)
            .await
            .unwrap();
        assert!(!changed);
    }

    #[tokio::test]
    async fn test_content_change_detected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("c.txt");
        fs::write(&path, "version one").unwrap();

        let detector = ChangeDetector::new();
        let before = detector.metadata(&path).await.unwrap();

        fs::write(&path, "version two").unwrap();
        // Same mtime as before; content alone must decide
        filetime::set_file_mtime(
            &path,
            filetime::FileTime::from_system_time(before.last_modified.into()),
        )
        .unwrap();

        assert!(
            detector
                .has_changed(&path, &before.hash, before.last_modified)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_missing_file_is_changed() {
        let detector = ChangeDetector::new();
        let changed = detector
            .has_changed(Path::new("/gone/away.txt"), "abc", Utc::now())
            .await
            .unwrap();
        assert!(changed);
    }

    #[tokio::test]
    async fn test_batch_check() {
        let dir = tempdir().unwrap();
        let kept = dir.path().join("kept.txt");
        let edited = dir.path().join("edited.txt");
        let fresh = dir.path().join("fresh.txt");
        fs::write(&kept, "kept").unwrap();
        fs::write(&edited, "before").unwrap();
        fs::write(&fresh, "new").unwrap();

        let detector = ChangeDetector::new();
        let mut stored = HashMap::new();
        for p in [&kept, &edited] {
            let meta = detector.metadata(p).await.unwrap();
            stored.insert(
                p.display().to_string(),
                StoredFileState {
                    hash: meta.hash,
                    last_modified: meta.last_modified,
                },
            );
        }
        fs::write(&edited, "after").unwrap();

        let paths: Vec<String> = [&kept, &edited, &fresh]
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        let result = detector.batch_check(&paths, &stored).await;

        assert_eq!(result[&paths[0]], false);
        assert_eq!(result[&paths[1]], true);
        assert_eq!(result[&paths[2]], true);
    }
}
