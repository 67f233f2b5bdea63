use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use ignore::WalkBuilder;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::chunker::split_into_chunks;
use super::report::{FailedFile, FailureStage, IndexMode, IndexingResult, SkippedFile};
use super::skip::{SkipReason, SkipRules, is_hidden};
use crate::ai::middleware::{AiError, AiMiddleware};
use crate::change::{ChangeDetector, StoredFileState};
use crate::config::IndexingConfig;
use crate::db::models::{DocumentMetadata, NewChunk};
use crate::db::{StoreError, VectorStore};
use crate::embedder::Embedder;
use crate::extract::{ExtractorSet, extension_of};

#[derive(Error, Debug)]
pub enum IndexingError {
    #[error("root directory not found: {0}")]
    RootNotFound(String),

    #[error("indexing cancelled")]
    Cancelled,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("indexing task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// How one file ended, short of a failure.
enum FileOutcome {
    Indexed { chunks: usize },
    Skipped(SkipReason),
}

enum FileError {
    Failed {
        stage: FailureStage,
        message: String,
        extractor: &'static str,
    },
    Cancelled,
    Fatal(StoreError),
}

/// Every regular file under `root`, sorted. Hidden directories are pruned
/// without being descended into; hidden files are still returned so they can
/// be reported as skipped.
pub fn walk_files(root: &Path) -> Vec<PathBuf> {
    let walker = WalkBuilder::new(root)
        .standard_filters(false)
        .follow_links(false)
        .filter_entry(|entry| {
            entry.depth() == 0
                || !(entry.file_type().is_some_and(|t| t.is_dir()) && is_hidden(entry.file_name()))
        })
        .build();

    let mut files = Vec::new();
    for entry in walker {
        match entry {
            Ok(e) if e.file_type().is_some_and(|t| t.is_file()) => files.push(e.into_path()),
            Ok(_) => {}
            Err(err) => warn!("Skipping unreadable entry: {err}"),
        }
    }
    files.sort();
    files
}

/// Document key for `path`: relative to `root`, always with forward slashes.
pub fn relative_key(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

/// The only writer of the vector store.
pub struct IndexingPipeline {
    store: Arc<VectorStore>,
    extractors: ExtractorSet,
    embedder: Arc<dyn Embedder>,
    middleware: Arc<AiMiddleware>,
    detector: ChangeDetector,
    config: IndexingConfig,
}

impl IndexingPipeline {
    pub fn new(
        store: Arc<VectorStore>,
        extractors: ExtractorSet,
        embedder: Arc<dyn Embedder>,
        middleware: Arc<AiMiddleware>,
        config: IndexingConfig,
    ) -> Self {
        Self {
            store,
            extractors,
            embedder,
            middleware,
            detector: ChangeDetector::new(),
            config,
        }
    }

    pub fn store(&self) -> &Arc<VectorStore> {
        &self.store
    }

    /// Embed a search query through the middleware.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>, AiError> {
        self.middleware
            .execute("embed_query", self.embedder.provider_key(), None, || {
                self.embedder.embed(text)
            })
            .await
            .into_result()
    }

    /// Index every file under `root`.
    ///
    /// `Full` clears the store first. `Incremental` leaves documents whose
    /// content hash is unchanged untouched and removes documents whose file
    /// is gone or is now skipped. Per-file problems are recorded in the result; only store
    /// faults and cancellation end the run early.
    pub async fn run(
        &self,
        root: &Path,
        mode: IndexMode,
        cancel: &CancellationToken,
    ) -> Result<IndexingResult, IndexingError> {
        let started_at = Utc::now();
        let root = std::path::absolute(root)
            .map_err(|_| IndexingError::RootNotFound(root.display().to_string()))?;
        if !tokio::fs::metadata(&root)
            .await
            .is_ok_and(|m| m.is_dir())
        {
            return Err(IndexingError::RootNotFound(root.display().to_string()));
        }

        info!(root = %root.display(), ?mode, "Indexing started");

        if mode == IndexMode::Full {
            self.store.clear_index().await?;
        }
        let stored = match mode {
            IndexMode::Incremental => self.store.documents().await?,
            IndexMode::Full => HashMap::new(),
        };

        let walk_root = root.clone();
        let files = tokio::task::spawn_blocking(move || walk_files(&walk_root)).await?;
        debug!(files = files.len(), "Scan complete");

        let mut result = IndexingResult {
            mode,
            indexed_files: Vec::new(),
            skipped_files: Vec::new(),
            failed_files: Vec::new(),
            removed_files: Vec::new(),
            total_chunks: 0,
            started_at,
            completed_at: started_at,
        };

        let db_path = std::path::absolute(self.store.path())
            .unwrap_or_else(|_| self.store.path().to_path_buf());
        let rules = SkipRules::new(self.config.max_file_size_bytes(), Some(db_path));

        // Keys whose stored row stays valid: indexed, unchanged or failed.
        // Anything else with a row (deleted, or now skipped) is purged below.
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        for path in files {
            if cancel.is_cancelled() {
                return Err(IndexingError::Cancelled);
            }
            let key = relative_key(&root, &path);

            let metadata = match tokio::fs::metadata(&path).await {
                Ok(m) => m,
                Err(e) => {
                    warn!(path = %key, "Cannot stat file: {e}");
                    seen.insert(key.clone());
                    result.failed_files.push(FailedFile {
                        path: key,
                        stage: FailureStage::Extraction,
                        error: e.to_string(),
                        extractor: None,
                    });
                    continue;
                }
            };

            if let Some(reason) = rules.check(&path, &metadata) {
                debug!(path = %key, %reason, "Skipping");
                result
                    .skipped_files
                    .push(skipped(&path, key, metadata.len(), &reason));
                continue;
            }
            candidates.push((path, key, metadata.len()));
        }

        // Content hashes decide what is unchanged; mtime alone never does
        let changed = if mode == IndexMode::Incremental {
            let mut states = HashMap::new();
            let mut paths = Vec::with_capacity(candidates.len());
            for (path, key, _) in &candidates {
                let abs = path.to_string_lossy().into_owned();
                if let Some(doc) = stored.get(key) {
                    states.insert(
                        abs.clone(),
                        StoredFileState {
                            hash: doc.content_hash.clone(),
                            last_modified: doc.last_modified,
                        },
                    );
                }
                paths.push(abs);
            }
            self.detector.batch_check(&paths, &states).await
        } else {
            HashMap::new()
        };

        for (path, key, size) in candidates {
            if cancel.is_cancelled() {
                info!("Indexing cancelled");
                return Err(IndexingError::Cancelled);
            }

            let unchanged = changed.get(&*path.to_string_lossy()) == Some(&false);
            if unchanged {
                debug!(path = %key, "Unchanged since last index");
                seen.insert(key.clone());
                result
                    .skipped_files
                    .push(skipped(&path, key, size, &SkipReason::Unchanged));
                continue;
            }

            match self.process_file(&path, &key, cancel).await {
                Ok(FileOutcome::Indexed { chunks }) => {
                    debug!(path = %key, chunks, "Indexed");
                    result.total_chunks += chunks;
                    seen.insert(key.clone());
                    result.indexed_files.push(key);
                }
                Ok(FileOutcome::Skipped(reason)) => {
                    debug!(path = %key, %reason, "Skipping");
                    result.skipped_files.push(skipped(&path, key, size, &reason));
                }
                Err(FileError::Failed {
                    stage,
                    message,
                    extractor,
                }) => {
                    warn!(path = %key, stage = stage.as_str(), extractor, "Failed to index: {message}");
                    seen.insert(key.clone());
                    result.failed_files.push(FailedFile {
                        path: key,
                        stage,
                        error: message,
                        extractor: Some(extractor.to_string()),
                    });
                }
                Err(FileError::Cancelled) => {
                    info!(path = %key, "Indexing cancelled mid-document");
                    return Err(IndexingError::Cancelled);
                }
                Err(FileError::Fatal(e)) => return Err(e.into()),
            }
        }

        if mode == IndexMode::Incremental {
            let mut gone: Vec<&String> = stored.keys().filter(|k| !seen.contains(*k)).collect();
            gone.sort();
            for key in gone {
                if self.store.remove_document(key).await? {
                    debug!(path = %key, "Removed stale document from index");
                    result.removed_files.push(key.clone());
                }
            }
        }

        result.completed_at = Utc::now();
        info!(
            indexed = result.indexed_files.len(),
            skipped = result.skipped_files.len(),
            failed = result.failed_files.len(),
            removed = result.removed_files.len(),
            chunks = result.total_chunks,
            duration_ms = result.duration_ms(),
            "Indexing complete"
        );
        Ok(result)
    }

    /// Extract, chunk, embed and store one file. Nothing is written unless
    /// every chunk was embedded.
    async fn process_file(
        &self,
        path: &Path,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<FileOutcome, FileError> {
        let Some(extractor) = self.extractors.find(path) else {
            return Ok(FileOutcome::Skipped(SkipReason::Unsupported {
                extension: extension_of(path),
            }));
        };
        let fail = |stage, message: String| FileError::Failed {
            stage,
            message,
            extractor: extractor.name(),
        };

        let file_meta = self
            .detector
            .metadata(path)
            .await
            .map_err(|e| fail(FailureStage::Extraction, e.to_string()))?;

        let text = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(FileError::Cancelled),
            r = extractor.extract_text(path) => {
                r.map_err(|e| fail(FailureStage::Extraction, e.to_string()))?
            }
        };
        if text.trim().is_empty() {
            return Ok(FileOutcome::Skipped(SkipReason::EmptyContent));
        }

        let pieces = split_into_chunks(&text, self.config.chunk_size, self.config.chunk_overlap);
        let mut chunks = Vec::with_capacity(pieces.len());
        for (ordinal, piece) in pieces.into_iter().enumerate() {
            let outcome = self
                .middleware
                .execute_with_cancel(
                    "embed_chunk",
                    self.embedder.provider_key(),
                    None,
                    cancel,
                    || self.embedder.embed(&piece),
                )
                .await;
            let embedding = match outcome.into_result() {
                Ok(v) => v,
                Err(_) if cancel.is_cancelled() => return Err(FileError::Cancelled),
                Err(e) => return Err(fail(FailureStage::Embedding, e.to_string())),
            };
            chunks.push(NewChunk {
                ordinal,
                text: piece,
                embedding,
            });
        }

        if cancel.is_cancelled() {
            return Err(FileError::Cancelled);
        }

        let count = chunks.len();
        let meta = DocumentMetadata {
            path: key.to_string(),
            content_hash: file_meta.hash,
            last_modified: file_meta.last_modified,
            size_bytes: file_meta.size_bytes,
            mime_type: extractor.mime_type(path).to_string(),
            extractor: extractor.name().to_string(),
        };
        match self.store.index_document(meta, chunks).await {
            Ok(()) => Ok(FileOutcome::Indexed { chunks: count }),
            Err(e) if e.is_fatal() => Err(FileError::Fatal(e)),
            Err(e) => Err(fail(FailureStage::Storage, e.to_string())),
        }
    }
}

fn skipped(path: &Path, key: String, size: u64, reason: &SkipReason) -> SkippedFile {
    SkippedFile::new(key, extension_of(path).unwrap_or_default(), size, reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::ProviderError;
    use crate::config::MiddlewareConfig;
    use crate::embedder::hash::HashEmbedder;
    use async_trait::async_trait;
    use filetime::{FileTime, set_file_mtime};
    use std::fs;
    use tempfile::{TempDir, tempdir};

    const DIMS: usize = 64;

    struct Fixture {
        root: TempDir,
        _db_dir: TempDir,
        pipeline: IndexingPipeline,
    }

    fn middleware() -> Arc<AiMiddleware> {
        Arc::new(AiMiddleware::new(MiddlewareConfig {
            base_delay_ms: 1,
            max_delay_ms: 5,
            ..MiddlewareConfig::default()
        }))
    }

    fn fixture_with(embedder: Arc<dyn Embedder>) -> Fixture {
        let root = tempdir().unwrap();
        let db_dir = tempdir().unwrap();
        let store = VectorStore::open(db_dir.path().join("index.db"), DIMS, 2).unwrap();
        let config = IndexingConfig {
            chunk_size: 200,
            chunk_overlap: 40,
            max_file_size_mb: 1,
            ..IndexingConfig::default()
        };
        let pipeline = IndexingPipeline::new(
            Arc::new(store),
            ExtractorSet::with_defaults(),
            embedder,
            middleware(),
            config,
        );
        Fixture {
            root,
            _db_dir: db_dir,
            pipeline,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(HashEmbedder::new(DIMS)))
    }

    impl Fixture {
        fn write(&self, rel: &str, body: &str) -> PathBuf {
            let path = self.root.path().join(rel);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            fs::write(&path, body).unwrap();
            path
        }

        async fn run(&self, mode: IndexMode) -> IndexingResult {
            self.pipeline
                .run(self.root.path(), mode, &CancellationToken::new())
                .await
                .unwrap()
        }
    }

    #[tokio::test]
    async fn test_text_and_executable() {
        let fx = fixture();
        fx.write("readme.txt", "hello world");
        fx.write("app.exe", "MZ\u{0}\u{0}binary");

        let result = fx.run(IndexMode::Incremental).await;

        assert_eq!(result.indexed_files, vec!["readme.txt"]);
        assert_eq!(result.skipped_files.len(), 1);
        assert_eq!(result.skipped_files[0].path, "app.exe");
        assert_eq!(result.skipped_files[0].extension, "exe");
        assert_eq!(result.skipped_files[0].reason, "binary executable");
        assert!(result.failed_files.is_empty());
        assert_eq!(result.total_chunks, 1);
        assert_eq!(fx.pipeline.store().chunk_count().await.unwrap(), 1);

        let doc = fx
            .pipeline
            .store()
            .get_document("readme.txt")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc.mime_type, "text/plain");
        assert_eq!(doc.extractor, "plain-text");
        assert_eq!(doc.size_bytes, 11);
    }

    #[tokio::test]
    async fn test_incremental_run_is_idempotent() {
        let fx = fixture();
        fx.write("a.md", &"Alpha beta gamma. ".repeat(40));
        fx.write("docs/b.txt", "short note");

        let first = fx.run(IndexMode::Incremental).await;
        assert_eq!(first.indexed_files.len(), 2);
        let chunks = fx.pipeline.store().chunk_count().await.unwrap();
        let docs_before = fx.pipeline.store().documents().await.unwrap();

        let second = fx.run(IndexMode::Incremental).await;
        assert!(second.indexed_files.is_empty());
        assert_eq!(second.total_chunks, 0);
        assert_eq!(second.skipped_files.len(), 2);
        assert!(
            second
                .skipped_files
                .iter()
                .all(|s| s.reason == "unchanged since last index")
        );
        assert_eq!(fx.pipeline.store().chunk_count().await.unwrap(), chunks);
        assert_eq!(fx.pipeline.store().documents().await.unwrap(), docs_before);
    }

    #[tokio::test]
    async fn test_touch_without_edit_is_unchanged() {
        let fx = fixture();
        let path = fx.write("notes.txt", "first draft");
        fx.run(IndexMode::Incremental).await;

        set_file_mtime(&path, FileTime::from_unix_time(2_000_000_000, 0)).unwrap();
        let touched = fx.run(IndexMode::Incremental).await;
        assert!(touched.indexed_files.is_empty());

        fs::write(&path, "edited content").unwrap();
        let edited = fx.run(IndexMode::Incremental).await;
        assert_eq!(edited.indexed_files, vec!["notes.txt"]);
    }

    #[tokio::test]
    async fn test_deleted_files_are_purged() {
        let fx = fixture();
        let keep = fx.write("keep.txt", "keep me");
        let gone = fx.write("sub/gone.txt", "remove me");
        fx.run(IndexMode::Incremental).await;

        fs::remove_file(&gone).unwrap();
        let result = fx.run(IndexMode::Incremental).await;
        assert_eq!(result.removed_files, vec!["sub/gone.txt"]);
        assert_eq!(
            fx.pipeline.store().indexed_files().await.unwrap(),
            vec!["keep.txt"]
        );
        assert!(keep.exists());
    }

    async fn search_texts(fx: &Fixture, text: &str) -> Vec<String> {
        let query = crate::db::models::RagQuery {
            query_text: text.to_string(),
            top_k: 10,
            min_similarity: 0.0,
            file_filters: Vec::new(),
        };
        let vector = fx.pipeline.embed_query(text).await.unwrap();
        fx.pipeline
            .store()
            .search(&query, &vector)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.chunk.text)
            .collect()
    }

    #[tokio::test]
    async fn test_emptied_file_drops_old_chunks() {
        let fx = fixture();
        fx.write("notes.txt", "secret launch codes alpha");
        fx.run(IndexMode::Incremental).await;
        assert_eq!(search_texts(&fx, "launch codes").await.len(), 1);

        fx.write("notes.txt", "   \n\t  ");
        let result = fx.run(IndexMode::Incremental).await;
        assert_eq!(result.skipped_files[0].reason, "no extractable text");
        assert_eq!(result.removed_files, vec!["notes.txt"]);

        assert_eq!(fx.pipeline.store().chunk_count().await.unwrap(), 0);
        assert!(fx.pipeline.store().indexed_files().await.unwrap().is_empty());
        assert!(search_texts(&fx, "launch codes").await.is_empty());
    }

    #[tokio::test]
    async fn test_file_grown_past_size_cap_drops_old_chunks() {
        let fx = fixture();
        fx.write("log.txt", "first entry");
        fx.write("other.txt", "stays indexed");
        fx.run(IndexMode::Incremental).await;

        fx.write("log.txt", &"x".repeat(1_200_000));
        let result = fx.run(IndexMode::Incremental).await;
        assert_eq!(result.skipped_files[0].path, "log.txt");
        assert_eq!(result.skipped_files[0].category, "too_large");
        assert_eq!(result.removed_files, vec!["log.txt"]);
        assert_eq!(
            fx.pipeline.store().indexed_files().await.unwrap(),
            vec!["other.txt"]
        );
        assert_eq!(fx.pipeline.store().chunk_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_full_mode_reprocesses_everything() {
        let fx = fixture();
        fx.write("a.txt", "one");
        fx.write("b.txt", "two");
        fx.run(IndexMode::Incremental).await;

        let full = fx.run(IndexMode::Full).await;
        assert_eq!(full.indexed_files, vec!["a.txt", "b.txt"]);
        assert!(full.skipped_files.is_empty());
        assert_eq!(fx.pipeline.store().chunk_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_skips_are_not_failures() {
        let fx = fixture();
        fx.write("blank.txt", "  \n\t ");
        fx.write("data.xyz", "mystery");
        fx.write(".env", "SECRET=1");
        fx.write(".git/config.txt", "pruned");
        fx.write("page.html", "<script>only()</script>");

        let result = fx.run(IndexMode::Incremental).await;
        assert!(result.indexed_files.is_empty());
        assert!(result.failed_files.is_empty());

        let reasons: HashMap<&str, &str> = result
            .skipped_files
            .iter()
            .map(|s| (s.path.as_str(), s.category))
            .collect();
        assert_eq!(reasons["blank.txt"], "empty_content");
        assert_eq!(reasons["data.xyz"], "unsupported_type");
        assert_eq!(reasons[".env"], "hidden");
        assert_eq!(reasons["page.html"], "empty_content");
        // Hidden directories are never walked
        assert!(!reasons.contains_key(".git/config.txt"));
        assert_eq!(reasons.len(), 4);
    }

    #[tokio::test]
    async fn test_bad_file_does_not_stop_the_run() {
        let fx = fixture();
        fx.write("broken.pdf", "not really a pdf");
        fx.write("fine.txt", "still indexed");

        let result = fx.run(IndexMode::Incremental).await;
        assert_eq!(result.indexed_files, vec!["fine.txt"]);
        assert_eq!(result.failed_files.len(), 1);
        let failed = &result.failed_files[0];
        assert_eq!(failed.path, "broken.pdf");
        assert_eq!(failed.stage, FailureStage::Extraction);
        assert_eq!(failed.extractor.as_deref(), Some("pdf"));
        assert!(
            fx.pipeline
                .store()
                .get_document("broken.pdf")
                .await
                .unwrap()
                .is_none()
        );
    }

    struct RejectingEmbedder;

    #[async_trait]
    impl Embedder for RejectingEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, ProviderError> {
            Err(ProviderError::Unauthorized("bad api key".into()))
        }
        fn dimensions(&self) -> usize {
            DIMS
        }
        fn provider_key(&self) -> &str {
            "embedding:rejecting"
        }
    }

    #[tokio::test]
    async fn test_embedding_failure_stores_nothing() {
        let fx = fixture_with(Arc::new(RejectingEmbedder));
        fx.write("a.txt", "content");

        let result = fx.run(IndexMode::Incremental).await;
        assert_eq!(result.failed_files.len(), 1);
        assert_eq!(result.failed_files[0].stage, FailureStage::Embedding);
        assert!(result.failed_files[0].error.contains("bad api key"));
        assert_eq!(fx.pipeline.store().chunk_count().await.unwrap(), 0);
        assert!(fx.pipeline.store().indexed_files().await.unwrap().is_empty());
    }

    /// Cancels the run while the first document is being embedded.
    struct CancellingEmbedder {
        token: CancellationToken,
        inner: HashEmbedder,
    }

    #[async_trait]
    impl Embedder for CancellingEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
            self.token.cancel();
            Ok(self.inner.embed_sync(text))
        }
        fn dimensions(&self) -> usize {
            DIMS
        }
        fn provider_key(&self) -> &str {
            "embedding:hash"
        }
    }

    #[tokio::test]
    async fn test_cancel_mid_document_commits_nothing() {
        let token = CancellationToken::new();
        let fx = fixture_with(Arc::new(CancellingEmbedder {
            token: token.clone(),
            inner: HashEmbedder::new(DIMS),
        }));
        fx.write("a.txt", &"Sentence number one. ".repeat(50));

        let err = fx
            .pipeline
            .run(fx.root.path(), IndexMode::Incremental, &token)
            .await
            .unwrap_err();
        assert!(matches!(err, IndexingError::Cancelled));
        assert_eq!(fx.pipeline.store().chunk_count().await.unwrap(), 0);
        assert!(fx.pipeline.store().indexed_files().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_root() {
        let fx = fixture();
        let err = fx
            .pipeline
            .run(
                &fx.root.path().join("absent"),
                IndexMode::Incremental,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, IndexingError::RootNotFound(_)));
    }

    #[tokio::test]
    async fn test_closed_store_is_fatal() {
        let fx = fixture();
        fx.write("a.txt", "content");
        fx.pipeline.store().close();

        let err = fx
            .pipeline
            .run(fx.root.path(), IndexMode::Full, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, IndexingError::Store(StoreError::Closed)));
    }

    #[test]
    fn test_relative_key() {
        let root = Path::new("/data/docs");
        assert_eq!(
            relative_key(root, Path::new("/data/docs/a/b.txt")),
            "a/b.txt"
        );
    }
}
