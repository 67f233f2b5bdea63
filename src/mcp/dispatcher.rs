/// Tool and resource operations behind the MCP handler.
///
/// Every problem, including a panic inside a tool, comes back as a
/// [`DispatchError`]. Tool calls and resource reads are reported on the
/// `audit` tracing target.
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use futures::FutureExt;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::DispatchError;
use super::tools::{
    AnalyzeFileArgs, AskAiArgs, DEFAULT_MAX_RESULTS, RagAskArgs, RagSearchArgs, SearchFilesArgs,
    ToolCall, ToolDescriptor, tool_descriptors,
};
use crate::ai::ProviderHandle;
use crate::ai::middleware::{AiMiddleware, AiOperationContext};
use crate::ai::ollama::build_prompt;
use crate::config::{ProviderConfig, SearchConfig, ServerMode};
use crate::db::models::{RagQuery, SearchResult};
use crate::extract::{ExtractError, ExtractorSet};
use crate::indexer::skip::{SkipRules, is_hidden};
use crate::indexer::{IndexMode, IndexingPipeline, IndexingResult, relative_key, walk_files};

/// Characters of context shown around a `search_files` content match.
const SNIPPET_BEFORE: usize = 60;
const SNIPPET_AFTER: usize = 100;

/// Room left in the prompt for the analysis instruction.
const INSTRUCTION_RESERVE: usize = 1_000;

/// Retrieval side of the server, present only in [`ServerMode::Rag`].
pub struct RagServices {
    pub pipeline: Arc<IndexingPipeline>,
    pub search: SearchConfig,
}

/// One readable file under the root.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceEntry {
    pub uri: String,
    pub name: String,
    pub mime_type: String,
}

/// Extracted text of a resource.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceText {
    pub uri: String,
    pub mime_type: String,
    pub text: String,
}

pub struct Dispatcher {
    root: PathBuf,
    provider: ProviderHandle,
    provider_config: ProviderConfig,
    middleware: Arc<AiMiddleware>,
    extractors: ExtractorSet,
    max_file_size: u64,
    rag: Option<RagServices>,
    last_report: RwLock<Option<IndexingResult>>,
    /// Held for the length of a reindex; a second one is refused.
    reindex_lock: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        root: PathBuf,
        provider: ProviderHandle,
        provider_config: ProviderConfig,
        middleware: Arc<AiMiddleware>,
        extractors: ExtractorSet,
        max_file_size: u64,
    ) -> Self {
        Self {
            root,
            provider,
            provider_config,
            middleware,
            extractors,
            max_file_size,
            rag: None,
            last_report: RwLock::new(None),
            reindex_lock: tokio::sync::Mutex::new(()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Enable the retrieval tools.
    pub fn with_rag(mut self, rag: RagServices) -> Self {
        self.rag = Some(rag);
        self
    }

    /// Token whose cancellation aborts a running reindex.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn mode(&self) -> ServerMode {
        if self.rag.is_some() {
            ServerMode::Rag
        } else {
            ServerMode::Basic
        }
    }

    pub fn provider(&self) -> &ProviderHandle {
        &self.provider
    }

    pub fn last_report(&self) -> Option<IndexingResult> {
        match self.last_report.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_last_report(&self, result: IndexingResult) {
        let mut guard = match self.last_report.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Some(result);
    }

    /// Tools offered in the current mode.
    pub fn tools(&self) -> Vec<ToolDescriptor> {
        tool_descriptors(self.rag.is_some())
    }

    // ── Resources ───────────────────────────────────────────────────

    /// Every non-hidden file under the root that some extractor can read.
    pub async fn list_resources(&self) -> Result<Vec<ResourceEntry>, DispatchError> {
        let files = self.walk().await?;
        Ok(files
            .iter()
            .filter(|path| !path.file_name().is_some_and(is_hidden))
            .filter_map(|path| {
                let extractor = self.extractors.find(path)?;
                Some(ResourceEntry {
                    uri: file_uri(path),
                    name: relative_key(&self.root, path),
                    mime_type: extractor.mime_type(path).to_string(),
                })
            })
            .collect())
    }

    pub async fn read_resource(&self, uri: &str) -> Result<ResourceText, DispatchError> {
        let started = Instant::now();
        let result = self.read_resource_inner(uri).await;
        info!(
            target: "audit",
            resource = %uri,
            ok = result.is_ok(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "resource read"
        );
        result
    }

    async fn read_resource_inner(&self, uri: &str) -> Result<ResourceText, DispatchError> {
        let path = self.resolve(uri).await?;
        let extractor = self.extractors.find(&path).ok_or_else(|| {
            DispatchError::InvalidParams(format!("no extractor for {}", path.display()))
        })?;
        let text = extractor
            .extract_text(&path)
            .await
            .map_err(|e| extract_error(uri, e))?;
        Ok(ResourceText {
            uri: file_uri(&path),
            mime_type: extractor.mime_type(&path).to_string(),
            text,
        })
    }

    /// Map a `file://` URI or root-relative path onto a file inside the root.
    async fn resolve(&self, uri: &str) -> Result<PathBuf, DispatchError> {
        let raw = uri.strip_prefix("file://").unwrap_or(uri);
        let candidate = Path::new(raw);
        let candidate = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.root.join(candidate)
        };

        let resolved = tokio::fs::canonicalize(&candidate)
            .await
            .map_err(|_| DispatchError::ResourceNotFound(uri.to_string()))?;
        let root = tokio::fs::canonicalize(&self.root)
            .await
            .map_err(|e| DispatchError::Internal(format!("root unavailable: {e}")))?;

        if !resolved.starts_with(&root) {
            return Err(DispatchError::InvalidParams(format!(
                "{uri} is outside the served root"
            )));
        }
        if !resolved.is_file() {
            return Err(DispatchError::ResourceNotFound(uri.to_string()));
        }
        Ok(resolved)
    }

    async fn walk(&self) -> Result<Vec<PathBuf>, DispatchError> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || walk_files(&root))
            .await
            .map_err(|e| DispatchError::Internal(e.to_string()))
    }

    // ── Tools ───────────────────────────────────────────────────────

    /// Run one tool. A panic inside the tool becomes [`DispatchError::Internal`].
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, DispatchError> {
        let started = Instant::now();
        let outcome = std::panic::AssertUnwindSafe(self.run_tool(name, arguments))
            .catch_unwind()
            .await;
        let result = match outcome {
            Ok(result) => result,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "tool panicked".to_string());
                warn!(tool = %name, "Tool panicked: {message}");
                Err(DispatchError::Internal(message))
            }
        };
        info!(
            target: "audit",
            tool = %name,
            ok = result.is_ok(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "tool call"
        );
        result
    }

    async fn run_tool(&self, name: &str, arguments: Value) -> Result<Value, DispatchError> {
        let call = ToolCall::parse(name, arguments)?;
        if call.requires_rag() && self.rag.is_none() {
            return Err(DispatchError::ToolUnavailable {
                tool: call.name().to_string(),
                reason: "retrieval is disabled in basic mode".to_string(),
            });
        }

        match call {
            ToolCall::SearchFiles(args) => self.search_files(args).await,
            ToolCall::AskAi(args) => self.ask_ai(args).await,
            ToolCall::AnalyzeFile(args) => self.analyze_file(args).await,
            ToolCall::RagSearch(args) => self.rag_search(args).await,
            ToolCall::RagAsk(args) => self.rag_ask(args).await,
            ToolCall::ReindexDocuments(args) => {
                let mode = if args.incremental {
                    IndexMode::Incremental
                } else {
                    IndexMode::Full
                };
                let result = self.reindex(mode).await?;
                Ok(json!({ "summary": result.summary() }))
            }
            ToolCall::IndexingReport => self.indexing_report().await,
        }
    }

    fn rag(&self, tool: &str) -> Result<&RagServices, DispatchError> {
        self.rag.as_ref().ok_or_else(|| DispatchError::ToolUnavailable {
            tool: tool.to_string(),
            reason: "retrieval is disabled in basic mode".to_string(),
        })
    }

    async fn search_files(&self, args: SearchFilesArgs) -> Result<Value, DispatchError> {
        let limit = args.max_results.unwrap_or(DEFAULT_MAX_RESULTS);
        let needle = args.query.to_lowercase();
        let rules = SkipRules::new(self.max_file_size, None);

        let mut matches = Vec::new();
        for path in self.walk().await? {
            if matches.len() >= limit {
                break;
            }
            let Ok(metadata) = tokio::fs::metadata(&path).await else {
                continue;
            };
            if rules.check(&path, &metadata).is_some() {
                continue;
            }
            let Some(extractor) = self.extractors.find(&path) else {
                continue;
            };

            let key = relative_key(&self.root, &path);
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_lowercase())
                .unwrap_or_default();

            let snippet = if name.contains(&needle) {
                None
            } else {
                match extractor.extract_text(&path).await {
                    Ok(text) => match find_case_insensitive(&text, &args.query) {
                        Some(at) => Some(snippet_around(&text, at)),
                        None => continue,
                    },
                    Err(e) => {
                        debug!(path = %key, "search_files skipped unreadable file: {e}");
                        continue;
                    }
                }
            };

            matches.push(json!({
                "path": key,
                "uri": file_uri(&path),
                "mimeType": extractor.mime_type(&path),
                "nameMatch": snippet.is_none(),
                "snippet": snippet,
            }));
        }

        Ok(json!({ "query": args.query, "results": matches }))
    }

    /// One generation call through the middleware.
    async fn generate(
        &self,
        tool: &str,
        prompt: &str,
        context: Option<&str>,
        temperature: Option<f32>,
    ) -> Result<(String, Value), DispatchError> {
        let provider = self.provider.current();
        let temperature = temperature.unwrap_or(self.provider_config.temperature);
        let op_context = AiOperationContext {
            prompt: build_prompt(prompt, context),
            max_tokens: self.provider_config.max_tokens,
            timeout_ms: self.provider_config.timeout_ms,
        };

        let outcome = self
            .middleware
            .execute(tool, provider.provider_type(), Some(&op_context), || {
                provider.generate(prompt, context, temperature)
            })
            .await;
        let retries = outcome.retry_count;
        let duration_ms = outcome.duration.as_millis() as u64;
        let answer = outcome
            .into_result()
            .map_err(|e| DispatchError::tool_failed(tool, e))?;

        let meta = json!({
            "provider": provider.provider_name(),
            "model": provider.current_model(),
            "retries": retries,
            "durationMs": duration_ms,
        });
        Ok((answer, meta))
    }

    async fn ask_ai(&self, args: AskAiArgs) -> Result<Value, DispatchError> {
        let (answer, meta) = self
            .generate(
                "ask_ai",
                &args.question,
                args.context.as_deref(),
                args.temperature,
            )
            .await?;
        Ok(json!({ "answer": answer, "ai": meta }))
    }

    async fn analyze_file(&self, args: AnalyzeFileArgs) -> Result<Value, DispatchError> {
        let path = self.resolve(&args.file_uri).await?;
        let extractor = self.extractors.find(&path).ok_or_else(|| {
            DispatchError::tool_failed(
                "analyze_file",
                format!("no extractor for {}", path.display()),
            )
        })?;
        let text = extractor
            .extract_text(&path)
            .await
            .map_err(|e| extract_error(&args.file_uri, e))?;
        if text.trim().is_empty() {
            return Err(DispatchError::tool_failed(
                "analyze_file",
                "file has no extractable text",
            ));
        }

        let budget = self
            .middleware
            .max_prompt_length()
            .saturating_sub(INSTRUCTION_RESERVE);
        let (document, truncated) = truncate_chars(&text, budget);

        let (answer, meta) = self
            .generate(
                "analyze_file",
                args.analysis_type.instruction(),
                Some(document),
                None,
            )
            .await?;
        Ok(json!({
            "file": relative_key(&self.root, &path),
            "analysisType": args.analysis_type,
            "truncated": truncated,
            "result": answer,
            "ai": meta,
        }))
    }

    async fn retrieve(
        &self,
        tool: &str,
        query_text: &str,
        top_k: Option<usize>,
        min_similarity: Option<f64>,
        file_filters: Vec<String>,
    ) -> Result<Vec<SearchResult>, DispatchError> {
        let rag = self.rag(tool)?;
        let query = RagQuery {
            query_text: query_text.to_string(),
            top_k: top_k.unwrap_or(rag.search.top_k),
            min_similarity: min_similarity.unwrap_or(rag.search.min_similarity),
            file_filters,
        };
        query
            .validate()
            .map_err(|e| DispatchError::InvalidParams(format!("{tool}: {e}")))?;

        let vector = rag
            .pipeline
            .embed_query(query_text)
            .await
            .map_err(|e| DispatchError::tool_failed(tool, e))?;
        rag.pipeline
            .store()
            .search(&query, &vector)
            .await
            .map_err(|e| DispatchError::tool_failed(tool, e))
    }

    async fn rag_search(&self, args: RagSearchArgs) -> Result<Value, DispatchError> {
        let results = self
            .retrieve(
                "rag_search",
                &args.query,
                args.top_k,
                args.min_similarity,
                args.file_filters,
            )
            .await?;
        let results: Vec<Value> = results
            .iter()
            .map(|r| {
                json!({
                    "path": r.chunk.document_path,
                    "ordinal": r.chunk.ordinal,
                    "similarity": r.similarity,
                    "text": r.chunk.text,
                })
            })
            .collect();
        Ok(json!({ "query": args.query, "results": results }))
    }

    async fn rag_ask(&self, args: RagAskArgs) -> Result<Value, DispatchError> {
        let results = self
            .retrieve(
                "rag_ask",
                &args.question,
                args.top_k,
                args.min_similarity,
                args.file_filters,
            )
            .await?;

        if results.is_empty() {
            return Ok(json!({
                "answer": "No indexed content is similar enough to the question to answer it.",
                "sources": [],
            }));
        }

        let context = results
            .iter()
            .map(|r| {
                format!(
                    "[{} #{}]\n{}",
                    r.chunk.document_path, r.chunk.ordinal, r.chunk.text
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n");
        let (answer, meta) = self
            .generate("rag_ask", &args.question, Some(&context), args.temperature)
            .await?;

        let sources: Vec<Value> = results
            .iter()
            .map(|r| {
                json!({
                    "path": r.chunk.document_path,
                    "ordinal": r.chunk.ordinal,
                    "similarity": r.similarity,
                })
            })
            .collect();
        Ok(json!({ "answer": answer, "sources": sources, "ai": meta }))
    }

    /// Run the pipeline over the root. Only one reindex runs at a time; a
    /// second request while one is in flight is refused.
    pub async fn reindex(&self, mode: IndexMode) -> Result<IndexingResult, DispatchError> {
        const TOOL: &str = "reindex_documents";
        let rag = self.rag(TOOL)?;
        let Ok(_guard) = self.reindex_lock.try_lock() else {
            return Err(DispatchError::tool_failed(
                TOOL,
                "a reindex is already in progress",
            ));
        };

        let result = rag
            .pipeline
            .run(&self.root, mode, &self.shutdown.child_token())
            .await
            .map_err(|e| DispatchError::tool_failed(TOOL, e))?;
        self.set_last_report(result.clone());
        Ok(result)
    }

    async fn indexing_report(&self) -> Result<Value, DispatchError> {
        const TOOL: &str = "indexing_report";
        let store = self.rag(TOOL)?.pipeline.store();
        let chunk_count = store
            .chunk_count()
            .await
            .map_err(|e| DispatchError::tool_failed(TOOL, e))?;
        let indexed_files = store
            .indexed_files()
            .await
            .map_err(|e| DispatchError::tool_failed(TOOL, e))?;

        Ok(json!({
            "lastRun": self.last_report().map(|r| r.summary()),
            "chunkCount": chunk_count,
            "indexedFileCount": indexed_files.len(),
        }))
    }
}

// ── Helpers ──────────────────────────────────────────────────────────

fn file_uri(path: &Path) -> String {
    format!("file://{}", path.to_string_lossy().replace('\\', "/"))
}

fn extract_error(uri: &str, e: ExtractError) -> DispatchError {
    match e {
        ExtractError::FileNotFound(_) => DispatchError::ResourceNotFound(uri.to_string()),
        other => DispatchError::Internal(other.to_string()),
    }
}

/// Byte offset of the first case-insensitive occurrence of `needle`.
fn find_case_insensitive(haystack: &str, needle: &str) -> Option<usize> {
    let needle: Vec<char> = needle.chars().flat_map(char::to_lowercase).collect();
    if needle.is_empty() {
        return None;
    }
    haystack.char_indices().map(|(i, _)| i).find(|&i| {
        let mut rest = haystack[i..].chars().flat_map(char::to_lowercase);
        needle.iter().all(|c| rest.next() == Some(*c))
    })
}

fn snippet_around(text: &str, at: usize) -> String {
    let before: String = text[..at]
        .chars()
        .rev()
        .take(SNIPPET_BEFORE)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    let after: String = text[at..].chars().take(SNIPPET_AFTER).collect();
    format!("{before}{after}")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// First `max` characters of `text`, and whether anything was cut.
fn truncate_chars(text: &str, max: usize) -> (&str, bool) {
    match text.char_indices().nth(max) {
        Some((byte, _)) => (&text[..byte], true),
        None => (text, false),
    }
}
