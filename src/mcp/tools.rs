/// Tool catalogue and typed arguments.
///
/// Arguments are parsed once into a [`ToolCall`] at the dispatcher boundary;
/// tool implementations only ever see validated, typed values.
use schemars::{JsonSchema, schema_for};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::DispatchError;

pub const SEARCH_FILES: &str = "search_files";
pub const ASK_AI: &str = "ask_ai";
pub const ANALYZE_FILE: &str = "analyze_file";
pub const RAG_SEARCH: &str = "rag_search";
pub const RAG_ASK: &str = "rag_ask";
pub const REINDEX_DOCUMENTS: &str = "reindex_documents";
pub const INDEXING_REPORT: &str = "indexing_report";

pub const DEFAULT_MAX_RESULTS: usize = 20;

// ── Parameter structs ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Deserialize, JsonSchema)]
pub struct SearchFilesArgs {
    /// Text matched case-insensitively against file names and contents
    pub query: String,
    /// Max results (default: 20)
    pub max_results: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, JsonSchema)]
pub struct AskAiArgs {
    /// Question or instruction for the model
    pub question: String,
    /// Optional grounding text passed alongside the question
    pub context: Option<String>,
    /// Sampling temperature (default from server configuration)
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisType {
    Summary,
    Keywords,
    Questions,
    Structure,
}

impl AnalysisType {
    pub fn instruction(self) -> &'static str {
        match self {
            Self::Summary => "Summarize the following document in a few short paragraphs.",
            Self::Keywords => {
                "List the ten most important keywords or key phrases of the following document, one per line."
            }
            Self::Questions => "Write five questions that the following document answers.",
            Self::Structure => {
                "Describe the structure of the following document: its sections, their order and what each one covers."
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, JsonSchema)]
pub struct AnalyzeFileArgs {
    /// `file://` URI or path relative to the served root
    pub file_uri: String,
    /// summary | keywords | questions | structure
    pub analysis_type: AnalysisType,
}

#[derive(Debug, Clone, PartialEq, Deserialize, JsonSchema)]
pub struct RagSearchArgs {
    /// Natural language query
    pub query: String,
    /// Max results (default from server configuration)
    pub top_k: Option<usize>,
    /// Minimum cosine similarity, 0.0 to 1.0
    pub min_similarity: Option<f64>,
    /// Only search documents whose path contains one of these substrings
    #[serde(default)]
    pub file_filters: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, JsonSchema)]
pub struct RagAskArgs {
    /// Question answered from the indexed documents
    pub question: String,
    /// Chunks retrieved as context (default from server configuration)
    pub top_k: Option<usize>,
    /// Minimum cosine similarity, 0.0 to 1.0
    pub min_similarity: Option<f64>,
    /// Only use documents whose path contains one of these substrings
    #[serde(default)]
    pub file_filters: Vec<String>,
    /// Sampling temperature (default from server configuration)
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, JsonSchema)]
pub struct ReindexArgs {
    /// Keep unchanged documents instead of clearing the index (default: false)
    #[serde(default)]
    pub incremental: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, JsonSchema)]
pub struct IndexingReportArgs {}

// ── Parsed calls ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum ToolCall {
    SearchFiles(SearchFilesArgs),
    AskAi(AskAiArgs),
    AnalyzeFile(AnalyzeFileArgs),
    RagSearch(RagSearchArgs),
    RagAsk(RagAskArgs),
    ReindexDocuments(ReindexArgs),
    IndexingReport,
}

fn parse_args<T: for<'de> Deserialize<'de>>(tool: &str, arguments: Value) -> Result<T, DispatchError> {
    // Tools without required arguments accept a missing argument object
    let arguments = if arguments.is_null() {
        Value::Object(Default::default())
    } else {
        arguments
    };
    serde_json::from_value(arguments)
        .map_err(|e| DispatchError::InvalidParams(format!("{tool}: {e}")))
}

fn require_text(tool: &str, field: &str, value: &str) -> Result<(), DispatchError> {
    if value.trim().is_empty() {
        return Err(DispatchError::InvalidParams(format!(
            "{tool}: {field} is required"
        )));
    }
    Ok(())
}

fn check_retrieval(
    tool: &str,
    top_k: Option<usize>,
    min_similarity: Option<f64>,
) -> Result<(), DispatchError> {
    if top_k == Some(0) {
        return Err(DispatchError::InvalidParams(format!(
            "{tool}: top_k must be at least 1"
        )));
    }
    if let Some(s) = min_similarity {
        if !(0.0..=1.0).contains(&s) {
            return Err(DispatchError::InvalidParams(format!(
                "{tool}: min_similarity must be within 0.0..=1.0"
            )));
        }
    }
    Ok(())
}

impl ToolCall {
    /// Parse and validate `arguments` for the tool called `name`.
    pub fn parse(name: &str, arguments: Value) -> Result<Self, DispatchError> {
        let call = match name {
            SEARCH_FILES => {
                let args: SearchFilesArgs = parse_args(name, arguments)?;
                require_text(name, "query", &args.query)?;
                if args.max_results == Some(0) {
                    return Err(DispatchError::InvalidParams(format!(
                        "{name}: max_results must be at least 1"
                    )));
                }
                Self::SearchFiles(args)
            }
            ASK_AI => {
                let args: AskAiArgs = parse_args(name, arguments)?;
                require_text(name, "question", &args.question)?;
                Self::AskAi(args)
            }
            ANALYZE_FILE => {
                let args: AnalyzeFileArgs = parse_args(name, arguments)?;
                require_text(name, "file_uri", &args.file_uri)?;
                Self::AnalyzeFile(args)
            }
            RAG_SEARCH => {
                let args: RagSearchArgs = parse_args(name, arguments)?;
                require_text(name, "query", &args.query)?;
                check_retrieval(name, args.top_k, args.min_similarity)?;
                Self::RagSearch(args)
            }
            RAG_ASK => {
                let args: RagAskArgs = parse_args(name, arguments)?;
                require_text(name, "question", &args.question)?;
                check_retrieval(name, args.top_k, args.min_similarity)?;
                Self::RagAsk(args)
            }
            REINDEX_DOCUMENTS => Self::ReindexDocuments(parse_args(name, arguments)?),
            INDEXING_REPORT => {
                let _: IndexingReportArgs = parse_args(name, arguments)?;
                Self::IndexingReport
            }
            other => {
                return Err(DispatchError::InvalidParams(format!("unknown tool: {other}")));
            }
        };
        Ok(call)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::SearchFiles(_) => SEARCH_FILES,
            Self::AskAi(_) => ASK_AI,
            Self::AnalyzeFile(_) => ANALYZE_FILE,
            Self::RagSearch(_) => RAG_SEARCH,
            Self::RagAsk(_) => RAG_ASK,
            Self::ReindexDocuments(_) => REINDEX_DOCUMENTS,
            Self::IndexingReport => INDEXING_REPORT,
        }
    }

    /// Needs the vector store, so only exists in retrieval mode.
    pub fn requires_rag(&self) -> bool {
        matches!(
            self,
            Self::RagSearch(_) | Self::RagAsk(_) | Self::ReindexDocuments(_) | Self::IndexingReport
        )
    }
}

// ── Catalogue ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    pub input_schema: Value,
}

fn descriptor<T: JsonSchema>(name: &'static str, description: &'static str) -> ToolDescriptor {
    ToolDescriptor {
        name,
        description,
        input_schema: schema_for!(T).to_value(),
    }
}

/// Tools offered to clients. Retrieval tools only appear when `rag` is set.
pub fn tool_descriptors(rag: bool) -> Vec<ToolDescriptor> {
    let mut tools = vec![
        descriptor::<SearchFilesArgs>(
            SEARCH_FILES,
            "Find files under the served root whose name or text contains the query.",
        ),
        descriptor::<AskAiArgs>(ASK_AI, "Ask the configured AI model a question."),
        descriptor::<AnalyzeFileArgs>(
            ANALYZE_FILE,
            "Summarize a file, list its keywords, suggest questions it answers, or describe its structure.",
        ),
    ];
    if rag {
        tools.extend([
            descriptor::<RagSearchArgs>(
                RAG_SEARCH,
                "Semantic search over indexed document chunks, ordered by similarity.",
            ),
            descriptor::<RagAskArgs>(
                RAG_ASK,
                "Answer a question using the most relevant indexed chunks as context.",
            ),
            descriptor::<ReindexArgs>(
                REINDEX_DOCUMENTS,
                "Rebuild the document index. Clears it first unless incremental is true.",
            ),
            descriptor::<IndexingReportArgs>(
                INDEXING_REPORT,
                "Summary of the most recent indexing run and the current index size.",
            ),
        ]);
    }
    tools
}
