use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::StoreError;

/// Per-document attributes written alongside its chunks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentMetadata {
    pub path: String,
    pub content_hash: String,
    pub last_modified: DateTime<Utc>,
    pub size_bytes: u64,
    pub mime_type: String,
    pub extractor: String,
}

/// A stored document row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Document {
    pub path: String,
    pub content_hash: String,
    pub last_modified: DateTime<Utc>,
    pub size_bytes: u64,
    pub mime_type: String,
    pub extractor: String,
    pub indexed_at: DateTime<Utc>,
}

/// A chunk ready to be written: text plus its embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct NewChunk {
    pub ordinal: usize,
    pub text: String,
    pub embedding: Vec<f32>,
}

/// A stored chunk as returned by search. The embedding is not read back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Chunk {
    pub id: i64,
    pub document_path: String,
    pub ordinal: usize,
    pub text: String,
    pub char_count: usize,
}

/// A similarity query against the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RagQuery {
    pub query_text: String,
    pub top_k: usize,
    pub min_similarity: f64,
    /// Substrings matched against document paths; empty means everything.
    #[serde(default)]
    pub file_filters: Vec<String>,
}

impl RagQuery {
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.top_k == 0 {
            return Err(StoreError::InvalidQuery("top_k must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.min_similarity) {
            return Err(StoreError::InvalidQuery(format!(
                "min_similarity {} is outside 0.0..=1.0",
                self.min_similarity
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub chunk: Chunk,
    pub similarity: f64,
}
