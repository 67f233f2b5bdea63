//! What one indexing run did, and its condensed summary.
use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::skip::SkipReason;

/// Files named in a summary sample, per list.
pub const SAMPLE_LIMIT: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexMode {
    /// Skip files whose content hash matches the stored document.
    Incremental,
    /// Clear the index and process everything.
    Full,
}

/// Pipeline step a file failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureStage {
    Extraction,
    Embedding,
    Storage,
}

impl FailureStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Extraction => "extraction",
            Self::Embedding => "embedding",
            Self::Storage => "storage",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedFile {
    pub path: String,
    pub extension: String,
    pub size_bytes: u64,
    pub category: &'static str,
    pub reason: String,
}

impl SkippedFile {
    pub fn new(path: String, extension: String, size_bytes: u64, reason: &SkipReason) -> Self {
        Self {
            path,
            extension,
            size_bytes,
            category: reason.category(),
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedFile {
    pub path: String,
    pub stage: FailureStage,
    pub error: String,
    pub extractor: Option<String>,
}

/// Full record of one run. Paths are relative to the indexed root.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexingResult {
    pub mode: IndexMode,
    pub indexed_files: Vec<String>,
    pub skipped_files: Vec<SkippedFile>,
    pub failed_files: Vec<FailedFile>,
    pub removed_files: Vec<String>,
    /// Chunks written during this run.
    pub total_chunks: usize,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexingSummary {
    pub mode: IndexMode,
    pub indexed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub removed: usize,
    pub total_chunks: usize,
    pub skipped_by_reason: BTreeMap<String, usize>,
    pub failed_by_stage: BTreeMap<String, usize>,
    pub indexed_by_extension: BTreeMap<String, usize>,
    pub failed_sample: Vec<String>,
    pub skipped_sample: Vec<String>,
    pub duration_ms: i64,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl IndexingResult {
    pub fn duration_ms(&self) -> i64 {
        (self.completed_at - self.started_at).num_milliseconds()
    }

    pub fn summary(&self) -> IndexingSummary {
        let mut skipped_by_reason = BTreeMap::new();
        for s in &self.skipped_files {
            *skipped_by_reason.entry(s.category.to_string()).or_insert(0) += 1;
        }

        let mut failed_by_stage = BTreeMap::new();
        for f in &self.failed_files {
            *failed_by_stage
                .entry(f.stage.as_str().to_string())
                .or_insert(0) += 1;
        }

        let mut indexed_by_extension = BTreeMap::new();
        for path in &self.indexed_files {
            let ext = crate::extract::extension_of(std::path::Path::new(path))
                .unwrap_or_else(|| "(none)".to_string());
            *indexed_by_extension.entry(ext).or_insert(0) += 1;
        }

        // Unchanged files are routine; sample the interesting skips first
        let skipped_sample: Vec<String> = self
            .skipped_files
            .iter()
            .filter(|s| s.category != "unchanged")
            .chain(self.skipped_files.iter().filter(|s| s.category == "unchanged"))
            .take(SAMPLE_LIMIT)
            .map(|s| format!("{} ({})", s.path, s.reason))
            .collect();

        IndexingSummary {
            mode: self.mode,
            indexed: self.indexed_files.len(),
            skipped: self.skipped_files.len(),
            failed: self.failed_files.len(),
            removed: self.removed_files.len(),
            total_chunks: self.total_chunks,
            skipped_by_reason,
            failed_by_stage,
            indexed_by_extension,
            failed_sample: self
                .failed_files
                .iter()
                .take(SAMPLE_LIMIT)
                .map(|f| format!("{} ({}: {})", f.path, f.stage.as_str(), f.error))
                .collect(),
            skipped_sample,
            duration_ms: self.duration_ms(),
            started_at: self.started_at,
            completed_at: self.completed_at,
        }
    }
}

impl fmt::Display for IndexingSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:?} index: {} indexed, {} skipped, {} failed, {} removed, {} chunks in {}ms",
            self.mode,
            self.indexed,
            self.skipped,
            self.failed,
            self.removed,
            self.total_chunks,
            self.duration_ms
        )?;
        for (ext, n) in &self.indexed_by_extension {
            writeln!(f, "  indexed {ext}: {n}")?;
        }
        for (reason, n) in &self.skipped_by_reason {
            writeln!(f, "  skipped {reason}: {n}")?;
        }
        for (stage, n) in &self.failed_by_stage {
            writeln!(f, "  failed during {stage}: {n}")?;
        }
        for line in &self.failed_sample {
            writeln!(f, "  ! {line}")?;
        }
        if self.failed > self.failed_sample.len() {
            writeln!(
                f,
                "  ... and {} more failures",
                self.failed - self.failed_sample.len()
            )?;
        }
        Ok(())
    }
}
