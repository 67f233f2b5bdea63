//! Text extraction collaborators.
//!
//! An [`ExtractorSet`] is an ordered list of [`Extractor`]s; the first one
//! whose [`can_handle`](Extractor::can_handle) accepts a path wins. An empty
//! string from `extract_text` means "no content", not failure.
pub mod html;
pub mod pdf;
pub mod text;

use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{format} parse error in {path}: {message}")]
    Format {
        format: &'static str,
        path: String,
        message: String,
    },

    #[error("extraction task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl ExtractError {
    pub(crate) fn from_io(path: &Path, source: std::io::Error) -> Self {
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

#[async_trait]
pub trait Extractor: Send + Sync {
    /// Short identifier recorded with indexed documents and failures.
    fn name(&self) -> &'static str;

    fn can_handle(&self, path: &Path) -> bool;

    fn mime_type(&self, path: &Path) -> &'static str;

    async fn extract_text(&self, path: &Path) -> Result<String, ExtractError>;
}

/// Lowercased extension without the dot, if any.
pub fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

/// Ordered extractor lookup.
#[derive(Clone)]
pub struct ExtractorSet {
    extractors: Vec<Arc<dyn Extractor>>,
}

impl ExtractorSet {
    pub fn new(extractors: Vec<Arc<dyn Extractor>>) -> Self {
        Self { extractors }
    }

    /// HTML, PDF, then plain text.
    pub fn with_defaults() -> Self {
        Self::new(vec![
            Arc::new(html::HtmlExtractor),
            Arc::new(pdf::PdfExtractor),
            Arc::new(text::PlainTextExtractor),
        ])
    }

    /// First extractor able to handle `path`.
    pub fn find(&self, path: &Path) -> Option<&dyn Extractor> {
        self.extractors
            .iter()
            .find(|e| e.can_handle(path))
            .map(|e| e.as_ref())
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.extractors.iter().map(|e| e.name()).collect()
    }
}

impl Default for ExtractorSet {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Always;

    #[async_trait]
    impl Extractor for Always {
        fn name(&self) -> &'static str {
            "always"
        }
        fn can_handle(&self, _path: &Path) -> bool {
            true
        }
        fn mime_type(&self, _path: &Path) -> &'static str {
            "application/octet-stream"
        }
        async fn extract_text(&self, _path: &Path) -> Result<String, ExtractError> {
            Ok(String::new())
        }
    }

    #[test]
    fn test_first_capable_extractor_wins() {
        let set = ExtractorSet::with_defaults();
        assert_eq!(set.find(Path::new("a/b.html")).unwrap().name(), "html");
        assert_eq!(set.find(Path::new("a/b.PDF")).unwrap().name(), "pdf");
        assert_eq!(set.find(Path::new("notes.md")).unwrap().name(), "plain-text");
        assert!(set.find(Path::new("photo.png")).is_none());
        assert!(set.find(Path::new("Makefile")).is_none());

        let fallback = ExtractorSet::new(vec![Arc::new(text::PlainTextExtractor), Arc::new(Always)]);
        assert_eq!(fallback.find(Path::new("x.txt")).unwrap().name(), "plain-text");
        assert_eq!(fallback.find(Path::new("x.bin")).unwrap().name(), "always");
    }

    #[test]
    fn test_extension_of() {
        assert_eq!(extension_of(Path::new("A.TXT")).as_deref(), Some("txt"));
        assert_eq!(extension_of(Path::new("README")), None);
    }
}
