/// PDF text via lopdf, page by page.
use std::path::Path;

use async_trait::async_trait;
use tracing::debug;

use super::{ExtractError, Extractor, extension_of};

pub struct PdfExtractor;

#[async_trait]
impl Extractor for PdfExtractor {
    fn name(&self) -> &'static str {
        "pdf"
    }

    fn can_handle(&self, path: &Path) -> bool {
        extension_of(path).as_deref() == Some("pdf")
    }

    fn mime_type(&self, _path: &Path) -> &'static str {
        "application/pdf"
    }

    async fn extract_text(&self, path: &Path) -> Result<String, ExtractError> {
        if !tokio::fs::try_exists(path)
            .await
            .map_err(|e| ExtractError::from_io(path, e))?
        {
            return Err(ExtractError::FileNotFound(path.display().to_string()));
        }

        let owned = path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let format_err = |message: String| ExtractError::Format {
                format: "pdf",
                path: owned.display().to_string(),
                message,
            };

            let doc = lopdf::Document::load(&owned).map_err(|e| format_err(e.to_string()))?;
            if doc.is_encrypted() {
                return Err(format_err("document is encrypted".to_string()));
            }

            let mut pages = Vec::new();
            for page in doc.get_pages().keys() {
                // One unreadable page should not lose the rest of the document
                match doc.extract_text(&[*page]) {
                    Ok(text) => pages.push(text),
                    Err(e) => debug!(path = %owned.display(), page, "skipping page: {e}"),
                }
            }
            Ok(pages.join("\n"))
        })
        .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_garbage_pdf_is_format_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.pdf");
        fs::write(&path, b"this is not a pdf").unwrap();

        let err = PdfExtractor.extract_text(&path).await.unwrap_err();
        assert!(matches!(err, ExtractError::Format { format: "pdf", .. }));
    }

    #[tokio::test]
    async fn test_missing_pdf() {
        let err = PdfExtractor
            .extract_text(Path::new("/missing/file.pdf"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::FileNotFound(_)));
    }

    #[test]
    fn test_can_handle() {
        assert!(PdfExtractor.can_handle(Path::new("paper.pdf")));
        assert!(!PdfExtractor.can_handle(Path::new("paper.txt")));
    }
}
