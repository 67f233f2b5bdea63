/// Plain text, markup and source files read as UTF-8.
use std::path::Path;

use async_trait::async_trait;

use super::{ExtractError, Extractor, extension_of};

const TEXT_EXTENSIONS: &[&str] = &[
    "txt", "text", "md", "markdown", "rst", "adoc", "org", "tex", "log", "csv", "tsv", "json",
    "jsonl", "yaml", "yml", "toml", "ini", "cfg", "conf", "xml", "rs", "py", "js", "ts", "tsx",
    "jsx", "go", "java", "kt", "c", "h", "cpp", "hpp", "cc", "cs", "rb", "php", "swift", "sh",
    "bash", "ps1", "sql", "css", "scss", "lua", "r",
];

pub struct PlainTextExtractor;

#[async_trait]
impl Extractor for PlainTextExtractor {
    fn name(&self) -> &'static str {
        "plain-text"
    }

    fn can_handle(&self, path: &Path) -> bool {
        extension_of(path).is_some_and(|ext| TEXT_EXTENSIONS.contains(&ext.as_str()))
    }

    fn mime_type(&self, path: &Path) -> &'static str {
        match extension_of(path).as_deref() {
            Some("md" | "markdown") => "text/markdown",
            Some("csv") => "text/csv",
            Some("tsv") => "text/tab-separated-values",
            Some("json" | "jsonl") => "application/json",
            Some("xml") => "application/xml",
            Some("yaml" | "yml") => "application/yaml",
            Some("toml") => "application/toml",
            Some("css" | "scss") => "text/css",
            Some("js" | "jsx") => "text/javascript",
            _ => "text/plain",
        }
    }

    async fn extract_text(&self, path: &Path) -> Result<String, ExtractError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| ExtractError::from_io(path, e))?;

        let text = match String::from_utf8(bytes) {
            Ok(s) => s,
            Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
        };
        Ok(text.trim_start_matches('\u{feff}').to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_extract_text() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("readme.txt");
        fs::write(&path, "\u{feff}hello world").unwrap();

        let text = PlainTextExtractor.extract_text(&path).await.unwrap();
        assert_eq!(text, "hello world");
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_lossy() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("latin1.txt");
        fs::write(&path, [b'c', b'a', b'f', 0xe9]).unwrap();

        let text = PlainTextExtractor.extract_text(&path).await.unwrap();
        assert!(text.starts_with("caf"));
    }

    #[tokio::test]
    async fn test_missing_file() {
        let err = PlainTextExtractor
            .extract_text(Path::new("/no/such/file.txt"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::FileNotFound(_)));
    }

    #[test]
    fn test_mime_types() {
        let e = PlainTextExtractor;
        assert_eq!(e.mime_type(Path::new("a.md")), "text/markdown");
        assert_eq!(e.mime_type(Path::new("a.json")), "application/json");
        assert_eq!(e.mime_type(Path::new("a.rs")), "text/plain");
        assert!(e.can_handle(Path::new("main.RS")));
        assert!(!e.can_handle(Path::new("app.exe")));
    }
}
