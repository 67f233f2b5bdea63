/// HTML pages reduced to their visible text.
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use scraper::Html;

use super::{ExtractError, Extractor, extension_of};

/// Elements whose text never reaches a reader.
const INVISIBLE: &[&str] = &["script", "style", "noscript", "template"];

pub struct HtmlExtractor;

/// Visible text nodes of `source`, one per line.
pub fn html_to_text(source: &str) -> String {
    let document = Html::parse_document(source);
    let mut lines = Vec::new();

    for node in document.tree.root().descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node.ancestors().any(|a| {
            a.value()
                .as_element()
                .is_some_and(|el| INVISIBLE.contains(&el.name()))
        });
        if hidden {
            continue;
        }
        let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
        if !collapsed.is_empty() {
            lines.push(collapsed);
        }
    }

    lines.join("\n")
}

#[async_trait]
impl Extractor for HtmlExtractor {
    fn name(&self) -> &'static str {
        "html"
    }

    fn can_handle(&self, path: &Path) -> bool {
        matches!(extension_of(path).as_deref(), Some("html" | "htm" | "xhtml"))
    }

    fn mime_type(&self, _path: &Path) -> &'static str {
        "text/html"
    }

    async fn extract_text(&self, path: &Path) -> Result<String, ExtractError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| ExtractError::from_io(path, e))?;

        let owned: PathBuf = path.to_path_buf();
        let text = tokio::task::spawn_blocking(move || {
            let source = String::from_utf8_lossy(&bytes);
            tracing::debug!(path = %owned.display(), "parsing html");
            html_to_text(&source)
        })
        .await?;
        Ok(text)
    }
}
