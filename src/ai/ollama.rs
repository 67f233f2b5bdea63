/// Ollama text generation over its HTTP API.
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{AiProvider, ProviderError};
use crate::config::ProviderConfig;

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: String,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Serialize)]
struct GenerateOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

pub struct OllamaProvider {
    client: reqwest::Client,
    base_url: String,
    model: String,
    max_tokens: u32,
}

impl OllamaProvider {
    pub fn new(config: &ProviderConfig) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| ProviderError::Configuration(format!("http client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
        })
    }
}

/// Fold optional grounding context into the prompt sent to the model.
pub(crate) fn build_prompt(prompt: &str, context: Option<&str>) -> String {
    match context {
        Some(ctx) if !ctx.trim().is_empty() => {
            format!("Context:\n{ctx}\n\nQuestion:\n{prompt}")
        }
        _ => prompt.to_string(),
    }
}

#[async_trait]
impl AiProvider for OllamaProvider {
    async fn is_available(&self) -> bool {
        let url = format!("{}/api/tags", self.base_url);
        match self.client.get(&url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!("Ollama not reachable at {url}: {e}");
                false
            }
        }
    }

    async fn generate(
        &self,
        prompt: &str,
        context: Option<&str>,
        temperature: f32,
    ) -> Result<String, ProviderError> {
        let body = GenerateRequest {
            model: &self.model,
            prompt: build_prompt(prompt, context),
            stream: false,
            options: GenerateOptions {
                temperature,
                num_predict: self.max_tokens,
            },
        };

        let resp = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(
                status.as_u16(),
                &format!("{} ({}): {text}", self.model, status),
            ));
        }

        let parsed: GenerateResponse = resp.json().await?;
        Ok(parsed.response)
    }

    fn provider_type(&self) -> &str {
        "ollama"
    }

    fn provider_name(&self) -> &str {
        "Ollama"
    }

    fn current_model(&self) -> &str {
        &self.model
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }
}
