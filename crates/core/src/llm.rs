use crate::config::{ollama_base_url, LlmConfig};
use crate::error::ModelError;
use crate::traits::LanguageModel;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
    #[serde(default)]
    error: Option<String>,
}

/// Client for a local Ollama server (`POST /api/generate`, non-streaming).
/// The underlying connection pool is reused across calls.
pub struct OllamaClient {
    endpoint: String,
    model: String,
    client: Client,
}

impl OllamaClient {
    pub fn new(base_url: &str, model: impl Into<String>) -> Result<Self, ModelError> {
        let endpoint = ollama_base_url(base_url)?.join("api/generate")?.to_string();
        Ok(Self {
            endpoint,
            model: model.into(),
            client: Client::new(),
        })
    }

    pub fn from_config(config: &LlmConfig) -> Result<Self, ModelError> {
        Self::new(&config.base_url, config.model.clone())
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl LanguageModel for OllamaClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str) -> Result<String, ModelError> {
        debug!(model = %self.model, prompt_chars = prompt.len(), "calling ollama generate");
        let response = self
            .client
            .post(&self.endpoint)
            .json(&GenerateRequest {
                model: &self.model,
                prompt,
                stream: false,
            })
            .send()
            .await
            .map_err(|error| ModelError::Unavailable {
                service: "ollama".to_string(),
                endpoint: self.endpoint.clone(),
                details: error.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::BackendResponse {
                backend: "ollama".to_string(),
                details: format!("{status}: {}", parse_error_body(&body)),
            });
        }

        let payload: GenerateResponse = response.json().await?;
        if let Some(error) = payload.error {
            return Err(ModelError::BackendResponse {
                backend: "ollama".to_string(),
                details: error,
            });
        }
        Ok(payload.response)
    }
}

fn parse_error_body(body: &str) -> String {
    serde_json::from_str::<GenerateResponse>(body)
        .ok()
        .and_then(|parsed| parsed.error)
        .unwrap_or_else(|| body.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_is_derived_from_base_url() {
        let client = OllamaClient::new("http://localhost:11434/", "llama3").expect("valid url");
        assert_eq!(client.endpoint(), "http://localhost:11434/api/generate");
        assert_eq!(client.model_name(), "llama3");
    }

    #[test]
    fn invalid_base_url_is_rejected() {
        assert!(matches!(OllamaClient::new("local host:11434", "llama3"), Err(ModelError::Url(_))));
    }

    #[test]
    fn ollama_host_forms_build_a_client() {
        let client = OllamaClient::new("0.0.0.0:11434", "llama3").expect("host:port form");
        assert_eq!(client.endpoint(), "http://0.0.0.0:11434/api/generate");

        let client = OllamaClient::new("http://gpu.internal/ollama", "llama3").expect("prefixed base");
        assert_eq!(client.endpoint(), "http://gpu.internal/ollama/api/generate");
    }

    #[test]
    fn ollama_error_body_is_unwrapped() {
        assert_eq!(
            parse_error_body(r#"{"error":"model \"llama3\" not found, try pulling it first"}"#),
            "model \"llama3\" not found, try pulling it first"
        );
        assert_eq!(parse_error_body("  bad gateway "), "bad gateway");
    }

    #[tokio::test]
    async fn unreachable_service_is_reported_as_unavailable() {
        let client = OllamaClient::new("http://127.0.0.1:9", "llama3").expect("valid url");
        let error = client.generate("hello").await.expect_err("nothing listens on port 9");
        assert!(matches!(error, ModelError::Unavailable { .. }));
        assert!(error.hint().is_some());
    }
}
