//! OpenAI adapters for the summary and speech seams.
//!
//! Summaries go through `/v1/chat/completions`, speech through
//! `/v1/audio/speech`. Failures are classified from the HTTP status and the
//! JSON error body; the "rate limit" substring check only kicks in when the
//! status and error code say nothing useful.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use super::provider::{ProviderFactory, SpeechClient, SummaryClient, SummaryConstraints};
use crate::config::Config;
use crate::error::ProviderError;

const SUMMARY_PROMPT: &str = "Summarize the following text so it can be read aloud. \
Keep the key points and the original language, write in plain flowing sentences, \
and output only the summary.";

/// Shared HTTP settings for both adapters.
#[derive(Clone)]
pub struct OpenAiClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl OpenAiClient {
    /// Build the shared connection pool used by every request.
    pub fn http_client(timeout: Duration) -> Result<Client, reqwest::Error> {
        Client::builder().timeout(timeout).build()
    }

    pub fn new(client: Client, base_url: &str, api_key: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }

    async fn post(&self, path: &str, body: &serde_json::Value) -> Result<Response, ProviderError> {
        let url = format!("{}{path}", self.base_url);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    warn!("Cannot connect to provider at {}", self.base_url);
                } else if e.is_timeout() {
                    warn!("Provider request to {path} timed out");
                }
                ProviderError::Transport {
                    message: e.to_string(),
                }
            })?;

        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        Err(classify_failure(status, &body))
    }
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    code: Option<String>,
}

/// Map a non-success provider response onto `ProviderError`.
pub fn classify_failure(status: StatusCode, body: &str) -> ProviderError {
    let Ok(ErrorEnvelope { error }) = serde_json::from_str::<ErrorEnvelope>(body) else {
        return ProviderError::Transport {
            message: format!("HTTP {status} with non-JSON body"),
        };
    };

    let code = error.code.as_deref().or(error.kind.as_deref()).unwrap_or("");
    let message = error.message;

    if code == "insufficient_quota" || status == StatusCode::PAYMENT_REQUIRED {
        return ProviderError::Quota { message };
    }
    if status == StatusCode::UNAUTHORIZED || code == "invalid_api_key" {
        return ProviderError::Auth { message };
    }
    if status == StatusCode::TOO_MANY_REQUESTS || code == "rate_limit_exceeded" {
        return ProviderError::RateLimited { message };
    }
    // Fallback heuristic for gateways that rewrite the status.
    if message.to_ascii_lowercase().contains("rate limit") {
        return ProviderError::RateLimited { message };
    }
    ProviderError::Api {
        status: status.as_u16(),
        message,
    }
}

pub struct OpenAiSummarizer {
    api: OpenAiClient,
    model: String,
}

impl OpenAiSummarizer {
    pub fn new(api: OpenAiClient, model: &str) -> Self {
        Self {
            api,
            model: model.to_string(),
        }
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[async_trait]
impl SummaryClient for OpenAiSummarizer {
    async fn summarize(
        &self,
        text: &str,
        constraints: SummaryConstraints,
    ) -> Result<String, ProviderError> {
        let body = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": SUMMARY_PROMPT },
                { "role": "user", "content": text }
            ],
            "max_tokens": constraints.max_output_tokens,
            "temperature": 0.3
        });

        let resp = self.api.post("/v1/chat/completions", &body).await?;
        let data: ChatResponse = resp.json().await.map_err(|e| ProviderError::Transport {
            message: format!("Failed to parse summary response: {e}"),
        })?;

        let summary = data
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|s| s.trim().to_string())
            .unwrap_or_default();
        if summary.is_empty() {
            warn!("Summarizer returned empty response");
            return Err(ProviderError::EmptyResponse);
        }
        debug!("Summary output: {} chars", summary.chars().count());
        Ok(summary)
    }

    fn model(&self) -> &str {
        &self.model
    }
}

pub struct OpenAiSpeech {
    api: OpenAiClient,
    model: String,
    voice: String,
    format: String,
}

impl OpenAiSpeech {
    pub fn new(api: OpenAiClient, config: &Config) -> Self {
        Self {
            api,
            model: config.speech.model.clone(),
            voice: config.speech.voice.clone(),
            format: config.speech.format.clone(),
        }
    }
}

#[async_trait]
impl SpeechClient for OpenAiSpeech {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, ProviderError> {
        let body = json!({
            "model": self.model,
            "voice": self.voice,
            "input": text,
            "response_format": self.format
        });

        let resp = self.api.post("/v1/audio/speech", &body).await?;
        let audio = resp.bytes().await.map_err(|e| ProviderError::Transport {
            message: format!("Failed to read audio: {e}"),
        })?;
        if audio.is_empty() {
            return Err(ProviderError::EmptyResponse);
        }
        debug!("Synthesized {} chars → {} bytes", text.chars().count(), audio.len());
        Ok(audio.to_vec())
    }
}

/// Production factory: one pooled `reqwest::Client`, fresh adapters per credential.
pub struct OpenAiProviders {
    client: Client,
    config: Arc<Config>,
}

impl OpenAiProviders {
    pub fn new(client: Client, config: Arc<Config>) -> Self {
        Self { client, config }
    }

    fn api(&self, api_key: &str) -> OpenAiClient {
        OpenAiClient::new(self.client.clone(), &self.config.provider.base_url, api_key)
    }
}

impl ProviderFactory for OpenAiProviders {
    fn speech(&self, api_key: &str) -> Arc<dyn SpeechClient> {
        Arc::new(OpenAiSpeech::new(self.api(api_key), &self.config))
    }

    fn summary(&self, api_key: &str) -> Arc<dyn SummaryClient> {
        Arc::new(OpenAiSummarizer::new(
            self.api(api_key),
            &self.config.summary.model,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(message: &str, kind: &str, code: Option<&str>) -> String {
        json!({ "error": { "message": message, "type": kind, "code": code } }).to_string()
    }

    #[test]
    fn test_429_is_rate_limited() {
        let error = classify_failure(
            StatusCode::TOO_MANY_REQUESTS,
            &body("Rate limit reached for tts-1", "requests", Some("rate_limit_exceeded")),
        );
        assert!(error.is_rate_limited());
    }

    #[test]
    fn test_insufficient_quota_is_not_retried() {
        let error = classify_failure(
            StatusCode::TOO_MANY_REQUESTS,
            &body("You exceeded your current quota", "insufficient_quota", Some("insufficient_quota")),
        );
        assert!(matches!(error, ProviderError::Quota { .. }));
        assert!(!error.is_rate_limited());
    }

    #[test]
    fn test_401_is_auth() {
        let error = classify_failure(
            StatusCode::UNAUTHORIZED,
            &body("Incorrect API key provided", "invalid_request_error", Some("invalid_api_key")),
        );
        assert!(matches!(error, ProviderError::Auth { .. }));
    }

    #[test]
    fn test_message_fallback_detects_rate_limit() {
        let error = classify_failure(
            StatusCode::BAD_GATEWAY,
            &body("Upstream says: Rate limit exceeded", "server_error", None),
        );
        assert!(error.is_rate_limited());
    }

    #[test]
    fn test_other_status_is_api_error() {
        let error = classify_failure(
            StatusCode::BAD_REQUEST,
            &body("input too long", "invalid_request_error", None),
        );
        assert_eq!(
            error,
            ProviderError::Api {
                status: 400,
                message: "input too long".into()
            }
        );
    }

    #[test]
    fn test_non_json_body_is_transport_error() {
        let error = classify_failure(StatusCode::BAD_GATEWAY, "<html>bad gateway</html>");
        assert!(matches!(error, ProviderError::Transport { .. }));
    }

    #[test]
    fn test_base_url_trailing_slash_is_trimmed() {
        let client = OpenAiClient::new(Client::new(), "http://localhost:9000/", "sk");
        assert_eq!(client.base_url, "http://localhost:9000");
    }
}
