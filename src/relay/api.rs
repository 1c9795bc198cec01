//! HTTP API for the relay.
//!
//! - `POST /convert` (also `/text-to-speech`, `/api/tts`): text in, audio out
//! - `GET /status`: snapshot of the current job
//! - `GET /config`: effective limits for client display
//! - `GET /`: the bundled client page

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use super::pipeline::{JobPipeline, PipelineSettings};
use super::progress::{JobPhase, JobStatus, ProgressTracker};
use super::provider::ProviderFactory;
use super::scheduler::RateScheduler;
use super::segmenter;
use crate::config::{Config, ServerConfig};
use crate::error::RelayError;

const INDEX_HTML: &str = include_str!("../../static/index.html");

#[derive(Clone)]
pub struct RelayState {
    pub config: Arc<Config>,
    pub scheduler: Arc<RateScheduler>,
    pub progress: ProgressTracker,
    pub providers: Arc<dyn ProviderFactory>,
}

// --- Request/Response types ---

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConvertRequest {
    #[serde(default)]
    text: String,
    #[serde(default)]
    use_summary: bool,
    #[serde(default)]
    api_key: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ConfigResponse {
    max_input_length: usize,
    max_output_tokens: u32,
    max_segment_length: usize,
    model: String,
    speech_model: String,
    voice: String,
    max_concurrent: usize,
    refill_interval_secs: u64,
    input_cost_per_million: f64,
    output_cost_per_million: f64,
}

/// Build the axum router.
pub fn router(state: RelayState) -> Router {
    Router::new()
        .route("/", get(handle_index))
        .route("/status", get(handle_status))
        .route("/config", get(handle_config))
        .route("/convert", post(handle_convert))
        .route("/text-to-speech", post(handle_convert))
        .route("/api/tts", post(handle_convert))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind `host:port`, moving up one port at a time while the address is taken.
pub async fn bind_with_fallback(server: &ServerConfig) -> std::io::Result<TcpListener> {
    let mut last_err = None;
    for offset in 0..server.port_attempts.max(1) {
        let Some(port) = server.port.checked_add(offset) else {
            break;
        };
        let addr = format!("{}:{port}", server.host);
        match TcpListener::bind(&addr).await {
            Ok(listener) => {
                if offset > 0 {
                    info!("Port {} was busy, using {port}", server.port);
                }
                return Ok(listener);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                warn!("{addr} in use, trying next port");
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::AddrInUse, "no free port in range")
    }))
}

/// MIME type for a provider `response_format`.
fn audio_content_type(format: &str) -> &'static str {
    match format {
        "opus" => "audio/ogg",
        "aac" => "audio/aac",
        "flac" => "audio/flac",
        "wav" => "audio/wav",
        "pcm" => "audio/pcm",
        _ => "audio/mpeg",
    }
}

// --- Handlers ---

async fn handle_index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn handle_status(State(state): State<RelayState>) -> Json<JobStatus> {
    Json(state.progress.snapshot())
}

async fn handle_config(State(state): State<RelayState>) -> Json<ConfigResponse> {
    let config = &state.config;
    Json(ConfigResponse {
        max_input_length: config.summary.max_input_chars,
        max_output_tokens: config.summary.max_output_tokens,
        max_segment_length: config.speech.max_segment_chars,
        model: config.summary.model.clone(),
        speech_model: config.speech.model.clone(),
        voice: config.speech.voice.clone(),
        max_concurrent: config.scheduler.max_concurrent,
        refill_interval_secs: config.scheduler.refill_interval_secs,
        input_cost_per_million: config.summary.input_cost_per_million,
        output_cost_per_million: config.summary.output_cost_per_million,
    })
}

async fn handle_convert(
    State(state): State<RelayState>,
    payload: Result<Json<ConvertRequest>, JsonRejection>,
) -> Result<Response, RelayError> {
    let Json(ConvertRequest {
        text,
        use_summary,
        api_key,
    }) = payload.map_err(|rejection| {
        warn!("Rejected convert request: {}", rejection.body_text());
        RelayError::InvalidRequest(rejection.body_text())
    })?;
    let first_phase = if use_summary {
        JobPhase::Summarizing
    } else {
        JobPhase::Segmenting
    };
    let job = state.progress.begin_job(first_phase);

    let api_key = api_key
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
        .unwrap_or_else(|| state.config.provider.api_key.clone());
    let precheck = if segmenter::normalize(&text).is_empty() {
        Some(RelayError::EmptyInput)
    } else if api_key.is_empty() {
        Some(RelayError::MissingCredential)
    } else {
        None
    };
    if let Some(e) = precheck {
        job.fail(&e);
        return Err(e);
    }

    let pipeline = JobPipeline::new(
        state.providers.speech(&api_key),
        state.providers.summary(&api_key),
        state.scheduler.clone(),
        PipelineSettings::from_config(&state.config),
    );

    // Run detached so a dropped connection does not abort in-flight segments.
    let run = tokio::spawn(async move { pipeline.run(&job, &text, use_summary).await });
    let audio = run
        .await
        .map_err(|e| RelayError::Internal(format!("conversion task failed: {e}")))??;

    let content_type = audio_content_type(&state.config.speech.format);
    Ok(([(CONTENT_TYPE, content_type)], audio).into_response())
}
