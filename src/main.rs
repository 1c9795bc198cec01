//! speech-relay: rate-limited text-to-speech relay with optional summarization.

mod config;
mod error;
mod relay;

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use relay::api::{self, RelayState};
use relay::openai::{OpenAiClient, OpenAiProviders};
use relay::progress::ProgressTracker;
use relay::scheduler::RateScheduler;

#[derive(Parser, Debug)]
#[command(name = "speech-relay", about = "Text-to-speech relay server")]
struct Args {
    /// Path to config.yaml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listening port (overrides config and SPEECH_RELAY_PORT)
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable verbose (debug) logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // RUST_LOG wins; otherwise keep hyper/reqwest internals quiet
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if args.verbose {
            EnvFilter::new("debug,hyper=info,reqwest=info")
        } else {
            EnvFilter::new("info,hyper=warn,reqwest=warn")
        }
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("speech-relay starting");

    let mut config = config::Config::load(args.config.as_deref());
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if config.provider.api_key.is_empty() {
        warn!("No API key configured; each request must supply apiKey");
    }
    info!(
        "Speech: {} ({}), summary: {}, segments up to {} chars",
        config.speech.model,
        config.speech.voice,
        config.summary.model,
        config.speech.max_segment_chars
    );
    let config = Arc::new(config);

    let progress = ProgressTracker::new();
    let scheduler = Arc::new(RateScheduler::from_config(
        &config.scheduler,
        progress.clone(),
    ));
    let http = OpenAiClient::http_client(Duration::from_secs(config.provider.timeout_secs))?;

    let state = RelayState {
        config: config.clone(),
        scheduler: scheduler.clone(),
        progress,
        providers: Arc::new(OpenAiProviders::new(http, config.clone())),
    };

    let listener = api::bind_with_fallback(&config.server).await?;
    info!("speech-relay listening on http://{}", listener.local_addr()?);

    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    scheduler.shutdown();
    info!("speech-relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}
