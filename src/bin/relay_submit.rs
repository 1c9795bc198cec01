//! relay-submit: send text to a running speech-relay and save the audio.
//!
//! Reads text from a file (or stdin), posts it to `/convert`, and polls
//! `/status` once a second while the conversion runs, printing progress to
//! stderr. On failure the server's error type is mapped to a short hint.

use std::convert::Infallible;
use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use reqwest::Client;
use serde::{Deserialize, Serialize};

#[derive(Parser, Debug)]
#[command(name = "relay-submit", about = "Convert text to speech via speech-relay")]
struct Args {
    /// Text file to convert (reads stdin when omitted or "-")
    input: Option<PathBuf>,

    /// Summarize the text before synthesis
    #[arg(short, long)]
    summary: bool,

    /// API key to send with the request instead of the server's
    #[arg(long)]
    api_key: Option<String>,

    /// Relay base URL
    #[arg(long, default_value = "http://127.0.0.1:3000")]
    server: String,

    /// Where to write the audio
    #[arg(short, long, default_value = "speech.mp3")]
    out: PathBuf,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ConvertRequest {
    text: String,
    use_summary: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    api_key: Option<String>,
}

#[derive(Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    error: String,
    #[serde(default, rename = "type")]
    kind: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    phase: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    total_segments: usize,
    #[serde(default)]
    processed_segments: usize,
    #[serde(default)]
    queued_segments: usize,
    /// `null` until the job starts summarizing.
    #[serde(default)]
    summary_progress: Option<u8>,
}

fn hint_for(kind: &str) -> Option<&'static str> {
    match kind {
        "empty_input" => Some("the input text is empty"),
        "missing_credential" => Some("the server has no API key; pass --api-key"),
        "invalid_request" => Some("the relay could not read the request; check --server"),
        "provider_auth_error" => Some("the API key was rejected"),
        "provider_quota_error" => Some("the provider account is out of quota"),
        "rate_limited" => Some("still rate limited after retrying; wait and try again"),
        "internal_transport_error" => Some("the relay could not reach the provider"),
        "summary_failed" => Some("summarization failed; retry without --summary"),
        "segment_failed" => Some("one segment failed to convert"),
        _ => None,
    }
}

fn read_input(path: Option<&PathBuf>) -> std::io::Result<String> {
    match path {
        Some(p) if p.as_os_str() != "-" => std::fs::read_to_string(p),
        _ => {
            let mut text = String::new();
            std::io::stdin().read_to_string(&mut text)?;
            Ok(text)
        }
    }
}

fn render_status(status: &StatusResponse) -> String {
    let mut line = format!("[{}] {}", status.phase, status.message);
    if status.phase == "summarizing" {
        line.push_str(&format!(" {}%", status.summary_progress.unwrap_or(0)));
    }
    if status.total_segments > 0 {
        line.push_str(&format!(
            " ({}/{} segments",
            status.processed_segments, status.total_segments
        ));
        if status.queued_segments > 0 {
            line.push_str(&format!(", {} queued", status.queued_segments));
        }
        line.push(')');
    }
    line
}

/// Print status changes until the caller stops polling.
async fn poll_status(client: &Client, base: &str) -> Infallible {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let mut last = String::new();
    let mut reported_parse_error = false;
    loop {
        ticker.tick().await;
        let Ok(resp) = client.get(format!("{base}/status")).send().await else {
            continue;
        };
        let status = match resp.json::<StatusResponse>().await {
            Ok(status) => status,
            Err(e) => {
                if !reported_parse_error {
                    eprintln!("Unreadable status reply: {e}");
                    reported_parse_error = true;
                }
                continue;
            }
        };
        let line = render_status(&status);
        if line != last {
            eprintln!("{line}");
            last = line;
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    let text = match read_input(args.input.as_ref()) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("Failed to read input: {e}");
            return ExitCode::FAILURE;
        }
    };

    let base = args.server.trim_end_matches('/').to_string();
    let client = Client::builder()
        .connect_timeout(Duration::from_secs(3))
        .build()
        .unwrap_or_else(|_| Client::new());

    let request = ConvertRequest {
        text,
        use_summary: args.summary,
        api_key: args.api_key,
    };
    let convert = client.post(format!("{base}/convert")).json(&request).send();

    let resp = tokio::select! {
        r = convert => r,
        never = poll_status(&client, &base) => match never {},
    };
    let resp = match resp {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Cannot reach speech-relay at {base}: {e}");
            return ExitCode::FAILURE;
        }
    };

    if !resp.status().is_success() {
        let status = resp.status();
        let err = resp.json::<ErrorResponse>().await.unwrap_or(ErrorResponse {
            error: format!("HTTP {status}"),
            kind: String::new(),
        });
        eprintln!("Conversion failed: {}", err.error);
        if let Some(hint) = hint_for(&err.kind) {
            eprintln!("Hint: {hint}");
        }
        return ExitCode::FAILURE;
    }

    let audio = match resp.bytes().await {
        Ok(b) => b,
        Err(e) => {
            eprintln!("Failed to read audio: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = std::fs::write(&args.out, &audio) {
        eprintln!("Failed to write {}: {e}", args.out.display());
        return ExitCode::FAILURE;
    }
    eprintln!("Wrote {} bytes to {}", audio.len(), args.out.display());
    ExitCode::SUCCESS
}
