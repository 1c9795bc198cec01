//! Relay: rate-limited text-to-speech conversion over HTTP.
//!
//! Components:
//! - `segmenter`: split normalized text into provider-sized segments
//! - `scheduler`: quota-aware admission with fixed-delay rate-limit retry
//! - `progress`: live status record of the current job
//! - `pipeline`: summarize → segment → dispatch → assemble for one request
//! - `provider`: summary/speech client traits
//! - `openai`: reqwest adapters for the OpenAI endpoints
//! - `api`: axum HTTP server

pub mod api;
pub mod openai;
pub mod pipeline;
pub mod progress;
pub mod provider;
pub mod scheduler;
pub mod segmenter;
