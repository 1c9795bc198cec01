//! Live status of the current conversion job.
//!
//! One record is kept per process and polled by `GET /status`. Each run gets
//! a `JobHandle`; writes through a handle whose job has since been replaced
//! are dropped, so a slow superseded job cannot overwrite the newer status.
//! Reads are advisory snapshots with no cross-field guarantee.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::error::RelayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobPhase {
    Idle,
    Summarizing,
    Segmenting,
    Dispatching,
    Assembling,
    Complete,
    Error,
}

impl JobPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }
}

impl std::fmt::Display for JobPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "IDLE"),
            Self::Summarizing => write!(f, "SUMMARIZING"),
            Self::Segmenting => write!(f, "SEGMENTING"),
            Self::Dispatching => write!(f, "DISPATCHING"),
            Self::Assembling => write!(f, "ASSEMBLING"),
            Self::Complete => write!(f, "COMPLETE"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

/// Snapshot served to status pollers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub job_id: u64,
    pub phase: JobPhase,
    pub message: String,
    pub total_segments: usize,
    pub processed_segments: usize,
    pub queued_segments: usize,
    pub summary_progress: Option<u8>,
    pub error_type: Option<String>,
    pub error: Option<String>,
    pub audio_bytes: Option<usize>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Default for JobStatus {
    fn default() -> Self {
        Self {
            job_id: 0,
            phase: JobPhase::Idle,
            message: "Idle".into(),
            total_segments: 0,
            processed_segments: 0,
            queued_segments: 0,
            summary_progress: None,
            error_type: None,
            error: None,
            audio_bytes: None,
            started_at: None,
            updated_at: Utc::now(),
        }
    }
}

/// Shared handle to the process-wide status record.
#[derive(Debug, Clone, Default)]
pub struct ProgressTracker {
    status: Arc<RwLock<JobStatus>>,
    last_job_id: Arc<AtomicU64>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> JobStatus {
        self.status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Reset the record for a new job entering `phase` and hand out the
    /// handle that owns it.
    pub fn begin_job(&self, phase: JobPhase) -> JobHandle {
        let id = self.last_job_id.fetch_add(1, Ordering::Relaxed) + 1;
        let now = Utc::now();
        let mut status = self.status.write().unwrap_or_else(PoisonError::into_inner);
        if status.job_id != 0 && !status.phase.is_terminal() {
            debug!("Job {} superseded by job {id} while {}", status.job_id, status.phase);
        }
        let queued = status.queued_segments;
        *status = JobStatus {
            job_id: id,
            phase,
            message: "Starting".into(),
            queued_segments: queued,
            started_at: Some(now),
            updated_at: now,
            ..JobStatus::default()
        };
        JobHandle {
            id,
            tracker: self.clone(),
        }
    }

    /// Number of callers waiting for scheduler capacity, process-wide.
    pub fn set_queued(&self, queued: usize) {
        let mut status = self.status.write().unwrap_or_else(PoisonError::into_inner);
        status.queued_segments = queued;
        status.updated_at = Utc::now();
    }

    fn update(&self, job_id: u64, f: impl FnOnce(&mut JobStatus)) -> bool {
        let mut status = self.status.write().unwrap_or_else(PoisonError::into_inner);
        if status.job_id != job_id {
            return false;
        }
        f(&mut status);
        status.updated_at = Utc::now();
        true
    }
}

/// Write access to one job's status.
#[derive(Debug, Clone)]
pub struct JobHandle {
    id: u64,
    tracker: ProgressTracker,
}

impl JobHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether this job still owns the status record.
    pub fn is_current(&self) -> bool {
        self.tracker.snapshot().job_id == self.id
    }

    pub fn set_phase(&self, phase: JobPhase, message: impl Into<String>) {
        let message = message.into();
        self.tracker.update(self.id, |s| {
            s.phase = phase;
            s.message = message;
        });
    }

    pub fn set_summary_progress(&self, percent: u8) {
        self.tracker.update(self.id, |s| {
            s.summary_progress = Some(percent.min(100));
        });
    }

    pub fn set_total(&self, total: usize) {
        self.tracker.update(self.id, |s| {
            s.total_segments = total;
            s.processed_segments = 0;
        });
    }

    pub fn segment_done(&self) {
        self.tracker.update(self.id, |s| {
            s.processed_segments += 1;
            s.message = format!(
                "Converted segment {} of {}",
                s.processed_segments, s.total_segments
            );
        });
    }

    pub fn complete(&self, audio_bytes: usize) {
        self.tracker.update(self.id, |s| {
            s.phase = JobPhase::Complete;
            s.message = "Conversion complete".into();
            s.audio_bytes = Some(audio_bytes);
        });
    }

    pub fn fail(&self, error: &RelayError) {
        let message = error.to_string();
        let tag = error.type_tag();
        self.tracker.update(self.id, |s| {
            s.phase = JobPhase::Error;
            s.message = format!("Failed: {message}");
            s.error_type = Some(tag.to_string());
            s.error = Some(message);
        });
    }
}
