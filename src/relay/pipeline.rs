//! One end-to-end conversion:
//! normalize → summarize (optional) → segment → dispatch → assemble.
//!
//! Every segment is dispatched at once through the shared `RateScheduler`.
//! Results land in a slot per segment index, so the assembled audio follows
//! the original text order no matter which calls finish first. Any failed
//! segment fails the whole job; partial audio is never returned.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::progress::{JobHandle, JobPhase};
use super::provider::{SpeechClient, SummaryClient, SummaryConstraints};
use super::scheduler::RateScheduler;
use super::segmenter::{self, Segment};
use crate::config::Config;
use crate::error::{ProviderError, RelayError};

const SUMMARY_TICK: Duration = Duration::from_secs(1);
const SUMMARY_TICK_STEP: u8 = 10;
const SUMMARY_TICK_CEILING: u8 = 90;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineSettings {
    pub max_segment_chars: usize,
    pub max_summary_input_chars: usize,
    pub max_summary_output_tokens: u32,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_segment_chars: config.speech.max_segment_chars.max(1),
            max_summary_input_chars: config.summary.max_input_chars,
            max_summary_output_tokens: config.summary.max_output_tokens,
        }
    }
}

pub struct JobPipeline {
    speech: Arc<dyn SpeechClient>,
    summary: Arc<dyn SummaryClient>,
    scheduler: Arc<RateScheduler>,
    settings: PipelineSettings,
}

impl JobPipeline {
    pub fn new(
        speech: Arc<dyn SpeechClient>,
        summary: Arc<dyn SummaryClient>,
        scheduler: Arc<RateScheduler>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            speech,
            summary,
            scheduler,
            settings,
        }
    }

    /// Convert `text` to one audio buffer, reporting progress through `job`.
    pub async fn run(
        &self,
        job: &JobHandle,
        text: &str,
        use_summary: bool,
    ) -> Result<Vec<u8>, RelayError> {
        let t_total = Instant::now();
        info!(
            "Job {} started: {} chars, summary={use_summary}",
            job.id(),
            text.chars().count()
        );

        let result = self.run_inner(job, text, use_summary).await;
        let total_ms = t_total.elapsed().as_millis();
        if !job.is_current() {
            info!("Job {} was superseded; its status is no longer reported", job.id());
        }
        match &result {
            Ok(audio) => {
                job.complete(audio.len());
                info!("Job {} complete: {} bytes in {total_ms}ms", job.id(), audio.len());
            }
            Err(e) => {
                job.fail(e);
                warn!("Job {} failed after {total_ms}ms: {e}", job.id());
            }
        }
        result
    }

    async fn run_inner(
        &self,
        job: &JobHandle,
        text: &str,
        use_summary: bool,
    ) -> Result<Vec<u8>, RelayError> {
        let mut working = segmenter::normalize(text);
        if working.is_empty() {
            return Err(RelayError::EmptyInput);
        }

        if use_summary {
            let summary = self.summarize(job, &working).await?;
            working = segmenter::normalize(&summary);
            if working.is_empty() {
                return Err(RelayError::SummaryFailed(ProviderError::EmptyResponse));
            }
        }

        job.set_phase(JobPhase::Segmenting, "Splitting text");
        let segments = segmenter::segment(&working, self.settings.max_segment_chars);
        job.set_total(segments.len());
        info!(
            "Job {}: {} chars in {} segments (max {})",
            job.id(),
            working.chars().count(),
            segments.len(),
            self.settings.max_segment_chars
        );

        let buffers = self.dispatch(job, segments).await?;

        job.set_phase(JobPhase::Assembling, "Joining audio");
        let mut audio = Vec::with_capacity(buffers.iter().map(Vec::len).sum());
        for buffer in buffers {
            audio.extend_from_slice(&buffer);
        }
        Ok(audio)
    }

    async fn summarize(&self, job: &JobHandle, text: &str) -> Result<String, RelayError> {
        job.set_phase(JobPhase::Summarizing, "Summarizing text");
        job.set_summary_progress(0);

        let limit = self.settings.max_summary_input_chars;
        let input = match text.char_indices().nth(limit) {
            Some((cut, _)) => {
                info!(
                    "Job {}: truncating summary input from {} to {limit} chars",
                    job.id(),
                    text.chars().count()
                );
                &text[..cut]
            }
            None => text,
        };
        let constraints = SummaryConstraints {
            max_output_tokens: self.settings.max_summary_output_tokens,
        };

        let request = self
            .scheduler
            .schedule(|| self.summary.summarize(input, constraints));
        tokio::pin!(request);

        // Nudge the percentage while waiting; the provider reports none.
        let mut ticker = tokio::time::interval(SUMMARY_TICK);
        ticker.tick().await;
        let mut percent = 0u8;
        let result = loop {
            tokio::select! {
                result = &mut request => break result,
                _ = ticker.tick() => {
                    percent = (percent + SUMMARY_TICK_STEP).min(SUMMARY_TICK_CEILING);
                    job.set_summary_progress(percent);
                }
            }
        };

        let summary = result.map_err(RelayError::SummaryFailed)?;
        job.set_summary_progress(100);
        info!(
            "Job {}: summarized {} chars → {} chars with {}",
            job.id(),
            input.chars().count(),
            summary.chars().count(),
            self.summary.model()
        );
        Ok(summary)
    }

    /// Fire every segment at once and collect the audio in index order.
    async fn dispatch(
        &self,
        job: &JobHandle,
        segments: Vec<Segment>,
    ) -> Result<Vec<Vec<u8>>, RelayError> {
        let total = segments.len();
        job.set_phase(
            JobPhase::Dispatching,
            format!("Converting {total} segments"),
        );

        let stats = self.scheduler.stats();
        debug!(
            "Job {}: dispatching {total} segments ({} units available, {} active, {} queued)",
            job.id(),
            stats.available,
            stats.active,
            stats.queued
        );

        let mut tasks = JoinSet::new();
        for segment in segments {
            debug!("Job {}: queueing segment {} ({} chars)", job.id(), segment.index, segment.length);
            let speech = self.speech.clone();
            let scheduler = self.scheduler.clone();
            tasks.spawn(async move {
                let result = scheduler
                    .schedule(|| speech.synthesize(&segment.content))
                    .await;
                (segment.index, result)
            });
        }

        let mut slots: Vec<Option<Vec<u8>>> = vec![None; total];
        while let Some(joined) = tasks.join_next().await {
            let failure = match joined {
                Ok((index, Ok(buffer))) => {
                    debug!("Job {}: segment {index} returned {} bytes", job.id(), buffer.len());
                    slots[index] = Some(buffer);
                    job.segment_done();
                    continue;
                }
                Ok((index, Err(source))) => {
                    warn!("Job {}: segment {index} of {total} failed: {source}", job.id());
                    RelayError::SegmentFailed {
                        index,
                        total,
                        source,
                    }
                }
                Err(e) => RelayError::Internal(format!("segment task aborted: {e}")),
            };

            // The job is lost: stop the in-flight calls and leave the queue.
            let abandoned = tasks.len();
            tasks.shutdown().await;
            let pruned = self.scheduler.prune_abandoned();
            info!(
                "Job {}: abandoned {abandoned} outstanding segments ({pruned} were queued)",
                job.id()
            );
            return Err(failure);
        }
        slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.ok_or_else(|| RelayError::Internal(format!("segment {index} produced no audio")))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::progress::ProgressTracker;
    use crate::relay::scheduler::RetryPolicy;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Echoes each segment back as `<content>` after a per-segment delay.
    #[derive(Default)]
    struct MockSpeech {
        calls: AtomicUsize,
        completed: Mutex<Vec<String>>,
        failing: HashSet<String>,
        reject_all: bool,
        rate_limit_once: Mutex<HashSet<String>>,
        delay: Option<fn(&str) -> Duration>,
    }

    #[async_trait]
    impl SpeechClient for MockSpeech {
        async fn synthesize(&self, text: &str) -> Result<Vec<u8>, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay(text)).await;
            }
            if self.reject_all {
                return Err(ProviderError::Auth {
                    message: "bad key".into(),
                });
            }
            if self.rate_limit_once.lock().unwrap().remove(text) {
                return Err(ProviderError::RateLimited {
                    message: "Rate limit reached".into(),
                });
            }
            if self.failing.contains(text) {
                return Err(ProviderError::Api {
                    status: 500,
                    message: "synthesis failed".into(),
                });
            }
            self.completed.lock().unwrap().push(text.to_string());
            Ok(format!("<{text}>").into_bytes())
        }
    }

    struct MockSummary {
        calls: AtomicUsize,
        received: Mutex<Option<String>>,
        response: Result<String, ProviderError>,
    }

    impl MockSummary {
        fn returning(response: Result<String, ProviderError>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                received: Mutex::new(None),
                response,
            }
        }
    }

    #[async_trait]
    impl SummaryClient for MockSummary {
        async fn summarize(
            &self,
            text: &str,
            _constraints: SummaryConstraints,
        ) -> Result<String, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.received.lock().unwrap() = Some(text.to_string());
            tokio::time::sleep(Duration::from_secs(3)).await;
            self.response.clone()
        }

        fn model(&self) -> &str {
            "mock-summary"
        }
    }

    struct Harness {
        pipeline: JobPipeline,
        scheduler: Arc<RateScheduler>,
        tracker: ProgressTracker,
        speech: Arc<MockSpeech>,
        summary: Arc<MockSummary>,
    }

    fn harness(speech: MockSpeech, summary: MockSummary, settings: PipelineSettings) -> Harness {
        harness_with_capacity(64, speech, summary, settings)
    }

    fn harness_with_capacity(
        max_concurrent: usize,
        speech: MockSpeech,
        summary: MockSummary,
        settings: PipelineSettings,
    ) -> Harness {
        let tracker = ProgressTracker::new();
        let scheduler = Arc::new(RateScheduler::new(
            max_concurrent,
            Duration::from_secs(30),
            RetryPolicy::new(2, Duration::from_secs(30)),
            Some(tracker.clone()),
        ));
        let speech = Arc::new(speech);
        let summary = Arc::new(summary);
        Harness {
            pipeline: JobPipeline::new(speech.clone(), summary.clone(), scheduler.clone(), settings),
            scheduler,
            tracker,
            speech,
            summary,
        }
    }

    fn settings(max_segment_chars: usize) -> PipelineSettings {
        PipelineSettings {
            max_segment_chars,
            max_summary_input_chars: 1000,
            max_summary_output_tokens: 256,
        }
    }

    fn no_summary() -> MockSummary {
        MockSummary::returning(Err(ProviderError::EmptyResponse))
    }

    /// "S00. S01. ... S09." splits into one segment per sentence at max 5.
    fn numbered_text(count: usize) -> String {
        (0..count)
            .map(|i| format!("S{i:02}."))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn sentence_number(text: &str) -> u64 {
        text.trim()
            .trim_start_matches('S')
            .trim_end_matches('.')
            .parse()
            .unwrap_or(0)
    }

    #[tokio::test(start_paused = true)]
    async fn test_output_follows_index_order_not_completion_order() {
        let speech = MockSpeech {
            // Later segments finish first.
            delay: Some(|text| Duration::from_millis((10 - sentence_number(text)) * 100)),
            ..MockSpeech::default()
        };
        let h = harness(speech, no_summary(), settings(5));
        let job = h.tracker.begin_job(JobPhase::Segmenting);

        let audio = h.pipeline.run(&job, &numbered_text(10), false).await.unwrap();

        let expected: String = segmenter::segment(&numbered_text(10), 5)
            .iter()
            .map(|s| format!("<{}>", s.content))
            .collect();
        assert_eq!(String::from_utf8(audio).unwrap(), expected);

        let completed = h.speech.completed.lock().unwrap().clone();
        assert_eq!(completed.first().map(|s| s.trim()), Some("S09."));
        assert_eq!(completed.last().map(|s| s.trim()), Some("S00."));
    }

    #[tokio::test(start_paused = true)]
    async fn test_segment_failure_fails_whole_job() {
        let speech = MockSpeech {
            failing: HashSet::from([" FAIL.".to_string()]),
            ..MockSpeech::default()
        };
        let h = harness(speech, no_summary(), settings(6));
        let job = h.tracker.begin_job(JobPhase::Segmenting);

        let result = h
            .pipeline
            .run(&job, "AAAA. BBBB. CCCC. FAIL. EEEE.", false)
            .await;

        match result {
            Err(RelayError::SegmentFailed { index, total, .. }) => {
                assert_eq!((index, total), (3, 5));
            }
            other => panic!("expected SegmentFailed, got {other:?}"),
        }
        let status = h.tracker.snapshot();
        assert_eq!(status.phase, JobPhase::Error);
        assert_eq!(status.error_type.as_deref(), Some("segment_failed"));
        assert!(status.audio_bytes.is_none());
        assert_eq!(h.speech.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_failure_is_reported() {
        let speech = MockSpeech {
            failing: HashSet::from([" BBBB.".to_string(), " EEEE.".to_string()]),
            // Segment 4 fails at 1 s, segment 1 would fail at 5 s.
            delay: Some(|text| {
                if text.contains('B') {
                    Duration::from_secs(5)
                } else {
                    Duration::from_secs(1)
                }
            }),
            ..MockSpeech::default()
        };
        let h = harness(speech, no_summary(), settings(6));
        let job = h.tracker.begin_job(JobPhase::Segmenting);

        let started = tokio::time::Instant::now();
        let result = h
            .pipeline
            .run(&job, "AAAA. BBBB. CCCC. DDDD. EEEE.", false)
            .await;
        assert!(matches!(
            result,
            Err(RelayError::SegmentFailed { index: 4, total: 5, .. })
        ));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_aborts_queued_segments_before_refill() {
        let speech = MockSpeech {
            reject_all: true,
            ..MockSpeech::default()
        };
        let h = harness_with_capacity(2, speech, no_summary(), settings(5));
        let job = h.tracker.begin_job(JobPhase::Segmenting);

        let started = tokio::time::Instant::now();
        let result = h.pipeline.run(&job, &numbered_text(20), false).await;

        assert!(started.elapsed() < Duration::from_secs(30));
        assert!(matches!(
            result,
            Err(RelayError::SegmentFailed {
                total: 20,
                source: ProviderError::Auth { .. },
                ..
            })
        ));
        assert!(h.speech.calls.load(Ordering::SeqCst) <= 2);
        assert_eq!(h.scheduler.stats().queued, 0);
        let status = h.tracker.snapshot();
        assert_eq!(status.phase, JobPhase::Error);
        assert_eq!(status.queued_segments, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blank_input_fails_before_any_remote_call() {
        let h = harness(
            MockSpeech::default(),
            MockSummary::returning(Ok("summary".into())),
            settings(100),
        );
        for text in ["", "   ", "\n\n \r\n"] {
            let job = h.tracker.begin_job(JobPhase::Segmenting);
            let result = h.pipeline.run(&job, text, true).await;
            assert!(matches!(result, Err(RelayError::EmptyInput)));
        }
        assert_eq!(h.speech.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.summary.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.tracker.snapshot().phase, JobPhase::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_summary_replaces_working_text() {
        let h = harness(
            MockSpeech::default(),
            MockSummary::returning(Ok("Short\nversion.".into())),
            settings(100),
        );
        let job = h.tracker.begin_job(JobPhase::Segmenting);

        let audio = h
            .pipeline
            .run(&job, "A very long original text.\nWith lines.", true)
            .await
            .unwrap();

        assert_eq!(audio, b"<Short version.>".to_vec());
        assert_eq!(
            h.summary.received.lock().unwrap().as_deref(),
            Some("A very long original text. With lines.")
        );
        assert_eq!(h.tracker.snapshot().summary_progress, Some(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_summary_input_is_truncated() {
        let mut config = settings(100);
        config.max_summary_input_chars = 10;
        let h = harness(
            MockSpeech::default(),
            MockSummary::returning(Ok("ok".into())),
            config,
        );
        let job = h.tracker.begin_job(JobPhase::Segmenting);

        h.pipeline
            .run(&job, "0123456789abcdefghij", true)
            .await
            .unwrap();
        assert_eq!(
            h.summary.received.lock().unwrap().as_deref(),
            Some("0123456789")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_summary_failure_skips_synthesis() {
        let h = harness(
            MockSpeech::default(),
            MockSummary::returning(Err(ProviderError::Quota {
                message: "insufficient_quota".into(),
            })),
            settings(100),
        );
        let job = h.tracker.begin_job(JobPhase::Segmenting);

        let result = h.pipeline.run(&job, "Some text.", true).await;

        assert!(matches!(
            result,
            Err(RelayError::SummaryFailed(ProviderError::Quota { .. }))
        ));
        assert_eq!(h.speech.calls.load(Ordering::SeqCst), 0);
        let status = h.tracker.snapshot();
        assert_eq!(status.error_type.as_deref(), Some("provider_quota_error"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_summary_is_a_summary_failure() {
        let h = harness(
            MockSpeech::default(),
            MockSummary::returning(Ok(" \n ".into())),
            settings(100),
        );
        let job = h.tracker.begin_job(JobPhase::Segmenting);
        let result = h.pipeline.run(&job, "Some text.", true).await;
        assert!(matches!(
            result,
            Err(RelayError::SummaryFailed(ProviderError::EmptyResponse))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_segment_recovers_on_retry() {
        let speech = MockSpeech {
            rate_limit_once: Mutex::new(HashSet::from([" S01.".to_string()])),
            ..MockSpeech::default()
        };
        let h = harness(speech, no_summary(), settings(5));
        let job = h.tracker.begin_job(JobPhase::Segmenting);

        let audio = h.pipeline.run(&job, &numbered_text(3), false).await.unwrap();

        assert_eq!(String::from_utf8(audio).unwrap(), "<S00.>< S01.>< S02.>");
        assert_eq!(h.speech.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_reaches_complete() {
        let h = harness(MockSpeech::default(), no_summary(), settings(5));
        let job = h.tracker.begin_job(JobPhase::Segmenting);

        let audio = h.pipeline.run(&job, &numbered_text(4), false).await.unwrap();

        let status = h.tracker.snapshot();
        assert_eq!(status.phase, JobPhase::Complete);
        assert_eq!(status.total_segments, 4);
        assert_eq!(status.processed_segments, 4);
        assert_eq!(status.audio_bytes, Some(audio.len()));
        assert!(status.summary_progress.is_none());
    }
}
