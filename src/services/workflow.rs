use crate::core::clock::Clock;
use crate::core::config::{GenerationConfig, QuotaPolicy};
use crate::core::error::{JobFailure, PersistenceError};
use crate::core::state::{CharacterDirectory, CharacterProfile};
use crate::services::cache::{AudioCache, FingerprintBase};
use crate::services::fallback::{
    last_error, AdmissionGate, FallbackPolicy, GenerationAttempt, SpeechRequest, SynthesisOutcome,
};
use crate::services::history::{HistoryOutcome, HistoryRecord, HistoryStore};
use crate::services::rate_limit::{Admission, RateLimiter};
use crate::services::script::Job;
use crate::services::tts::Synthesizer;
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Where a single job is in its life. Every change after `Pending` is
/// reported as a [`ProgressEvent`].
#[derive(Debug, Clone, PartialEq)]
pub enum JobState {
    Pending,
    Admitted,
    InFlight { model_id: String, attempt: u32 },
    Stored { version: u32, model_id: String, reused: bool },
    Failed(JobFailure),
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stored { .. } | Self::Failed(_))
    }
}

/// `Aborted` is reached only when history or quota state cannot be written;
/// continuing would risk making provider calls nobody has counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
    Completed,
    Cancelled,
    Aborted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub job_id: String,
    pub index: usize,
    pub state: JobState,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobReport {
    pub job_id: String,
    pub filename: String,
    pub state: JobState,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchSummary {
    pub total: usize,
    pub stored: usize,
    pub reused: usize,
    pub failed: usize,
    /// Jobs never started because the run was cancelled first.
    pub skipped: usize,
    pub state: RunState,
    pub reports: Vec<JobReport>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    Started { total: usize },
    Job(ProgressEvent),
    Finished(BatchSummary),
}

pub type RunEventTx = mpsc::UnboundedSender<RunEvent>;
pub type RunEventRx = mpsc::UnboundedReceiver<RunEvent>;

/// Handle to a batch running in the background.
pub struct BatchRun {
    cancel: CancellationToken,
    state: watch::Receiver<RunState>,
    task: JoinHandle<Result<BatchSummary>>,
}

impl BatchRun {
    /// Asks the run to stop before its next job. A call already sent to the
    /// provider still finishes and is recorded.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    pub async fn wait(self) -> Result<BatchSummary> {
        self.task.await?
    }
}

pub struct GenerationScheduler {
    generation: GenerationConfig,
    characters: Arc<dyn CharacterDirectory>,
    limiter: Arc<RateLimiter>,
    cache: Arc<AudioCache>,
    history: Arc<HistoryStore>,
    synthesizer: Arc<dyn Synthesizer>,
    policy: FallbackPolicy,
    clock: Arc<dyn Clock>,
}

impl GenerationScheduler {
    pub fn new(
        generation: GenerationConfig,
        characters: Arc<dyn CharacterDirectory>,
        limiter: Arc<RateLimiter>,
        cache: Arc<AudioCache>,
        history: Arc<HistoryStore>,
        synthesizer: Arc<dyn Synthesizer>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let policy = FallbackPolicy::new(generation.retry, clock.clone());
        Self {
            generation,
            characters,
            limiter,
            cache,
            history,
            synthesizer,
            policy,
            clock,
        }
    }

    /// Spawns the batch loop and returns immediately.
    pub fn start(self: &Arc<Self>, jobs: Vec<Job>) -> (BatchRun, RunEventRx) {
        let (tx, rx) = mpsc::unbounded_channel::<RunEvent>();
        let (state_tx, state_rx) = watch::channel(RunState::Idle);
        let cancel = CancellationToken::new();

        let scheduler = self.clone();
        let cancel2 = cancel.clone();
        let task = tokio::spawn(async move {
            let _ = state_tx.send(RunState::Running);
            let result = scheduler.run(jobs, tx, cancel2).await;
            let _ = state_tx.send(match &result {
                Ok(summary) => summary.state,
                Err(_) => RunState::Aborted,
            });
            result
        });

        (
            BatchRun {
                cancel,
                state: state_rx,
                task,
            },
            rx,
        )
    }

    /// Processes `jobs` strictly in order, one full fallback sequence at a
    /// time. Cancellation is checked between jobs only.
    pub async fn run(
        &self,
        jobs: Vec<Job>,
        events: RunEventTx,
        cancel: CancellationToken,
    ) -> Result<BatchSummary> {
        let total = jobs.len();
        // Every attempt has to be recordable before the first provider call.
        let recorded = self
            .history
            .record_count()
            .await
            .context("History log is unreadable, batch not started")?;
        info!("Starting batch of {} jobs ({} history records)", total, recorded);
        let _ = events.send(RunEvent::Started { total });

        let mut summary = BatchSummary {
            total,
            stored: 0,
            reused: 0,
            failed: 0,
            skipped: 0,
            state: RunState::Running,
            reports: Vec::with_capacity(total),
        };

        for job in &jobs {
            if cancel.is_cancelled() {
                summary.skipped += 1;
                summary.reports.push(JobReport {
                    job_id: job.id.clone(),
                    filename: job.filename.clone(),
                    state: JobState::Pending,
                });
                continue;
            }

            let state = match self.process_job(job, &events).await {
                Ok(state) => state,
                Err(e) => {
                    error!("Aborting batch, state could not be persisted: {}", e);
                    return Err(anyhow::Error::new(e).context(format!("Batch aborted at job {}", job.id)));
                }
            };

            match &state {
                JobState::Stored { reused: true, .. } => {
                    summary.stored += 1;
                    summary.reused += 1;
                }
                JobState::Stored { .. } => summary.stored += 1,
                _ => summary.failed += 1,
            }
            summary.reports.push(JobReport {
                job_id: job.id.clone(),
                filename: job.filename.clone(),
                state,
            });
        }

        summary.state = if cancel.is_cancelled() && summary.skipped > 0 {
            RunState::Cancelled
        } else {
            RunState::Completed
        };
        info!(
            "Batch {:?}: {} stored ({} reused), {} failed, {} skipped",
            summary.state, summary.stored, summary.reused, summary.failed, summary.skipped
        );
        let _ = events.send(RunEvent::Finished(summary.clone()));
        Ok(summary)
    }

    async fn process_job(&self, job: &Job, events: &RunEventTx) -> Result<JobState, PersistenceError> {
        let emit = |state: JobState| {
            let _ = events.send(RunEvent::Job(ProgressEvent {
                job_id: job.id.clone(),
                index: job.index,
                state,
            }));
        };

        let Some(profile) = self.characters.lookup(&job.character) else {
            warn!("{}: unknown character {}", job.id, job.character);
            let failure = JobFailure::UnknownCharacter {
                name: job.character.clone(),
            };
            self.record(job, None, Vec::new(), HistoryOutcome::Failed { failure: failure.clone() })
                .await?;
            let state = JobState::Failed(failure);
            emit(state.clone());
            return Ok(state);
        };

        let base = FingerprintBase::new(&job.character, &profile, &job.text);

        if self.generation.reuse_unchanged {
            match self.cache.latest_matching(&job.id, &base).await {
                Ok(Some(version)) => {
                    debug!("{}: reusing take {}", job.id, version.index);
                    self.record(
                        job,
                        Some(&profile),
                        Vec::new(),
                        HistoryOutcome::Stored {
                            version: version.index,
                            model_id: version.model_id.clone(),
                            reused: true,
                        },
                    )
                    .await?;
                    let state = JobState::Stored {
                        version: version.index,
                        model_id: version.model_id,
                        reused: true,
                    };
                    emit(state.clone());
                    return Ok(state);
                }
                Ok(None) => {}
                Err(e) => warn!("{}: cache lookup failed, generating anew: {:#}", job.id, e),
            }
        }

        let gate = LimiterGate {
            limiter: &self.limiter,
            policy: self.generation.quota_policy,
            waited: tokio::sync::Mutex::new(Duration::ZERO),
            admitted: AtomicBool::new(false),
            emit: &emit,
        };
        let request = SpeechRequest {
            text: &job.text,
            voice: &profile.voice,
            style_instruction: profile.style_instruction(),
        };
        let outcome = self
            .policy
            .synthesize(request, &self.generation.models, self.synthesizer.as_ref(), &gate)
            .await?;
        debug!("{}: {} attempt(s) made", job.id, outcome.attempts().len());

        let (state, attempts, outcome) = match outcome {
            SynthesisOutcome::Success {
                audio,
                model_used,
                attempts,
            } => match self.cache.store(&job.id, &base, &model_used, &audio).await {
                Ok(version) => (
                    JobState::Stored {
                        version: version.index,
                        model_id: model_used.clone(),
                        reused: false,
                    },
                    attempts,
                    HistoryOutcome::Stored {
                        version: version.index,
                        model_id: model_used,
                        reused: false,
                    },
                ),
                Err(e) => {
                    error!("{}: audio could not be stored: {:#}", job.id, e);
                    let failure = JobFailure::Storage {
                        detail: format!("{:#}", e),
                    };
                    (
                        JobState::Failed(failure.clone()),
                        attempts,
                        HistoryOutcome::Failed { failure },
                    )
                }
            },
            SynthesisOutcome::Exhausted { attempts } => {
                let failure = JobFailure::AllModelsExhausted {
                    last_error: last_error(&attempts),
                };
                (
                    JobState::Failed(failure.clone()),
                    attempts,
                    HistoryOutcome::Failed { failure },
                )
            }
            SynthesisOutcome::Denied {
                attempts,
                retry_after,
            } => {
                let failure = JobFailure::QuotaExhausted {
                    retry_after_secs: retry_after.as_secs_f64().ceil() as u64,
                };
                (
                    JobState::Failed(failure.clone()),
                    attempts,
                    HistoryOutcome::Failed { failure },
                )
            }
        };

        self.record(job, Some(&profile), attempts, outcome).await?;
        emit(state.clone());
        Ok(state)
    }

    async fn record(
        &self,
        job: &Job,
        profile: Option<&CharacterProfile>,
        attempts: Vec<GenerationAttempt>,
        outcome: HistoryOutcome,
    ) -> Result<(), PersistenceError> {
        self.history
            .append(HistoryRecord {
                job_id: job.id.clone(),
                filename: job.filename.clone(),
                character: job.character.clone(),
                text: job.text.clone(),
                voice: profile.map(|p| p.voice.clone()),
                style: profile.and_then(|p| p.style.clone()),
                attempts,
                outcome,
                recorded_at: self.clock.now(),
            })
            .await
    }
}

/// Puts the rate limiter in front of every provider call of one job and
/// applies the configured denial policy.
struct LimiterGate<'a, F: Fn(JobState) + Send + Sync> {
    limiter: &'a RateLimiter,
    policy: QuotaPolicy,
    waited: tokio::sync::Mutex<Duration>,
    admitted: AtomicBool,
    emit: &'a F,
}

#[async_trait]
impl<'a, F: Fn(JobState) + Send + Sync> AdmissionGate for LimiterGate<'a, F> {
    async fn admit(&self, model_id: &str, attempt: u32) -> Result<Admission, PersistenceError> {
        loop {
            let retry_after = match self.limiter.acquire().await? {
                Admission::Admitted => {
                    if !self.admitted.swap(true, Ordering::SeqCst) {
                        (self.emit)(JobState::Admitted);
                    }
                    (self.emit)(JobState::InFlight {
                        model_id: model_id.to_string(),
                        attempt,
                    });
                    return Ok(Admission::Admitted);
                }
                Admission::Denied { retry_after } => retry_after,
            };

            let max_wait = match self.policy {
                QuotaPolicy::FailFast => return Ok(Admission::Denied { retry_after }),
                QuotaPolicy::Wait { max_wait_seconds } => Duration::from_secs(max_wait_seconds),
            };

            let mut waited = self.waited.lock().await;
            if *waited + retry_after > max_wait {
                warn!(
                    "Quota wait of {:?} would exceed the {:?} limit, giving up",
                    retry_after, max_wait
                );
                return Ok(Admission::Denied { retry_after });
            }
            info!("Quota exhausted, waiting {:?} before retrying", retry_after);
            *waited += retry_after;
            drop(waited);
            tokio::time::sleep(retry_after.max(Duration::from_millis(10))).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::SystemClock;
    use crate::core::config::{RateLimits, RetryConfig};
    use crate::core::error::ProviderError;
    use crate::core::io::NativeStorage;
    use crate::core::state::CharacterMap;
    use crate::services::fallback::AttemptOutcome;
    use crate::services::script::parse_script;
    use std::sync::Mutex;

    /// Succeeds on every call and remembers which models were asked.
    struct RecordingSynth {
        calls: Mutex<Vec<(String, String)>>,
        cancel_on_call: Option<CancellationToken>,
    }

    impl RecordingSynth {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                cancel_on_call: None,
            }
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Synthesizer for RecordingSynth {
        async fn synthesize(
            &self,
            text: &str,
            voice: &str,
            _style: &str,
            model_id: &str,
        ) -> Result<Vec<u8>, ProviderError> {
            self.calls
                .lock()
                .unwrap()
                .push((voice.to_string(), model_id.to_string()));
            if let Some(cancel) = &self.cancel_on_call {
                cancel.cancel();
            }
            Ok(text.as_bytes().to_vec())
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        history: Arc<HistoryStore>,
        cache: Arc<AudioCache>,
        limiter: Arc<RateLimiter>,
    }

    async fn fixture(limits: RateLimits) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(NativeStorage::new());
        let clock = Arc::new(SystemClock);
        let history = Arc::new(HistoryStore::new(
            storage.clone(),
            dir.path().join("state").to_string_lossy().to_string(),
        ));
        let cache = Arc::new(AudioCache::new(
            storage,
            dir.path().join("cache").to_string_lossy().to_string(),
            clock.clone(),
        ));
        let limiter = Arc::new(RateLimiter::open(limits, history.clone(), clock).await.unwrap());
        Fixture {
            _dir: dir,
            history,
            cache,
            limiter,
        }
    }

    fn generation(models: &[&str]) -> GenerationConfig {
        GenerationConfig {
            models: models.iter().map(|s| s.to_string()).collect(),
            limits: RateLimits {
                per_minute: 100,
                per_day: 100,
            },
            retry: RetryConfig {
                max_transient_retries: 2,
                base_backoff_ms: 0,
            },
            quota_policy: QuotaPolicy::FailFast,
            reuse_unchanged: false,
        }
    }

    fn characters() -> Arc<CharacterMap> {
        let mut map = CharacterMap::default();
        map.insert("Alice", "v1", None);
        map.insert("Bob", "v2", Some("Grumpy"));
        Arc::new(map)
    }

    fn scheduler(
        fx: &Fixture,
        generation: GenerationConfig,
        synth: Arc<dyn Synthesizer>,
    ) -> Arc<GenerationScheduler> {
        Arc::new(GenerationScheduler::new(
            generation,
            characters(),
            fx.limiter.clone(),
            fx.cache.clone(),
            fx.history.clone(),
            synth,
            Arc::new(SystemClock),
        ))
    }

    async fn drain(mut rx: RunEventRx) -> Vec<RunEvent> {
        let mut events = Vec::new();
        while let Some(e) = rx.recv().await {
            events.push(e);
        }
        events
    }

    #[tokio::test]
    async fn test_single_line_scenario() {
        let fx = fixture(RateLimits {
            per_minute: 10,
            per_day: 100,
        })
        .await;
        let synth = Arc::new(RecordingSynth::new());
        let scheduler = scheduler(&fx, generation(&["M1"]), synth.clone());

        let jobs = parse_script("Alice | Hello there | greet").jobs;
        let (run, rx) = scheduler.start(jobs);
        let summary = run.wait().await.unwrap();
        let events = drain(rx).await;

        assert_eq!(summary.state, RunState::Completed);
        assert_eq!((summary.total, summary.stored, summary.failed), (1, 1, 0));
        assert_eq!(synth.call_count(), 1);
        assert_eq!(synth.calls.lock().unwrap()[0], ("v1".to_string(), "M1".to_string()));

        let versions = fx.cache.versions("greet").await.unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(fx.cache.selected_version("greet").await.unwrap().unwrap().index, 1);

        let history = fx.history.load_all().await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].outcome.is_success());
        assert_eq!(history[0].attempts.len(), 1);
        assert_eq!(history[0].attempts[0].model_id, "M1");
        assert!(matches!(history[0].attempts[0].outcome, AttemptOutcome::Success { .. }));

        let job_states: Vec<JobState> = events
            .iter()
            .filter_map(|e| match e {
                RunEvent::Job(p) => Some(p.state.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(
            job_states,
            vec![
                JobState::Admitted,
                JobState::InFlight {
                    model_id: "M1".to_string(),
                    attempt: 1
                },
                JobState::Stored {
                    version: 1,
                    model_id: "M1".to_string(),
                    reused: false
                },
            ]
        );
        assert_eq!(events.first(), Some(&RunEvent::Started { total: 1 }));
        assert!(matches!(events.last(), Some(RunEvent::Finished(_))));
    }

    #[tokio::test]
    async fn test_progress_events_follow_submission_order() {
        let fx = fixture(RateLimits {
            per_minute: 10,
            per_day: 100,
        })
        .await;
        let scheduler = scheduler(&fx, generation(&["M1"]), Arc::new(RecordingSynth::new()));

        let jobs = parse_script("Alice | One | a\nNobody | Two | b\nBob | Three | c").jobs;
        let (run, rx) = scheduler.start(jobs);
        let summary = run.wait().await.unwrap();
        let events = drain(rx).await;

        let order: Vec<usize> = events
            .iter()
            .filter_map(|e| match e {
                RunEvent::Job(p) => Some(p.index),
                _ => None,
            })
            .collect();
        let mut sorted = order.clone();
        sorted.sort();
        assert_eq!(order, sorted, "events for a job never interleave with later jobs");
        assert_eq!((summary.stored, summary.failed), (2, 1));
    }

    #[tokio::test]
    async fn test_unknown_character_fails_job_and_continues() {
        let fx = fixture(RateLimits {
            per_minute: 10,
            per_day: 100,
        })
        .await;
        let synth = Arc::new(RecordingSynth::new());
        let scheduler = scheduler(&fx, generation(&["M1"]), synth.clone());

        let jobs = parse_script("Carol | Hi | one\nAlice | Hi | two").jobs;
        let (run, _rx) = scheduler.start(jobs);
        let summary = run.wait().await.unwrap();

        assert_eq!(
            summary.reports[0].state,
            JobState::Failed(JobFailure::UnknownCharacter {
                name: "Carol".to_string()
            })
        );
        assert!(matches!(summary.reports[1].state, JobState::Stored { .. }));
        assert_eq!(synth.call_count(), 1);

        let history = fx.history.records_for_job("one").await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].attempts.is_empty());
        assert_eq!(history[0].voice, None);
    }

    #[tokio::test]
    async fn test_zero_daily_ceiling_fails_fast_without_attempts() {
        let fx = fixture(RateLimits {
            per_minute: 10,
            per_day: 0,
        })
        .await;
        let synth = Arc::new(RecordingSynth::new());
        let scheduler = scheduler(&fx, generation(&["M1", "M2"]), synth.clone());

        let jobs = parse_script("Alice | One | a\nBob | Two | b").jobs;
        let (run, _rx) = scheduler.start(jobs);
        let summary = run.wait().await.unwrap();

        assert_eq!(summary.failed, 2);
        for report in &summary.reports {
            assert!(matches!(
                report.state,
                JobState::Failed(JobFailure::QuotaExhausted { .. })
            ));
        }
        assert_eq!(synth.call_count(), 0);
        let history = fx.history.load_all().await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|r| r.attempts.is_empty()));
    }

    #[tokio::test]
    async fn test_wait_policy_gives_up_past_max_wait() {
        let fx = fixture(RateLimits {
            per_minute: 1,
            per_day: 100,
        })
        .await;
        let synth = Arc::new(RecordingSynth::new());
        let mut config = generation(&["M1"]);
        config.quota_policy = QuotaPolicy::Wait { max_wait_seconds: 5 };
        let scheduler = scheduler(&fx, config, synth.clone());

        let jobs = parse_script("Alice | One | a\nAlice | Two | b").jobs;
        let (run, _rx) = scheduler.start(jobs);
        let summary = run.wait().await.unwrap();

        assert!(matches!(summary.reports[0].state, JobState::Stored { .. }));
        assert!(matches!(
            summary.reports[1].state,
            JobState::Failed(JobFailure::QuotaExhausted { retry_after_secs }) if retry_after_secs > 5
        ));
        assert_eq!(synth.call_count(), 1);
    }

    #[tokio::test]
    async fn test_cancellation_lets_in_flight_job_finish() {
        let fx = fixture(RateLimits {
            per_minute: 10,
            per_day: 100,
        })
        .await;
        let cancel = CancellationToken::new();
        let synth = Arc::new(RecordingSynth {
            calls: Mutex::new(Vec::new()),
            cancel_on_call: Some(cancel.clone()),
        });
        let scheduler = scheduler(&fx, generation(&["M1"]), synth.clone());

        let jobs = parse_script("Alice | One | a\nAlice | Two | b\nAlice | Three | c").jobs;
        let (tx, rx) = mpsc::unbounded_channel();
        let summary = scheduler.run(jobs, tx, cancel).await.unwrap();
        drop(rx);

        assert_eq!(summary.state, RunState::Cancelled);
        assert_eq!((summary.stored, summary.skipped), (1, 2));
        assert_eq!(summary.reports[1].state, JobState::Pending);
        assert_eq!(synth.call_count(), 1);
        assert_eq!(fx.history.load_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_before_start_reports_cancelled_state() {
        let fx = fixture(RateLimits {
            per_minute: 10,
            per_day: 100,
        })
        .await;
        let synth = Arc::new(RecordingSynth::new());
        let scheduler = scheduler(&fx, generation(&["M1"]), synth.clone());

        let (tx, _rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let summary = scheduler
            .run(parse_script("Alice | One | a").jobs, tx, cancel)
            .await
            .unwrap();

        assert_eq!(summary.state, RunState::Cancelled);
        assert_eq!(synth.call_count(), 0);
    }

    #[tokio::test]
    async fn test_regeneration_mints_new_version_unless_reuse_enabled() {
        let fx = fixture(RateLimits {
            per_minute: 10,
            per_day: 100,
        })
        .await;
        let synth = Arc::new(RecordingSynth::new());

        let scheduler_a = scheduler(&fx, generation(&["M1"]), synth.clone());
        for _ in 0..2 {
            let (run, _rx) = scheduler_a.start(parse_script("Alice | Hi | greet").jobs);
            run.wait().await.unwrap();
        }
        assert_eq!(fx.cache.versions("greet").await.unwrap().len(), 2);
        assert_eq!(synth.call_count(), 2);

        let mut config = generation(&["M1"]);
        config.reuse_unchanged = true;
        let scheduler_b = scheduler(&fx, config, synth.clone());
        let (run, _rx) = scheduler_b.start(parse_script("Alice | Hi | greet").jobs);
        let summary = run.wait().await.unwrap();

        assert_eq!(summary.reused, 1);
        assert_eq!(
            summary.reports[0].state,
            JobState::Stored {
                version: 2,
                model_id: "M1".to_string(),
                reused: true
            }
        );
        assert_eq!(synth.call_count(), 2, "reuse makes no provider call");

        // Changed text is never reused.
        let (run, _rx) = scheduler_b.start(parse_script("Alice | Hello | greet").jobs);
        let summary = run.wait().await.unwrap();
        assert_eq!(summary.reused, 0);
        assert_eq!(fx.cache.versions("greet").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_unreadable_history_stops_batch_before_any_call() {
        let fx = fixture(RateLimits {
            per_minute: 10,
            per_day: 100,
        })
        .await;
        let state_dir = fx._dir.path().join("state");
        std::fs::create_dir_all(&state_dir).unwrap();
        std::fs::write(state_dir.join("history.json"), "{ not json").unwrap();
        let synth = Arc::new(RecordingSynth::new());
        let scheduler = scheduler(&fx, generation(&["M1"]), synth.clone());

        let (run, rx) = scheduler.start(parse_script("Alice | Hello | greet").jobs);
        let mut state_rx = run.state.clone();
        let err = run.wait().await.unwrap_err();
        let events = drain(rx).await;

        assert!(matches!(
            err.downcast_ref::<PersistenceError>(),
            Some(PersistenceError::Corruption { .. })
        ));
        assert_eq!(synth.call_count(), 0);
        assert!(fx.cache.versions("greet").await.unwrap().is_empty());
        assert_eq!(fx.limiter.current_budget().await.per_day_remaining, 100);
        assert!(events.is_empty());
        assert_eq!(*state_rx.borrow_and_update(), RunState::Aborted);
    }

    #[tokio::test]
    async fn test_batch_run_state_transitions() {
        let fx = fixture(RateLimits {
            per_minute: 10,
            per_day: 100,
        })
        .await;
        let scheduler = scheduler(&fx, generation(&["M1"]), Arc::new(RecordingSynth::new()));

        let (run, rx) = scheduler.start(parse_script("Alice | Hi | greet").jobs);
        let mut state_rx = run.state.clone();
        let summary = run.wait().await.unwrap();
        drain(rx).await;

        assert_eq!(summary.state, RunState::Completed);
        assert_eq!(*state_rx.borrow_and_update(), RunState::Completed);
    }
}
