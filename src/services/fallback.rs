use crate::core::clock::Clock;
use crate::core::config::RetryConfig;
use crate::core::error::{PersistenceError, ProviderErrorKind};
use crate::services::rate_limit::Admission;
use crate::services::tts::Synthesizer;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// One call made to the provider. Never changed after it is recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationAttempt {
    pub model_id: String,
    pub started_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success { bytes: usize },
    Failed { kind: ProviderErrorKind, detail: String },
}

/// What to say, in whose voice.
#[derive(Debug, Clone, Copy)]
pub struct SpeechRequest<'a> {
    pub text: &'a str,
    pub voice: &'a str,
    pub style_instruction: &'a str,
}

/// Consulted before every provider call, including retries and fallbacks.
/// `Admitted` means the call has been counted and must now be made.
#[async_trait]
pub trait AdmissionGate: Send + Sync {
    async fn admit(&self, model_id: &str, attempt: u32) -> Result<Admission, PersistenceError>;
}

#[derive(Debug)]
pub enum SynthesisOutcome {
    Success {
        audio: Vec<u8>,
        model_used: String,
        attempts: Vec<GenerationAttempt>,
    },
    /// Every model was tried and none produced audio.
    Exhausted { attempts: Vec<GenerationAttempt> },
    /// The gate refused the next call; the sequence stopped there.
    Denied {
        attempts: Vec<GenerationAttempt>,
        retry_after: Duration,
    },
}

impl SynthesisOutcome {
    pub fn attempts(&self) -> &[GenerationAttempt] {
        match self {
            Self::Success { attempts, .. }
            | Self::Exhausted { attempts }
            | Self::Denied { attempts, .. } => attempts,
        }
    }
}

/// Summary line for a failed sequence: the last error wins.
pub fn last_error(attempts: &[GenerationAttempt]) -> String {
    attempts
        .iter()
        .rev()
        .find_map(|a| match &a.outcome {
            AttemptOutcome::Failed { kind, detail } => {
                Some(format!("{} ({}): {}", a.model_id, kind, detail))
            }
            AttemptOutcome::Success { .. } => None,
        })
        .unwrap_or_else(|| "no models configured".to_string())
}

pub struct FallbackPolicy {
    retry: RetryConfig,
    clock: Arc<dyn Clock>,
}

impl FallbackPolicy {
    pub fn new(retry: RetryConfig, clock: Arc<dyn Clock>) -> Self {
        Self { retry, clock }
    }

    /// Walks `models` in order. Provider saturation and non-retryable errors
    /// move straight to the next model; transient errors are retried on the
    /// same model with exponential backoff up to the configured bound.
    pub async fn synthesize(
        &self,
        request: SpeechRequest<'_>,
        models: &[String],
        synthesizer: &dyn Synthesizer,
        gate: &dyn AdmissionGate,
    ) -> Result<SynthesisOutcome, PersistenceError> {
        let mut attempts = Vec::new();

        for model in models {
            let mut retries = 0;
            loop {
                let attempt_no = attempts.len() as u32 + 1;
                if let Admission::Denied { retry_after } = gate.admit(model, attempt_no).await? {
                    return Ok(SynthesisOutcome::Denied {
                        attempts,
                        retry_after,
                    });
                }

                let started_at = self.clock.now();
                let result = synthesizer
                    .synthesize(request.text, request.voice, request.style_instruction, model)
                    .await;

                let err = match result {
                    Ok(audio) => {
                        attempts.push(GenerationAttempt {
                            model_id: model.clone(),
                            started_at,
                            outcome: AttemptOutcome::Success { bytes: audio.len() },
                        });
                        return Ok(SynthesisOutcome::Success {
                            audio,
                            model_used: model.clone(),
                            attempts,
                        });
                    }
                    Err(err) => err,
                };

                attempts.push(GenerationAttempt {
                    model_id: model.clone(),
                    started_at,
                    outcome: AttemptOutcome::Failed {
                        kind: err.kind,
                        detail: err.detail.clone(),
                    },
                });

                if err.kind.is_retryable() && retries < self.retry.max_transient_retries {
                    retries += 1;
                    let delay = self.retry.backoff(retries);
                    warn!(
                        "{} failed ({}), retry {}/{} in {:?}",
                        model, err, retries, self.retry.max_transient_retries, delay
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }

                info!("Giving up on {} after {}, trying next model", model, err.kind);
                break;
            }
        }

        Ok(SynthesisOutcome::Exhausted { attempts })
    }
}
