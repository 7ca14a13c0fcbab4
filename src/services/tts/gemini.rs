use crate::core::error::ProviderError;
use crate::services::tts::{build_prompt, Synthesizer};
use crate::utils::audio::{parse_audio_mime_type, pcm_to_wav};
use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use log::{debug, warn};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

// --- Config ---

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GeminiTtsConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

impl Default for GeminiTtsConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_base_url(),
            timeout_seconds: default_timeout_seconds(),
            temperature: default_temperature(),
        }
    }
}

fn default_base_url() -> String {
    "https://generativelanguage.googleapis.com/".to_string()
}
fn default_timeout_seconds() -> u64 {
    120
}
fn default_temperature() -> f32 {
    1.0
}

// --- Wire format ---

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct Content {
    role: String,
    parts: Vec<TextPart>,
}

#[derive(Serialize)]
struct TextPart {
    text: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    response_modalities: Vec<String>,
    speech_config: SpeechConfig,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SpeechConfig {
    voice_config: VoiceConfig,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VoiceConfig {
    prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PrebuiltVoiceConfig {
    voice_name: String,
}

#[derive(Deserialize, Debug)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ResponsePart {
    inline_data: Option<InlineData>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Deserialize, Debug)]
struct ErrorEnvelope {
    error: ApiError,
}

#[derive(Deserialize, Debug)]
struct ApiError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: String,
}

// --- Client ---

pub struct GeminiTtsClient {
    config: GeminiTtsConfig,
    base_url: Url,
    client: reqwest::Client,
}

impl GeminiTtsClient {
    pub fn new(config: GeminiTtsConfig) -> Result<Self> {
        if config.api_key.trim().is_empty() {
            anyhow::bail!("Gemini API key is empty (set provider.gemini.api_key or GEMINI_API_KEY)");
        }

        let mut base = config.base_url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base).context("Invalid Gemini base_url")?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            config,
            base_url,
            client,
        })
    }

    fn endpoint(&self, model_id: &str) -> Result<Url, ProviderError> {
        self.base_url
            .join(&format!("v1beta/models/{}:generateContent", model_id))
            .map_err(|e| ProviderError::non_retryable(format!("invalid model id {}: {}", model_id, e)))
    }
}

#[async_trait]
impl Synthesizer for GeminiTtsClient {
    async fn synthesize(
        &self,
        text: &str,
        voice: &str,
        style_instruction: &str,
        model_id: &str,
    ) -> Result<Vec<u8>, ProviderError> {
        let url = self.endpoint(model_id)?;

        let request_body = GenerateRequest {
            contents: vec![Content {
                role: "user".to_string(),
                parts: vec![TextPart {
                    text: build_prompt(text, style_instruction),
                }],
            }],
            generation_config: GenerationConfig {
                temperature: self.config.temperature,
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: voice.to_string(),
                        },
                    },
                },
            },
        };

        debug!("POST {} (voice {})", url, voice);
        let resp = self
            .client
            .post(url)
            .header("x-goog-api-key", &self.config.api_key)
            .json(&request_body)
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;

        let status = resp.status();
        let body = resp.text().await.map_err(|e| classify_transport(&e))?;

        if !status.is_success() {
            let err = classify_status(status, &body);
            warn!("Gemini {} returned {}: {}", model_id, status, err.detail);
            return Err(err);
        }

        extract_audio(&body)
    }
}

fn classify_transport(err: &reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::timeout(err.to_string())
    } else if err.is_builder() {
        ProviderError::non_retryable(err.to_string())
    } else {
        ProviderError::transient(err.to_string())
    }
}

fn classify_status(status: StatusCode, body: &str) -> ProviderError {
    let (message, api_status) = match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) => (envelope.error.message, envelope.error.status),
        Err(_) => (body.chars().take(500).collect(), String::new()),
    };
    let detail = format!("HTTP {}: {}", status.as_u16(), message);

    if status == StatusCode::TOO_MANY_REQUESTS || api_status == "RESOURCE_EXHAUSTED" {
        ProviderError::quota_exceeded(detail)
    } else if status == StatusCode::REQUEST_TIMEOUT || status == StatusCode::GATEWAY_TIMEOUT {
        ProviderError::timeout(detail)
    } else if status.is_server_error() {
        ProviderError::transient(detail)
    } else {
        ProviderError::non_retryable(detail)
    }
}

/// Pulls the inline audio out of a successful response and wraps it as WAV.
fn extract_audio(body: &str) -> Result<Vec<u8>, ProviderError> {
    let response: GenerateResponse = serde_json::from_str(body)
        .map_err(|e| ProviderError::transient(format!("unreadable response: {}", e)))?;

    let candidate = response
        .candidates
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::transient("response has no candidates"))?;

    let mut pcm = Vec::new();
    let mut mime_type = String::from("audio/pcm");
    if let Some(content) = candidate.content {
        for part in content.parts {
            if let Some(inline) = part.inline_data {
                let chunk = base64::engine::general_purpose::STANDARD
                    .decode(inline.data.as_bytes())
                    .map_err(|e| ProviderError::transient(format!("bad audio payload: {}", e)))?;
                pcm.extend_from_slice(&chunk);
                mime_type = inline.mime_type;
            }
        }
    }

    if pcm.is_empty() {
        let reason = candidate.finish_reason.unwrap_or_else(|| "UNKNOWN".to_string());
        let detail = format!("no audio in response, finish reason {}", reason);
        return Err(match reason.as_str() {
            "SAFETY" | "PROHIBITED_CONTENT" | "BLOCKLIST" | "SPII" => {
                ProviderError::non_retryable(detail)
            }
            _ => ProviderError::transient(detail),
        });
    }

    Ok(pcm_to_wav(&pcm, parse_audio_mime_type(&mime_type)))
}
