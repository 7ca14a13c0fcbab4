use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::core::io::write_atomic;
use crate::core::state::CharacterMap;
use crate::services::tts::gemini::GeminiTtsConfig;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_input")]
    pub input_folder: String,

    #[serde(default = "default_output")]
    pub output_folder: String,

    #[serde(default = "default_build")]
    pub build_folder: String,

    #[serde(default)]
    pub unattended: bool,

    #[serde(default)]
    pub provider: ProviderConfig,

    #[serde(default)]
    pub generation: GenerationConfig,

    #[serde(default)]
    pub characters: CharacterMap,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ProviderConfig {
    #[serde(default = "default_provider_kind")]
    pub kind: String, // "gemini" or "mock"
    pub gemini: Option<GeminiTtsConfig>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: default_provider_kind(),
            gemini: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GenerationConfig {
    /// Primary model first, then fallbacks in order.
    #[serde(default = "default_models")]
    pub models: Vec<String>,
    #[serde(default)]
    pub limits: RateLimits,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub quota_policy: QuotaPolicy,
    /// Hand back the latest take instead of calling the provider when a job's
    /// character, voice, text and style are unchanged.
    #[serde(default)]
    pub reuse_unchanged: bool,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            models: default_models(),
            limits: RateLimits::default(),
            retry: RetryConfig::default(),
            quota_policy: QuotaPolicy::default(),
            reuse_unchanged: false,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct RateLimits {
    #[serde(default = "default_per_minute")]
    pub per_minute: u32,
    #[serde(default = "default_per_day")]
    pub per_day: u32,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            per_minute: default_per_minute(),
            per_day: default_per_day(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// Extra attempts against the same model after a transient failure.
    #[serde(default = "default_max_transient_retries")]
    pub max_transient_retries: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
}

impl RetryConfig {
    /// Delay before retry number `retry` (1-based): base, 2*base, 4*base, ...
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u64 << retry.saturating_sub(1).min(16);
        Duration::from_millis(self.base_backoff_ms.saturating_mul(factor))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_transient_retries: default_max_transient_retries(),
            base_backoff_ms: default_base_backoff_ms(),
        }
    }
}

/// What to do when the rate limiter denies admission.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum QuotaPolicy {
    #[default]
    FailFast,
    Wait {
        #[serde(default = "default_max_wait_seconds")]
        max_wait_seconds: u64,
    },
}

fn default_input() -> String {
    "input".to_string()
}
fn default_output() -> String {
    "output".to_string()
}
fn default_build() -> String {
    "build".to_string()
}
fn default_provider_kind() -> String {
    "gemini".to_string()
}
fn default_models() -> Vec<String> {
    vec![
        "gemini-2.5-pro-preview-tts".to_string(),
        "gemini-2.5-flash-preview-tts".to_string(),
    ]
}
fn default_per_minute() -> u32 {
    10
}
fn default_per_day() -> u32 {
    100
}
fn default_max_transient_retries() -> u32 {
    2
}
fn default_base_backoff_ms() -> u64 {
    1000
}
fn default_max_wait_seconds() -> u64 {
    90
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            anyhow::bail!("{} not found. Please create one.", path.display());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Config = serde_yaml_ng::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(config)
    }

    /// `GEMINI_API_KEY` is applied when the provider is built, never here, so
    /// the saved file only ever holds what the user wrote into it.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_yaml_ng::to_string(self)?;
        write_atomic(path, content.as_bytes())
    }

    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.input_folder)?;
        fs::create_dir_all(&self.output_folder)?;
        fs::create_dir_all(&self.build_folder)?;
        Ok(())
    }

    pub fn state_folder(&self) -> String {
        Path::new(&self.build_folder)
            .join("state")
            .to_string_lossy()
            .to_string()
    }

    pub fn cache_folder(&self) -> String {
        Path::new(&self.build_folder)
            .join("cache")
            .to_string_lossy()
            .to_string()
    }
}
