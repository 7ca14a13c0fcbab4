use crate::core::config::ProviderConfig;
use crate::core::error::ProviderError;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::info;
use std::sync::Arc;

/// The remote speech provider, seen as one opaque call per line. Every failure
/// comes back classified; implementations must return within their own timeout.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(
        &self,
        text: &str,
        voice: &str,
        style_instruction: &str,
        model_id: &str,
    ) -> Result<Vec<u8>, ProviderError>;
}

pub fn create_synthesizer(config: &ProviderConfig) -> Result<Arc<dyn Synthesizer>> {
    info!("Initializing synthesis provider: {}", config.kind);
    match config.kind.as_str() {
        "gemini" => {
            let gemini_config =
                resolve_gemini_config(config.gemini.as_ref(), std::env::var("GEMINI_API_KEY").ok());
            Ok(Arc::new(gemini::GeminiTtsClient::new(gemini_config)?))
        }
        "mock" => Ok(Arc::new(mock::MockSynthesizer::new())),
        _ => Err(anyhow!("Unknown synthesis provider: {}", config.kind)),
    }
}

/// Configured Gemini settings (defaults when the block is absent) with
/// `env_key` filling an empty API key. The result is never written back.
fn resolve_gemini_config(
    configured: Option<&gemini::GeminiTtsConfig>,
    env_key: Option<String>,
) -> gemini::GeminiTtsConfig {
    let mut resolved = configured.cloned().unwrap_or_default();
    if resolved.api_key.trim().is_empty() {
        if let Some(key) = env_key.filter(|k| !k.trim().is_empty()) {
            resolved.api_key = key;
        }
    }
    resolved
}

/// Style direction goes first, separated from the line by a blank line.
pub fn build_prompt(text: &str, style_instruction: &str) -> String {
    let style = style_instruction.trim();
    if style.is_empty() {
        text.to_string()
    } else {
        format!("{}\n\n{}", style, text)
    }
}

pub mod gemini;
pub mod mock;
