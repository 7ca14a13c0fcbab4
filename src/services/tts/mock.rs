use crate::core::error::ProviderError;
use crate::services::tts::Synthesizer;
use crate::utils::audio::{silent_wav, AudioFormat};
use async_trait::async_trait;
use log::debug;
use std::time::Duration;

/// Offline provider: one second of silence per line, no quota spent anywhere.
pub struct MockSynthesizer {
    duration: Duration,
}

impl MockSynthesizer {
    pub fn new() -> Self {
        Self {
            duration: Duration::from_secs(1),
        }
    }
}

impl Default for MockSynthesizer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Synthesizer for MockSynthesizer {
    async fn synthesize(
        &self,
        text: &str,
        voice: &str,
        _style_instruction: &str,
        model_id: &str,
    ) -> Result<Vec<u8>, ProviderError> {
        if text.trim().is_empty() {
            return Err(ProviderError::non_retryable("empty text"));
        }
        debug!("Mock synthesis with {} / {}: {}", model_id, voice, text);
        Ok(silent_wav(self.duration, AudioFormat::default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::audio::wav_duration;

    #[tokio::test]
    async fn test_mock_returns_one_second_of_wav() {
        let synth = MockSynthesizer::new();
        let wav = synth.synthesize("Hello", "Kore", "", "m1").await.unwrap();
        assert_eq!(wav_duration(&wav).unwrap(), Duration::from_secs(1));
    }
}
