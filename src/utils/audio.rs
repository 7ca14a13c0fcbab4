use anyhow::{anyhow, Result};
use std::io::{Cursor, Read, Seek, SeekFrom};
use std::time::Duration;

pub const DEFAULT_SAMPLE_RATE: u32 = 24_000;
pub const DEFAULT_BITS_PER_SAMPLE: u16 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub bits_per_sample: u16,
    pub sample_rate: u32,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            bits_per_sample: DEFAULT_BITS_PER_SAMPLE,
            sample_rate: DEFAULT_SAMPLE_RATE,
        }
    }
}

/// Reads bits per sample and rate from a mime type such as `audio/L16;rate=24000`.
/// Unparseable parts fall back to 16 bit / 24 kHz.
pub fn parse_audio_mime_type(mime_type: &str) -> AudioFormat {
    let mut format = AudioFormat::default();

    for param in mime_type.split(';').map(str::trim) {
        if let Some(rate) = param
            .get(..5)
            .filter(|p| p.eq_ignore_ascii_case("rate="))
            .and_then(|_| param[5..].parse::<u32>().ok())
        {
            format.sample_rate = rate;
        } else if let Some(bits) = param.strip_prefix("audio/L") {
            if let Ok(bits) = bits.parse::<u16>() {
                format.bits_per_sample = bits;
            }
        }
    }

    format
}

/// Wraps raw mono PCM in a canonical 44 byte RIFF/WAVE header.
pub fn pcm_to_wav(pcm: &[u8], format: AudioFormat) -> Vec<u8> {
    let num_channels: u16 = 1;
    let bytes_per_sample = format.bits_per_sample / 8;
    let block_align = num_channels * bytes_per_sample;
    let byte_rate = format.sample_rate * block_align as u32;
    let data_size = pcm.len() as u32;

    let mut out = Vec::with_capacity(44 + pcm.len());
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_size).to_le_bytes());
    out.extend_from_slice(b"WAVE");

    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes()); // PCM
    out.extend_from_slice(&num_channels.to_le_bytes());
    out.extend_from_slice(&format.sample_rate.to_le_bytes());
    out.extend_from_slice(&byte_rate.to_le_bytes());
    out.extend_from_slice(&block_align.to_le_bytes());
    out.extend_from_slice(&format.bits_per_sample.to_le_bytes());

    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_size.to_le_bytes());
    out.extend_from_slice(pcm);
    out
}

pub fn silent_wav(duration: Duration, format: AudioFormat) -> Vec<u8> {
    let samples = (format.sample_rate as u128 * duration.as_millis() / 1000) as usize;
    let pcm = vec![0u8; samples * (format.bits_per_sample / 8) as usize];
    pcm_to_wav(&pcm, format)
}

struct WavInfo {
    byte_rate: u32,
    data_size: u32,
}

fn scan_wav(bytes: &[u8]) -> Result<WavInfo> {
    let mut f = Cursor::new(bytes);

    let mut id = [0u8; 4];
    f.read_exact(&mut id)?;
    if &id != b"RIFF" {
        return Err(anyhow!("Not a RIFF file"));
    }
    f.seek(SeekFrom::Current(4))?;
    f.read_exact(&mut id)?;
    if &id != b"WAVE" {
        return Err(anyhow!("Not a WAVE file"));
    }

    let mut byte_rate: Option<u32> = None;
    loop {
        let mut chunk_id = [0u8; 4];
        let n = f.read(&mut chunk_id)?;
        if n == 0 {
            break;
        }
        if n < 4 {
            return Err(anyhow!("Unexpected EOF reading chunk ID"));
        }

        let mut size_buf = [0u8; 4];
        f.read_exact(&mut size_buf)?;
        let chunk_size = u32::from_le_bytes(size_buf);

        if &chunk_id == b"fmt " {
            let mut buf = vec![0u8; chunk_size as usize];
            f.read_exact(&mut buf)?;
            if buf.len() < 12 {
                return Err(anyhow!("fmt chunk too short"));
            }
            byte_rate = Some(u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]));
        } else if &chunk_id == b"data" {
            return Ok(WavInfo {
                byte_rate: byte_rate.ok_or_else(|| anyhow!("data chunk before fmt chunk"))?,
                data_size: chunk_size,
            });
        } else {
            f.seek(SeekFrom::Current(chunk_size as i64))?;
        }
    }

    Err(anyhow!("Missing data chunk"))
}

/// Playback length of a PCM WAV payload.
pub fn wav_duration(bytes: &[u8]) -> Result<Duration> {
    let info = scan_wav(bytes)?;
    if info.byte_rate == 0 {
        return Err(anyhow!("WAV byte rate is zero"));
    }
    Ok(Duration::from_secs_f64(
        info.data_size as f64 / info.byte_rate as f64,
    ))
}
