//! Speech synthesis capability invoked inside the enclave, plus request
//! validation and audio encoding.

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};

/// Output sample rate of the synthesizer (mono).
pub const SAMPLE_RATE: u32 = 24_000;

/// Longest accepted voice identifier.
pub const MAX_VOICE_ID_LEN: usize = 64;

/// Accepted speed multipliers.
pub const SPEED_RANGE: std::ops::RangeInclusive<f32> = 0.25..=4.0;

/// Failure inside the synthesis capability.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SynthesisError {
    #[error("voice not available")]
    UnknownVoice,

    #[error("synthesis failed: {0}")]
    Failed(String),

    #[error("audio output does not fit the container")]
    OutputTooLarge,
}

/// Opaque text-to-speech engine.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Render `text` as f32 mono PCM at [`SAMPLE_RATE`].
    async fn synthesize(
        &self,
        text: &str,
        voice: &str,
        speed: f32,
    ) -> Result<Vec<f32>, SynthesisError>;
}

/// Request-level refusal sent back to the client as an `ErrorNotice`.
///
/// Only the stable identifier crosses the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    UnsupportedVoice,
    InvalidSpeed,
    SynthesisFailed,
}

impl Rejection {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UnsupportedVoice => "unsupported_voice",
            Self::InvalidSpeed => "invalid_speed",
            Self::SynthesisFailed => "synthesis_failed",
        }
    }
}

impl From<SynthesisError> for Rejection {
    fn from(err: SynthesisError) -> Self {
        match err {
            SynthesisError::UnknownVoice => Self::UnsupportedVoice,
            SynthesisError::Failed(_) | SynthesisError::OutputTooLarge => Self::SynthesisFailed,
        }
    }
}

/// Check a voice id's shape and, if given, membership in `allowed`.
pub fn validate_voice(voice: &str, allowed: Option<&[String]>) -> Result<(), Rejection> {
    let well_formed = !voice.is_empty()
        && voice.len() <= MAX_VOICE_ID_LEN
        && voice
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
    if !well_formed {
        return Err(Rejection::UnsupportedVoice);
    }
    match allowed {
        Some(list) if !list.iter().any(|v| v == voice) => Err(Rejection::UnsupportedVoice),
        _ => Ok(()),
    }
}

pub fn validate_speed(speed: f32) -> Result<(), Rejection> {
    if speed.is_finite() && SPEED_RANGE.contains(&speed) {
        Ok(())
    } else {
        Err(Rejection::InvalidSpeed)
    }
}

/// Encoding applied to synthesized samples before they are chunked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AudioFormat {
    /// RIFF/WAVE, 16-bit PCM, mono.
    #[default]
    Wav16,
    /// Headerless little-endian f32 samples.
    RawF32Le,
}

impl AudioFormat {
    /// Encode `samples`. WAV output is refused when its sizes overflow the
    /// 32-bit RIFF length fields.
    pub fn encode(self, samples: &[f32]) -> Result<Bytes, SynthesisError> {
        match self {
            Self::Wav16 => encode_wav16(samples, SAMPLE_RATE),
            Self::RawF32Le => {
                let mut buf = BytesMut::with_capacity(samples.len() * 4);
                for &s in samples {
                    buf.put_f32_le(s);
                }
                Ok(buf.freeze())
            }
        }
    }
}

const WAV_HEADER_LEN: usize = 44;

/// Size of the `data` chunk for `sample_count` 16-bit samples. The RIFF
/// chunk size (`36 + data`) must fit in a `u32` too.
fn wav_data_len(sample_count: usize) -> Result<u32, SynthesisError> {
    sample_count
        .checked_mul(2)
        .and_then(|n| u32::try_from(n).ok())
        .filter(|n| n.checked_add(36).is_some())
        .ok_or(SynthesisError::OutputTooLarge)
}

fn encode_wav16(samples: &[f32], sample_rate: u32) -> Result<Bytes, SynthesisError> {
    let data_len = wav_data_len(samples.len())?;
    let mut buf = BytesMut::with_capacity(WAV_HEADER_LEN + data_len as usize);

    buf.put_slice(b"RIFF");
    buf.put_u32_le(36 + data_len);
    buf.put_slice(b"WAVE");

    buf.put_slice(b"fmt ");
    buf.put_u32_le(16);
    buf.put_u16_le(1); // PCM
    buf.put_u16_le(1); // mono
    buf.put_u32_le(sample_rate);
    buf.put_u32_le(sample_rate * 2);
    buf.put_u16_le(2);
    buf.put_u16_le(16);

    buf.put_slice(b"data");
    buf.put_u32_le(data_len);
    for &s in samples {
        let clamped = if s.is_nan() { 0.0 } else { s.clamp(-1.0, 1.0) };
        buf.put_i16_le((clamped * 32767.0) as i16);
    }
    Ok(buf.freeze())
}

/// Split encoded audio into chunks of at most `chunk_size` bytes.
///
/// Empty audio still yields one (empty) chunk so the response can carry a
/// final marker.
pub fn split_chunks(audio: Bytes, chunk_size: usize) -> Vec<Bytes> {
    if audio.is_empty() {
        return vec![Bytes::new()];
    }
    let size = chunk_size.max(1);
    let mut chunks = Vec::with_capacity(audio.len().div_ceil(size));
    let mut rest = audio;
    while !rest.is_empty() {
        let take = size.min(rest.len());
        chunks.push(rest.split_to(take));
    }
    chunks
}

/// Deterministic sine-tone synthesizer for tests and local development.
#[cfg(any(test, feature = "mock"))]
#[derive(Debug, Clone)]
pub struct ToneSynthesizer {
    voices: Vec<String>,
    samples_per_char: usize,
}

#[cfg(any(test, feature = "mock"))]
impl ToneSynthesizer {
    /// Voices a default instance knows.
    pub const DEFAULT_VOICES: [&'static str; 4] = ["af_bella", "af_sky", "am_adam", "bf_emma"];

    pub fn new() -> Self {
        Self {
            voices: Self::DEFAULT_VOICES.iter().map(|v| v.to_string()).collect(),
            samples_per_char: 240,
        }
    }

    /// Number of samples produced per input character at speed 1.0.
    pub fn with_samples_per_char(mut self, n: usize) -> Self {
        self.samples_per_char = n;
        self
    }
}

#[cfg(any(test, feature = "mock"))]
impl Default for ToneSynthesizer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(any(test, feature = "mock"))]
#[async_trait]
impl SpeechSynthesizer for ToneSynthesizer {
    async fn synthesize(
        &self,
        text: &str,
        voice: &str,
        speed: f32,
    ) -> Result<Vec<f32>, SynthesisError> {
        if !self.voices.iter().any(|v| v == voice) {
            return Err(SynthesisError::UnknownVoice);
        }
        let n = (text.chars().count() as f32 * self.samples_per_char as f32 / speed) as usize;
        let step = 2.0 * std::f32::consts::PI * 440.0 / SAMPLE_RATE as f32;
        Ok((0..n).map(|i| (i as f32 * step).sin() * 0.5).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wav_header_layout() {
        let wav = AudioFormat::Wav16.encode(&[0.0, 1.0, -1.0]).unwrap();
        assert_eq!(wav.len(), WAV_HEADER_LEN + 6);
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(&wav[4..8], &(36u32 + 6).to_le_bytes());
        assert_eq!(&wav[24..28], &SAMPLE_RATE.to_le_bytes());
        assert_eq!(&wav[40..44], &6u32.to_le_bytes());
        assert_eq!(&wav[46..48], &32767i16.to_le_bytes());
        assert_eq!(&wav[48..50], &(-32767i16).to_le_bytes());
    }

    #[test]
    fn raw_format_is_f32_le() {
        let raw = AudioFormat::RawF32Le.encode(&[0.5]).unwrap();
        assert_eq!(&raw[..], &0.5f32.to_le_bytes());
    }

    #[test]
    fn wav_length_fields_never_truncate() {
        assert_eq!(wav_data_len(3), Ok(6));
        let largest = (u32::MAX as usize - 36) / 2;
        assert!(wav_data_len(largest).is_ok());
        assert_eq!(wav_data_len(largest + 1), Err(SynthesisError::OutputTooLarge));
        assert_eq!(wav_data_len(usize::MAX), Err(SynthesisError::OutputTooLarge));
        assert_eq!(
            Rejection::from(SynthesisError::OutputTooLarge),
            Rejection::SynthesisFailed
        );
    }

    #[test]
    fn split_respects_chunk_size() {
        let chunks = split_chunks(Bytes::from(vec![0u8; 10]), 4);
        let sizes: Vec<_> = chunks.iter().map(Bytes::len).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
    }

    #[test]
    fn empty_audio_yields_one_chunk() {
        let chunks = split_chunks(Bytes::new(), 4);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].is_empty());
    }

    #[test]
    fn voice_validation() {
        assert!(validate_voice("af_bella", None).is_ok());
        assert!(validate_voice("", None).is_err());
        assert!(validate_voice("bad voice", None).is_err());
        assert!(validate_voice(&"a".repeat(65), None).is_err());
        let allowed = vec!["am_adam".to_string()];
        assert_eq!(
            validate_voice("af_bella", Some(&allowed)),
            Err(Rejection::UnsupportedVoice)
        );
        assert!(validate_voice("am_adam", Some(&allowed)).is_ok());
    }

    #[test]
    fn speed_validation() {
        assert!(validate_speed(1.0).is_ok());
        assert!(validate_speed(0.25).is_ok());
        assert!(validate_speed(4.0).is_ok());
        assert!(validate_speed(0.1).is_err());
        assert!(validate_speed(f32::NAN).is_err());
        assert!(validate_speed(f32::INFINITY).is_err());
    }

    #[tokio::test]
    async fn tone_synthesizer_scales_with_text() {
        let synth = ToneSynthesizer::new().with_samples_per_char(10);
        let samples = synth.synthesize("Hello", "af_bella", 1.0).await.unwrap();
        assert_eq!(samples.len(), 50);
        assert_eq!(
            synth.synthesize("Hello", "nobody", 1.0).await,
            Err(SynthesisError::UnknownVoice)
        );
    }
}
