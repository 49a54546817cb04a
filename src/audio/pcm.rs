//! Sample conversion between normalized floats, 16-bit PCM and the base64
//! text carried inside JSON envelopes.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::error::{LiveError, LiveResult};

/// The only sample rate spoken on the wire.
pub const PCM_SAMPLE_RATE: u32 = 16_000;

/// MIME tag attached to every audio chunk, in both directions.
pub const PCM_MIME_TYPE: &str = "audio/pcm;rate=16000";

/// Immutable mono 16 kHz PCM16 buffer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PcmBuffer {
    samples: Vec<i16>,
}

impl PcmBuffer {
    pub fn new(samples: Vec<i16>) -> Self {
        Self { samples }
    }

    /// Quantize one captured block.
    pub fn from_frame(frame: &[f32]) -> Self {
        Self::new(to_pcm16(frame))
    }

    /// Decode the base64 text of an inbound chunk.
    pub fn from_base64(text: &str) -> LiveResult<Self> {
        let bytes = decode(text)?;
        Ok(Self::new(bytes_to_pcm(&bytes)?))
    }

    pub fn to_base64(&self) -> String {
        encode(&pcm_to_bytes(&self.samples))
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Playback length in seconds.
    pub fn duration(&self) -> f64 {
        self.samples.len() as f64 / PCM_SAMPLE_RATE as f64
    }

    /// Render to normalized floats for the output device.
    pub fn to_f32(&self) -> Vec<f32> {
        from_pcm16(&self.samples)
    }
}

/// Clamp to [-1, 1], scale by 32767 and truncate toward zero.
pub fn to_pcm16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|s| (s.clamp(-1.0, 1.0) * 32767.0) as i16)
        .collect()
}

pub fn from_pcm16(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / 32768.0).collect()
}

pub fn pcm_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        bytes.extend_from_slice(&s.to_le_bytes());
    }
    bytes
}

pub fn bytes_to_pcm(bytes: &[u8]) -> LiveResult<Vec<i16>> {
    if bytes.len() % 2 != 0 {
        return Err(LiveError::MalformedPayload(format!(
            "odd PCM16 byte length {}",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

pub fn encode(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// All-or-nothing: any invalid symbol or padding rejects the whole text.
pub fn decode(text: &str) -> LiveResult<Vec<u8>> {
    STANDARD
        .decode(text.as_bytes())
        .map_err(|e| LiveError::MalformedPayload(e.to_string()))
}

/// Root-mean-square level of a block, 0.0 for an empty block.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum_sq / samples.len() as f64).sqrt() as f32
}
