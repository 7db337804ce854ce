pub mod command;
pub mod tone;

use crate::voices::PromptConditioning;

/// Bytes per sample in every frame: signed 16-bit little-endian, mono.
pub const BYTES_PER_SAMPLE: usize = 2;

/// A chunk of generated speech. Granularity is whatever the model produces.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AudioFrame {
    pub samples: Vec<i16>,
}

impl AudioFrame {
    pub fn new(samples: Vec<i16>) -> Self {
        Self { samples }
    }

    /// Convert float samples in `[-1.0, 1.0]` to 16-bit PCM.
    pub fn from_f32(samples: &[f32]) -> Self {
        let samples = samples
            .iter()
            .map(|&s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
            .collect();
        Self { samples }
    }

    /// Decode little-endian s16 bytes. A trailing odd byte is ignored.
    pub fn from_le_bytes(bytes: &[u8]) -> Self {
        let samples = bytes
            .chunks_exact(BYTES_PER_SAMPLE)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        Self { samples }
    }

    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.samples.len() * BYTES_PER_SAMPLE);
        for sample in &self.samples {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        bytes
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// The model's own bad-case retry: regenerate when the audio length is implausible
/// for the text.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub enabled: bool,
    pub max_times: u32,
    pub ratio_threshold: f32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_times: 3,
            ratio_threshold: 6.0,
        }
    }
}

/// Everything the model needs for one generation.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub text: String,
    pub prompt: Option<PromptConditioning>,
    pub cfg_value: f32,
    pub inference_timesteps: u32,
    pub retry: RetryPolicy,
}

/// Error reported by a model implementation.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct ModelError(pub String);

impl ModelError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

impl From<std::io::Error> for ModelError {
    fn from(err: std::io::Error) -> Self {
        Self(err.to_string())
    }
}

pub type ModelResult<T> = Result<T, ModelError>;

/// Lazy frame sequence borrowed from the model for the duration of one generation.
pub type FrameIter<'a> = Box<dyn Iterator<Item = ModelResult<AudioFrame>> + 'a>;

/// A text-to-speech model.
///
/// Implementations are stateful and are only ever driven from one thread, one
/// generation at a time. Dropping the returned iterator before it is exhausted
/// must stop generation.
pub trait SpeechModel {
    /// Short backend identifier (e.g. "tone").
    fn id(&self) -> &'static str;

    /// Output sample rate in Hz. Fixed for the model's lifetime.
    fn sample_rate(&self) -> u32;

    fn generate<'a>(&'a mut self, request: &GenerationRequest) -> ModelResult<FrameIter<'a>>;
}
