//! Deterministic stand-in model: one short sine burst per input character.
//!
//! Useful for exercising the server end to end without model weights.

use super::{AudioFrame, FrameIter, GenerationRequest, ModelResult, SpeechModel};

pub struct ToneModel {
    sample_rate: u32,
    frame_samples: usize,
    samples_per_char: usize,
}

impl ToneModel {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            frame_samples: (sample_rate / 20).max(1) as usize,
            samples_per_char: (sample_rate / 40).max(1) as usize,
        }
    }

    /// Override the frame size, mostly for tests that want many small frames.
    pub fn with_frame_samples(mut self, frame_samples: usize) -> Self {
        self.frame_samples = frame_samples.max(1);
        self
    }

    /// Base pitch: a cloned voice shifts it so conditioning is audible.
    fn pitch_hz(request: &GenerationRequest) -> f32 {
        let shift = request
            .prompt
            .as_ref()
            .map(|p| (p.text.len() % 12) as f32 * 15.0)
            .unwrap_or(0.0);
        220.0 + shift
    }
}

impl SpeechModel for ToneModel {
    fn id(&self) -> &'static str {
        "tone"
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn generate<'a>(&'a mut self, request: &GenerationRequest) -> ModelResult<FrameIter<'a>> {
        let total = request.text.chars().count() * self.samples_per_char;
        let pitch = Self::pitch_hz(request);
        let amplitude = (0.2 + 0.05 * request.cfg_value).min(0.8);
        let rate = self.sample_rate as f32;
        let frame_samples = self.frame_samples;

        let mut produced = 0usize;
        let iter = std::iter::from_fn(move || {
            if produced >= total {
                return None;
            }
            let end = (produced + frame_samples).min(total);
            let samples: Vec<f32> = (produced..end)
                .map(|n| {
                    let t = n as f32 / rate;
                    amplitude * (2.0 * std::f32::consts::PI * pitch * t).sin()
                })
                .collect();
            produced = end;
            Some(Ok(AudioFrame::from_f32(&samples)))
        });

        Ok(Box::new(iter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::RetryPolicy;

    fn request(text: &str) -> GenerationRequest {
        GenerationRequest {
            text: text.to_string(),
            prompt: None,
            cfg_value: 2.0,
            inference_timesteps: 10,
            retry: RetryPolicy::default(),
        }
    }

    #[test]
    fn test_length_follows_text() {
        let mut model = ToneModel::new(16000).with_frame_samples(100);
        let frames: Vec<_> = model
            .generate(&request("hello"))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();

        let total: usize = frames.iter().map(|f| f.len()).sum();
        assert_eq!(total, 5 * 400);
        assert_eq!(frames.len(), 20);
    }

    #[test]
    fn test_deterministic() {
        let mut model = ToneModel::new(8000);
        let a: Vec<_> = model.generate(&request("abc")).unwrap().collect::<Result<_, _>>().unwrap();
        let b: Vec<_> = model.generate(&request("abc")).unwrap().collect::<Result<_, _>>().unwrap();
        assert_eq!(a, b);
    }
}
