//! Turns an OpenAI-shaped `/v1/audio/speech` body into a typed [`SynthesisJob`].
//!
//! Extended generation parameters may sit at the top level (where the OpenAI
//! client's `extra_body` ends up) or inside a literal `extra_body` object.

use crate::backends::RetryPolicy;
use crate::error::{SpeechError, SpeechResult};
use crate::voices::DEFAULT_VOICE;
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;

pub const DEFAULT_CFG_VALUE: f32 = 2.0;
pub const DEFAULT_INFERENCE_TIMESTEPS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseFormat {
    #[default]
    Wav,
    Pcm,
}

impl ResponseFormat {
    pub fn content_type(self) -> &'static str {
        match self {
            Self::Wav => "audio/wav",
            Self::Pcm => "audio/pcm",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Wav => "wav",
            Self::Pcm => "pcm",
        }
    }
}

impl fmt::Display for ResponseFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl std::str::FromStr for ResponseFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "wav" => Ok(Self::Wav),
            "pcm" => Ok(Self::Pcm),
            other => Err(format!("unsupported response format '{other}'")),
        }
    }
}

/// A validated synthesis request.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisJob {
    pub input: String,
    /// `"default"` means no conditioning.
    pub voice: String,
    pub cfg_value: f32,
    pub inference_timesteps: u32,
    pub response_format: ResponseFormat,
    pub stream: bool,
    /// Accepted for compatibility. The model has no speed control.
    pub speed: Option<f64>,
    pub retry: RetryPolicy,
}

impl SynthesisJob {
    pub fn uses_default_voice(&self) -> bool {
        self.voice == DEFAULT_VOICE
    }

    /// Whether frames go to the client as they are produced. WAV needs its length
    /// up front, so a streamed WAV request is still answered in one piece.
    pub fn streams_incrementally(&self) -> bool {
        self.stream && self.response_format == ResponseFormat::Pcm
    }

    pub fn word_count(&self) -> usize {
        self.input.split_whitespace().count()
    }
}

/// Validate a raw request body.
pub fn normalize(raw: &Value) -> SpeechResult<SynthesisJob> {
    let body = raw
        .as_object()
        .ok_or_else(|| SpeechError::validation("body", "request body must be a JSON object"))?;
    let extra = body.get("extra_body").and_then(Value::as_object);

    let input = match body.get("input") {
        Some(Value::String(text)) if !text.trim().is_empty() => text.clone(),
        Some(Value::String(_)) => {
            return Err(SpeechError::validation("input", "must not be empty"));
        }
        None | Some(Value::Null) => {
            return Err(SpeechError::validation("input", "missing 'input' field"));
        }
        Some(_) => return Err(SpeechError::validation("input", "must be a string")),
    };

    let voice = match body.get("voice") {
        None | Some(Value::Null) => DEFAULT_VOICE.to_string(),
        Some(Value::String(v)) if v.is_empty() => DEFAULT_VOICE.to_string(),
        Some(Value::String(v)) => v.clone(),
        Some(_) => return Err(SpeechError::validation("voice", "must be a string")),
    };

    let response_format = match body.get("response_format") {
        None | Some(Value::Null) => ResponseFormat::default(),
        Some(Value::String(f)) => f
            .parse()
            .map_err(|e: String| SpeechError::validation("response_format", e + "; expected wav or pcm"))?,
        Some(_) => {
            return Err(SpeechError::validation("response_format", "must be a string"));
        }
    };

    let stream = optional_bool(body, extra, "stream")?.unwrap_or(false);

    let speed = match body.get("speed") {
        None | Some(Value::Null) => None,
        Some(v) => Some(
            v.as_f64()
                .ok_or_else(|| SpeechError::validation("speed", "must be a number"))?,
        ),
    };

    let cfg_value = match lookup(body, extra, "cfg_value") {
        None => DEFAULT_CFG_VALUE,
        Some(v) => {
            let cfg = v
                .as_f64()
                .ok_or_else(|| SpeechError::validation("cfg_value", "must be a number"))?;
            positive_f32(cfg, "cfg_value")?
        }
    };

    let inference_timesteps = match lookup(body, extra, "inference_timesteps") {
        None => DEFAULT_INFERENCE_TIMESTEPS,
        Some(v) => {
            let steps = integer(v, "inference_timesteps")?;
            if steps < 1 {
                return Err(SpeechError::validation(
                    "inference_timesteps",
                    "must be at least 1",
                ));
            }
            steps
        }
    };

    let defaults = RetryPolicy::default();
    let retry = RetryPolicy {
        enabled: optional_bool(body, extra, "retry_badcase")?.unwrap_or(defaults.enabled),
        max_times: match lookup(body, extra, "retry_badcase_max_times") {
            None => defaults.max_times,
            Some(v) => integer(v, "retry_badcase_max_times")?,
        },
        ratio_threshold: match lookup(body, extra, "retry_badcase_ratio_threshold") {
            None => defaults.ratio_threshold,
            Some(v) => {
                let ratio = v.as_f64().ok_or_else(|| {
                    SpeechError::validation("retry_badcase_ratio_threshold", "must be a number")
                })?;
                positive_f32(ratio, "retry_badcase_ratio_threshold")?
            }
        },
    };

    Ok(SynthesisJob {
        input,
        voice,
        cfg_value,
        inference_timesteps,
        response_format,
        stream,
        speed,
        retry,
    })
}

fn positive_f32(value: f64, field: &'static str) -> SpeechResult<f32> {
    if value > f32::MAX as f64 {
        return Err(SpeechError::validation(field, "is too large"));
    }
    if !value.is_finite() || value <= 0.0 {
        return Err(SpeechError::validation(field, "must be greater than 0"));
    }
    Ok(value as f32)
}

/// Top-level key first, then `extra_body`. Explicit nulls count as absent.
fn lookup<'a>(
    body: &'a Map<String, Value>,
    extra: Option<&'a Map<String, Value>>,
    key: &str,
) -> Option<&'a Value> {
    body.get(key)
        .filter(|v| !v.is_null())
        .or_else(|| extra.and_then(|e| e.get(key)).filter(|v| !v.is_null()))
}

fn optional_bool(
    body: &Map<String, Value>,
    extra: Option<&Map<String, Value>>,
    key: &'static str,
) -> SpeechResult<Option<bool>> {
    match lookup(body, extra, key) {
        None => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(SpeechError::validation(key, "must be a boolean")),
    }
}

/// Non-negative integer; integral floats such as `10.0` are accepted.
fn integer(value: &Value, field: &'static str) -> SpeechResult<u32> {
    if let Some(n) = value.as_u64() {
        return u32::try_from(n).map_err(|_| SpeechError::validation(field, "is too large"));
    }
    match value.as_f64() {
        Some(f) if f.is_finite() && f.fract() == 0.0 && f >= 0.0 && f <= u32::MAX as f64 => {
            Ok(f as u32)
        }
        Some(f) if f < 0.0 => Err(SpeechError::validation(field, "must not be negative")),
        _ => Err(SpeechError::validation(field, "must be an integer")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn field_of(err: SpeechError) -> &'static str {
        match err {
            SpeechError::Validation { field, .. } => field,
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_defaults() {
        let job = normalize(&json!({"input": "Hello world", "model": "tts-1"})).unwrap();

        assert_eq!(job.input, "Hello world");
        assert_eq!(job.voice, "default");
        assert!(job.uses_default_voice());
        assert_eq!(job.cfg_value, DEFAULT_CFG_VALUE);
        assert_eq!(job.inference_timesteps, DEFAULT_INFERENCE_TIMESTEPS);
        assert_eq!(job.response_format, ResponseFormat::Wav);
        assert!(!job.stream);
        assert_eq!(job.speed, None);
        assert_eq!(job.retry, RetryPolicy::default());
        assert_eq!(job.word_count(), 2);
    }

    #[test]
    fn test_extended_fields() {
        let job = normalize(&json!({
            "input": "hi",
            "voice": "alice",
            "response_format": "pcm",
            "stream": true,
            "speed": 1.5,
            "cfg_value": 3,
            "inference_timesteps": 20.0,
            "retry_badcase": false,
            "retry_badcase_max_times": 1,
            "retry_badcase_ratio_threshold": 4.5,
        }))
        .unwrap();

        assert_eq!(job.voice, "alice");
        assert_eq!(job.response_format, ResponseFormat::Pcm);
        assert!(job.stream);
        assert!(job.streams_incrementally());
        assert_eq!(job.speed, Some(1.5));
        assert_eq!(job.cfg_value, 3.0);
        assert_eq!(job.inference_timesteps, 20);
        assert!(!job.retry.enabled);
        assert_eq!(job.retry.max_times, 1);
        assert_eq!(job.retry.ratio_threshold, 4.5);
    }

    #[test]
    fn test_nested_extra_body() {
        let job = normalize(&json!({
            "input": "hi",
            "extra_body": {"cfg_value": 1.25, "inference_timesteps": 4}
        }))
        .unwrap();
        assert_eq!(job.cfg_value, 1.25);
        assert_eq!(job.inference_timesteps, 4);

        // Top level wins.
        let job = normalize(&json!({
            "input": "hi",
            "cfg_value": 2.5,
            "extra_body": {"cfg_value": 1.25}
        }))
        .unwrap();
        assert_eq!(job.cfg_value, 2.5);
    }

    #[test]
    fn test_wav_stream_is_buffered() {
        let job = normalize(&json!({"input": "hi", "stream": true})).unwrap();
        assert!(job.stream);
        assert!(!job.streams_incrementally());
    }

    #[test]
    fn test_out_of_range_floats() {
        let message = |body: Value| match normalize(&body).unwrap_err() {
            SpeechError::Validation { message, .. } => message,
            other => panic!("expected validation error, got {other:?}"),
        };

        assert_eq!(message(json!({"input": "hi", "cfg_value": 1e300})), "is too large");
        assert_eq!(message(json!({"input": "hi", "cfg_value": -1.0})), "must be greater than 0");
        assert_eq!(
            message(json!({"input": "hi", "retry_badcase_ratio_threshold": 1e39})),
            "is too large"
        );
        assert_eq!(
            message(json!({"input": "hi", "retry_badcase_ratio_threshold": 0})),
            "must be greater than 0"
        );
    }

    #[test]
    fn test_missing_input() {
        assert_eq!(field_of(normalize(&json!({})).unwrap_err()), "input");
        assert_eq!(field_of(normalize(&json!({"input": null})).unwrap_err()), "input");
        assert_eq!(field_of(normalize(&json!({"input": 42})).unwrap_err()), "input");
    }

    #[test]
    fn test_bad_format() {
        let err = normalize(&json!({"input": "hi", "response_format": "mp3"})).unwrap_err();
        assert_eq!(field_of(err), "response_format");
    }

    #[test]
    fn test_bad_generation_params() {
        for (body, field) in [
            (json!({"input": "hi", "cfg_value": 0}), "cfg_value"),
            (json!({"input": "hi", "cfg_value": -1.0}), "cfg_value"),
            (json!({"input": "hi", "cfg_value": "2.0"}), "cfg_value"),
            (json!({"input": "hi", "inference_timesteps": 0}), "inference_timesteps"),
            (json!({"input": "hi", "inference_timesteps": 2.5}), "inference_timesteps"),
            (json!({"input": "hi", "inference_timesteps": -3}), "inference_timesteps"),
            (json!({"input": "hi", "inference_timesteps": "ten"}), "inference_timesteps"),
            (json!({"input": "hi", "stream": "yes"}), "stream"),
            (json!({"input": "hi", "speed": "fast"}), "speed"),
            (json!({"input": "hi", "voice": 7}), "voice"),
            (json!({"input": "hi", "retry_badcase_ratio_threshold": 0}), "retry_badcase_ratio_threshold"),
        ] {
            assert_eq!(field_of(normalize(&body).unwrap_err()), field, "{body}");
        }
    }

    #[test]
    fn test_non_object_body() {
        assert_eq!(field_of(normalize(&json!(["input"])).unwrap_err()), "body");
    }

    proptest! {
        #[test]
        fn prop_blank_input_always_rejected(
            blank in "[ \t\n\r]{0,16}",
            format in prop_oneof![Just("wav"), Just("pcm")],
            stream in any::<bool>(),
            cfg in 0.1f64..10.0,
        ) {
            let body = json!({
                "input": blank,
                "response_format": format,
                "stream": stream,
                "cfg_value": cfg,
                "voice": "someone",
            });
            let err = normalize(&body).unwrap_err();
            prop_assert_eq!(field_of(err), "input");
        }

        #[test]
        fn prop_valid_params_accepted(cfg in 0.01f64..100.0, steps in 1u32..500) {
            let job = normalize(&json!({
                "input": "some words",
                "cfg_value": cfg,
                "inference_timesteps": steps,
            })).unwrap();
            prop_assert_eq!(job.inference_timesteps, steps);
            prop_assert!(job.cfg_value > 0.0);
        }
    }
}
