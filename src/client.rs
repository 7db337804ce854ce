//! Blocking HTTP client for the speech server, used by `voxcpm-control`.

use crate::encoder::wav_spec;
use crate::metrics::UsageSnapshot;
use crate::request::ResponseFormat;
use serde::Deserialize;
use serde_json::{json, Value};
use std::io::{Cursor, Write};
use std::time::Duration;

pub const DEFAULT_SERVER: &str = "http://localhost:5000";

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with an error envelope.
    #[error("server returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("audio error: {0}")]
    Audio(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Request options beyond the text itself. `None` leaves the server default.
#[derive(Debug, Clone, Default)]
pub struct SpeakOptions {
    pub voice: Option<String>,
    pub cfg_value: Option<f32>,
    pub inference_timesteps: Option<u32>,
    /// Model-side regeneration of implausibly long or short audio.
    pub retry_badcase: Option<bool>,
    pub retry_max_times: Option<u32>,
    pub retry_ratio_threshold: Option<f32>,
    pub format: ResponseFormat,
    pub stream: bool,
}

#[derive(Deserialize)]
struct VoicesBody {
    voices: Vec<String>,
}

pub struct SpeechClient {
    base_url: String,
    http: reqwest::blocking::Client,
}

impl SpeechClient {
    pub fn new(base_url: impl Into<String>) -> ClientResult<Self> {
        let http = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            // Generation can take a while; no overall timeout.
            .timeout(None)
            .build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Synthesize `text`, copying the response body into `out` as it arrives.
    /// Returns the number of bytes written.
    pub fn speak_into<W: Write>(
        &self,
        text: &str,
        options: &SpeakOptions,
        out: &mut W,
    ) -> ClientResult<u64> {
        let payload = speech_payload(text, options);

        let mut response = self
            .http
            .post(self.url("/v1/audio/speech"))
            .json(&payload)
            .send()?;
        check(&mut response)?;
        Ok(response.copy_to(out)?)
    }

    /// Synthesize `text` and return a WAV file regardless of the wire format.
    /// Raw PCM (e.g. from a streamed request) is wrapped locally at `sample_rate`.
    pub fn speak_wav(
        &self,
        text: &str,
        options: &SpeakOptions,
        sample_rate: u32,
    ) -> ClientResult<Vec<u8>> {
        let mut body = Vec::new();
        self.speak_into(text, options, &mut body)?;
        match options.format {
            ResponseFormat::Wav => Ok(body),
            ResponseFormat::Pcm => pcm_to_wav(&body, sample_rate),
        }
    }

    pub fn voices(&self) -> ClientResult<Vec<String>> {
        let body: VoicesBody = self.get_json("/v1/voices")?;
        Ok(body.voices)
    }

    pub fn metrics(&self) -> ClientResult<UsageSnapshot> {
        self.get_json("/v1/metrics")
    }

    pub fn health(&self) -> ClientResult<Value> {
        self.get_json("/health")
    }

    pub fn paths(&self) -> ClientResult<Value> {
        self.get_json("/v1/system/paths")
    }

    fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> ClientResult<T> {
        let mut response = self
            .http
            .get(self.url(path))
            .timeout(Duration::from_secs(5))
            .send()?;
        check(&mut response)?;
        Ok(response.json()?)
    }
}

/// OpenAI-shaped request body. Unset options are left out so the server
/// applies its own defaults.
fn speech_payload(text: &str, options: &SpeakOptions) -> Value {
    let mut payload = json!({
        "model": "voxcpm",
        "input": text,
        "response_format": options.format.extension(),
        "stream": options.stream,
    });
    if let Some(voice) = &options.voice {
        payload["voice"] = json!(voice);
    }
    if let Some(cfg) = options.cfg_value {
        payload["cfg_value"] = json!(cfg);
    }
    if let Some(steps) = options.inference_timesteps {
        payload["inference_timesteps"] = json!(steps);
    }
    if let Some(retry) = options.retry_badcase {
        payload["retry_badcase"] = json!(retry);
    }
    if let Some(times) = options.retry_max_times {
        payload["retry_badcase_max_times"] = json!(times);
    }
    if let Some(ratio) = options.retry_ratio_threshold {
        payload["retry_badcase_ratio_threshold"] = json!(ratio);
    }
    payload
}

/// Turn a non-success response into `ClientError::Api`, pulling the message out
/// of the error envelope when there is one.
fn check(response: &mut reqwest::blocking::Response) -> ClientResult<()> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }

    let mut text = String::new();
    let _ = std::io::Read::read_to_string(response, &mut text);
    let message = serde_json::from_str::<Value>(&text)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
        .unwrap_or(text);

    Err(ClientError::Api {
        status: status.as_u16(),
        message,
    })
}

/// Wrap little-endian s16 mono samples in a WAV container.
pub fn pcm_to_wav(pcm: &[u8], sample_rate: u32) -> ClientResult<Vec<u8>> {
    let mut cursor = Cursor::new(Vec::with_capacity(pcm.len() + 44));
    {
        let mut writer = hound::WavWriter::new(&mut cursor, wav_spec(sample_rate))
            .map_err(|e| ClientError::Audio(e.to_string()))?;
        for pair in pcm.chunks_exact(2) {
            writer
                .write_sample(i16::from_le_bytes([pair[0], pair[1]]))
                .map_err(|e| ClientError::Audio(e.to_string()))?;
        }
        writer
            .finalize()
            .map_err(|e| ClientError::Audio(e.to_string()))?;
    }
    Ok(cursor.into_inner())
}
