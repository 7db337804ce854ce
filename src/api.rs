//! HTTP surface: the OpenAI-compatible `/v1/audio/speech` route plus the
//! discovery endpoints the desktop client uses.

use crate::encoder::{self, EncodedAudio};
use crate::engine::{FrameStream, SynthesisEngine};
use crate::error::SpeechError;
use crate::metrics::UsageMetrics;
use crate::request::{self, ResponseFormat, SynthesisJob};
use crate::voices::{VoiceProfile, VoiceRegistry, DEFAULT_VOICE};
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Shared server state.
pub struct AppState {
    pub engine: SynthesisEngine,
    pub voices: VoiceRegistry,
    pub metrics: UsageMetrics,
    pub output_dir: PathBuf,
    pub model_path: PathBuf,
    pub started: Instant,
}

impl AppState {
    pub fn new(engine: SynthesisEngine, voices: VoiceRegistry) -> Self {
        Self {
            engine,
            voices,
            metrics: UsageMetrics::new(),
            output_dir: PathBuf::from("saved_outputs"),
            model_path: PathBuf::new(),
            started: Instant::now(),
        }
    }

    pub fn with_paths(mut self, output_dir: PathBuf, model_path: PathBuf) -> Self {
        self.output_dir = output_dir;
        self.model_path = model_path;
        self
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/audio/speech", post(speech_handler))
        .route("/v1/voices", get(voices_handler))
        .route("/v1/metrics", get(metrics_handler))
        .route("/v1/system/paths", get(paths_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Error envelope compatible with the OpenAI API.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    kind: &'static str,
    param: Option<&'static str>,
    code: Option<&'static str>,
}

impl ApiError {
    fn invalid_json(detail: impl std::fmt::Display) -> Self {
        debug!(%detail, "Rejected non-JSON body");
        Self {
            status: StatusCode::BAD_REQUEST,
            message: "Invalid request, JSON body required".to_string(),
            kind: "invalid_request_error",
            param: None,
            code: None,
        }
    }
}

impl From<SpeechError> for ApiError {
    fn from(err: SpeechError) -> Self {
        let param = err.param();
        match err {
            SpeechError::Validation { message, field } => Self {
                status: StatusCode::BAD_REQUEST,
                message: format!("Invalid '{field}': {message}"),
                kind: "invalid_request_error",
                param,
                code: None,
            },
            SpeechError::ProfileNotFound(voice) => Self {
                status: StatusCode::BAD_REQUEST,
                message: format!("Voice '{voice}' not found"),
                kind: "invalid_request_error",
                param,
                code: Some("voice_not_found"),
            },
            SpeechError::ProfileIncomplete { voice, transcript } => {
                let file = transcript
                    .file_name()
                    .map(|f| f.to_string_lossy().into_owned())
                    .unwrap_or_else(|| format!("{voice}.txt"));
                Self {
                    status: StatusCode::BAD_REQUEST,
                    message: format!(
                        "Voice '{voice}' has an audio sample but is missing its transcript file '{file}'"
                    ),
                    kind: "invalid_request_error",
                    param,
                    code: Some("voice_incomplete"),
                }
            }
            other => {
                error!(error = %other, "Speech synthesis failed");
                Self {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    message: "Speech synthesis failed".to_string(),
                    kind: "server_error",
                    param: None,
                    code: None,
                }
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": {
                "message": self.message,
                "type": self.kind,
                "param": self.param,
                "code": self.code,
            }
        });
        (self.status, Json(body)).into_response()
    }
}

#[instrument(
    skip_all,
    fields(
        voice = tracing::field::Empty,
        format = tracing::field::Empty,
        stream = tracing::field::Empty
    )
)]
async fn speech_handler(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let started = Instant::now();

    let raw: Value = serde_json::from_slice(&body).map_err(ApiError::invalid_json)?;
    let job = request::normalize(&raw)?;

    let span = tracing::Span::current();
    span.record("voice", job.voice.as_str());
    span.record("format", job.response_format.extension());
    span.record("stream", job.stream);

    if let Some(model) = raw.get("model").and_then(Value::as_str) {
        debug!(model, "Ignoring requested model name");
    }
    if let Some(speed) = job.speed {
        warn!(speed, "Speed control is not supported; generating at normal speed");
    }
    if job.stream && !job.streams_incrementally() {
        debug!("WAV needs its length up front; buffering streamed request");
    }

    let profile = if job.uses_default_voice() {
        None
    } else {
        resolve_voice(&state.voices, &job.voice).await?
    };
    info!(
        text_len = job.input.len(),
        cfg_value = job.cfg_value,
        inference_timesteps = job.inference_timesteps,
        cloned = profile.is_some(),
        "Generating speech"
    );

    let frames = state.engine.invoke(&job, profile)?;
    let sample_rate = frames.sample_rate();

    let (bytes, samples) =
        match encoder::encode(frames, &job).await? {
            EncodedAudio::Streamed(frames) => return stream_pcm(state, job, frames, started).await,
            EncodedAudio::Buffered { bytes, samples } => (bytes, samples),
        };

    state
        .metrics
        .record(job.word_count(), started.elapsed(), samples, sample_rate);
    debug!(
        bytes = bytes.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Speech ready"
    );

    let format = job.response_format;
    let length = bytes.len();
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, HeaderValue::from_static(format.content_type())),
            (header::CONTENT_LENGTH, HeaderValue::from(length)),
            (header::CONTENT_DISPOSITION, attachment(format)),
        ],
        bytes,
    )
        .into_response())
}

/// Start a chunked raw-PCM response.
///
/// The first frame is awaited before the status line is committed, so a job that
/// fails up front (e.g. an unreadable profile) still gets a proper error response.
async fn stream_pcm(
    state: Arc<AppState>,
    job: SynthesisJob,
    mut frames: FrameStream,
    started: Instant,
) -> Result<Response, ApiError> {
    let sample_rate = frames.sample_rate();
    let leading = match frames.next().await {
        Some(Ok(frame)) => Some(Bytes::from(frame.to_le_bytes())),
        Some(Err(e)) => return Err(e.into()),
        None => None,
    };
    debug!(
        first_audio_ms = started.elapsed().as_millis() as u64,
        "Streaming PCM"
    );

    let chunks = stream::iter(leading.map(Ok))
        .chain(encoder::pcm_stream(frames))
        .boxed();

    let tracker = StreamTracker {
        state,
        words: job.word_count(),
        started,
        sample_rate,
        bytes: 0,
        failed: false,
    };

    let body = stream::unfold((chunks, tracker), |(mut chunks, mut tracker)| async move {
        match chunks.next().await {
            Some(Ok(bytes)) => {
                tracker.bytes += bytes.len();
                Some((Ok(bytes), (chunks, tracker)))
            }
            Some(Err(e)) => {
                tracker.failed = true;
                error!(error = %e, "Streaming synthesis failed mid-response");
                Some((Err(e), (chunks, tracker)))
            }
            None => {
                tracker.finish();
                None
            }
        }
    });

    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static(ResponseFormat::Pcm.content_type()),
        )],
        Body::from_stream(body),
    )
        .into_response())
}

/// Records usage once a streamed body has been fully sent.
struct StreamTracker {
    state: Arc<AppState>,
    words: usize,
    started: Instant,
    sample_rate: u32,
    bytes: usize,
    failed: bool,
}

impl StreamTracker {
    fn finish(&self) {
        if self.failed {
            return;
        }
        let samples = self.bytes / crate::backends::BYTES_PER_SAMPLE;
        self.state
            .metrics
            .record(self.words, self.started.elapsed(), samples, self.sample_rate);
        debug!(
            bytes = self.bytes,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "Stream complete"
        );
    }
}

async fn resolve_voice(
    registry: &VoiceRegistry,
    voice: &str,
) -> Result<Option<VoiceProfile>, ApiError> {
    let registry = registry.clone();
    let voice = voice.to_string();
    tokio::task::spawn_blocking(move || registry.resolve(Some(&voice)))
        .await
        .map_err(|e| SpeechError::Io(std::io::Error::other(e.to_string())))?
        .map_err(ApiError::from)
}

fn attachment(format: ResponseFormat) -> HeaderValue {
    match format {
        ResponseFormat::Wav => HeaderValue::from_static("attachment; filename=\"speech.wav\""),
        ResponseFormat::Pcm => HeaderValue::from_static("attachment; filename=\"speech.pcm\""),
    }
}

#[derive(Serialize)]
struct VoicesResponse {
    voices: Vec<String>,
}

async fn voices_handler(State(state): State<Arc<AppState>>) -> Result<Json<VoicesResponse>, ApiError> {
    let registry = state.voices.clone();
    let profiles = tokio::task::spawn_blocking(move || registry.list_profiles())
        .await
        .map_err(|e| SpeechError::Io(std::io::Error::other(e.to_string())))?;

    let mut voices = vec![DEFAULT_VOICE.to_string()];
    voices.extend(profiles.into_iter().map(|p| p.id));
    Ok(Json(VoicesResponse { voices }))
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.metrics.snapshot())
}

#[derive(Serialize)]
struct PathsResponse {
    model_path: PathBuf,
    voices_path: PathBuf,
    output_path: PathBuf,
}

async fn paths_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(PathsResponse {
        model_path: state.model_path.clone(),
        voices_path: absolute(state.voices.voices_dir()),
        output_path: absolute(&state.output_dir),
    })
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    message: &'static str,
    backend: &'static str,
    sample_rate: u32,
    queued_jobs: usize,
    version: &'static str,
    uptime_secs: u64,
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let info = state.engine.info();
    let (code, status, message) = if state.engine.is_available() {
        (StatusCode::OK, "ok", "Model is ready")
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            "unavailable",
            "Model worker is not running",
        )
    };
    let body = Json(HealthResponse {
        status,
        message,
        backend: info.id,
        sample_rate: info.sample_rate,
        queued_jobs: state.engine.queued_jobs(),
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.started.elapsed().as_secs(),
    });
    (code, body)
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}
