#![allow(dead_code)]

use axum::body::Body;
use axum::http::{Request, Response};
use axum::Router;
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tower::ServiceExt;
use voxcpm_server::api::{self, AppState};
use voxcpm_server::backends::{
    AudioFrame, FrameIter, GenerationRequest, ModelError, ModelResult, SpeechModel,
};
use voxcpm_server::engine::SynthesisEngine;
use voxcpm_server::voices::VoiceRegistry;

pub const SAMPLE_RATE: u32 = 16000;
pub const SAMPLES_PER_CHAR: usize = 4;

/// What the stub model saw, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Start { text: String, prompt_text: Option<String> },
    End(String),
}

pub type EventLog = Arc<Mutex<Vec<Event>>>;

/// Stub model driven by the input text:
/// `fail` errors after one frame, `forever` never finishes, `slow ...` sleeps
/// between frames, anything else yields one frame per character.
pub struct StubModel {
    events: EventLog,
}

struct Logged<I> {
    inner: I,
    text: String,
    events: EventLog,
}

impl<I: Iterator> Iterator for Logged<I> {
    type Item = I::Item;
    fn next(&mut self) -> Option<I::Item> {
        self.inner.next()
    }
}

impl<I> Drop for Logged<I> {
    fn drop(&mut self) {
        self.events.lock().unwrap().push(Event::End(self.text.clone()));
    }
}

impl SpeechModel for StubModel {
    fn id(&self) -> &'static str {
        "stub"
    }

    fn sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }

    fn generate<'a>(&'a mut self, request: &GenerationRequest) -> ModelResult<FrameIter<'a>> {
        let text = request.text.clone();
        self.events.lock().unwrap().push(Event::Start {
            text: text.clone(),
            prompt_text: request.prompt.as_ref().map(|p| p.text.clone()),
        });

        let inner: FrameIter<'static> = if text == "fail" {
            Box::new(
                vec![
                    Ok(AudioFrame::new(vec![1; SAMPLES_PER_CHAR])),
                    Err(ModelError::new("CUDA error: out of memory at /opt/model")),
                ]
                .into_iter(),
            )
        } else if text == "forever" {
            Box::new(std::iter::repeat_with(|| {
                thread::sleep(Duration::from_millis(1));
                Ok(AudioFrame::new(vec![9; 64]))
            }))
        } else if text.starts_with("slow") {
            let frames: Vec<_> = text
                .chars()
                .map(|c| AudioFrame::new(vec![c as i16; SAMPLES_PER_CHAR]))
                .collect();
            Box::new(frames.into_iter().map(|f| {
                thread::sleep(Duration::from_millis(5));
                Ok(f)
            }))
        } else {
            let frames: Vec<_> = text
                .chars()
                .map(|c| Ok(AudioFrame::new(vec![c as i16; SAMPLES_PER_CHAR])))
                .collect();
            Box::new(frames.into_iter())
        };

        Ok(Box::new(Logged {
            inner,
            text,
            events: Arc::clone(&self.events),
        }))
    }
}

pub struct TestApp {
    pub router: Router,
    pub state: Arc<AppState>,
    pub events: EventLog,
}

pub fn spawn_app(voices_dir: &Path) -> TestApp {
    let events: EventLog = Arc::new(Mutex::new(Vec::new()));
    let model_events = Arc::clone(&events);
    let engine = SynthesisEngine::start(
        move || Ok(Box::new(StubModel { events: model_events }) as Box<dyn SpeechModel>),
        2,
    )
    .expect("engine starts");

    let state = Arc::new(AppState::new(engine, VoiceRegistry::new(voices_dir)));
    TestApp {
        router: api::router(Arc::clone(&state)),
        state,
        events,
    }
}

impl TestApp {
    pub async fn post_raw(&self, body: impl Into<Body>) -> Response<Body> {
        let request = Request::builder()
            .method("POST")
            .uri("/v1/audio/speech")
            .header("content-type", "application/json")
            .body(body.into())
            .unwrap();
        self.router.clone().oneshot(request).await.unwrap()
    }

    pub async fn speech(&self, body: Value) -> Response<Body> {
        self.post_raw(body.to_string()).await
    }

    pub async fn get(&self, uri: &str) -> Response<Body> {
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        self.router.clone().oneshot(request).await.unwrap()
    }

    pub fn starts(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                Event::Start { text, .. } => Some(text.clone()),
                Event::End(_) => None,
            })
            .collect()
    }
}

pub async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

pub async fn body_json(response: Response<Body>) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

/// Write a short mono 16-bit WAV sample.
pub fn write_wav(path: &Path) {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec).unwrap();
    for i in 0..160 {
        writer.write_sample((i * 100) as i16).unwrap();
    }
    writer.finalize().unwrap();
}

/// Expected little-endian PCM for a plain input.
pub fn expected_pcm(text: &str) -> Vec<u8> {
    text.chars()
        .flat_map(|c| std::iter::repeat(c as i16).take(SAMPLES_PER_CHAR))
        .flat_map(|s| s.to_le_bytes())
        .collect()
}
