//! Single-flight access to the speech model.
//!
//! The model lives on one dedicated thread and is fed from a FIFO job queue, so
//! at most one generation runs at any time and it runs until its last frame has
//! been handed over (or its consumer has gone away). Frames reach the caller over
//! a small bounded channel: the worker can never run far ahead of the consumer,
//! and a dropped [`FrameStream`] stops generation at the next frame boundary.

use crate::backends::{AudioFrame, GenerationRequest, ModelResult, RetryPolicy, SpeechModel};
use crate::error::{SpeechError, SpeechResult, SynthesisCause};
use crate::request::SynthesisJob;
use crate::voices::VoiceProfile;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Identity of the loaded model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelInfo {
    pub id: &'static str,
    pub sample_rate: u32,
}

type FrameResult = Result<AudioFrame, SynthesisCause>;

struct QueuedJob {
    text: String,
    cfg_value: f32,
    inference_timesteps: u32,
    retry: RetryPolicy,
    profile: Option<VoiceProfile>,
    frames: mpsc::Sender<FrameResult>,
    queued_at: Instant,
}

enum WorkerMessage {
    Job(QueuedJob),
    /// Finish the jobs queued so far, then exit.
    Stop,
}

/// Clears the availability flag however the worker thread exits.
struct AliveGuard(Arc<AtomicBool>);

impl Drop for AliveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// How a generation ended on the worker side.
enum Delivery {
    Completed { frames: usize, samples: usize },
    ConsumerGone { frames: usize },
}

/// Handle to the model worker. Cheap to clone.
#[derive(Clone)]
pub struct SynthesisEngine {
    jobs: std_mpsc::Sender<WorkerMessage>,
    info: ModelInfo,
    frame_queue_depth: usize,
    pending: Arc<AtomicUsize>,
    alive: Arc<AtomicBool>,
}

impl SynthesisEngine {
    /// Spawn the worker thread and build the model on it.
    ///
    /// The model is constructed on the worker so it never has to cross threads.
    /// Blocks until the model is ready or has failed to load.
    pub fn start<F>(factory: F, frame_queue_depth: usize) -> SpeechResult<Self>
    where
        F: FnOnce() -> ModelResult<Box<dyn SpeechModel>> + Send + 'static,
    {
        let (jobs_tx, jobs_rx) = std_mpsc::channel::<WorkerMessage>();
        let (ready_tx, ready_rx) = std_mpsc::channel::<ModelResult<ModelInfo>>();
        let pending = Arc::new(AtomicUsize::new(0));
        let worker_pending = Arc::clone(&pending);
        let alive = Arc::new(AtomicBool::new(true));
        let worker_alive = AliveGuard(Arc::clone(&alive));

        thread::Builder::new()
            .name("speech-model".to_string())
            .spawn(move || {
                let _alive = worker_alive;
                let mut model = match factory() {
                    Ok(model) => model,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(ModelInfo {
                    id: model.id(),
                    sample_rate: model.sample_rate(),
                }));

                while let Ok(message) = jobs_rx.recv() {
                    match message {
                        WorkerMessage::Job(job) => {
                            worker_pending.fetch_sub(1, Ordering::SeqCst);
                            run_job(model.as_mut(), job);
                        }
                        WorkerMessage::Stop => break,
                    }
                }
                debug!("Model worker shutting down");
            })?;

        let info = ready_rx
            .recv()
            .map_err(|_| SpeechError::SynthesisFailed(SynthesisCause::WorkerUnavailable))?
            .map_err(|e| SpeechError::model(format!("model failed to load: {e}")))?;

        info!(
            backend = info.id,
            sample_rate = info.sample_rate,
            "Speech model ready"
        );

        Ok(Self {
            jobs: jobs_tx,
            info,
            frame_queue_depth: frame_queue_depth.max(1),
            pending,
            alive,
        })
    }

    pub fn info(&self) -> ModelInfo {
        self.info
    }

    pub fn sample_rate(&self) -> u32 {
        self.info.sample_rate
    }

    /// Whether the worker thread is still taking jobs.
    pub fn is_available(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Ask the worker to exit once the jobs already queued are done. Later
    /// [`invoke`](Self::invoke) calls fail with `WorkerUnavailable`.
    pub fn shutdown(&self) {
        if self.jobs.send(WorkerMessage::Stop).is_ok() {
            debug!("Model worker stop requested");
        }
    }

    /// Jobs accepted but not yet picked up by the worker.
    pub fn queued_jobs(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Queue a generation. Frames arrive on the returned stream as the model
    /// produces them; drop the stream to cancel.
    pub fn invoke(
        &self,
        job: &SynthesisJob,
        profile: Option<VoiceProfile>,
    ) -> SpeechResult<FrameStream> {
        if !self.is_available() {
            return Err(SpeechError::SynthesisFailed(
                SynthesisCause::WorkerUnavailable,
            ));
        }
        let (frames_tx, frames_rx) = mpsc::channel(self.frame_queue_depth);

        let queued = QueuedJob {
            text: job.input.clone(),
            cfg_value: job.cfg_value,
            inference_timesteps: job.inference_timesteps,
            retry: job.retry,
            profile,
            frames: frames_tx,
            queued_at: Instant::now(),
        };

        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.jobs.send(WorkerMessage::Job(queued)).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(SpeechError::SynthesisFailed(
                SynthesisCause::WorkerUnavailable,
            ));
        }

        Ok(FrameStream {
            rx: frames_rx,
            sample_rate: self.info.sample_rate,
        })
    }
}

/// Lazy, finite, non-restartable sequence of frames for one job.
#[derive(Debug)]
pub struct FrameStream {
    rx: mpsc::Receiver<FrameResult>,
    sample_rate: u32,
}

impl FrameStream {
    /// Next frame, `None` once generation has finished.
    pub async fn next(&mut self) -> Option<SpeechResult<AudioFrame>> {
        self.rx
            .recv()
            .await
            .map(|item| item.map_err(SpeechError::SynthesisFailed))
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

fn run_job(model: &mut dyn SpeechModel, job: QueuedJob) {
    let waited = job.queued_at.elapsed();

    if job.frames.is_closed() {
        debug!(waited_ms = waited.as_millis() as u64, "Skipping job cancelled while queued");
        return;
    }

    let started = Instant::now();
    let frames = job.frames.clone();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| generate_into(model, &job)));

    match outcome {
        Ok(Ok(Delivery::Completed { frames, samples })) => {
            debug!(
                frames,
                samples,
                waited_ms = waited.as_millis() as u64,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Generation completed"
            );
        }
        Ok(Ok(Delivery::ConsumerGone { frames })) => {
            info!(frames, "Client disconnected, generation cancelled");
        }
        Ok(Err(cause)) => {
            warn!(%cause, "Generation failed");
            let _ = frames.blocking_send(Err(cause));
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(%message, "Model panicked during generation");
            let _ = frames.blocking_send(Err(SynthesisCause::Panicked(message)));
        }
    }
}

fn generate_into(model: &mut dyn SpeechModel, job: &QueuedJob) -> Result<Delivery, SynthesisCause> {
    let prompt = match &job.profile {
        Some(profile) => Some(profile.load_prompt().map_err(into_cause)?),
        None => None,
    };
    if let Some(prompt) = &prompt {
        debug!(prompt_audio = %prompt.audio.display(), prompt_text = %prompt.text, "Using voice prompt");
    }

    let request = GenerationRequest {
        text: job.text.clone(),
        prompt,
        cfg_value: job.cfg_value,
        inference_timesteps: job.inference_timesteps,
        retry: job.retry,
    };

    let iter = model
        .generate(&request)
        .map_err(|e| SynthesisCause::Model(e.to_string()))?;

    let mut frames = 0usize;
    let mut samples = 0usize;
    for item in iter {
        let frame = item.map_err(|e| SynthesisCause::Model(e.to_string()))?;
        if frame.is_empty() {
            continue;
        }
        samples += frame.len();
        if job.frames.blocking_send(Ok(frame)).is_err() {
            return Ok(Delivery::ConsumerGone { frames });
        }
        frames += 1;
    }

    Ok(Delivery::Completed { frames, samples })
}

fn into_cause(err: SpeechError) -> SynthesisCause {
    match err {
        SpeechError::SynthesisFailed(cause) => cause,
        other => SynthesisCause::Model(other.to_string()),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
