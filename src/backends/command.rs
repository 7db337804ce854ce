//! External synthesizer process speaking raw PCM on stdout.
//!
//! One process per generation. The text goes to stdin, s16le mono samples come
//! back on stdout and are cut into frames as they arrive. Killing the child is how
//! a cancelled generation stops.

use super::{
    AudioFrame, FrameIter, GenerationRequest, ModelError, ModelResult, SpeechModel,
    BYTES_PER_SAMPLE,
};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdout, Command, Stdio};
use std::thread::JoinHandle;
use tracing::{debug, warn};

pub struct CommandModel {
    program: PathBuf,
    base_args: Vec<String>,
    sample_rate: u32,
    frame_bytes: usize,
}

impl CommandModel {
    pub fn new(program: impl Into<PathBuf>, base_args: Vec<String>, sample_rate: u32) -> Self {
        Self {
            program: program.into(),
            base_args,
            sample_rate,
            // ~100ms of audio per read
            frame_bytes: ((sample_rate / 10).max(1) as usize) * BYTES_PER_SAMPLE,
        }
    }

    fn args_for(&self, request: &GenerationRequest) -> Vec<String> {
        let mut args = self.base_args.clone();
        args.push("--cfg-value".to_string());
        args.push(request.cfg_value.to_string());
        args.push("--inference-timesteps".to_string());
        args.push(request.inference_timesteps.to_string());

        if let Some(prompt) = &request.prompt {
            args.push("--prompt-audio".to_string());
            args.push(prompt.audio.to_string_lossy().into_owned());
            args.push("--prompt-text".to_string());
            args.push(prompt.text.clone());
        }

        if request.retry.enabled {
            args.push("--retry-badcase".to_string());
            args.push("--retry-max-times".to_string());
            args.push(request.retry.max_times.to_string());
            args.push("--retry-ratio-threshold".to_string());
            args.push(request.retry.ratio_threshold.to_string());
        }
        args
    }
}

impl SpeechModel for CommandModel {
    fn id(&self) -> &'static str {
        "command"
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn generate<'a>(&'a mut self, request: &GenerationRequest) -> ModelResult<FrameIter<'a>> {
        let mut child = Command::new(&self.program)
            .args(self.args_for(request))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                ModelError::new(format!("failed to start {}: {e}", self.program.display()))
            })?;

        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(ModelError::new("child stdout not captured"));
            }
        };

        // Feed stdin on its own thread so a child that answers before reading all
        // of its input cannot deadlock against us.
        let stdin = child.stdin.take().map(|mut stdin| {
            let text = request.text.clone();
            std::thread::spawn(move || {
                stdin.write_all(text.as_bytes())?;
                stdin.write_all(b"\n")
                // stdin is dropped here, closing the pipe
            })
        });

        // Drain stderr on the side so a chatty child cannot block on a full pipe.
        let stderr = child.stderr.take().map(|mut stderr| {
            std::thread::spawn(move || {
                let mut text = String::new();
                let _ = stderr.read_to_string(&mut text);
                text
            })
        });

        debug!(program = %self.program.display(), pid = child.id(), "Synthesizer started");

        Ok(Box::new(PcmReader {
            child,
            stdout,
            stdin,
            stderr,
            frame_bytes: self.frame_bytes,
            carry: None,
            finished: false,
        }))
    }
}

/// Frames read off a running synthesizer.
struct PcmReader {
    child: Child,
    stdout: ChildStdout,
    stdin: Option<JoinHandle<std::io::Result<()>>>,
    stderr: Option<JoinHandle<String>>,
    frame_bytes: usize,
    /// Odd byte left over from the previous read.
    carry: Option<u8>,
    finished: bool,
}

impl PcmReader {
    /// Reap the child and turn its exit into a result. A failed exit reports the
    /// synthesizer's stderr in place of any pipe error on our side.
    fn finish(&mut self) -> ModelResult<()> {
        self.finished = true;
        let status = self.child.wait()?;
        let written = self
            .stdin
            .take()
            .map(|handle| {
                handle
                    .join()
                    .unwrap_or_else(|_| Err(std::io::Error::other("stdin writer panicked")))
            })
            .unwrap_or(Ok(()));
        let stderr = self
            .stderr
            .take()
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();

        if !status.success() {
            return Err(ModelError::new(format!(
                "synthesizer exited with {status}: {}",
                stderr.trim()
            )));
        }
        match written {
            // A successful child may stop reading once it has what it needs.
            Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => Err(ModelError::new(format!(
                "failed to write text to synthesizer: {e}"
            ))),
            _ => Ok(()),
        }
    }

    /// Stop the child after a read error and report both.
    fn abort(&mut self, err: std::io::Error) -> ModelError {
        let _ = self.child.kill();
        match self.finish() {
            Err(exit) => ModelError::new(format!("reading synthesizer output failed: {err}; {exit}")),
            Ok(()) => err.into(),
        }
    }
}

impl Iterator for PcmReader {
    type Item = ModelResult<AudioFrame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        let mut buf = vec![0u8; self.frame_bytes];
        let mut filled = 0;
        if let Some(byte) = self.carry.take() {
            buf[0] = byte;
            filled = 1;
        }

        loop {
            match self.stdout.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => {
                    filled += n;
                    if filled >= BYTES_PER_SAMPLE {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Some(Err(self.abort(e))),
            }
        }

        if filled < BYTES_PER_SAMPLE {
            // EOF
            return match self.finish() {
                Ok(()) => None,
                Err(e) => Some(Err(e)),
            };
        }

        let usable = filled - filled % BYTES_PER_SAMPLE;
        if usable < filled {
            self.carry = Some(buf[usable]);
        }
        Some(Ok(AudioFrame::from_le_bytes(&buf[..usable])))
    }
}

impl Drop for PcmReader {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(e) = self.child.kill() {
            warn!("Failed to kill synthesizer: {e}");
        }
        let _ = self.child.wait();
        debug!("Synthesizer stopped before completion");
    }
}
