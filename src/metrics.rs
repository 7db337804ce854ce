//! Usage counters served on `/v1/metrics`.

use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub total_queries: u64,
    pub total_words: u64,
    /// Seconds spent from request receipt to the last audio byte.
    pub total_processing_time: f64,
    pub total_audio_duration_seconds: f64,
}

#[derive(Debug, Default)]
pub struct UsageMetrics {
    inner: Mutex<UsageSnapshot>,
}

impl UsageMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one completed synthesis.
    pub fn record(&self, words: usize, processing: Duration, samples: usize, sample_rate: u32) {
        let audio_seconds = if sample_rate > 0 {
            samples as f64 / sample_rate as f64
        } else {
            0.0
        };

        if let Ok(mut m) = self.inner.lock() {
            m.total_queries += 1;
            m.total_words += words as u64;
            m.total_processing_time += processing.as_secs_f64();
            m.total_audio_duration_seconds += audio_seconds;
        }
    }

    pub fn snapshot(&self) -> UsageSnapshot {
        self.inner.lock().map(|m| *m).unwrap_or_default()
    }
}
