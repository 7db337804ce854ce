//! # voxcpm-server
//!
//! OpenAI-compatible speech endpoint for a local VoxCPM text-to-speech model.
//!
//! A request flows through:
//! - [`request`]: validate the JSON body into a [`request::SynthesisJob`]
//! - [`voices`]: resolve the voice name to a cloning profile
//! - [`engine`]: queue the job on the single model worker, get frames lazily
//! - [`encoder`]: turn frames into a WAV file or a raw PCM stream
//! - [`api`]: HTTP routes and error envelopes

pub mod api;
pub mod backends;
pub mod client;
pub mod config_loader;
pub mod encoder;
pub mod engine;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod request;
pub mod server;
pub mod voices;

pub use error::{SpeechError, SpeechResult, SynthesisCause};
