use config::{Config, Environment, File};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Which model implementation the server drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Built-in sine generator, no weights needed.
    Tone,
    /// External synthesizer process writing PCM to stdout.
    Command,
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tone" => Ok(Self::Tone),
            "command" => Ok(Self::Command),
            other => Err(format!("unknown backend: {other}")),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub bind_addr: SocketAddr,
    pub voices_dir: PathBuf,
    pub output_dir: PathBuf,
    pub backend: BackendKind,
    // Command backend
    pub model_command: String,
    pub model_args: Vec<String>,
    /// Where the model weights live. Informational only.
    pub model_path: PathBuf,
    pub sample_rate: u32,
    /// Frames buffered between the model worker and the HTTP response.
    pub frame_queue_depth: usize,
    pub shutdown_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 5000)),
            voices_dir: PathBuf::from("voices"),
            output_dir: PathBuf::from("saved_outputs"),
            backend: BackendKind::Tone,
            model_command: String::new(),
            model_args: Vec::new(),
            model_path: default_model_path(),
            // VoxCPM 1.5 generates 44.1kHz audio
            sample_rate: 44100,
            frame_queue_depth: 4,
            shutdown_timeout_secs: 30,
        }
    }
}

impl Settings {
    /// Load settings from defaults, config files and `VOXCPM_*` environment
    /// variables, in increasing priority. `extra` is an explicit file from the
    /// command line; it must exist if given. Call [`Settings::validate`] once any
    /// command-line overrides are applied.
    pub fn new(extra: Option<&Path>) -> Result<Self, config::ConfigError> {
        let defaults = Self::default();

        let mut builder = Config::builder()
            .set_default("bind_addr", defaults.bind_addr.to_string())?
            .set_default("voices_dir", path_str(&defaults.voices_dir))?
            .set_default("output_dir", path_str(&defaults.output_dir))?
            .set_default("backend", "tone")?
            .set_default("model_command", defaults.model_command.clone())?
            .set_default("model_args", Vec::<String>::new())?
            .set_default("model_path", path_str(&defaults.model_path))?
            .set_default("sample_rate", defaults.sample_rate as i64)?
            .set_default("frame_queue_depth", defaults.frame_queue_depth as i64)?
            .set_default("shutdown_timeout_secs", defaults.shutdown_timeout_secs as i64)?
            // Merge with local config file (if exists)
            .add_source(File::with_name("Voxcpm").required(false));

        if let Some(home) = dirs::home_dir() {
            builder = builder.add_source(
                File::from(home.join(".config/voxcpm-server/Voxcpm")).required(false),
            );
        }

        if let Some(path) = extra {
            builder = builder.add_source(File::from(path.to_path_buf()).required(true));
        }

        // Environment last, e.g. VOXCPM_BIND_ADDR
        let builder = builder.add_source(
            Environment::with_prefix("VOXCPM")
                .try_parsing(true)
                .list_separator(" ")
                .with_list_parse_key("model_args"),
        );

        builder.build()?.try_deserialize()
    }

    pub fn validate(&self) -> Result<(), config::ConfigError> {
        if self.sample_rate == 0 {
            return Err(config::ConfigError::Message(
                "sample_rate must be greater than 0".to_string(),
            ));
        }
        if self.frame_queue_depth == 0 {
            return Err(config::ConfigError::Message(
                "frame_queue_depth must be greater than 0".to_string(),
            ));
        }
        if self.backend == BackendKind::Command && self.model_command.trim().is_empty() {
            return Err(config::ConfigError::Message(
                "backend 'command' requires model_command".to_string(),
            ));
        }
        Ok(())
    }
}

/// Hugging Face hub cache entry for the VoxCPM weights, honouring `HF_HOME`.
pub fn default_model_path() -> PathBuf {
    let hub = std::env::var_os("HF_HOME")
        .map(PathBuf::from)
        .or_else(|| dirs::home_dir().map(|h| h.join(".cache").join("huggingface").join("hub")))
        .unwrap_or_else(|| PathBuf::from("."));
    let model_dir = hub.join("models--openbmb--VoxCPM1.5");
    if model_dir.exists() {
        model_dir
    } else {
        hub
    }
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
