//! voxcpm-control - CLI for a running voxcpm-server
//!
//! Talks to the server over its HTTP API.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use voxcpm_server::client::{SpeakOptions, SpeechClient, DEFAULT_SERVER};
use voxcpm_server::request::ResponseFormat;

/// CLI for the VoxCPM speech server
#[derive(Parser)]
#[command(name = "voxcpm-control")]
#[command(version)]
#[command(about = "Control utility for the VoxCPM speech server", long_about = None)]
struct Cli {
    /// Server base URL
    #[arg(long, default_value = DEFAULT_SERVER)]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Synthesize text into a WAV file
    Speak {
        /// Text to speak
        text: String,
        /// Voice profile (omit for the default voice)
        #[arg(short, long)]
        voice: Option<String>,
        /// Classifier-free guidance strength
        #[arg(long)]
        cfg_value: Option<f32>,
        /// Diffusion steps
        #[arg(long)]
        steps: Option<u32>,
        /// Regenerate bad cases (true/false)
        #[arg(long)]
        retry_badcase: Option<bool>,
        /// Maximum bad-case retries
        #[arg(long)]
        retry_max_times: Option<u32>,
        /// Audio/text length ratio that counts as a bad case
        #[arg(long)]
        retry_ratio_threshold: Option<f32>,
        /// Stream raw PCM and wrap it locally
        #[arg(long)]
        stream: bool,
        /// Wire format: wav or pcm
        #[arg(short, long, default_value = "wav")]
        format: ResponseFormat,
        /// Output file
        #[arg(short, long, default_value = "speech.wav")]
        output: PathBuf,
        /// Sample rate used to wrap PCM (defaults to the server's)
        #[arg(long)]
        sample_rate: Option<u32>,
    },

    /// List available voices
    Voices,

    /// Check server health
    Health,

    /// Show usage counters
    Metrics,

    /// Show server directories
    Paths,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = SpeechClient::new(cli.server)?;

    match cli.command {
        Commands::Speak {
            text,
            voice,
            cfg_value,
            steps,
            retry_badcase,
            retry_max_times,
            retry_ratio_threshold,
            stream,
            format,
            output,
            sample_rate,
        } => {
            // Streaming is only incremental for raw PCM.
            let format = if stream { ResponseFormat::Pcm } else { format };
            let sample_rate = match (format, sample_rate) {
                (_, Some(rate)) => rate,
                (ResponseFormat::Pcm, None) => client.health()?["sample_rate"]
                    .as_u64()
                    .and_then(|r| u32::try_from(r).ok())
                    .unwrap_or(44100),
                (ResponseFormat::Wav, None) => 44100,
            };

            let options = SpeakOptions {
                voice,
                cfg_value,
                inference_timesteps: steps,
                retry_badcase,
                retry_max_times,
                retry_ratio_threshold,
                format,
                stream,
            };
            println!("Synthesizing: {}", text);
            let wav = client.speak_wav(&text, &options, sample_rate)?;
            std::fs::write(&output, &wav)?;
            println!("Saved {} bytes to {}", wav.len(), output.display());
        }

        Commands::Voices => {
            let voices = client.voices()?;
            println!("Available voices ({}):", voices.len());
            for voice in voices {
                println!("  {}", voice);
            }
        }

        Commands::Health => {
            let health = client.health()?;
            println!("Status:      {}", health["status"].as_str().unwrap_or("unknown"));
            println!("Backend:     {}", health["backend"].as_str().unwrap_or("-"));
            println!("Sample rate: {}", health["sample_rate"]);
            println!("Queued jobs: {}", health["queued_jobs"]);
            println!("Uptime:      {}s", health["uptime_secs"]);
            println!("Version:     {}", health["version"].as_str().unwrap_or("-"));
        }

        Commands::Metrics => {
            let m = client.metrics()?;
            println!("Queries:         {}", m.total_queries);
            println!("Words:           {}", m.total_words);
            println!("Processing time: {:.2}s", m.total_processing_time);
            println!("Audio generated: {:.2}s", m.total_audio_duration_seconds);
        }

        Commands::Paths => {
            let paths = client.paths()?;
            println!("{}", serde_json::to_string_pretty(&paths)?);
        }
    }

    Ok(())
}
