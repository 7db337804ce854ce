//! Wiring: settings → model worker → router → listener.

use crate::api::{self, AppState};
use crate::backends::command::CommandModel;
use crate::backends::tone::ToneModel;
use crate::backends::{ModelResult, SpeechModel};
use crate::config_loader::{BackendKind, Settings};
use crate::engine::SynthesisEngine;
use crate::error::SpeechResult;
use crate::voices::VoiceRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

/// Build the model the settings ask for. Runs on the model worker thread.
pub fn model_factory(
    settings: &Settings,
) -> impl FnOnce() -> ModelResult<Box<dyn SpeechModel>> + Send + 'static {
    let backend = settings.backend;
    let command = settings.model_command.clone();
    let args = settings.model_args.clone();
    let sample_rate = settings.sample_rate;

    move || {
        let model: Box<dyn SpeechModel> = match backend {
            BackendKind::Tone => Box::new(ToneModel::new(sample_rate)),
            BackendKind::Command => Box::new(CommandModel::new(command, args, sample_rate)),
        };
        Ok(model)
    }
}

/// Start the model worker and assemble the shared state.
pub fn build_state(settings: &Settings) -> SpeechResult<Arc<AppState>> {
    if !settings.voices_dir.exists() {
        match std::fs::create_dir_all(&settings.voices_dir) {
            Ok(()) => info!(dir = %settings.voices_dir.display(), "Created voices directory"),
            Err(e) => warn!(dir = %settings.voices_dir.display(), "Cannot create voices directory: {e}"),
        }
    }

    let engine = SynthesisEngine::start(model_factory(settings), settings.frame_queue_depth)?;
    let state = AppState::new(engine, VoiceRegistry::new(&settings.voices_dir))
        .with_paths(settings.output_dir.clone(), settings.model_path.clone());
    Ok(Arc::new(state))
}

/// Serve until SIGINT/SIGTERM, then give in-flight requests
/// `shutdown_timeout` to finish.
pub async fn run(settings: Settings) -> SpeechResult<()> {
    let state = build_state(&settings)?;
    let app = api::router(Arc::clone(&state));

    let listener = TcpListener::bind(settings.bind_addr).await?;
    info!(addr = %settings.bind_addr, "Speech server listening");

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);
    let mut server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown_rx.changed().await.ok();
            })
            .await
    });

    tokio::select! {
        result = &mut server => {
            return result
                .map_err(|e| std::io::Error::other(e.to_string()))?
                .map_err(Into::into);
        }
        _ = shutdown_signal() => {}
    }

    info!("Shutdown signal received, draining requests...");
    let _ = shutdown_tx.send(true);

    let timeout = Duration::from_secs(settings.shutdown_timeout_secs);
    match tokio::time::timeout(timeout, server).await {
        Ok(_) => info!("Server stopped gracefully"),
        Err(_) => warn!("Shutdown timeout, forcing exit"),
    }
    state.engine.shutdown();
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
