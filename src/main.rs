//! # Stream ASR Backend - Main Application Entry Point
//!
//! Streaming speech-to-text server. Clients stream PCM over a WebSocket and get
//! transcripts back as the model produces them.
//!
//! ## Key Rust Concepts Used:
//! - **async/await**: the HTTP side runs on actix-web's async runtime
//! - **a dedicated OS thread**: every model call happens on one worker thread,
//!   outside the async runtime, so a slow inference never stalls a request
//! - **Arc**: the session manager is shared by all HTTP workers and actors
//!
//! ## Application Architecture:
//! - **config**: configuration (TOML file + environment variables)
//! - **audio**: PCM decoding, rolling buffers, voice activity gate, sessions
//! - **worker**: the work queue and the single transcription worker
//! - **delivery**: lazily acquired transcript delivery channels
//! - **transcription**: the inference engine interface and the Whisper model
//! - **websocket**: the `/ws/audio` streaming protocol
//! - **health / handlers**: monitoring and read-only HTTP API
//! - **error**: HTTP error responses and fatal-error handling

mod audio;
mod config;
mod delivery;
mod device;
mod error;
mod handlers;
mod health;
mod state;
mod transcription;
mod websocket;
mod worker;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use state::AppState;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transcription::engine::InferenceEngine;
use transcription::model::{ModelSize, WhisperModel};
use worker::{SessionManager, StreamSettings};

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from files and environment variables
/// 2. **Sets up logging**
/// 3. **Loads the Whisper model** and starts the transcription worker
/// 4. **Configures the HTTP server** with middleware and routes
/// 5. **Shuts down gracefully**: stop accepting requests, then stop the worker
#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting {} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);

    configure_compute_threads(config.streaming.resolved_threads());

    let device = device::select_device_from_str(&config.models.device);
    let device_label = device::device_label(&device);
    let engine = load_engine(&config, device).await?;

    let settings = StreamSettings::from_config(&config);
    let sessions = Arc::new(SessionManager::init(engine, settings)?);

    let app_state = AppState::new(config.clone(), sessions.clone(), device_label);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(TracingLogger::default())
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/sessions", web::get().to(handlers::list_sessions))
                    .route("/sessions/{id}", web::get().to(handlers::get_session)),
            )
            .route("/ws/audio", web::get().to(websocket::audio_websocket))
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&bind_addr)?
    .disable_signals()
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    // Actors are gone, so every session handle has been dropped and destroyed.
    let worker = sessions.clone();
    if let Err(e) = tokio::task::spawn_blocking(move || worker.shutdown()).await {
        error!("Worker shutdown task failed: {}", e);
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Initialize the tracing (logging) system.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Controls what gets logged (e.g. "debug", "stream_asr_backend=trace")
/// - If not set, defaults to "stream_asr_backend=debug,actix_web=info"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stream_asr_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Candle's CPU kernels run on the global rayon pool, which reads
/// `RAYON_NUM_THREADS` when it is first used.
fn configure_compute_threads(threads: usize) {
    if std::env::var_os("RAYON_NUM_THREADS").is_some() {
        info!("Using RAYON_NUM_THREADS from the environment");
        return;
    }
    std::env::set_var("RAYON_NUM_THREADS", threads.to_string());
    info!("Inference threads: {}", threads);
}

async fn load_engine(config: &AppConfig, device: candle_core::Device) -> Result<Box<dyn InferenceEngine>> {
    let language = &config.models.language;
    let model = match &config.models.model_path {
        Some(path) => WhisperModel::load_from_dir(Path::new(path), language, device)?,
        None => {
            let size: ModelSize = config.models.whisper_model.parse()?;
            WhisperModel::load(size, language, device).await?
        }
    };
    Ok(Box::new(model))
}

/// Resolve when SIGINT (Ctrl+C) or SIGTERM arrives.
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                }
                return;
            }
            Err(e) => warn!("Failed to install SIGTERM handler: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received SIGINT");
}
