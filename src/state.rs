//! # Application State
//!
//! Shared state handed to every HTTP handler and WebSocket actor.
//!
//! ## Rust Concepts:
//!
//! ### Arc (Atomically Reference Counted)
//! - Every actix worker thread gets a clone of `AppState`; the `Arc`s make the
//!   clone cheap and keep exactly one `SessionManager` alive for the process.
//!
//! ### Why no RwLock here
//! - The configuration is read once at startup and baked into the worker's
//!   settings, so handlers only ever read it. An immutable `Arc<AppConfig>` is enough.

use crate::config::AppConfig;
use crate::worker::SessionManager;
use std::sync::Arc;
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    /// Configuration the server was started with
    pub config: Arc<AppConfig>,

    /// The streaming service: owns the engine, the queue and the worker thread
    pub sessions: Arc<SessionManager>,

    /// Label of the device the model runs on, e.g. "CPU"
    pub device: &'static str,

    /// When the server started
    pub start_time: Instant,
}

impl AppState {
    pub fn new(config: AppConfig, sessions: Arc<SessionManager>, device: &'static str) -> Self {
        Self {
            config: Arc::new(config),
            sessions,
            device,
            start_time: Instant::now(),
        }
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Number of sessions still open and not destroyed.
    pub fn active_sessions(&self) -> usize {
        self.sessions
            .sessions()
            .iter()
            .filter(|summary| !summary.destroyed)
            .count()
    }
}
