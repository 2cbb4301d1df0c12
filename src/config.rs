//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` (deployment platforms)
//! 2. Environment variables (`APP_SERVER__PORT`, `APP_VAD__ENERGY_THRESHOLD`, ...)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! Nested keys are separated by a double underscore so that field names with
//! underscores (`window_ms`, `energy_threshold`) survive the mapping.

use crate::device::DevicePreference;
use crate::transcription::engine::default_thread_count;
use crate::transcription::model::{self, ModelSize};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub models: ModelsConfig,
    pub streaming: StreamingConfig,
    pub vad: VadConfig,
    pub suppression: SuppressionConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Which Whisper model to run and where.
///
/// ## Fields:
/// - `whisper_model`: size fetched from HuggingFace ("tiny", "base", "small", "medium", "large")
/// - `model_path`: local directory with `config.json`, `tokenizer.json` and
///   `model.safetensors`; when set, nothing is downloaded
/// - `language`: fixed decoding language
/// - `device`: "auto", "cpu", "cuda" or "metal"
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    pub whisper_model: String,
    pub model_path: Option<String>,
    pub language: String,
    pub device: String,
}

/// What the worker does when the engine returns an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InferenceFailurePolicy {
    /// Abort the process; the shared engine is no longer trusted
    Abort,
    /// Mark only the affected session destroyed and keep serving the rest
    DropSession,
}

/// Buffering and decoding parameters for every session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    pub sample_rate: u32,
    /// Rolling buffer length, also the inference window length.
    pub window_ms: u64,
    /// Minimum new audio before another inference attempt.
    pub overlap_ms: u64,
    pub idle_wait_ms: u64,
    pub max_tokens: usize,
    /// Compute threads; 0 picks `max(1, cores - 1)`.
    pub threads: usize,
    pub on_inference_error: InferenceFailurePolicy,
}

impl StreamingConfig {
    pub fn resolved_threads(&self) -> usize {
        if self.threads == 0 {
            default_thread_count()
        } else {
            self.threads
        }
    }
}

/// Voice-activity gate tuning. The threshold is tuned together with the
/// high-pass cutoff; change them as a pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VadConfig {
    pub analysis_ms: u64,
    pub energy_threshold: f32,
    pub high_pass_cutoff_hz: f32,
}

/// Transcripts that are dropped instead of delivered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuppressionConfig {
    pub placeholders: Vec<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            models: ModelsConfig {
                whisper_model: "base".to_string(),
                model_path: None,
                language: "en".to_string(),
                device: "auto".to_string(),
            },
            streaming: StreamingConfig {
                sample_rate: 16000,
                window_ms: 30_000,
                overlap_ms: 200,
                idle_wait_ms: 1,
                max_tokens: 512,
                threads: 0,
                on_inference_error: InferenceFailurePolicy::Abort,
            },
            vad: VadConfig {
                analysis_ms: 1000,
                energy_threshold: 0.0005,
                high_pass_cutoff_hz: 100.0,
            },
            suppression: SuppressionConfig {
                placeholders: vec![
                    " you".to_string(),
                    " [BLANK_AUDIO]".to_string(),
                    " [ Silence ]".to_string(),
                ],
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__HOST=0.0.0.0`: Override server host
    /// - `APP_MODELS__WHISPER_MODEL=small`: Override whisper model
    /// - `APP_STREAMING__ON_INFERENCE_ERROR=drop_session`: Survive engine errors
    /// - `HOST=0.0.0.0` / `PORT=3000`: Special cases for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        self.models.whisper_model.parse::<ModelSize>()?;

        self.models
            .device
            .parse::<DevicePreference>()
            .map_err(|e| anyhow::anyhow!(e))?;

        if !model::is_supported_language(&self.models.language) {
            return Err(anyhow::anyhow!(
                "Unsupported decoding language '{}' (expected a code such as \"en\")",
                self.models.language
            ));
        }

        let streaming = &self.streaming;
        if streaming.sample_rate != model::ENGINE_SAMPLE_RATE {
            return Err(anyhow::anyhow!(
                "Sample rate must be {} Hz, the rate the model expects (got {})",
                model::ENGINE_SAMPLE_RATE,
                streaming.sample_rate
            ));
        }

        if streaming.window_ms > model::ENGINE_WINDOW_MS {
            return Err(anyhow::anyhow!(
                "Window ({} ms) cannot exceed the model's {} ms input",
                streaming.window_ms,
                model::ENGINE_WINDOW_MS
            ));
        }

        if streaming.overlap_ms == 0 {
            return Err(anyhow::anyhow!("Overlap must be greater than 0"));
        }

        if streaming.window_ms < streaming.overlap_ms {
            return Err(anyhow::anyhow!(
                "Window ({} ms) must be at least as long as the overlap ({} ms)",
                streaming.window_ms,
                streaming.overlap_ms
            ));
        }

        if streaming.max_tokens == 0 {
            return Err(anyhow::anyhow!("Max tokens must be greater than 0"));
        }

        if self.vad.analysis_ms == 0 {
            return Err(anyhow::anyhow!("VAD analysis duration must be greater than 0"));
        }

        if !(self.vad.energy_threshold >= 0.0) {
            return Err(anyhow::anyhow!("VAD energy threshold must be non-negative"));
        }

        Ok(())
    }
}
