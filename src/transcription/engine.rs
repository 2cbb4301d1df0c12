//! # Inference Engine Interface
//!
//! The worker thread talks to speech recognition through the [`InferenceEngine`]
//! trait: hand it a fixed-length window plus the previous window's tokens and it
//! returns the transcribed segments synchronously.
//!
//! ## Reentrancy:
//! Engines are assumed non-reentrant. The trait takes `&mut self` and the engine
//! is owned by the worker thread, so at most one call is ever in flight.

use anyhow::Result;
use std::collections::HashSet;

/// Decoding parameters sent with every call.
///
/// Decoding is always greedy and produces a single segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeOptions {
    /// ISO 639-1 code, e.g. "en"
    pub language: String,
    /// Upper bound on generated tokens per window
    pub max_tokens: usize,
    /// Compute threads the engine may use
    pub threads: usize,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            language: "en".to_string(),
            max_tokens: 512,
            threads: default_thread_count(),
        }
    }
}

/// `max(1, available_parallelism - 1)`, leaving a core for the server.
pub fn default_thread_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1).max(1))
        .unwrap_or(1)
}

/// Output of one inference call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transcript {
    pub segments: Vec<String>,
    /// Text tokens produced, carried into the next call as prompt context.
    pub tokens: Vec<u32>,
}

impl Transcript {
    /// All segment texts concatenated without separators.
    pub fn text(&self) -> String {
        self.segments.concat()
    }
}

/// A speech recognition backend.
pub trait InferenceEngine: Send {
    fn transcribe(&mut self, window: &[f32], prompt: &[u32], options: &DecodeOptions) -> Result<Transcript>;
}

/// Known no-speech outputs that should never reach a client.
///
/// Matching is exact, including the leading space the model emits.
#[derive(Debug, Clone)]
pub struct Suppressor {
    placeholders: HashSet<String>,
}

impl Suppressor {
    pub fn new<I, S>(placeholders: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            placeholders: placeholders.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_placeholder(&self, text: &str) -> bool {
        self.placeholders.contains(text)
    }
}
