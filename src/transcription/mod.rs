//! # Transcription Module
//!
//! Speech-to-text behind the [`engine::InferenceEngine`] trait, with a
//! pure-Rust Whisper implementation on Candle-rs.
//!
//! ## Key Components:
//! - **engine**: the engine trait, decode options and placeholder suppression
//! - **model**: Whisper model loading and greedy decoding
//! - **mel**: the mel filter bank Whisper's front end needs
//!
//! ## Whisper Model Sizes:
//! - **tiny**: ~39MB, fastest but least accurate
//! - **base**: ~74MB, the default
//! - **small**: ~244MB, better accuracy
//! - **medium**: ~769MB, good technical vocabulary
//! - **large**: ~1550MB, best accuracy but slowest; a poor fit when many
//!   sessions share one worker

pub mod engine;
pub mod mel;
pub mod model;
