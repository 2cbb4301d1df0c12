//! # Audio Module
//!
//! Everything that happens to audio before it reaches the model.
//!
//! ## Key Components:
//! - **pcm**: 16-bit little-endian PCM decoding and format checks
//! - **buffer**: fixed-capacity rolling buffer, one per session
//! - **vad**: high-pass filter and energy-based speech gate
//! - **session**: session state and the producer handle clients hold
//!
//! ## Audio Format Requirements:
//! - **Sample Rate**: 16kHz (configurable, must match the model)
//! - **Bit Depth**: 16-bit PCM
//! - **Channels**: Mono (1 channel)
//! - **Encoding**: Little-endian signed integers

pub mod buffer;
pub mod pcm;
pub mod session;
pub mod vad;
