//! # PCM Decoding and Format Checks
//!
//! Incoming audio is raw little-endian 16-bit signed PCM, mono, at the engine's
//! sample rate. This module turns those bytes into normalized `f32` samples and
//! checks the format a client declares when it starts a session.

use byteorder::{LittleEndian, ReadBytesExt};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

/// Scale factor between `i16` PCM and normalized floats.
const PCM_SCALE: f32 = 32768.0;

/// Decode little-endian 16-bit PCM into samples in `[-1.0, 1.0)`.
///
/// A trailing odd byte cannot form a sample and is ignored.
pub fn decode_pcm16_le(data: &[u8]) -> Vec<f32> {
    let mut cursor = Cursor::new(data);
    let mut samples = Vec::with_capacity(data.len() / 2);

    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample as f32 / PCM_SCALE);
    }

    samples
}

/// Audio format a client claims to be sending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u8,
    pub bit_depth: u8,
}

impl AudioFormat {
    /// The only format the stream accepts: mono 16-bit PCM at `sample_rate`.
    pub fn pcm16_mono(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            channels: 1,
            bit_depth: 16,
        }
    }

    /// Check a declared format against the expected one.
    ///
    /// ## Returns:
    /// - **Ok(())**: formats match
    /// - **Err(String)**: which field differs
    pub fn check_against(&self, expected: &AudioFormat) -> Result<(), String> {
        if self.sample_rate != expected.sample_rate {
            return Err(format!(
                "Sample rate mismatch: expected {}, got {}",
                expected.sample_rate, self.sample_rate
            ));
        }

        if self.channels != expected.channels {
            return Err(format!(
                "Channel count mismatch: expected {}, got {}",
                expected.channels, self.channels
            ));
        }

        if self.bit_depth != expected.bit_depth {
            return Err(format!(
                "Bit depth mismatch: expected {}, got {}",
                expected.bit_depth, self.bit_depth
            ));
        }

        Ok(())
    }
}
