//! # Mel Filter Bank
//!
//! Candle's `pcm_to_mel` needs a flattened `n_mels x (N_FFT / 2 + 1)` filter
//! matrix. Model directories that ship `melfilters.bytes` (little-endian f32)
//! use that file; everything else gets a Slaney-normalized bank computed here,
//! which matches the one Whisper was trained with.

use anyhow::{anyhow, Result};
use byteorder::{ByteOrder, LittleEndian};
use std::path::Path;

/// FFT size Whisper's front end uses at 16 kHz.
pub const N_FFT: usize = 400;

const F_SP: f64 = 200.0 / 3.0;
const MIN_LOG_HZ: f64 = 1000.0;
const MIN_LOG_MEL: f64 = 15.0;
// ln(6.4) / 27
const LOGSTEP: f64 = 0.06875177742094912;

fn hz_to_mel(freq: f64) -> f64 {
    if freq < MIN_LOG_HZ {
        freq / F_SP
    } else {
        MIN_LOG_MEL + (freq / MIN_LOG_HZ).ln() / LOGSTEP
    }
}

fn mel_to_hz(mel: f64) -> f64 {
    if mel < MIN_LOG_MEL {
        mel * F_SP
    } else {
        MIN_LOG_HZ * ((mel - MIN_LOG_MEL) * LOGSTEP).exp()
    }
}

/// Build a row-major Slaney filter bank spanning `0..sample_rate / 2`.
pub fn slaney_filter_bank(n_mels: usize, sample_rate: u32) -> Vec<f32> {
    let n_freqs = N_FFT / 2 + 1;
    let mel_max = hz_to_mel(sample_rate as f64 / 2.0);

    let edges: Vec<f64> = (0..n_mels + 2)
        .map(|i| mel_to_hz(mel_max * i as f64 / (n_mels + 1) as f64))
        .collect();

    let mut filters = vec![0.0f32; n_mels * n_freqs];
    for m in 0..n_mels {
        let (lower, center, upper) = (edges[m], edges[m + 1], edges[m + 2]);
        let enorm = 2.0 / (upper - lower);

        for k in 0..n_freqs {
            let freq = k as f64 * sample_rate as f64 / N_FFT as f64;
            let weight = if freq >= lower && freq <= center {
                (freq - lower) / (center - lower)
            } else if freq > center && freq <= upper {
                (upper - freq) / (upper - center)
            } else {
                continue;
            };
            filters[m * n_freqs + k] = (enorm * weight) as f32;
        }
    }

    filters
}

/// Load `melfilters.bytes` from `dir` when present, otherwise compute the bank.
pub fn load_or_compute(dir: Option<&Path>, n_mels: usize, sample_rate: u32) -> Result<Vec<f32>> {
    let expected = n_mels * (N_FFT / 2 + 1);

    if let Some(path) = dir.map(|d| d.join("melfilters.bytes")).filter(|p| p.exists()) {
        let bytes = std::fs::read(&path)?;
        if bytes.len() != expected * 4 {
            return Err(anyhow!(
                "{} holds {} bytes, expected {} for {} mel bins",
                path.display(),
                bytes.len(),
                expected * 4,
                n_mels
            ));
        }
        let mut filters = vec![0f32; expected];
        LittleEndian::read_f32_into(&bytes, &mut filters);
        tracing::debug!("Loaded mel filters from {}", path.display());
        return Ok(filters);
    }

    Ok(slaney_filter_bank(n_mels, sample_rate))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mel_scale_roundtrip() {
        for freq in [100.0, 500.0, 1000.0, 2000.0, 4000.0, 8000.0] {
            assert!((mel_to_hz(hz_to_mel(freq)) - freq).abs() < 0.001, "freq {}", freq);
        }
    }

    #[test]
    fn test_filter_bank_shape() {
        let filters = slaney_filter_bank(80, 16000);
        assert_eq!(filters.len(), 80 * 201);
        assert!(filters.iter().all(|w| *w >= 0.0));

        // every band picks up at least one FFT bin
        for row in filters.chunks(201) {
            assert!(row.iter().any(|w| *w > 0.0));
        }
    }

    #[test]
    fn test_missing_file_falls_back() {
        let dir = std::env::temp_dir();
        let filters = load_or_compute(Some(&dir.join("no-such-model-dir")), 80, 16000).unwrap();
        assert_eq!(filters.len(), 80 * 201);
    }

    #[test]
    fn test_reads_filter_file() {
        let dir = std::env::temp_dir().join(format!("mel-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();

        let mut bytes = vec![0u8; 2 * 201 * 4];
        LittleEndian::write_f32(&mut bytes[4..8], 0.5);
        std::fs::write(dir.join("melfilters.bytes"), &bytes).unwrap();

        let filters = load_or_compute(Some(&dir), 2, 16000).unwrap();
        assert_eq!(filters[1], 0.5);
        assert!(load_or_compute(Some(&dir), 80, 16000).is_err());

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
