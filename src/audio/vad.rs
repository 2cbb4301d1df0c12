//! # Voice-Activity Gate
//!
//! Decides whether an inference window is worth sending to the engine. Two
//! stages run over the window:
//!
//! 1. **High-pass filter**: single-pole IIR applied in place, skipped when the
//!    cutoff is zero or negative.
//! 2. **Energy gate**: mean absolute amplitude of the most recent
//!    `analysis_samples` samples compared against an absolute threshold.
//!
//! Speech is declared only when the tail energy is strictly greater than the
//! threshold.

/// Tuning for the gate, derived from the `[vad]` configuration section.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VadSettings {
    pub sample_rate: u32,
    /// Length of the tail segment that is measured, in samples.
    pub analysis_samples: usize,
    /// Absolute mean |x| above which the tail counts as speech.
    pub energy_threshold: f32,
    /// High-pass cutoff in Hz; `<= 0` disables the filter.
    pub high_pass_cutoff_hz: f32,
}

/// Filter `samples` in place.
///
/// `rc = 1/(2π·cutoff)`, `dt = 1/sample_rate`, `alpha = dt/(rc+dt)`,
/// `y[0] = x[0]`, `y[i] = alpha·(y[i-1] + x[i] - x[i-1])`.
pub fn high_pass_filter(samples: &mut [f32], cutoff_hz: f32, sample_rate: u32) {
    if cutoff_hz <= 0.0 || samples.is_empty() {
        return;
    }

    let rc = 1.0 / (2.0 * std::f32::consts::PI * cutoff_hz);
    let dt = 1.0 / sample_rate as f32;
    let alpha = dt / (rc + dt);

    let mut prev_x = samples[0];
    let mut prev_y = samples[0];
    for sample in samples.iter_mut().skip(1) {
        let x = *sample;
        let y = alpha * (prev_y + x - prev_x);
        *sample = y;
        prev_x = x;
        prev_y = y;
    }
}

/// Mean absolute amplitude of the last `min(analysis_samples, len)` samples.
pub fn tail_energy(samples: &[f32], analysis_samples: usize) -> f32 {
    let count = analysis_samples.min(samples.len());
    if count == 0 {
        return 0.0;
    }

    let tail = &samples[samples.len() - count..];
    tail.iter().map(|s| s.abs()).sum::<f32>() / count as f32
}

/// Run both stages over `window` and report whether it contains speech.
///
/// The filter modifies `window`; whatever runs after the gate sees the
/// filtered samples.
pub fn is_speech(window: &mut [f32], settings: &VadSettings) -> bool {
    high_pass_filter(window, settings.high_pass_cutoff_hz, settings.sample_rate);

    let energy = tail_energy(window, settings.analysis_samples);
    let speech = energy > settings.energy_threshold;

    tracing::trace!(
        energy,
        threshold = settings.energy_threshold,
        speech,
        "voice activity gate"
    );

    speech
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unfiltered(threshold: f32, analysis_samples: usize) -> VadSettings {
        VadSettings {
            sample_rate: 16000,
            analysis_samples,
            energy_threshold: threshold,
            high_pass_cutoff_hz: 0.0,
        }
    }

    fn tone(freq_hz: f32, amplitude: f32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|n| amplitude * (2.0 * std::f32::consts::PI * freq_hz * n as f32 / 16000.0).sin())
            .collect()
    }

    #[test]
    fn test_high_pass_first_sample_passes_through() {
        let mut samples = vec![0.7, 0.1, -0.3];
        high_pass_filter(&mut samples, 100.0, 16000);
        assert_eq!(samples[0], 0.7);
    }

    #[test]
    fn test_high_pass_rejects_constant_input() {
        let mut samples = vec![0.5f32; 4000];
        high_pass_filter(&mut samples, 100.0, 16000);

        // Output decays monotonically from the first sample towards zero.
        assert!(samples[1] < samples[0]);
        assert!(samples[3999].abs() < 1e-6);
    }

    #[test]
    fn test_high_pass_disabled_for_non_positive_cutoff() {
        let original = vec![0.2f32, -0.4, 0.9];
        let mut samples = original.clone();
        high_pass_filter(&mut samples, 0.0, 16000);
        assert_eq!(samples, original);

        high_pass_filter(&mut samples, -5.0, 16000);
        assert_eq!(samples, original);
    }

    #[test]
    fn test_gate_boundary_is_not_speech() {
        let settings = unfiltered(0.5, 4);

        let mut at_threshold = vec![0.5f32; 8];
        assert!(!is_speech(&mut at_threshold, &settings));

        let mut above = vec![-0.75f32; 8];
        assert!(is_speech(&mut above, &settings));

        let mut below = vec![0.25f32; 8];
        assert!(!is_speech(&mut below, &settings));
    }

    #[test]
    fn test_gate_only_measures_tail() {
        let settings = unfiltered(0.1, 4);

        let mut loud_then_quiet = vec![1.0f32; 10];
        loud_then_quiet.extend_from_slice(&[0.0; 4]);
        assert!(!is_speech(&mut loud_then_quiet, &settings));

        let mut quiet_then_loud = vec![0.0f32; 10];
        quiet_then_loud.extend_from_slice(&[1.0; 4]);
        assert!(is_speech(&mut quiet_then_loud, &settings));
    }

    #[test]
    fn test_analysis_longer_than_window_uses_whole_window() {
        assert_eq!(tail_energy(&[0.5, -0.5], 16000), 0.5);
        assert_eq!(tail_energy(&[], 16000), 0.0);
    }

    #[test]
    fn test_filtered_tone_passes_and_silence_fails() {
        let settings = VadSettings {
            sample_rate: 16000,
            analysis_samples: 16000,
            energy_threshold: 0.0005,
            high_pass_cutoff_hz: 100.0,
        };

        let mut silence = vec![0.0f32; 32000];
        assert!(!is_speech(&mut silence, &settings));

        let mut window = vec![0.0f32; 16000];
        window.extend(tone(4000.0, 0.8, 16000));
        assert!(is_speech(&mut window, &settings));
    }
}
