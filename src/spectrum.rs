//! Windowed-FFT spectrum estimation for the waterfall/panadapter display.
//!
//! Runs over the most recent [`FFT_SIZE`] conditioned-input samples each
//! decode cycle. Decoupled from the decode path: the caller publishes the
//! resulting snapshot under its own lock, and a skipped cycle (not enough
//! samples yet) is not an error.

use num_complex::Complex32;
use realfft::{RealFftPlanner, RealToComplex};
use std::sync::Arc;

use crate::{FFT_SIZE, SPECTRUM_BINS};

/// Magnitudes below this publish as the dB floor instead of `log(0)`.
const MAG_EPSILON: f32 = 1e-10;
/// dB floor for near-zero bins.
pub const DB_FLOOR: f32 = -200.0;

/// Hann-windowed power spectrum, dB-scaled, first [`SPECTRUM_BINS`] bins.
///
/// All buffers are pre-allocated; [`process`](Self::process) performs no
/// heap allocation.
pub struct SpectrumAnalyzer {
    fft: Arc<dyn RealToComplex<f32>>,
    window: Vec<f32>,
    input: Vec<f32>,
    output: Vec<Complex32>,
    scratch: Vec<Complex32>,
}

impl SpectrumAnalyzer {
    pub fn new() -> Self {
        let mut planner = RealFftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(FFT_SIZE);
        let output = fft.make_output_vec();
        let scratch = fft.make_scratch_vec();

        let window = (0..FFT_SIZE)
            .map(|i| {
                0.5 * (1.0
                    - (2.0 * std::f32::consts::PI * i as f32 / (FFT_SIZE - 1) as f32).cos())
            })
            .collect();

        Self {
            fft,
            window,
            input: vec![0.0; FFT_SIZE],
            output,
            scratch,
        }
    }

    /// Analyze the most recent [`FFT_SIZE`] samples of `samples` into `out`.
    ///
    /// Returns `false` (leaving `out` untouched) when fewer than
    /// [`FFT_SIZE`] samples are available.
    pub fn process(&mut self, samples: &[f32], out: &mut [f32; SPECTRUM_BINS]) -> bool {
        if samples.len() < FFT_SIZE {
            return false;
        }
        let tail = &samples[samples.len() - FFT_SIZE..];
        for ((x, &s), &w) in self.input.iter_mut().zip(tail).zip(self.window.iter()) {
            *x = s * w;
        }

        // realfft destroys the input buffer; it is rewritten next call
        self.fft
            .process_with_scratch(&mut self.input, &mut self.output, &mut self.scratch)
            .expect("FFT buffer sizes are fixed at construction");

        let scale = 1.0 / (FFT_SIZE as f32 * 0.5);
        for (bin, x) in out.iter_mut().zip(self.output.iter().take(SPECTRUM_BINS)) {
            let mag = x.norm() * scale;
            *bin = if mag > MAG_EPSILON {
                20.0 * mag.log10()
            } else {
                DB_FLOOR
            };
        }
        true
    }
}

impl Default for SpectrumAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MODEM_RATE;

    #[test]
    fn too_few_samples_is_skipped() {
        let mut an = SpectrumAnalyzer::new();
        let mut out = [0.0f32; SPECTRUM_BINS];
        assert!(!an.process(&vec![0.0; FFT_SIZE - 1], &mut out));
    }

    #[test]
    fn silence_is_floor_everywhere() {
        let mut an = SpectrumAnalyzer::new();
        let mut out = [0.0f32; SPECTRUM_BINS];
        assert!(an.process(&vec![0.0; FFT_SIZE], &mut out));
        for (i, &db) in out.iter().enumerate() {
            assert_eq!(db, DB_FLOOR, "bin {i}");
        }
    }

    #[test]
    fn sinusoid_peaks_within_one_bin() {
        let freq = 1000.0f32;
        let samples: Vec<f32> = (0..FFT_SIZE)
            .map(|i| {
                (2.0 * std::f32::consts::PI * freq * i as f32 / MODEM_RATE as f32).sin()
            })
            .collect();
        let mut an = SpectrumAnalyzer::new();
        let mut out = [0.0f32; SPECTRUM_BINS];
        assert!(an.process(&samples, &mut out));

        let peak = out
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .map(|(i, _)| i)
            .unwrap();
        let expected = freq / (MODEM_RATE as f32 / FFT_SIZE as f32);
        assert!(
            (peak as f32 - expected).abs() <= 1.0,
            "peak bin {peak}, expected near {expected}"
        );
    }

    #[test]
    fn uses_most_recent_samples() {
        // long buffer: silence followed by a tone in the final FFT window
        let freq = 500.0f32;
        let mut samples = vec![0.0f32; 4 * FFT_SIZE];
        let n = samples.len();
        for (i, s) in samples[n - FFT_SIZE..].iter_mut().enumerate() {
            *s = (2.0 * std::f32::consts::PI * freq * i as f32 / MODEM_RATE as f32).sin();
        }
        let mut an = SpectrumAnalyzer::new();
        let mut out = [0.0f32; SPECTRUM_BINS];
        assert!(an.process(&samples, &mut out));
        let expected = (freq / (MODEM_RATE as f32 / FFT_SIZE as f32)).round() as usize;
        assert!(out[expected] > DB_FLOOR + 100.0);
    }
}
