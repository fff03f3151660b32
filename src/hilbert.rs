//! Streaming Hilbert transform: real 8 kHz samples in, analytic IQ out.
//!
//! A 127-tap windowed-sinc Hilbert FIR produces the imaginary leg; the real
//! leg is the input delayed by the FIR's group delay (63 samples) so both
//! legs stay time-aligned sample for sample. O(taps) per sample; this is
//! the dominant per-sample cost of the receive path.

use num_complex::Complex32;

use crate::ring::Ring;
use crate::{HILBERT_DELAY, HILBERT_TAPS};

/// One-sample-in, one-sample-out analytic signal generator.
pub struct Hilbert {
    coeffs: Vec<f32>,
    hist: Ring,
    delay: Ring,
}

impl Hilbert {
    pub fn new() -> Self {
        Self {
            coeffs: hilbert_kernel(HILBERT_TAPS),
            hist: Ring::new(HILBERT_TAPS),
            delay: Ring::new(HILBERT_TAPS),
        }
    }

    /// Process one real sample into one complex sample.
    pub fn push(&mut self, sample: f32) -> Complex32 {
        self.hist.push(sample);

        let mut imag = 0.0f32;
        for (k, &c) in self.coeffs.iter().enumerate() {
            // every other tap is zero; branch is cheaper than the multiply
            if c != 0.0 {
                imag += c * self.hist.tap(k);
            }
        }

        self.delay.push(sample);
        let real = self.delay.tap(HILBERT_DELAY);

        Complex32::new(real, imag)
    }

    /// Process a block. `out` must be at least as long as `input`.
    pub fn process(&mut self, input: &[f32], out: &mut [Complex32]) {
        debug_assert!(out.len() >= input.len());
        for (x, y) in input.iter().zip(out.iter_mut()) {
            *y = self.push(*x);
        }
    }

    /// Zero the filter history (new session, not per-cycle).
    pub fn reset(&mut self) {
        self.hist.clear();
        self.delay.clear();
    }

    #[cfg(test)]
    pub(crate) fn coeffs(&self) -> &[f32] {
        &self.coeffs
    }
}

impl Default for Hilbert {
    fn default() -> Self {
        Self::new()
    }
}

/// Hamming-windowed Hilbert kernel: zero at the center tap and at every
/// even offset from center, `2/(pi*n)` at odd offsets.
fn hilbert_kernel(ntaps: usize) -> Vec<f32> {
    debug_assert!(ntaps % 2 == 1);
    let center = (ntaps - 1) / 2;
    let mut coeffs = vec![0.0f32; ntaps];
    for (i, c) in coeffs.iter_mut().enumerate() {
        let n = i as i64 - center as i64;
        if n == 0 || n % 2 == 0 {
            continue;
        }
        let h = 2.0 / (std::f32::consts::PI * n as f32);
        let w = 0.54
            - 0.46 * (2.0 * std::f32::consts::PI * i as f32 / (ntaps - 1) as f32).cos();
        *c = h * w;
    }
    coeffs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_zero_at_center_and_even_offsets() {
        let h = Hilbert::new();
        let c = h.coeffs();
        let center = (HILBERT_TAPS - 1) / 2;
        for (i, &v) in c.iter().enumerate() {
            let n = i as i64 - center as i64;
            if n == 0 || n % 2 == 0 {
                assert_eq!(v, 0.0, "tap {i} should be zero");
            } else {
                assert!(v != 0.0, "tap {i} should be nonzero");
            }
        }
    }

    #[test]
    fn kernel_antisymmetric() {
        let h = Hilbert::new();
        let c = h.coeffs();
        let center = (HILBERT_TAPS - 1) / 2;
        for k in 1..=center {
            let lo = c[center - k];
            let hi = c[center + k];
            assert!(
                (lo + hi).abs() < 1e-6,
                "taps at +/-{k} not antisymmetric: {lo} vs {hi}"
            );
        }
    }

    #[test]
    fn real_leg_delayed_by_group_delay() {
        let mut h = Hilbert::new();
        let n = HILBERT_TAPS * 2;
        let mut real_out = Vec::with_capacity(n);
        for i in 0..n {
            let x = if i == 10 { 1.0 } else { 0.0 };
            real_out.push(h.push(x).re);
        }
        for (i, &r) in real_out.iter().enumerate() {
            if i == 10 + HILBERT_DELAY {
                assert!((r - 1.0).abs() < 1e-6);
            } else {
                assert_eq!(r, 0.0, "unexpected real output at {i}");
            }
        }
    }

    #[test]
    fn imag_leg_is_kernel_impulse_response() {
        let mut h = Hilbert::new();
        let expected = hilbert_kernel(HILBERT_TAPS);
        let mut imag_out = Vec::new();
        for i in 0..HILBERT_TAPS {
            let x = if i == 0 { 1.0 } else { 0.0 };
            imag_out.push(h.push(x).im);
        }
        for (k, (&got, &want)) in imag_out.iter().zip(expected.iter()).enumerate() {
            assert!((got - want).abs() < 1e-6, "tap {k}: {got} vs {want}");
        }
    }
}
