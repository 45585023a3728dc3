use num_complex::Complex32;
use rustfft::{num_traits::Zero, Fft, FftPlanner};
use std::f64::consts::PI;
use std::sync::Arc;

/// Helper that wraps the `rustfft` planner for reuse on fixed-length profiles.
#[derive(Clone)]
pub struct FftHelper {
    forward: Arc<dyn Fft<f32>>,
    inverse: Arc<dyn Fft<f32>>,
    size: usize,
}

impl FftHelper {
    pub fn new(size: usize) -> Self {
        let mut planner = FftPlanner::new();
        let forward = planner.plan_fft_forward(size);
        let inverse = planner.plan_fft_inverse(size);
        Self {
            forward,
            inverse,
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn forward(&self, input: &[f32]) -> Vec<Complex32> {
        let mut buffer: Vec<Complex32> = input
            .iter()
            .map(|&value| Complex32::new(value, 0.0))
            .collect();
        buffer.resize(self.size, Complex32::zero());
        self.forward.process(&mut buffer);
        buffer
    }

    /// Inverse transform returning the normalised real part.
    pub fn inverse_real(&self, spectrum: &[Complex32]) -> Vec<f32> {
        let mut buffer = spectrum.to_vec();
        buffer.resize(self.size, Complex32::zero());
        self.inverse.process(&mut buffer);
        let norm = 1.0 / self.size as f32;
        buffer.iter().map(|c| c.re * norm).collect()
    }

    /// Per-harmonic factors that delay a profile by `shift` turns of phase,
    /// i.e. `out(φ) = in(φ - shift)`.
    pub fn shift_factors(&self, shift: f64) -> Vec<Complex32> {
        let n = self.size;
        let half = n / 2;
        let mut factors = vec![Complex32::zero(); n];
        let step = -2.0 * PI * shift;
        for (h, factor) in factors.iter_mut().enumerate() {
            let harmonic = if h <= half { h as f64 } else { h as f64 - n as f64 };
            let angle = step * harmonic;
            *factor = Complex32::new(angle.cos() as f32, angle.sin() as f32);
        }
        factors
    }

    /// Accumulates `spectrum * factors` into `acc`.
    pub fn accumulate_shifted(acc: &mut [Complex32], spectrum: &[Complex32], factors: &[Complex32]) {
        for ((a, s), f) in acc.iter_mut().zip(spectrum).zip(factors) {
            *a += s * f;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fft_helper_returns_same_length() {
        let helper = FftHelper::new(4);
        let output = helper.forward(&[1.0, 0.0, -1.0, 0.0]);
        assert_eq!(output.len(), 4);
    }

    #[test]
    fn integer_shift_rotates_profile() {
        let helper = FftHelper::new(8);
        let profile = [0.0, 1.0, 5.0, 1.0, 0.0, 0.0, 0.0, 0.0];
        let spectrum = helper.forward(&profile);
        let factors = helper.shift_factors(2.0 / 8.0);
        let mut acc = vec![Complex32::zero(); 8];
        FftHelper::accumulate_shifted(&mut acc, &spectrum, &factors);
        let shifted = helper.inverse_real(&acc);
        for (i, value) in shifted.iter().enumerate() {
            let expected = profile[(i + 8 - 2) % 8];
            assert!((value - expected).abs() < 1e-4, "bin {i}: {value} vs {expected}");
        }
    }
}
