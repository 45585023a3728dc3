//! Cold-plasma dispersion law.

/// Dispersion constant in s MHz² cm³ pc⁻¹.
pub const DISPERSION_CONSTANT: f64 = 4.1488e3;

/// Constant used by the closed-form DM uncertainty.
pub const DISPERSION_CONSTANT_PRECISE: f64 = 4.148741601e3;

/// Extra arrival delay in seconds at `freq` relative to `ref_freq` (MHz).
/// Positive when `freq` is below `ref_freq`.
pub fn dm_delay(dm: f64, freq: f64, ref_freq: f64) -> f64 {
    DISPERSION_CONSTANT * dm * (freq.powi(-2) - ref_freq.powi(-2))
}

/// Per-channel delays in whole samples, measured against the highest channel.
pub fn delay_table(dm: f64, frequencies: &[f64], tsamp: f64) -> Vec<usize> {
    let ref_freq = frequencies
        .iter()
        .copied()
        .fold(f64::NEG_INFINITY, f64::max);
    frequencies
        .iter()
        .map(|&freq| {
            let samples = (dm_delay(dm, freq, ref_freq) / tsamp).round();
            if samples > 0.0 {
                samples as usize
            } else {
                0
            }
        })
        .collect()
}
