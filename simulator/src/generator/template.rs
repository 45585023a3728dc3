/// Circular Gaussian pulse at `center` turns with `width` turns FWHM,
/// evaluated at `phase`.
pub fn gaussian_pulse(phase: f64, center: f64, width: f64) -> f32 {
    let mut d = (phase - center).rem_euclid(1.0);
    if d > 0.5 {
        d -= 1.0;
    }
    let sigma = width / (2.0 * (2.0 * std::f64::consts::LN_2).sqrt());
    (-(d * d) / (2.0 * sigma * sigma)).exp() as f32
}

/// Smooth bandpass shape across `nchans` channels, between 0.5 and 1.
pub fn bandpass(channel: usize, nchans: usize) -> f32 {
    let x = (channel as f32 + 0.5) / nchans.max(1) as f32;
    0.5 + 0.5 * (std::f32::consts::PI * x).sin()
}
