use crate::generator::template::{bandpass, gaussian_pulse};
use anyhow::{ensure, Context};
use ndarray::Array2;
use pulsarcore::interface::InMemorySource;
use pulsarcore::math::dispersion::dm_delay;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Configuration for generating a synthetic filterbank observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    pub nchans: usize,
    /// Centre frequency of the lowest channel, MHz.
    pub fch_low: f64,
    /// Channel spacing, MHz.
    pub channel_width: f64,
    pub tsamp: f64,
    /// Seconds of data, gaps excluded.
    pub duration: f64,
    pub start_mjd: f64,
    pub dm: f64,
    pub f0: f64,
    pub f1: f64,
    /// Peak pulse height relative to the noise amplitude.
    pub amplitude: f32,
    /// Pulse FWHM in turns.
    pub duty_cycle: f64,
    /// Half-width of the uniform noise.
    pub noise: f32,
    /// Number of broadband zero-DM impulses.
    pub impulses: usize,
    pub impulse_amplitude: f32,
    /// Recordings the observation is split into.
    pub nfiles: usize,
    /// Dead time inserted between consecutive recordings, seconds.
    pub gap: f64,
    pub seed: u64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            nchans: 64,
            fch_low: 1200.0,
            channel_width: 4.0,
            tsamp: 1e-3,
            duration: 16.0,
            start_mjd: 60_000.0,
            dm: 40.0,
            f0: 4.0,
            f1: 0.0,
            amplitude: 1.0,
            duty_cycle: 0.04,
            noise: 1.0,
            impulses: 0,
            impulse_amplitude: 50.0,
            nfiles: 1,
            gap: 0.0,
            seed: 0,
        }
    }
}

impl GeneratorConfig {
    pub fn frequencies(&self) -> Vec<f64> {
        (0..self.nchans)
            .map(|ch| self.fch_low + ch as f64 * self.channel_width)
            .collect()
    }

    pub fn nsamples(&self) -> usize {
        (self.duration / self.tsamp).round() as usize
    }

    fn validate(&self) -> anyhow::Result<()> {
        ensure!(self.nchans > 0, "generator needs at least one channel");
        ensure!(
            self.tsamp.is_finite() && self.tsamp > 0.0,
            "sample period must be positive, got {}",
            self.tsamp
        );
        ensure!(self.nsamples() > 0, "duration {} s holds no samples", self.duration);
        ensure!(self.nfiles > 0, "observation must span at least one file");
        ensure!(self.f0 > 0.0, "spin frequency must be positive, got {}", self.f0);
        ensure!(self.gap >= 0.0, "gap must be non-negative, got {}", self.gap);
        Ok(())
    }

    /// Pulse phase at `t` seconds after the start, referenced to mid-observation.
    fn phase(&self, t: f64, ref_epoch: f64) -> f64 {
        let dt = t - ref_epoch;
        self.f0 * dt + 0.5 * self.f1 * dt * dt
    }
}

/// Builds the recordings of one synthetic observation, in time order.
pub fn build_sources(config: &GeneratorConfig) -> anyhow::Result<Vec<InMemorySource>> {
    config.validate()?;
    let frequencies = config.frequencies();
    let f_high = frequencies.iter().cloned().fold(f64::MIN, f64::max);
    let delays: Vec<f64> = frequencies
        .iter()
        .map(|&f| dm_delay(config.dm, f, f_high))
        .collect();
    let gains: Vec<f32> = (0..config.nchans).map(|ch| bandpass(ch, config.nchans)).collect();

    let total = config.nsamples();
    let per_file = total.div_ceil(config.nfiles);
    let span = total as f64 * config.tsamp + (config.nfiles - 1) as f64 * config.gap;
    let ref_epoch = span / 2.0;

    let mut rng = StdRng::seed_from_u64(config.seed);
    let impulse_at: Vec<usize> = (0..config.impulses).map(|_| rng.gen_range(0..total)).collect();

    let mut sources = Vec::with_capacity(config.nfiles);
    let mut first = 0usize;
    for file in 0..config.nfiles {
        let last = (first + per_file).min(total);
        if first >= last {
            break;
        }
        let offset = first as f64 * config.tsamp + file as f64 * config.gap;
        let rows = last - first;
        let mut samples = Vec::with_capacity(rows * config.nchans);
        for i in 0..rows {
            let t = offset + i as f64 * config.tsamp;
            let impulse = if impulse_at.contains(&(first + i)) {
                config.impulse_amplitude
            } else {
                0.0
            };
            for ch in 0..config.nchans {
                let frac = config.phase(t - delays[ch], ref_epoch).rem_euclid(1.0);
                let pulse = config.amplitude * gaussian_pulse(frac, 0.5, config.duty_cycle);
                let jitter = if config.noise > 0.0 {
                    rng.gen_range(-config.noise..config.noise)
                } else {
                    0.0
                };
                samples.push(gains[ch] * (pulse + jitter) + impulse);
            }
        }
        let data = Array2::from_shape_vec((rows, config.nchans), samples)
            .context("shaping generated samples")?;
        let start_mjd = config.start_mjd + offset / SECONDS_PER_DAY;
        let source = InMemorySource::new(data, config.tsamp, frequencies.clone(), start_mjd)
            .with_context(|| format!("building synthetic source {file}"))?;
        sources.push(source);
        first = last;
    }
    Ok(sources)
}
