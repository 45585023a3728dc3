//! Iterative (DM, F0, F1) refinement of a folded archive.
//!
//! The archive is transformed to harmonic space once. Every trial is an exact
//! fractional phase rotation of those spectra, so the folded data are never
//! re-binned. Each iteration scans an F0×F1 grid at the current DM, then a DM
//! line at the current F0/F1, both centred on the running best.

use crate::math::dispersion::{DISPERSION_CONSTANT, DISPERSION_CONSTANT_PRECISE};
use crate::math::fft::FftHelper;
use crate::processing::fold::Archive;
use crate::processing::snr::{BoxcarSnr, SnrEstimate, SnrEstimator};
use crate::telemetry::log::LogManager;
use ndarray::{Array2, Array3};
use num_complex::Complex32;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Speed of light in m/s.
pub const SPEED_OF_LIGHT: f64 = 299_792_458.0;

/// Symmetric trial axis; index `count / 2` is a zero offset.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridAxis {
    pub step: f64,
    pub count: usize,
}

impl GridAxis {
    pub fn new(step: f64, count: usize) -> Self {
        if step.is_finite() && step > 0.0 && count > 1 {
            Self { step, count }
        } else {
            Self::degenerate()
        }
    }

    /// Single zero-offset point.
    pub fn degenerate() -> Self {
        Self { step: 0.0, count: 1 }
    }

    pub fn center(&self) -> usize {
        self.count / 2
    }

    pub fn offset(&self, index: usize) -> f64 {
        (index as f64 - self.center() as f64) * self.step
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridSearchSettings {
    pub max_iterations: usize,
    /// `false` only measures S/N at the nominal parameters.
    pub search: bool,
}

impl Default for GridSearchSettings {
    fn default() -> Self {
        Self {
            max_iterations: 8,
            search: true,
        }
    }
}

/// Formal 1σ uncertainties. Degenerate inputs give `f64::INFINITY`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimingErrors {
    pub toa: f64,
    pub dm: f64,
    pub f0: f64,
    pub f1: f64,
}

impl TimingErrors {
    /// `width` is the pulse width in seconds and `span` the folded time span.
    pub fn compute(width: f64, snr: f64, f0: f64, span: f64, f_lo: f64, f_hi: f64) -> Self {
        let toa = if snr > 0.0 && width.is_finite() {
            width / (std::f64::consts::PI.powf(0.25) * snr)
        } else {
            f64::INFINITY
        };
        let (f0_err, f1_err) = if span > 0.0 {
            (
                12f64.sqrt() * toa * f0 / span,
                320f64.sqrt() * toa * f0 / (span * span),
            )
        } else {
            (f64::INFINITY, f64::INFINITY)
        };
        let ratio = (f_lo / f_hi + f_hi / f_lo + 1.0) / 3.0 - 1.0;
        let dm = if f_lo > 0.0 && f_hi > 0.0 && ratio > 0.0 {
            f_lo * f_hi / ratio.sqrt() * toa / DISPERSION_CONSTANT_PRECISE
        } else {
            f64::INFINITY
        };
        Self {
            toa,
            dm,
            f0: f0_err,
            f1: f1_err,
        }
    }
}

/// Period-domain parameters with propagated uncertainties.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DerivedParameters {
    pub p0: f64,
    pub p0_err: f64,
    pub p1: f64,
    pub p1_err: f64,
    /// Line-of-sight acceleration in m/s².
    pub acc: f64,
    pub acc_err: f64,
}

impl DerivedParameters {
    pub fn compute(f0: f64, f1: f64, errors: &TimingErrors) -> Self {
        let f0_sq = f0 * f0;
        let p0 = 1.0 / f0;
        let p0_err = errors.f0 / f0_sq;
        let p1 = -f1 / f0_sq;
        let p1_err = ((errors.f1 / f0_sq).powi(2) + (2.0 * f1 * errors.f0 / (f0_sq * f0)).powi(2))
            .sqrt();
        let acc = f1 / f0 * SPEED_OF_LIGHT;
        let acc_err = SPEED_OF_LIGHT
            * ((errors.f1 / f0).powi(2) + (f1 * errors.f0 / f0_sq).powi(2)).sqrt();
        Self {
            p0,
            p0_err,
            p1,
            p1_err,
            acc,
            acc_err,
        }
    }
}

/// Outcome of one refinement. Replaced wholesale by every iteration.
#[derive(Debug, Clone)]
pub struct GridSearchResult {
    pub nominal_dm: f64,
    pub nominal_f0: f64,
    pub nominal_f1: f64,
    pub dm: f64,
    pub f0: f64,
    pub f1: f64,
    pub ddm: f64,
    pub df0: f64,
    pub df1: f64,
    pub snr: f64,
    /// Boxcar width in bins.
    pub width: usize,
    pub dm_axis: GridAxis,
    pub f0_axis: GridAxis,
    pub f1_axis: GridAxis,
    /// S/N along the DM line of the last iteration.
    pub snr_dm: Vec<f64>,
    /// S/N over the last F0×F1 grid, `(nf1, nf0)`.
    pub snr_ffdot: Array2<f64>,
    pub profile: Vec<f32>,
    /// Channel profiles re-aligned at the best parameters, `(nsubint, nchan, nbin)`.
    pub aligned: Array3<f32>,
    pub errors: TimingErrors,
    pub derived: DerivedParameters,
    pub iterations: usize,
    pub converged: bool,
}

#[derive(Debug, Clone, Copy, Default)]
struct Offsets {
    ddm: f64,
    df0: f64,
    df1: f64,
}

pub struct GridSearch<'a> {
    archive: &'a Archive,
    settings: GridSearchSettings,
    estimator: Box<dyn SnrEstimator>,
    fft: FftHelper,
    /// `(nsubint, nchan, nbin)` harmonic spectra of the folded profiles.
    spectra: Array3<Complex32>,
    /// Integration epochs relative to the reference epoch.
    epochs: Vec<f64>,
    /// `K (f⁻² − f_ref⁻²)` per channel.
    dispersion: Vec<f64>,
    dm_axis: GridAxis,
    f0_axis: GridAxis,
    f1_axis: GridAxis,
    logger: LogManager,
}

impl<'a> GridSearch<'a> {
    pub fn new(archive: &'a Archive, settings: GridSearchSettings) -> Self {
        Self::with_estimator(archive, settings, Box::new(BoxcarSnr::new()))
    }

    pub fn with_estimator(
        archive: &'a Archive,
        settings: GridSearchSettings,
        estimator: Box<dyn SnrEstimator>,
    ) -> Self {
        let nbin = archive.nbin.max(1);
        let nchan = archive.nchan();
        let nsub = archive.nsubint();
        let fft = FftHelper::new(nbin);

        let mut spectra = Array3::<Complex32>::zeros((nsub, nchan, nbin));
        for (k, integration) in archive.integrations.iter().enumerate() {
            for (ch, row) in integration.channels().outer_iter().enumerate().take(nchan) {
                let spectrum = fft.forward(&row.to_vec());
                for (b, value) in spectrum.into_iter().enumerate() {
                    spectra[[k, ch, b]] = value;
                }
            }
        }
        let epochs = archive.integrations.iter().map(|i| i.epoch).collect();

        let f_hi = archive
            .frequencies
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max);
        let f_lo = archive.frequencies.iter().copied().fold(f64::INFINITY, f64::min);
        let dispersion = if nchan > 1 {
            archive
                .frequencies
                .iter()
                .map(|&f| DISPERSION_CONSTANT * (f.powi(-2) - f_hi.powi(-2)))
                .collect()
        } else {
            vec![0.0; nchan]
        };

        let span = archive.span();
        let count = 2 * nbin;
        let band_delay = DISPERSION_CONSTANT * (f_lo.powi(-2) - f_hi.powi(-2));
        let dm_axis = if nchan > 1 {
            GridAxis::new(3.0 / (archive.f0 * band_delay) / nbin as f64, count)
        } else {
            GridAxis::degenerate()
        };
        let f0_axis = GridAxis::new(3.0 / (span * nbin as f64), count);
        let f1_axis = GridAxis::new(6.0 / (span * span * nbin as f64), count);

        Self {
            archive,
            settings,
            estimator,
            fft,
            spectra,
            epochs,
            dispersion,
            dm_axis,
            f0_axis,
            f1_axis,
            logger: LogManager::new("gridsearch"),
        }
    }

    pub fn axes(&self) -> (GridAxis, GridAxis, GridAxis) {
        (self.dm_axis, self.f0_axis, self.f1_axis)
    }

    /// Phase delay in turns that re-aligns integration `k` for an F0/F1
    /// offset.
    fn ff_shift(&self, k: usize, df0: f64, df1: f64) -> f64 {
        let t = self.epochs[k];
        df0 * t + 0.5 * df1 * t * t
    }

    fn dm_shift(&self, ch: usize, ddm: f64) -> f64 {
        -self.archive.f0 * ddm * self.dispersion[ch]
    }

    fn nbin(&self) -> usize {
        self.fft.size()
    }

    fn empty_spectrum(&self) -> Vec<Complex32> {
        vec![Complex32::new(0.0, 0.0); self.nbin()]
    }

    /// Channel-summed spectrum of each integration at DM offset `ddm`.
    fn dm_aligned(&self, ddm: f64) -> Vec<Vec<Complex32>> {
        (0..self.spectra.dim().0)
            .map(|k| {
                let mut acc = self.empty_spectrum();
                for ch in 0..self.spectra.dim().1 {
                    let factors = self.fft.shift_factors(self.dm_shift(ch, ddm));
                    let spectrum = self.spectra.slice(ndarray::s![k, ch, ..]).to_vec();
                    FftHelper::accumulate_shifted(&mut acc, &spectrum, &factors);
                }
                acc
            })
            .collect()
    }

    /// Time-summed spectrum of each channel at F0/F1 offsets.
    fn ff_aligned(&self, df0: f64, df1: f64) -> Vec<Vec<Complex32>> {
        (0..self.spectra.dim().1)
            .map(|ch| {
                let mut acc = self.empty_spectrum();
                for k in 0..self.spectra.dim().0 {
                    let factors = self.fft.shift_factors(self.ff_shift(k, df0, df1));
                    let spectrum = self.spectra.slice(ndarray::s![k, ch, ..]).to_vec();
                    FftHelper::accumulate_shifted(&mut acc, &spectrum, &factors);
                }
                acc
            })
            .collect()
    }

    fn score(&self, spectrum: &[Complex32]) -> SnrEstimate {
        self.estimator.estimate(&self.fft.inverse_real(spectrum))
    }

    /// F0×F1 scan around `center`; returns the grid and the best indices.
    fn scan_ffdot(&self, center: Offsets) -> (Array2<f64>, usize, usize) {
        let per_subint = self.dm_aligned(center.ddm);
        let (nf0, nf1) = (self.f0_axis.count, self.f1_axis.count);
        let rows: Vec<Vec<f64>> = (0..nf1)
            .into_par_iter()
            .map(|j| {
                let df1 = center.df1 + self.f1_axis.offset(j);
                (0..nf0)
                    .map(|i| {
                        let df0 = center.df0 + self.f0_axis.offset(i);
                        let mut acc = self.empty_spectrum();
                        for (k, spectrum) in per_subint.iter().enumerate() {
                            let factors = self.fft.shift_factors(self.ff_shift(k, df0, df1));
                            FftHelper::accumulate_shifted(&mut acc, spectrum, &factors);
                        }
                        self.score(&acc).snr
                    })
                    .collect()
            })
            .collect();
        let mut grid = Array2::zeros((nf1, nf0));
        for (j, row) in rows.into_iter().enumerate() {
            for (i, value) in row.into_iter().enumerate() {
                grid[[j, i]] = value;
            }
        }

        let (mut best_i, mut best_j) = (self.f0_axis.center(), self.f1_axis.center());
        let mut best = grid[[best_j, best_i]];
        for ((j, i), &value) in grid.indexed_iter() {
            if value > best {
                best = value;
                best_i = i;
                best_j = j;
            }
        }
        (grid, best_i, best_j)
    }

    /// DM line around `center`; returns the curve and the best index.
    fn scan_dm(&self, center: Offsets) -> (Vec<f64>, usize) {
        let per_channel = self.ff_aligned(center.df0, center.df1);
        let curve: Vec<f64> = (0..self.dm_axis.count)
            .into_par_iter()
            .map(|d| {
                let ddm = center.ddm + self.dm_axis.offset(d);
                let mut acc = self.empty_spectrum();
                for (ch, spectrum) in per_channel.iter().enumerate() {
                    let factors = self.fft.shift_factors(self.dm_shift(ch, ddm));
                    FftHelper::accumulate_shifted(&mut acc, spectrum, &factors);
                }
                self.score(&acc).snr
            })
            .collect();
        let mut best_d = self.dm_axis.center();
        let mut best = curve[best_d];
        for (d, &value) in curve.iter().enumerate() {
            if value > best {
                best = value;
                best_d = d;
            }
        }
        (curve, best_d)
    }

    /// Fully re-aligned spectra, summed over channels and integrations.
    fn aligned_spectrum(&self, at: Offsets) -> Vec<Complex32> {
        let mut acc = self.empty_spectrum();
        for (k, spectrum) in self.dm_aligned(at.ddm).iter().enumerate() {
            let factors = self.fft.shift_factors(self.ff_shift(k, at.df0, at.df1));
            FftHelper::accumulate_shifted(&mut acc, spectrum, &factors);
        }
        acc
    }

    fn aligned_cube(&self, at: Offsets) -> Array3<f32> {
        let (nsub, nchan, nbin) = self.spectra.dim();
        let mut cube = Array3::zeros((nsub, nchan, nbin));
        for k in 0..nsub {
            for ch in 0..nchan {
                let factors = self
                    .fft
                    .shift_factors(self.ff_shift(k, at.df0, at.df1) + self.dm_shift(ch, at.ddm));
                let mut acc = self.empty_spectrum();
                let spectrum = self.spectra.slice(ndarray::s![k, ch, ..]).to_vec();
                FftHelper::accumulate_shifted(&mut acc, &spectrum, &factors);
                for (b, value) in self.fft.inverse_real(&acc).into_iter().enumerate() {
                    cube[[k, ch, b]] = value;
                }
            }
        }
        cube
    }

    /// Runs the refinement. Never fails: degenerate archives return the
    /// nominal parameters with zero S/N and infinite uncertainties.
    pub fn run(&self) -> GridSearchResult {
        let mut at = Offsets::default();
        let mut snr_ffdot = Array2::zeros((1, 1));
        let mut snr_dm = vec![0.0];
        let mut iterations = 0;
        let mut converged = !self.settings.search;

        let searchable = self.archive.nsubint() > 0 && self.archive.nbin >= 2;
        if self.settings.search && searchable {
            while iterations < self.settings.max_iterations {
                iterations += 1;
                let (grid, i, j) = self.scan_ffdot(at);
                let moved_ff = i != self.f0_axis.center() || j != self.f1_axis.center();
                at.df0 += self.f0_axis.offset(i);
                at.df1 += self.f1_axis.offset(j);
                snr_ffdot = grid;

                let (curve, d) = self.scan_dm(at);
                let moved_dm = d != self.dm_axis.center();
                at.ddm += self.dm_axis.offset(d);
                snr_dm = curve;

                self.logger.detail(&format!(
                    "iteration {iterations}: ddm {:.4e} df0 {:.4e} df1 {:.4e}",
                    at.ddm, at.df0, at.df1
                ));
                if !moved_ff && !moved_dm {
                    converged = true;
                    break;
                }
            }
            if !converged {
                self.logger.warn(&format!(
                    "DM {:.3} F0 {:.6}: no convergence after {iterations} iterations",
                    self.archive.dm, self.archive.f0
                ));
            }
        } else if self.settings.search {
            self.logger.warn("archive has nothing to refine");
            converged = true;
        }

        let (profile, estimate) = if searchable {
            let spectrum = self.aligned_spectrum(at);
            let profile = self.fft.inverse_real(&spectrum);
            let estimate = self.estimator.estimate(&profile);
            (profile, estimate)
        } else {
            (vec![0.0; self.archive.nbin], SnrEstimate::none())
        };
        if !self.settings.search {
            snr_ffdot[[0, 0]] = estimate.snr;
            snr_dm[0] = estimate.snr;
        }

        let f0 = self.archive.f0 + at.df0;
        let f1 = self.archive.f1 + at.df1;
        let width_seconds = estimate.width as f64 / self.nbin() as f64 / f0;
        let f_lo = self.archive.frequencies.iter().copied().fold(f64::INFINITY, f64::min);
        let f_hi = self
            .archive
            .frequencies
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max);
        let errors = TimingErrors::compute(
            width_seconds,
            estimate.snr,
            f0,
            self.archive.span(),
            f_lo,
            f_hi,
        );

        GridSearchResult {
            nominal_dm: self.archive.dm,
            nominal_f0: self.archive.f0,
            nominal_f1: self.archive.f1,
            dm: self.archive.dm + at.ddm,
            f0,
            f1,
            ddm: at.ddm,
            df0: at.df0,
            df1: at.df1,
            snr: estimate.snr,
            width: estimate.width,
            dm_axis: self.dm_axis,
            f0_axis: self.f0_axis,
            f1_axis: self.f1_axis,
            snr_dm,
            snr_ffdot,
            profile,
            aligned: if searchable {
                self.aligned_cube(at)
            } else {
                Array3::zeros((0, self.archive.nchan(), self.archive.nbin))
            },
            errors,
            derived: DerivedParameters::compute(f0, f1, &errors),
            iterations,
            converged,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::fold::Integration;

    const NBIN: usize = 32;
    const F0: f64 = 10.0;

    fn pulse(center_turns: f64, bin: usize) -> f32 {
        let center = center_turns.rem_euclid(1.0) * NBIN as f64;
        let mut d = (bin as f64 - center).abs();
        d = d.min(NBIN as f64 - d);
        (-(d * d) / (2.0 * 1.5 * 1.5)).exp() as f32
    }

    /// 16 one-second integrations whose pulse drifts by `drift(t)` turns.
    fn archive(frequencies: Vec<f64>, drift: impl Fn(f64) -> f64) -> Archive {
        let nchan = frequencies.len();
        let integrations = (0..16)
            .map(|k| {
                let start = k as f64 - 8.0;
                let epoch = start + 0.5;
                let data = Array3::from_shape_fn((1, nchan, NBIN), |(_, ch, b)| {
                    let noise = (((k * 131 + ch * 71 + b * 17) as f32) * 0.61).sin() * 0.01;
                    pulse(0.5 - drift(epoch), b) + noise
                });
                Integration {
                    epoch,
                    start,
                    ffold: F0,
                    tsubint: 1.0,
                    data,
                }
            })
            .collect();
        Archive {
            dm: 30.0,
            f0: F0,
            f1: 0.0,
            ref_epoch: 8.0,
            start_mjd: 60_000.0,
            frequencies,
            nbin: NBIN,
            integrations,
        }
    }

    #[test]
    fn axes_follow_span_and_band() {
        let arch = archive(vec![1400.0, 1410.0, 1420.0, 1430.0], |_| 0.0);
        let search = GridSearch::new(&arch, GridSearchSettings::default());
        let (dm_axis, f0_axis, f1_axis) = search.axes();
        assert_eq!(f0_axis.count, 2 * NBIN);
        assert!((f0_axis.step - 3.0 / (16.0 * NBIN as f64)).abs() < 1e-15);
        assert!((f1_axis.step - 6.0 / (256.0 * NBIN as f64)).abs() < 1e-15);
        assert_eq!(f0_axis.offset(NBIN), 0.0);
        assert_eq!(dm_axis.count, 2 * NBIN);
    }

    #[test]
    fn converges_onto_grid_point_optimum() {
        let df0_step = 3.0 / (16.0 * NBIN as f64);
        let df1_step = 6.0 / (256.0 * NBIN as f64);
        let (true_df0, true_df1) = (2.0 * df0_step, -df1_step);
        let arch = archive(vec![1400.0, 1410.0, 1420.0, 1430.0], |t| {
            true_df0 * t + 0.5 * true_df1 * t * t
        });
        let result = GridSearch::new(&arch, GridSearchSettings::default()).run();
        assert!(result.converged);
        assert!(result.iterations <= 2, "iterations {}", result.iterations);
        assert!((result.df0 - true_df0).abs() < 1e-12, "df0 {}", result.df0);
        assert!((result.df1 - true_df1).abs() < 1e-12, "df1 {}", result.df1);
        assert_eq!(result.ddm, 0.0);
        assert!(result.snr > 10.0);
        assert_eq!(result.snr_ffdot.dim(), (2 * NBIN, 2 * NBIN));
        assert_eq!(result.aligned.dim(), (16, 4, NBIN));
        assert!(result.errors.f0.is_finite() && result.errors.dm.is_finite());
    }

    #[test]
    fn single_channel_archive_has_degenerate_dm_axis() {
        let arch = archive(vec![1400.0], |_| 0.0);
        let result = GridSearch::new(&arch, GridSearchSettings::default()).run();
        assert_eq!(result.dm_axis.count, 1);
        assert_eq!(result.snr_dm.len(), 1);
        assert_eq!(result.dm, 30.0);
        assert!(result.errors.dm.is_infinite());
        assert!(result.converged);
        assert_eq!(result.iterations, 1);
    }

    #[test]
    fn no_search_reports_nominal_snr() {
        let arch = archive(vec![1400.0, 1430.0], |_| 0.0);
        let settings = GridSearchSettings {
            search: false,
            ..GridSearchSettings::default()
        };
        let result = GridSearch::new(&arch, settings).run();
        assert_eq!(result.iterations, 0);
        assert_eq!((result.f0, result.f1, result.dm), (F0, 0.0, 30.0));
        assert!(result.snr > 10.0);
        assert_eq!(result.snr_ffdot[[0, 0]], result.snr);
    }

    #[test]
    fn empty_archive_returns_nominal_parameters() {
        let mut arch = archive(vec![1400.0], |_| 0.0);
        arch.integrations.clear();
        let result = GridSearch::new(&arch, GridSearchSettings::default()).run();
        assert_eq!(result.snr, 0.0);
        assert!(result.errors.toa.is_infinite());
        assert_eq!(result.f0, F0);
    }

    #[test]
    fn closed_form_uncertainties() {
        let errors = TimingErrors::compute(0.01, 10.0, 5.0, 100.0, 1200.0, 1500.0);
        let toa = 0.01 / (std::f64::consts::PI.powf(0.25) * 10.0);
        assert!((errors.toa - toa).abs() < 1e-15);
        assert!((errors.f0 - 12f64.sqrt() * toa * 5.0 / 100.0).abs() < 1e-15);
        assert!((errors.f1 - 320f64.sqrt() * toa * 5.0 / 1e4).abs() < 1e-18);
        assert!(errors.dm > 0.0 && errors.dm.is_finite());

        let degenerate = TimingErrors::compute(0.01, 0.0, 5.0, 100.0, 1400.0, 1400.0);
        assert!(degenerate.toa.is_infinite() && degenerate.dm.is_infinite());

        let derived = DerivedParameters::compute(5.0, -1e-10, &errors);
        assert!((derived.p0 - 0.2).abs() < 1e-15);
        assert!((derived.p1 - 4e-12).abs() < 1e-24);
        assert!(derived.acc < 0.0);
    }
}
