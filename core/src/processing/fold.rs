use crate::prelude::{PipelineError, PipelineResult};
use crate::processing::dedisperse::DedispersedChunk;
use crate::telemetry::log::LogManager;
use ndarray::{Array2, Array3, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

/// Quadratic spin model around a reference epoch (seconds since observation
/// start).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimingModel {
    pub f0: f64,
    pub f1: f64,
    pub ref_epoch: f64,
}

impl TimingModel {
    pub fn new(f0: f64, f1: f64, ref_epoch: f64) -> Self {
        Self { f0, f1, ref_epoch }
    }

    /// Unwrapped pulse phase in turns.
    pub fn phase(&self, t: f64) -> f64 {
        let dt = t - self.ref_epoch;
        self.f0 * dt + 0.5 * self.f1 * dt * dt
    }

    /// Instantaneous spin frequency.
    pub fn ffold(&self, t: f64) -> f64 {
        self.f0 + self.f1 * (t - self.ref_epoch)
    }

    /// Time of the last integer-phase crossing at or before `t_nom`.
    pub fn epoch(&self, t_nom: f64) -> f64 {
        let dt_nom = t_nom - self.ref_epoch;
        let k = self.phase(t_nom).floor();
        match solve_pulse_epoch(self.f0, self.f1, k, dt_nom) {
            Some(dt) => self.ref_epoch + dt,
            None => {
                log::warn!("[fold] F0 and F1 are both zero, epoch left at {t_nom:.6}");
                t_nom
            }
        }
    }
}

/// Offset `dt` with `f0 dt + ½ f1 dt² = k`, choosing the root nearest
/// `dt_nom`. The discriminant is clamped at zero. `None` when the model has
/// no phase evolution.
pub fn solve_pulse_epoch(f0: f64, f1: f64, k: f64, dt_nom: f64) -> Option<f64> {
    if f1 != 0.0 {
        let disc = (f0 * f0 + 2.0 * f1 * k).max(0.0).sqrt();
        let plus = (-f0 + disc) / f1;
        let minus = (-f0 - disc) / f1;
        if (plus - dt_nom).abs() <= (minus - dt_nom).abs() {
            Some(plus)
        } else {
            Some(minus)
        }
    } else if f0 != 0.0 {
        Some(k / f0)
    } else {
        None
    }
}

/// One folded sub-integration. Times are relative to the archive reference
/// epoch.
#[derive(Debug, Clone)]
pub struct Integration {
    pub epoch: f64,
    pub start: f64,
    pub ffold: f64,
    pub tsubint: f64,
    /// Flux cube `(npol, nchan, nbin)`.
    pub data: Array3<f32>,
}

impl Integration {
    pub fn nchan(&self) -> usize {
        self.data.len_of(Axis(1))
    }

    /// Polarisation 0 as `(nchan, nbin)`.
    pub fn channels(&self) -> ArrayView2<'_, f32> {
        self.data.index_axis(Axis(0), 0)
    }
}

/// A folded candidate ready for refinement and persistence.
#[derive(Debug, Clone)]
pub struct Archive {
    pub dm: f64,
    pub f0: f64,
    pub f1: f64,
    /// Seconds since observation start.
    pub ref_epoch: f64,
    pub start_mjd: f64,
    pub frequencies: Vec<f64>,
    pub nbin: usize,
    pub integrations: Vec<Integration>,
}

impl Archive {
    pub fn nsubint(&self) -> usize {
        self.integrations.len()
    }

    pub fn nchan(&self) -> usize {
        self.frequencies.len()
    }

    /// Time covered from the first integration start to the last one's end.
    pub fn span(&self) -> f64 {
        match (self.integrations.first(), self.integrations.last()) {
            (Some(first), Some(last)) => last.start + last.tsubint - first.start,
            _ => 0.0,
        }
    }

    /// MJD of the reference epoch.
    pub fn ref_mjd(&self) -> f64 {
        self.start_mjd + self.ref_epoch / 86_400.0
    }

    /// Sum over every integration, `(nchan, nbin)`.
    pub fn channel_profiles(&self) -> Array2<f32> {
        let mut acc = Array2::zeros((self.nchan(), self.nbin));
        for integration in &self.integrations {
            acc += &integration.channels();
        }
        acc
    }

    /// Frequency- and time-scrunched profile.
    pub fn profile(&self) -> Vec<f32> {
        self.channel_profiles().sum_axis(Axis(0)).to_vec()
    }
}

/// Accumulates dedispersed chunks into sub-integrations for one candidate.
pub struct PhaseFolder {
    model: TimingModel,
    nbin: usize,
    dm: f64,
    frequencies: Option<Vec<f64>>,
    integrations: Vec<Integration>,
    logger: LogManager,
}

impl PhaseFolder {
    pub fn new(model: TimingModel, dm: f64, nbin: usize) -> PipelineResult<Self> {
        if nbin < 2 {
            return Err(PipelineError::Configuration(format!(
                "fold needs at least 2 phase bins, got {nbin}"
            )));
        }
        if !(model.f0.is_finite() && model.f0 > 0.0) {
            return Err(PipelineError::Configuration(format!(
                "fold frequency must be positive, got {}",
                model.f0
            )));
        }
        Ok(Self {
            model,
            nbin,
            dm,
            frequencies: None,
            integrations: Vec::new(),
            logger: LogManager::new("fold"),
        })
    }

    pub fn model(&self) -> &TimingModel {
        &self.model
    }

    pub fn nsubint(&self) -> usize {
        self.integrations.len()
    }

    /// Folds one chunk into a new integration.
    pub fn fold(&mut self, chunk: &DedispersedChunk) -> PipelineResult<()> {
        self.fold_samples(chunk.data.view(), chunk.start, chunk.tsamp, &chunk.frequencies)
    }

    /// Folds `(nsamples, nchan)` rows starting at `start` into a new
    /// integration.
    pub fn fold_samples(
        &mut self,
        rows: ArrayView2<'_, f32>,
        start: f64,
        tsamp: f64,
        frequencies: &[f64],
    ) -> PipelineResult<()> {
        if rows.nrows() == 0 {
            return Ok(());
        }
        match &self.frequencies {
            Some(known) if known.len() != frequencies.len() => {
                return Err(PipelineError::InvalidInput(format!(
                    "folder has {} channels, chunk has {}",
                    known.len(),
                    frequencies.len()
                )));
            }
            Some(_) => {}
            None => self.frequencies = Some(frequencies.to_vec()),
        }

        let nchan = frequencies.len();
        let nbin = self.nbin;
        let mut data = Array3::<f32>::zeros((1, nchan, nbin));
        for (i, row) in rows.axis_iter(Axis(0)).enumerate() {
            let t = start + i as f64 * tsamp;
            let phase = self.model.phase(t);
            let bin = (((phase - phase.floor()) * nbin as f64) as usize) % nbin;
            for (ch, &value) in row.iter().enumerate() {
                data[[0, ch, bin]] += value;
            }
        }

        let tsubint = rows.nrows() as f64 * tsamp;
        let mid = start + 0.5 * tsubint;
        let epoch = self.model.epoch(mid);
        self.integrations.push(Integration {
            epoch: epoch - self.model.ref_epoch,
            start: start - self.model.ref_epoch,
            ffold: self.model.ffold(mid),
            tsubint,
            data,
        });
        Ok(())
    }

    pub fn into_archive(self, start_mjd: f64) -> Archive {
        self.logger.detail(&format!(
            "DM {:.3} F0 {:.9}: {} integrations",
            self.dm,
            self.model.f0,
            self.integrations.len()
        ));
        Archive {
            dm: self.dm,
            f0: self.model.f0,
            f1: self.model.f1,
            ref_epoch: self.model.ref_epoch,
            start_mjd,
            frequencies: self.frequencies.unwrap_or_default(),
            nbin: self.nbin,
            integrations: self.integrations,
        }
    }
}
