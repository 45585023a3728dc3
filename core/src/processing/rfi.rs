use crate::math::stats::StatsHelper;
use crate::plan::{RfiOp, RfiThresholds};
use crate::prelude::{
    BlockLayout, DataBlock, PipelineError, PipelineResult, ProcessingStage,
};
use crate::processing::downsample::Downsampler;
use crate::telemetry::log::LogManager;
use ndarray::{s, Array2, Axis};

/// Applies an RFI recipe in place. Flagged samples are zeroed at the latest
/// when the recipe finishes; block shape never changes.
pub struct RfiMitigator {
    ops: Vec<RfiOp>,
    thresholds: RfiThresholds,
    layout: Option<BlockLayout>,
    flags: Array2<bool>,
    logger: LogManager,
}

/// Tile grid of one statistics pass: `z` holds the normalised tile power.
struct Tiles {
    z: Array2<f32>,
    td: usize,
    fd: usize,
}

impl RfiMitigator {
    pub fn new(ops: Vec<RfiOp>, thresholds: RfiThresholds) -> Self {
        Self {
            ops,
            thresholds,
            layout: None,
            flags: Array2::from_elem((0, 0), false),
            logger: LogManager::new("rfi"),
        }
    }

    /// Flags raised while processing the most recent block.
    pub fn flags(&self) -> &Array2<bool> {
        &self.flags
    }

    fn zap(&mut self, block: &mut DataBlock, fmin: f64, fmax: f64) {
        for (j, &freq) in block.frequencies.iter().enumerate() {
            if freq >= fmin && freq <= fmax {
                block.data.column_mut(j).fill(0.0);
                self.flags.column_mut(j).fill(true);
            }
        }
    }

    fn zdot(&mut self, block: &mut DataBlock) {
        for (mut row, flags) in block
            .data
            .axis_iter_mut(Axis(0))
            .zip(self.flags.axis_iter(Axis(0)))
        {
            let mut sum = 0.0f64;
            let mut count = 0usize;
            for (&value, &flagged) in row.iter().zip(flags.iter()) {
                if !flagged {
                    sum += value as f64;
                    count += 1;
                }
            }
            if count == 0 {
                continue;
            }
            let mean = (sum / count as f64) as f32;
            for (value, &flagged) in row.iter_mut().zip(flags.iter()) {
                if !flagged {
                    *value -= mean;
                }
            }
        }
    }

    fn zero(&mut self, block: &mut DataBlock) {
        for (value, &flagged) in block.data.iter_mut().zip(self.flags.iter()) {
            if flagged {
                *value = 0.0;
            }
        }
    }

    /// Downsamples by `td×fd` and normalises the tiles by their own mean and
    /// standard deviation. Returns `None` for a degenerate (flat) block.
    fn tiles(&self, block: &DataBlock, td: usize, fd: usize) -> Option<Tiles> {
        let reduced = Downsampler::reduce(&block.data, td, fd);
        if reduced.is_empty() {
            return None;
        }
        let values: Vec<f32> = reduced.iter().copied().collect();
        let (mean, std) = StatsHelper::mean_std(&values);
        if std <= f64::EPSILON {
            self.logger.detail("flat block, statistics pass skipped");
            return None;
        }
        let (mean, scale) = (mean as f32, (1.0 / std) as f32);
        Some(Tiles {
            z: reduced.mapv(|v| (v - mean) * scale),
            td,
            fd,
        })
    }

    fn flag_tiles(&mut self, tiles: &Tiles, rows: std::ops::Range<usize>, cols: std::ops::Range<usize>) {
        self.flags
            .slice_mut(s![
                rows.start * tiles.td..rows.end * tiles.td,
                cols.start * tiles.fd..cols.end * tiles.fd
            ])
            .fill(true);
    }

    fn mask(&mut self, block: &DataBlock, td: usize, fd: usize) {
        let Some(tiles) = self.tiles(block, td, fd) else {
            return;
        };
        let threshold = self.thresholds.mask;
        for ((i, j), &z) in tiles.z.indexed_iter() {
            if z > threshold {
                self.flag_tiles(&tiles, i..i + 1, j..j + 1);
            }
        }
    }

    fn kadane_f(&mut self, block: &DataBlock, td: usize, fd: usize) {
        let Some(tiles) = self.tiles(block, td, fd) else {
            return;
        };
        let threshold_sq = (self.thresholds.kadane_f as f64).powi(2);
        let channel_width = channel_width(&block.frequencies);
        for (i, row) in tiles.z.axis_iter(Axis(0)).enumerate() {
            let values = row.to_vec();
            let Some((start, len, sum)) = StatsHelper::kadane(&values) else {
                continue;
            };
            let first = start * fd;
            let last = (start + len) * fd - 1;
            let extent = (block.frequencies[last] - block.frequencies[first]).abs() + channel_width;
            if sum * sum / len as f64 > threshold_sq && extent < self.thresholds.kadane_f_limit_mhz {
                self.flag_tiles(&tiles, i..i + 1, start..start + len);
            }
        }
    }

    fn kadane_t(&mut self, block: &DataBlock, td: usize, fd: usize) {
        let Some(tiles) = self.tiles(block, td, fd) else {
            return;
        };
        let threshold_sq = (self.thresholds.kadane_t as f64).powi(2);
        for (j, column) in tiles.z.axis_iter(Axis(1)).enumerate() {
            let values = column.to_vec();
            let Some((start, len, sum)) = StatsHelper::kadane(&values) else {
                continue;
            };
            let duration = (len * td) as f64 * block.tsamp;
            if sum * sum / len as f64 > threshold_sq && duration < self.thresholds.kadane_t_limit_s {
                self.flag_tiles(&tiles, start..start + len, j..j + 1);
            }
        }
    }
}

fn channel_width(frequencies: &[f64]) -> f64 {
    if frequencies.len() < 2 {
        return 0.0;
    }
    let span = (frequencies[frequencies.len() - 1] - frequencies[0]).abs();
    span / (frequencies.len() - 1) as f64
}

impl ProcessingStage for RfiMitigator {
    fn name(&self) -> &'static str {
        "rfi"
    }

    fn configure(&mut self, layout: &BlockLayout) -> PipelineResult<BlockLayout> {
        self.ops.iter().try_for_each(RfiOp::validate)?;
        self.layout = Some(layout.clone());
        Ok(layout.clone())
    }

    fn process(&mut self, mut block: DataBlock) -> PipelineResult<DataBlock> {
        if self.layout.is_none() {
            return Err(PipelineError::InvalidInput("RFI mitigator not configured".into()));
        }
        self.flags = Array2::from_elem(block.data.raw_dim(), false);

        let ops = self.ops.clone();
        for op in ops {
            match op {
                RfiOp::Zap { fmin, fmax } => self.zap(&mut block, fmin, fmax),
                RfiOp::Zdot => self.zdot(&mut block),
                RfiOp::Mask { td, fd } => self.mask(&block, td, fd),
                RfiOp::KadaneF { td, fd } => self.kadane_f(&block, td, fd),
                RfiOp::KadaneT { td, fd } => self.kadane_t(&block, td, fd),
                RfiOp::Zero => self.zero(&mut block),
            }
        }
        self.zero(&mut block);

        let flagged = self.flags.iter().filter(|&&f| f).count();
        if flagged > 0 {
            self.logger.detail(&format!(
                "block at {:.3} s: {} of {} samples flagged",
                block.start,
                flagged,
                self.flags.len()
            ));
        }
        Ok(block)
    }
}
