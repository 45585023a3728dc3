use crate::math::stats::RunningStats;
use crate::prelude::{
    BlockLayout, DataBlock, PipelineError, PipelineResult, ProcessingStage,
};
use crate::telemetry::log::LogManager;
use ndarray::Axis;

/// Below this variance a channel is treated as dead and written as zeros.
const MIN_VARIANCE: f64 = 1e-12;

/// Flattens bandpass shape and gain drift with per-channel running statistics.
pub struct Equalizer {
    stats: Vec<RunningStats>,
    logger: LogManager,
}

impl Equalizer {
    pub fn new() -> Self {
        Self {
            stats: Vec::new(),
            logger: LogManager::new("equalize"),
        }
    }
}

impl Default for Equalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessingStage for Equalizer {
    fn name(&self) -> &'static str {
        "equalize"
    }

    fn configure(&mut self, layout: &BlockLayout) -> PipelineResult<BlockLayout> {
        self.stats = vec![RunningStats::default(); layout.nchans()];
        Ok(layout.clone())
    }

    fn process(&mut self, mut block: DataBlock) -> PipelineResult<DataBlock> {
        if block.nchans() != self.stats.len() {
            return Err(PipelineError::InvalidInput(format!(
                "equalizer configured for {} channels, block has {}",
                self.stats.len(),
                block.nchans()
            )));
        }

        let mut dead = 0usize;
        for (stats, mut column) in self.stats.iter_mut().zip(block.data.axis_iter_mut(Axis(1))) {
            stats.merge_samples(column.iter().copied());
            let variance = stats.variance();
            if variance < MIN_VARIANCE {
                column.fill(0.0);
                dead += 1;
                continue;
            }
            let mean = stats.mean() as f32;
            let scale = (1.0 / variance.sqrt()) as f32;
            column.mapv_inplace(|v| (v - mean) * scale);
        }
        if dead > 0 {
            self.logger
                .detail(&format!("{dead} zero-variance channels left at zero"));
        }
        Ok(block)
    }

    fn reset(&mut self) {
        for stats in &mut self.stats {
            *stats = RunningStats::default();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::stats::StatsHelper;
    use ndarray::Array2;

    #[test]
    fn normalises_each_channel_and_zeroes_flat_ones() {
        let layout = BlockLayout::new(1e-3, vec![1400.0, 1401.0, 1402.0]);
        let data = Array2::from_shape_fn((256, 3), |(i, j)| match j {
            0 => 100.0 + ((i * 7919) % 13) as f32,
            1 => 5.0,
            _ => -3.0 + 0.01 * ((i * 104_729) % 17) as f32,
        });
        let mut stage = Equalizer::new();
        stage.configure(&layout).unwrap();
        let output = stage
            .process(DataBlock::new(data, &layout, 0.0).unwrap())
            .unwrap();

        for j in [0, 2] {
            let column: Vec<f32> = output.data.column(j).to_vec();
            let (mean, std) = StatsHelper::mean_std(&column);
            assert!(mean.abs() < 1e-4, "channel {j} mean {mean}");
            assert!((std - 1.0).abs() < 1e-3, "channel {j} std {std}");
        }
        assert!(output.data.column(1).iter().all(|&v| v == 0.0));
    }
}
