use crate::math::dispersion::delay_table;
use crate::prelude::{BlockLayout, DataBlock, PipelineError, PipelineResult};
use crate::telemetry::log::LogManager;
use ndarray::{concatenate, s, Array2, Axis};
use rayon::prelude::*;

/// A dump of dedispersed output rows for one trial.
#[derive(Debug, Clone)]
pub struct DedispersedChunk {
    pub dm: f64,
    /// Output segment the rows belong to; bumped at every discontinuity.
    pub segment: usize,
    /// Time of the first row, seconds since observation start.
    pub start: f64,
    pub tsamp: f64,
    /// Subband centre frequencies in MHz.
    pub frequencies: Vec<f64>,
    /// Rows with shape `(nsamples, nsubband)`.
    pub data: Array2<f32>,
}

impl DedispersedChunk {
    pub fn nsamples(&self) -> usize {
        self.data.nrows()
    }

    /// Row sums, i.e. the fully dedispersed series.
    pub fn series(&self) -> Vec<f32> {
        self.data.sum_axis(Axis(1)).to_vec()
    }
}

/// Per-trial state: delay table, subband map and the rolling history that
/// carries `max_delay` rows across block boundaries.
pub struct TrialDm {
    dm: f64,
    delays: Vec<usize>,
    max_delay: usize,
    subband: Vec<usize>,
    subband_frequencies: Vec<f64>,
    tsamp: f64,
    history: Array2<f32>,
    pending: Array2<f32>,
    pending_start: f64,
    base_time: Option<f64>,
    produced: usize,
    segment: usize,
}

impl TrialDm {
    pub fn new(dm: f64, layout: &BlockLayout, nsubband: usize) -> Self {
        let nchans = layout.nchans();
        let nsub = nsubband.clamp(1, nchans.max(1));
        let subband: Vec<usize> = (0..nchans).map(|ch| ch * nsub / nchans).collect();
        let mut subband_frequencies = vec![0.0; nsub];
        let mut members = vec![0usize; nsub];
        for (&sb, &freq) in subband.iter().zip(&layout.frequencies) {
            subband_frequencies[sb] += freq;
            members[sb] += 1;
        }
        for (freq, &count) in subband_frequencies.iter_mut().zip(&members) {
            *freq /= count.max(1) as f64;
        }

        let delays = delay_table(dm, &layout.frequencies, layout.tsamp);
        let max_delay = delays.iter().copied().max().unwrap_or(0);
        Self {
            dm,
            delays,
            max_delay,
            subband,
            subband_frequencies,
            tsamp: layout.tsamp,
            history: Array2::zeros((0, nchans)),
            pending: Array2::zeros((0, nsub)),
            pending_start: 0.0,
            base_time: None,
            produced: 0,
            segment: 0,
        }
    }

    pub fn dm(&self) -> f64 {
        self.dm
    }

    pub fn nsubband(&self) -> usize {
        self.subband_frequencies.len()
    }

    fn push(&mut self, block: &DataBlock, ndump: usize) -> PipelineResult<Vec<DedispersedChunk>> {
        if self.base_time.is_none() {
            self.base_time = Some(block.start - self.history.nrows() as f64 * self.tsamp);
        }
        let combined = concatenate(Axis(0), &[self.history.view(), block.data.view()])
            .map_err(|err| PipelineError::InvalidInput(format!("DM {}: {err}", self.dm)))?;
        let total = combined.nrows();
        let n_out = total.saturating_sub(self.max_delay);

        if n_out > 0 {
            let mut out = Array2::<f32>::zeros((n_out, self.nsubband()));
            for (ch, (&delay, &sb)) in self.delays.iter().zip(&self.subband).enumerate() {
                let mut column = out.column_mut(sb);
                column += &combined.slice(s![delay..delay + n_out, ch]);
            }
            if self.pending.nrows() == 0 {
                let base = self.base_time.unwrap_or(block.start);
                self.pending_start = base + self.produced as f64 * self.tsamp;
            }
            self.pending = concatenate(Axis(0), &[self.pending.view(), out.view()])
                .map_err(|err| PipelineError::InvalidInput(format!("DM {}: {err}", self.dm)))?;
            self.produced += n_out;
        }

        let keep = total.min(self.max_delay);
        self.history = combined.slice(s![total - keep.., ..]).to_owned();

        let mut chunks = Vec::new();
        while self.pending.nrows() >= ndump {
            chunks.push(self.take(ndump));
        }
        Ok(chunks)
    }

    fn take(&mut self, rows: usize) -> DedispersedChunk {
        let data = self.pending.slice(s![..rows, ..]).to_owned();
        self.pending = self.pending.slice(s![rows.., ..]).to_owned();
        let chunk = DedispersedChunk {
            dm: self.dm,
            segment: self.segment,
            start: self.pending_start,
            tsamp: self.tsamp,
            frequencies: self.subband_frequencies.clone(),
            data,
        };
        self.pending_start += rows as f64 * self.tsamp;
        chunk
    }

    fn flush(&mut self) -> Option<DedispersedChunk> {
        let rows = self.pending.nrows();
        (rows > 0).then(|| self.take(rows))
    }

    /// Flushes pending rows and forgets the history; the next block starts
    /// output segment `segment`.
    fn reset(&mut self, segment: usize) -> Option<DedispersedChunk> {
        let flushed = self.flush();
        self.history = Array2::zeros((0, self.delays.len()));
        self.base_time = None;
        self.produced = 0;
        self.segment = segment;
        flushed
    }
}

/// Every DM trial of one plan entry, advanced together block by block.
pub struct DedispersionBank {
    trials: Vec<TrialDm>,
    layout: BlockLayout,
    ndump: usize,
    logger: LogManager,
}

impl DedispersionBank {
    /// Builds one trial per DM. `capacity` bounds the delay history in
    /// samples; a trial needing more is rejected here rather than mid-run.
    pub fn new(
        layout: &BlockLayout,
        dms: &[f64],
        nsubband: usize,
        ndump: usize,
        capacity: Option<usize>,
    ) -> PipelineResult<Self> {
        layout.validate()?;
        if ndump == 0 {
            return Err(PipelineError::Configuration(
                "dump length must be at least one sample".into(),
            ));
        }
        if dms.is_empty() {
            return Err(PipelineError::Configuration("no DM trials".into()));
        }
        let trials: Vec<TrialDm> = dms
            .iter()
            .map(|&dm| TrialDm::new(dm, layout, nsubband))
            .collect();
        if let Some(capacity) = capacity {
            if let Some(trial) = trials.iter().find(|t| t.max_delay > capacity) {
                return Err(PipelineError::DedispersionOverrun {
                    dm: trial.dm,
                    required: trial.max_delay,
                    capacity,
                });
            }
        }
        let logger = LogManager::new("dedisperse");
        logger.detail(&format!(
            "{} trials, DM {:.3}..{:.3}, largest delay {} samples",
            trials.len(),
            dms.iter().copied().fold(f64::INFINITY, f64::min),
            dms.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            trials.iter().map(|t| t.max_delay).max().unwrap_or(0)
        ));
        Ok(Self {
            trials,
            layout: layout.clone(),
            ndump,
            logger,
        })
    }

    pub fn trials(&self) -> &[TrialDm] {
        &self.trials
    }

    pub fn len(&self) -> usize {
        self.trials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trials.is_empty()
    }

    pub fn layout(&self) -> &BlockLayout {
        &self.layout
    }

    pub fn max_delay(&self) -> usize {
        self.trials.iter().map(|t| t.max_delay).max().unwrap_or(0)
    }

    /// Advances every trial by one conditioned block. The outer vector is
    /// indexed like [`trials`](Self::trials).
    pub fn process(&mut self, block: &DataBlock) -> PipelineResult<Vec<Vec<DedispersedChunk>>> {
        if block.nchans() != self.layout.nchans() {
            return Err(PipelineError::InvalidInput(format!(
                "bank expects {} channels, block has {}",
                self.layout.nchans(),
                block.nchans()
            )));
        }
        let ndump = self.ndump;
        self.trials
            .par_iter_mut()
            .map(|trial| trial.push(block, ndump))
            .collect()
    }

    /// Discontinuity: flush what is pending and restart every trial in
    /// output segment `segment`.
    pub fn reset(&mut self, segment: usize) -> Vec<Vec<DedispersedChunk>> {
        self.logger
            .detail(&format!("reset, next output segment {segment}"));
        self.trials
            .iter_mut()
            .map(|trial| trial.reset(segment).into_iter().collect())
            .collect()
    }

    /// End of stream: emit the remaining rows of every trial.
    pub fn finish(&mut self) -> Vec<Vec<DedispersedChunk>> {
        self.trials
            .iter_mut()
            .map(|trial| trial.flush().into_iter().collect())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> BlockLayout {
        BlockLayout::new(1e-3, vec![1400.0, 1400.5, 1401.0, 1401.5])
    }

    fn collect_series(chunks: &[Vec<DedispersedChunk>], trial: usize) -> Vec<f32> {
        chunks[trial].iter().flat_map(|chunk| chunk.series()).collect()
    }

    #[test]
    fn zero_dm_output_equals_channel_sums() {
        let layout = layout();
        let data = Array2::from_shape_fn((4096, 4), |(i, j)| ((i * 13 + j * 7) % 19) as f32 - 9.0);
        let expected: Vec<f32> = data.sum_axis(Axis(1)).to_vec();
        let mut bank = DedispersionBank::new(&layout, &[0.0], 1, 1024, None).unwrap();

        let mut series = Vec::new();
        for (idx, rows) in data.axis_chunks_iter(Axis(0), 1000).enumerate() {
            let block = DataBlock::new(rows.to_owned(), &layout, idx as f64).unwrap();
            series.extend(collect_series(&bank.process(&block).unwrap(), 0));
        }
        series.extend(collect_series(&bank.finish(), 0));
        assert_eq!(series, expected);
    }

    #[test]
    fn dispersed_pulse_is_realigned() {
        let layout = BlockLayout::new(1e-3, vec![1200.0, 1300.0, 1400.0, 1500.0]);
        let dm = 60.0;
        let delays = delay_table(dm, &layout.frequencies, layout.tsamp);
        let t0 = 10;
        let mut data = Array2::zeros((400, 4));
        for (ch, &delay) in delays.iter().enumerate() {
            data[[t0 + delay, ch]] = 1.0;
        }
        let mut bank = DedispersionBank::new(&layout, &[dm], 1, 64, None).unwrap();
        let block = DataBlock::new(data, &layout, 0.0).unwrap();
        let mut chunks = bank.process(&block).unwrap();
        chunks[0].extend(bank.finish().remove(0));
        let series = collect_series(&chunks, 0);
        assert_eq!(series.len(), 400 - bank.max_delay());
        assert_eq!(series[t0], 4.0);
        assert_eq!(series.iter().sum::<f32>(), 4.0);
    }

    #[test]
    fn chunk_start_times_follow_output_rows() {
        let layout = layout();
        let mut bank = DedispersionBank::new(&layout, &[0.0], 2, 30, None).unwrap();
        let block = DataBlock::new(Array2::ones((50, 4)), &layout, 2.0).unwrap();
        let chunks = bank.process(&block).unwrap().remove(0);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].data.dim(), (30, 2));
        assert_eq!(chunks[0].frequencies, vec![1400.25, 1401.25]);
        let rest = bank.finish().remove(0);
        assert_eq!(rest[0].nsamples(), 20);
        assert!((rest[0].start - 2.03).abs() < 1e-12);
    }

    #[test]
    fn oversized_delay_is_an_overrun() {
        let layout = BlockLayout::new(1e-3, vec![300.0, 400.0]);
        let err = DedispersionBank::new(&layout, &[10.0, 500.0], 1, 16, Some(1000)).err();
        match err {
            Some(PipelineError::DedispersionOverrun { dm, capacity, .. }) => {
                assert_eq!(dm, 500.0);
                assert_eq!(capacity, 1000);
            }
            other => panic!("expected overrun, got {other:?}"),
        }
    }

    #[test]
    fn reset_prevents_cross_gap_delays() {
        let layout = BlockLayout::new(1e-3, vec![1200.0, 1500.0]);
        let mut bank = DedispersionBank::new(&layout, &[100.0], 1, 10_000, None).unwrap();
        let md = bank.max_delay();
        assert!(md > 0);

        let before = DataBlock::new(Array2::from_elem((500, 2), 100.0), &layout, 0.0).unwrap();
        bank.process(&before).unwrap();
        let flushed = bank.reset(1).remove(0);
        assert_eq!(flushed[0].nsamples(), 500 - md);
        assert_eq!(flushed[0].segment, 0);

        let after = DataBlock::new(Array2::from_elem((500, 2), 1.0), &layout, 0.8).unwrap();
        bank.process(&after).unwrap();
        let tail = bank.finish().remove(0);
        assert_eq!(tail[0].segment, 1);
        assert_eq!(tail[0].nsamples(), 500 - md);
        assert!((tail[0].start - 0.8).abs() < 1e-12);
        assert!(tail[0].series().iter().all(|&v| v == 2.0));
    }
}
