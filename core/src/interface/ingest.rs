use crate::interface::source::SampleSource;
use crate::plan::Segmentation;
use crate::prelude::{BlockLayout, DataBlock, PipelineError, PipelineResult};
use crate::telemetry::log::LogManager;
use crate::telemetry::metrics::MetricsRecorder;
use ndarray::{s, Array2, ArrayView2};

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Consumer of the assembled block stream.
pub trait BlockSink {
    fn on_block(&mut self, block: DataBlock) -> PipelineResult<()>;

    /// The stream is discontinuous before the next block; `segment` numbers
    /// the output segment that starts there.
    fn on_discontinuity(&mut self, segment: usize) -> PipelineResult<()>;

    fn on_finish(&mut self) -> PipelineResult<()>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StreamSummary {
    pub samples_read: usize,
    pub samples_used: usize,
    pub blocks: usize,
    pub segments: usize,
}

/// Time-ordered, layout-checked set of recordings forming one observation.
pub struct Observation {
    sources: Vec<Box<dyn SampleSource>>,
    layout: BlockLayout,
    start_mjd: f64,
    /// Start of each source in seconds since the observation start.
    offsets: Vec<f64>,
    /// Whether a reset is forced before each source.
    breaks: Vec<bool>,
    logger: LogManager,
}

impl Observation {
    /// Sorts `sources` by start time and checks they share one layout and
    /// follow each other within half a sample. Gaps are fatal unless
    /// `allow_gaps`, which turns each into a forced reset.
    pub fn assemble(mut sources: Vec<Box<dyn SampleSource>>, allow_gaps: bool) -> PipelineResult<Self> {
        let logger = LogManager::new("ingest");
        if sources.is_empty() {
            return Err(PipelineError::Configuration("no input sources".into()));
        }
        sources.sort_by(|a, b| a.header().start_mjd.total_cmp(&b.header().start_mjd));

        let first = sources[0].header().clone();
        let layout = first.layout();
        layout.validate()?;
        for (idx, source) in sources.iter().enumerate().skip(1) {
            let header = source.header();
            let same_tsamp = (header.tsamp - first.tsamp).abs() <= 1e-9 * first.tsamp;
            if !same_tsamp || header.frequencies != first.frequencies {
                return Err(PipelineError::Configuration(format!(
                    "source {idx} has a different sample period or channel table"
                )));
            }
        }

        let mut breaks = vec![false; sources.len()];
        for idx in 0..sources.len() - 1 {
            let current = sources[idx].header();
            let next = sources[idx + 1].header();
            let gap_seconds = (next.start_mjd - current.end_mjd()) * SECONDS_PER_DAY;
            if gap_seconds.abs() <= 0.5 * first.tsamp {
                continue;
            }
            if !allow_gaps {
                return Err(PipelineError::Contiguity {
                    index: idx,
                    end_mjd: current.end_mjd(),
                    next_start_mjd: next.start_mjd,
                    gap_seconds,
                });
            }
            logger.warn(&format!(
                "{gap_seconds:.6} s gap after source {idx}, dedispersion restarts there"
            ));
            breaks[idx + 1] = true;
        }

        let offsets = sources
            .iter()
            .map(|s| (s.header().start_mjd - first.start_mjd) * SECONDS_PER_DAY)
            .collect();
        Ok(Self {
            sources,
            layout,
            start_mjd: first.start_mjd,
            offsets,
            breaks,
            logger,
        })
    }

    pub fn layout(&self) -> &BlockLayout {
        &self.layout
    }

    pub fn start_mjd(&self) -> f64 {
        self.start_mjd
    }

    pub fn nsamples(&self) -> usize {
        self.sources.iter().map(|s| s.header().nsamples).sum()
    }

    /// Seconds from the observation start to the end of the last source.
    pub fn duration(&self) -> f64 {
        match (self.offsets.last(), self.sources.last()) {
            (Some(offset), Some(source)) => offset + source.header().duration(),
            _ => 0.0,
        }
    }

    /// Reads every source in order and feeds `sink` blocks of `block_len`
    /// rows, honouring lead-in/lead-out and periodic segmentation. Blocks
    /// are cut short only before a discontinuity or at the end.
    pub fn stream(
        &mut self,
        block_len: usize,
        segmentation: &Segmentation,
        sink: &mut dyn BlockSink,
        metrics: &MetricsRecorder,
    ) -> PipelineResult<StreamSummary> {
        let result = self.stream_blocks(block_len, segmentation, sink, metrics);
        if let Err(err) = &result {
            metrics.record_error();
            self.logger.warn(&format!("stream aborted: {err}"));
        }
        result
    }

    fn stream_blocks(
        &mut self,
        block_len: usize,
        segmentation: &Segmentation,
        sink: &mut dyn BlockSink,
        metrics: &MetricsRecorder,
    ) -> PipelineResult<StreamSummary> {
        if block_len == 0 {
            return Err(PipelineError::Configuration("block length must be positive".into()));
        }
        segmentation.validate()?;
        let tsamp = self.layout.tsamp;
        let to_samples = |seconds: f64| (seconds / tsamp).round() as usize;
        let total = self.nsamples();
        let lead_in = to_samples(segmentation.lead_in);
        let usable_end = total.saturating_sub(to_samples(segmentation.lead_out));
        let cycle = segmentation.segment_length.map(|length| {
            let length = to_samples(length).max(1);
            (length, length + to_samples(segmentation.segment_skip))
        });

        let mut assembler = BlockAssembler::new(self.layout.clone(), block_len);
        let mut summary = StreamSummary {
            segments: 1,
            ..StreamSummary::default()
        };
        let mut segment = 0usize;
        let mut current_cycle = 0usize;
        let mut global = 0usize;
        let mut next_report = 0.1;

        for idx in 0..self.sources.len() {
            if self.breaks[idx] {
                assembler.flush(sink, metrics, &mut summary)?;
                segment += 1;
                summary.segments += 1;
                metrics.record_reset();
                sink.on_discontinuity(segment)?;
            }
            let source_start = self.offsets[idx];
            let mut local = 0usize;
            while let Some(rows) = self.sources[idx].read(block_len)? {
                let n = rows.nrows();
                let mut r = 0usize;
                while r < n {
                    let gi = global + r;
                    if gi < lead_in {
                        r += (lead_in - gi).min(n - r);
                        continue;
                    }
                    if gi >= usable_end {
                        break;
                    }
                    let mut take = (n - r).min(usable_end - gi);
                    if let Some((length, period)) = cycle {
                        let offset = gi - lead_in;
                        let k = offset / period;
                        let phase = offset % period;
                        if phase >= length {
                            r += (period - phase).min(n - r);
                            continue;
                        }
                        if k != current_cycle {
                            assembler.flush(sink, metrics, &mut summary)?;
                            current_cycle = k;
                            segment += 1;
                            summary.segments += 1;
                            metrics.record_reset();
                            sink.on_discontinuity(segment)?;
                        }
                        take = take.min(length - phase);
                    }
                    let start = source_start + (local + r) as f64 * tsamp;
                    assembler.push(rows.slice(s![r..r + take, ..]), start, sink, metrics, &mut summary)?;
                    summary.samples_used += take;
                    r += take;
                }
                global += n;
                local += n;
                summary.samples_read += n;

                let fraction = global as f64 / total.max(1) as f64;
                if fraction >= next_report {
                    self.logger
                        .record(&format!("{:.0}% of {} samples ingested", fraction * 100.0, total));
                    next_report = (fraction * 10.0).floor() / 10.0 + 0.1;
                }
            }
        }
        assembler.flush(sink, metrics, &mut summary)?;
        sink.on_finish()?;
        Ok(summary)
    }
}

/// Regroups contiguous rows into fixed-length blocks.
struct BlockAssembler {
    layout: BlockLayout,
    block_len: usize,
    buffer: Vec<f32>,
    rows: usize,
    start: f64,
}

impl BlockAssembler {
    fn new(layout: BlockLayout, block_len: usize) -> Self {
        Self {
            layout,
            block_len,
            buffer: Vec::new(),
            rows: 0,
            start: 0.0,
        }
    }

    fn push(
        &mut self,
        rows: ArrayView2<'_, f32>,
        start: f64,
        sink: &mut dyn BlockSink,
        metrics: &MetricsRecorder,
        summary: &mut StreamSummary,
    ) -> PipelineResult<()> {
        if self.rows == 0 {
            self.start = start;
        }
        self.buffer.extend(rows.iter().copied());
        self.rows += rows.nrows();
        while self.rows >= self.block_len {
            self.emit(self.block_len, sink, metrics, summary)?;
        }
        Ok(())
    }

    fn flush(
        &mut self,
        sink: &mut dyn BlockSink,
        metrics: &MetricsRecorder,
        summary: &mut StreamSummary,
    ) -> PipelineResult<()> {
        if self.rows > 0 {
            self.emit(self.rows, sink, metrics, summary)?;
        }
        Ok(())
    }

    fn emit(
        &mut self,
        rows: usize,
        sink: &mut dyn BlockSink,
        metrics: &MetricsRecorder,
        summary: &mut StreamSummary,
    ) -> PipelineResult<()> {
        let nchans = self.layout.nchans();
        let values: Vec<f32> = self.buffer.drain(..rows * nchans).collect();
        let data = Array2::from_shape_vec((rows, nchans), values)
            .map_err(|err| PipelineError::InvalidInput(format!("block assembly: {err}")))?;
        let block = DataBlock::new(data, &self.layout, self.start)?;
        self.rows -= rows;
        self.start += rows as f64 * self.layout.tsamp;
        metrics.record_block(rows);
        summary.blocks += 1;
        sink.on_block(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::source::InMemorySource;

    #[derive(Default)]
    struct Recorder {
        blocks: Vec<(f64, usize, f32)>,
        resets: Vec<usize>,
        finished: bool,
    }

    impl BlockSink for Recorder {
        fn on_block(&mut self, block: DataBlock) -> PipelineResult<()> {
            self.blocks.push((block.start, block.nsamples(), block.data[[0, 0]]));
            Ok(())
        }

        fn on_discontinuity(&mut self, segment: usize) -> PipelineResult<()> {
            self.resets.push(segment);
            Ok(())
        }

        fn on_finish(&mut self) -> PipelineResult<()> {
            self.finished = true;
            Ok(())
        }
    }

    const TSAMP: f64 = 1e-3;

    fn source(nsamples: usize, offset_seconds: f64, first_value: f32) -> Box<dyn SampleSource> {
        let data = Array2::from_shape_fn((nsamples, 2), |(i, _)| first_value + i as f32);
        Box::new(
            InMemorySource::new(
                data,
                TSAMP,
                vec![1400.0, 1401.0],
                60_000.0 + offset_seconds / SECONDS_PER_DAY,
            )
            .unwrap(),
        )
    }

    #[test]
    fn contiguous_sources_are_sorted_and_streamed() {
        let sources = vec![source(1000, 1.0, 1000.0), source(1000, 0.0, 0.0)];
        let mut observation = Observation::assemble(sources, false).unwrap();
        assert!((observation.duration() - 2.0).abs() < 1e-4);
        let mut sink = Recorder::default();
        let metrics = MetricsRecorder::new();
        let summary = observation
            .stream(256, &Segmentation::default(), &mut sink, &metrics)
            .unwrap();
        assert_eq!(summary.samples_used, 2000);
        assert!(sink.resets.is_empty());
        assert!(sink.finished);
        assert_eq!(sink.blocks[0].2, 0.0);
        assert!(sink.blocks[..7].iter().all(|b| b.1 == 256));
        assert_eq!(sink.blocks.iter().map(|b| b.1).sum::<usize>(), 2000);
        assert!((sink.blocks[4].0 - 1.024).abs() < 1e-9);
        assert_eq!(metrics.snapshot().samples, 2000);
    }

    #[test]
    fn gap_is_rejected_unless_allowed() {
        let err = Observation::assemble(vec![source(1000, 0.0, 0.0), source(500, 1.5, 0.0)], false)
            .err();
        assert!(matches!(err, Some(PipelineError::Contiguity { index: 0, .. })));

        let mut observation =
            Observation::assemble(vec![source(1000, 0.0, 0.0), source(500, 1.5, 7.0)], true).unwrap();
        let mut sink = Recorder::default();
        let metrics = MetricsRecorder::new();
        let summary = observation
            .stream(300, &Segmentation::default(), &mut sink, &metrics)
            .unwrap();
        assert_eq!(sink.resets, vec![1]);
        assert_eq!(summary.segments, 2);
        let after_gap = sink.blocks.iter().find(|b| b.2 == 7.0).unwrap();
        assert!((after_gap.0 - 1.5).abs() < 1e-4);
        assert_eq!(metrics.snapshot().resets, 1);
    }

    #[test]
    fn layouts_must_match() {
        let other = Box::new(
            InMemorySource::new(Array2::zeros((10, 1)), TSAMP, vec![1400.0], 60_000.0).unwrap(),
        );
        assert!(matches!(
            Observation::assemble(vec![source(10, 0.0, 0.0), other], false).err(),
            Some(PipelineError::Configuration(_))
        ));
    }

    #[test]
    fn lead_and_segmentation_shape_the_stream() {
        let mut observation = Observation::assemble(vec![source(2000, 0.0, 0.0)], false).unwrap();
        let segmentation = Segmentation {
            lead_in: 0.1,
            lead_out: 0.2,
            segment_length: Some(0.5),
            segment_skip: 0.25,
        };
        let mut sink = Recorder::default();
        let summary = observation
            .stream(128, &segmentation, &mut sink, &MetricsRecorder::new())
            .unwrap();
        // Usable samples 100..1800: segments [100,600), [850,1350), [1600,1800).
        assert_eq!(sink.resets, vec![1, 2]);
        assert_eq!(summary.samples_used, 500 + 500 + 200);
        assert_eq!(sink.blocks[0].2, 100.0);
        let second = sink.blocks.iter().find(|b| b.2 == 850.0).unwrap();
        assert!((second.0 - 0.85).abs() < 1e-9);
        assert!(sink.blocks.iter().any(|b| b.2 == 1600.0));
    }
}
