use crate::prelude::{
    BlockLayout, DataBlock, PipelineError, PipelineResult, ProcessingStage,
};
use crate::telemetry::log::LogManager;
use ndarray::Array2;

/// Averages `td` samples in time and `fd` adjacent channels in frequency.
pub struct Downsampler {
    td: usize,
    fd: usize,
    layout: Option<BlockLayout>,
    logger: LogManager,
}

impl Downsampler {
    pub fn new(td: usize, fd: usize) -> Self {
        Self {
            td,
            fd,
            layout: None,
            logger: LogManager::new("downsample"),
        }
    }

    /// Output layout for `input`: grouped channel frequencies are averaged and
    /// the trailing partial group is dropped.
    pub fn reduce_layout(input: &BlockLayout, td: usize, fd: usize) -> BlockLayout {
        let frequencies = input
            .frequencies
            .chunks_exact(fd)
            .map(|group| group.iter().sum::<f64>() / fd as f64)
            .collect();
        BlockLayout::new(input.tsamp * td as f64, frequencies)
    }

    /// Averages `data` into `(rows / td, cols / fd)` tiles.
    pub fn reduce(data: &Array2<f32>, td: usize, fd: usize) -> Array2<f32> {
        let nsamples = data.nrows() / td;
        let nchans = data.ncols() / fd;
        let norm = 1.0 / (td * fd) as f32;
        Array2::from_shape_fn((nsamples, nchans), |(i, j)| {
            let mut acc = 0.0f32;
            for t in i * td..(i + 1) * td {
                for c in j * fd..(j + 1) * fd {
                    acc += data[[t, c]];
                }
            }
            acc * norm
        })
    }
}

impl ProcessingStage for Downsampler {
    fn name(&self) -> &'static str {
        "downsample"
    }

    fn configure(&mut self, layout: &BlockLayout) -> PipelineResult<BlockLayout> {
        if self.td == 0 || self.fd == 0 {
            return Err(PipelineError::Configuration(format!(
                "downsample factors td={} fd={} must be at least 1",
                self.td, self.fd
            )));
        }
        if self.fd > layout.nchans() {
            return Err(PipelineError::Configuration(format!(
                "cannot average {} channels out of {}",
                self.fd,
                layout.nchans()
            )));
        }
        let output = Self::reduce_layout(layout, self.td, self.fd);
        self.logger.detail(&format!(
            "td={} fd={}: {} -> {} channels, tsamp {:.3e} -> {:.3e} s",
            self.td,
            self.fd,
            layout.nchans(),
            output.nchans(),
            layout.tsamp,
            output.tsamp
        ));
        self.layout = Some(output.clone());
        Ok(output)
    }

    fn process(&mut self, block: DataBlock) -> PipelineResult<DataBlock> {
        let layout = self
            .layout
            .as_ref()
            .ok_or_else(|| PipelineError::InvalidInput("downsampler not configured".into()))?;
        if self.td == 1 && self.fd == 1 {
            return Ok(block);
        }
        if block.nsamples() % self.td != 0 {
            self.logger.detail(&format!(
                "dropping {} trailing samples",
                block.nsamples() % self.td
            ));
        }
        let data = Self::reduce(&block.data, self.td, self.fd);
        DataBlock::new(data, layout, block.start)
    }
}
