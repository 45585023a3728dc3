use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Shape shared by every block of a stream: sample period and channel table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockLayout {
    /// Sample period in seconds.
    pub tsamp: f64,
    /// Channel centre frequencies in MHz, in channel order.
    pub frequencies: Vec<f64>,
}

impl BlockLayout {
    pub fn new(tsamp: f64, frequencies: Vec<f64>) -> Self {
        Self { tsamp, frequencies }
    }

    pub fn nchans(&self) -> usize {
        self.frequencies.len()
    }

    /// Highest channel frequency; dispersion delays are measured against it.
    pub fn highest_frequency(&self) -> f64 {
        self.frequencies
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max)
    }

    pub fn lowest_frequency(&self) -> f64 {
        self.frequencies.iter().copied().fold(f64::INFINITY, f64::min)
    }

    pub fn validate(&self) -> PipelineResult<()> {
        if !(self.tsamp.is_finite() && self.tsamp > 0.0) {
            return Err(PipelineError::Configuration(format!(
                "sample period must be positive, got {}",
                self.tsamp
            )));
        }
        if self.frequencies.is_empty() {
            return Err(PipelineError::Configuration(
                "frequency table is empty".into(),
            ));
        }
        if self.frequencies.iter().any(|f| !(f.is_finite() && *f > 0.0)) {
            return Err(PipelineError::Configuration(
                "channel frequencies must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Streaming unit of work: a time-major sample matrix plus its layout.
#[derive(Debug, Clone)]
pub struct DataBlock {
    /// Samples with shape `(nsamples, nchans)`.
    pub data: Array2<f32>,
    pub tsamp: f64,
    pub frequencies: Vec<f64>,
    /// Time of the first sample, in seconds since the observation start.
    pub start: f64,
}

impl DataBlock {
    pub fn new(data: Array2<f32>, layout: &BlockLayout, start: f64) -> PipelineResult<Self> {
        if data.ncols() != layout.nchans() {
            return Err(PipelineError::InvalidInput(format!(
                "block has {} channels, layout expects {}",
                data.ncols(),
                layout.nchans()
            )));
        }
        Ok(Self {
            data,
            tsamp: layout.tsamp,
            frequencies: layout.frequencies.clone(),
            start,
        })
    }

    pub fn nsamples(&self) -> usize {
        self.data.nrows()
    }

    pub fn nchans(&self) -> usize {
        self.data.ncols()
    }

    pub fn layout(&self) -> BlockLayout {
        BlockLayout::new(self.tsamp, self.frequencies.clone())
    }

    pub fn duration(&self) -> f64 {
        self.nsamples() as f64 * self.tsamp
    }
}

/// Error taxonomy for the whole run. Numeric degeneracies are recovered where
/// they occur and never surface here.
#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error(
        "time not contiguous: source {index} ends at MJD {end_mjd:.9}, next starts at MJD {next_start_mjd:.9} (gap {gap_seconds:.6} s)"
    )]
    Contiguity {
        index: usize,
        end_mjd: f64,
        next_start_mjd: f64,
        gap_seconds: f64,
    },
    #[error("DM {dm} needs a {required}-sample delay history, capacity is {capacity}")]
    DedispersionOverrun {
        dm: f64,
        required: usize,
        capacity: usize,
    },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("sample source failure: {0}")]
    Source(String),
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type PipelineResult<T> = Result<T, PipelineError>;

/// Narrow capability implemented by every conditioning stage.
///
/// `configure` is called once with the incoming stream layout and returns the
/// layout the stage produces; `process` then consumes and returns blocks of
/// that stream in order.
pub trait ProcessingStage: Send {
    fn name(&self) -> &'static str;
    fn configure(&mut self, layout: &BlockLayout) -> PipelineResult<BlockLayout>;
    fn process(&mut self, block: DataBlock) -> PipelineResult<DataBlock>;
    fn reset(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_rejects_mismatched_channel_count() {
        let layout = BlockLayout::new(1e-3, vec![1400.0, 1401.0]);
        let err = DataBlock::new(Array2::zeros((4, 3)), &layout, 0.0).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidInput(_)));
    }

    #[test]
    fn layout_reports_band_edges() {
        let layout = BlockLayout::new(1e-3, vec![1401.5, 1400.0, 1401.0]);
        assert_eq!(layout.highest_frequency(), 1401.5);
        assert_eq!(layout.lowest_frequency(), 1400.0);
        assert!(layout.validate().is_ok());
        assert!(BlockLayout::new(0.0, vec![1400.0]).validate().is_err());
    }
}
