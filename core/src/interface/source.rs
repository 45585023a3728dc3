use crate::prelude::{BlockLayout, PipelineError, PipelineResult};
use ndarray::{s, Array2};
use serde::{Deserialize, Serialize};

/// Static description of one recording.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceHeader {
    pub nsamples: usize,
    pub tsamp: f64,
    pub frequencies: Vec<f64>,
    pub start_mjd: f64,
}

impl SourceHeader {
    pub fn layout(&self) -> BlockLayout {
        BlockLayout::new(self.tsamp, self.frequencies.clone())
    }

    pub fn duration(&self) -> f64 {
        self.nsamples as f64 * self.tsamp
    }

    pub fn end_mjd(&self) -> f64 {
        self.start_mjd + self.duration() / 86_400.0
    }
}

/// Sequential reader over one recording. Format parsers live behind this.
pub trait SampleSource: Send {
    fn header(&self) -> &SourceHeader;

    /// Up to `n` rows of `(time, channel)` samples; `None` once exhausted.
    fn read(&mut self, n: usize) -> PipelineResult<Option<Array2<f32>>>;
}

/// Source backed by a sample matrix already in memory.
pub struct InMemorySource {
    header: SourceHeader,
    data: Array2<f32>,
    cursor: usize,
}

impl InMemorySource {
    pub fn new(data: Array2<f32>, tsamp: f64, frequencies: Vec<f64>, start_mjd: f64) -> PipelineResult<Self> {
        if data.ncols() != frequencies.len() {
            return Err(PipelineError::Source(format!(
                "{} data columns for {} channel frequencies",
                data.ncols(),
                frequencies.len()
            )));
        }
        Ok(Self {
            header: SourceHeader {
                nsamples: data.nrows(),
                tsamp,
                frequencies,
                start_mjd,
            },
            data,
            cursor: 0,
        })
    }
}

impl SampleSource for InMemorySource {
    fn header(&self) -> &SourceHeader {
        &self.header
    }

    fn read(&mut self, n: usize) -> PipelineResult<Option<Array2<f32>>> {
        if self.cursor >= self.data.nrows() || n == 0 {
            return Ok(None);
        }
        let end = (self.cursor + n).min(self.data.nrows());
        let rows = self.data.slice(s![self.cursor..end, ..]).to_owned();
        self.cursor = end;
        Ok(Some(rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_in_requested_pieces_until_exhausted() {
        let data = Array2::from_shape_fn((10, 2), |(i, j)| (i * 2 + j) as f32);
        let mut source = InMemorySource::new(data, 1e-3, vec![1400.0, 1401.0], 60_000.0).unwrap();
        assert_eq!(source.read(4).unwrap().unwrap().nrows(), 4);
        assert_eq!(source.read(4).unwrap().unwrap()[[0, 0]], 8.0);
        assert_eq!(source.read(4).unwrap().unwrap().nrows(), 2);
        assert!(source.read(4).unwrap().is_none());
        assert!((source.header().duration() - 0.01).abs() < 1e-12);
    }

    #[test]
    fn rejects_mismatched_frequency_table() {
        assert!(InMemorySource::new(Array2::zeros((4, 3)), 1e-3, vec![1400.0], 0.0).is_err());
    }
}
