//! Boundaries with the outside world: recordings in, series and archives out.

pub mod archive;
pub mod ingest;
pub mod source;
pub mod timeseries;

pub use archive::{format_candidate_table, write_candidate_table, ArchiveWriter, SpftArchiveWriter};
pub use ingest::{BlockSink, Observation, StreamSummary};
pub use source::{InMemorySource, SampleSource, SourceHeader};
pub use timeseries::{
    read_series, DatFileFactory, DatFileSink, MemorySeriesFactory, SeriesId, SeriesSink, SeriesSinkFactory,
};
