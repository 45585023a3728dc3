//! End-to-end compositions of the processing stages.

pub mod fold;
pub mod search;

pub use fold::{fold_series, refine, FoldPipeline, FoldSettings};
pub use search::DedispersionSearch;
