pub mod conditioning;
pub mod dedisperse;
pub mod downsample;
pub mod equalize;
pub mod fold;
pub mod gridsearch;
pub mod rfi;
pub mod snr;

pub use conditioning::ConditioningPipeline;
pub use dedisperse::{DedispersedChunk, DedispersionBank, TrialDm};
pub use downsample::Downsampler;
pub use equalize::Equalizer;
pub use fold::{Archive, Integration, PhaseFolder, TimingModel};
pub use gridsearch::{GridSearch, GridSearchResult, GridSearchSettings};
pub use rfi::RfiMitigator;
pub use snr::{BoxcarSnr, SnrEstimate, SnrEstimator};
