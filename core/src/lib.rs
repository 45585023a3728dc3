//! Streaming pulsar search and candidate refinement.
//!
//! Blocks of time×frequency power flow through a conditioning chain
//! (downsample, equalize, RFI mitigation), a bank of incoherent
//! dedispersion trials, a phase folder and finally an iterative grid search
//! over (DM, F0, F1).

pub mod interface;
pub mod math;
pub mod pipeline;
pub mod plan;
pub mod prelude;
pub mod processing;
pub mod telemetry;

pub use plan::{CandidateSpec, PlanEntry, RfiOp, RfiThresholds, RunConfig, Segmentation, TrialSpec};
pub use prelude::{BlockLayout, DataBlock, PipelineError, PipelineResult, ProcessingStage};
