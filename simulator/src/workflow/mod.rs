pub mod config;
pub mod runner;

pub use config::WorkflowConfig;
pub use runner::{FoldReport, Runner};
