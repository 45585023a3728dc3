pub mod profile;
pub mod template;

pub use profile::{build_sources, GeneratorConfig};
