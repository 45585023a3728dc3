use crate::plan::{RfiOp, RfiThresholds};
use crate::prelude::{BlockLayout, DataBlock, PipelineError, PipelineResult, ProcessingStage};
use crate::processing::downsample::Downsampler;
use crate::processing::equalize::Equalizer;
use crate::processing::rfi::RfiMitigator;

/// Ordered chain of conditioning stages sharing one stream layout.
pub struct ConditioningPipeline {
    stages: Vec<Box<dyn ProcessingStage>>,
    output: Option<BlockLayout>,
}

impl ConditioningPipeline {
    /// Downsampler, equalizer and (when the recipe is non-empty) RFI mitigator.
    pub fn new(td: usize, fd: usize, rfi: Vec<RfiOp>, thresholds: RfiThresholds) -> Self {
        let mut stages: Vec<Box<dyn ProcessingStage>> = vec![
            Box::new(Downsampler::new(td, fd)),
            Box::new(Equalizer::new()),
        ];
        if !rfi.is_empty() {
            stages.push(Box::new(RfiMitigator::new(rfi, thresholds)));
        }
        Self::from_stages(stages)
    }

    pub fn from_stages(stages: Vec<Box<dyn ProcessingStage>>) -> Self {
        Self {
            stages,
            output: None,
        }
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    /// Threads `layout` through every stage and returns the output layout.
    pub fn configure(&mut self, layout: &BlockLayout) -> PipelineResult<BlockLayout> {
        layout.validate()?;
        let mut current = layout.clone();
        for stage in &mut self.stages {
            current = stage.configure(&current)?;
        }
        self.output = Some(current.clone());
        Ok(current)
    }

    pub fn process(&mut self, block: DataBlock) -> PipelineResult<DataBlock> {
        if self.output.is_none() {
            return Err(PipelineError::InvalidInput(
                "conditioning pipeline used before configure".into(),
            ));
        }
        self.stages
            .iter_mut()
            .try_fold(block, |block, stage| stage.process(block))
    }

    pub fn reset(&mut self) {
        for stage in &mut self.stages {
            stage.reset();
        }
    }
}
