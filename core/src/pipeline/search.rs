use crate::interface::ingest::BlockSink;
use crate::interface::timeseries::{SeriesId, SeriesSink, SeriesSinkFactory};
use crate::math::lcm;
use crate::plan::{PlanEntry, RunConfig};
use crate::prelude::{BlockLayout, DataBlock, PipelineError, PipelineResult};
use crate::processing::conditioning::ConditioningPipeline;
use crate::processing::dedisperse::{DedispersedChunk, DedispersionBank};
use crate::telemetry::log::LogManager;
use rayon::prelude::*;
use std::sync::Arc;

/// One plan entry: its own conditioning chain, trial bank and open sinks.
struct SearchBranch {
    entry: usize,
    td: usize,
    fd: usize,
    conditioning: ConditioningPipeline,
    bank: DedispersionBank,
    sinks: Vec<Box<dyn SeriesSink>>,
}

impl SearchBranch {
    fn write(&mut self, chunks: Vec<Vec<DedispersedChunk>>) -> PipelineResult<()> {
        self.sinks
            .par_iter_mut()
            .zip(chunks.into_par_iter())
            .try_for_each(|(sink, chunks)| {
                chunks
                    .iter()
                    .try_for_each(|chunk| sink.write(&chunk.series()))
            })
    }

    fn process(&mut self, block: DataBlock) -> PipelineResult<()> {
        let conditioned = self.conditioning.process(block)?;
        let chunks = self.bank.process(&conditioned)?;
        self.write(chunks)
    }

    fn finish_sinks(&mut self) -> PipelineResult<()> {
        self.sinks.iter_mut().try_for_each(|sink| sink.finish())
    }

    fn open_sinks(&mut self, factory: &dyn SeriesSinkFactory, segment: usize) -> PipelineResult<()> {
        self.sinks = self
            .bank
            .trials()
            .iter()
            .enumerate()
            .map(|(trial, dedisp)| {
                factory.create(SeriesId {
                    entry: self.entry,
                    trial,
                    dm: dedisp.dm(),
                    segment,
                })
            })
            .collect::<PipelineResult<_>>()?;
        Ok(())
    }
}

/// Multi-entry DM search writing one series per trial and segment.
pub struct DedispersionSearch {
    branches: Vec<SearchBranch>,
    factory: Arc<dyn SeriesSinkFactory>,
    pool: rayon::ThreadPool,
    logger: LogManager,
}

impl DedispersionSearch {
    pub fn new(
        plan: &[PlanEntry],
        layout: &BlockLayout,
        run: &RunConfig,
        factory: Arc<dyn SeriesSinkFactory>,
    ) -> PipelineResult<Self> {
        run.validate()?;
        if plan.is_empty() {
            return Err(PipelineError::Configuration("DM plan is empty".into()));
        }
        let logger = LogManager::new("search");
        let mut branches = Vec::with_capacity(plan.len());
        for (index, entry) in plan.iter().enumerate() {
            entry.validate()?;
            let mut conditioning =
                ConditioningPipeline::new(entry.td, entry.fd, entry.rfi.clone(), run.rfi.clone());
            let output = conditioning.configure(layout)?;
            let bank = DedispersionBank::new(
                &output,
                &entry.trials.dms(),
                1,
                4096,
                run.history_capacity(output.tsamp),
            )?;
            logger.record(&format!(
                "branch td={} fd={}: {} trials, stages {:?}",
                entry.td,
                entry.fd,
                bank.len(),
                conditioning.stage_names()
            ));
            let mut branch = SearchBranch {
                entry: index,
                td: entry.td,
                fd: entry.fd,
                conditioning,
                bank,
                sinks: Vec::new(),
            };
            branch.open_sinks(factory.as_ref(), 0)?;
            branches.push(branch);
        }
        Ok(Self {
            branches,
            factory,
            pool: run.thread_pool()?,
            logger,
        })
    }

    /// Raw block length nearest `seconds`, rounded down to a multiple of every
    /// branch's time decimation.
    pub fn block_length(&self, tsamp: f64, seconds: f64) -> usize {
        let factors: Vec<usize> = self.branches.iter().map(|b| b.td).collect();
        let unit = lcm(&factors);
        let units = ((seconds / tsamp) as usize / unit).max(1);
        units * unit
    }

    pub fn trial_count(&self) -> usize {
        self.branches.iter().map(|b| b.bank.len()).sum()
    }

    /// `(td, fd, dm)` for every trial, branch by branch.
    pub fn trials(&self) -> Vec<(usize, usize, f64)> {
        self.branches
            .iter()
            .flat_map(|b| b.bank.trials().iter().map(move |t| (b.td, b.fd, t.dm())))
            .collect()
    }
}

impl BlockSink for DedispersionSearch {
    fn on_block(&mut self, block: DataBlock) -> PipelineResult<()> {
        let branches = &mut self.branches;
        self.pool.install(|| {
            branches
                .par_iter_mut()
                .try_for_each(|branch| branch.process(block.clone()))
        })
    }

    fn on_discontinuity(&mut self, segment: usize) -> PipelineResult<()> {
        self.logger
            .detail(&format!("discontinuity, opening segment {segment}"));
        let factory = self.factory.as_ref();
        let branches = &mut self.branches;
        self.pool.install(|| {
            branches.iter_mut().try_for_each(|branch| {
                let flushed = branch.bank.reset(segment);
                branch.write(flushed)?;
                branch.finish_sinks()?;
                branch.conditioning.reset();
                branch.open_sinks(factory, segment)
            })
        })
    }

    fn on_finish(&mut self) -> PipelineResult<()> {
        let branches = &mut self.branches;
        self.pool.install(|| {
            branches.iter_mut().try_for_each(|branch| {
                let rest = branch.bank.finish();
                branch.write(rest)?;
                branch.finish_sinks()
            })
        })?;
        self.logger
            .record(&format!("search finished, {} trials written", self.trial_count()));
        Ok(())
    }
}
