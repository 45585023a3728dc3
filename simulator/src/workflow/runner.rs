use crate::generator::build_sources;
use crate::workflow::config::WorkflowConfig;
use anyhow::{ensure, Context};
use log::info;
use pulsarcore::interface::{
    read_series, write_candidate_table, ArchiveWriter, DatFileFactory, MemorySeriesFactory, Observation,
    SampleSource, SeriesSinkFactory, SpftArchiveWriter, StreamSummary,
};
use pulsarcore::pipeline::{fold_series, refine, DedispersionSearch, FoldPipeline};
use pulsarcore::processing::{Archive, GridSearchResult};
use pulsarcore::telemetry::{MetricsRecorder, MetricsSnapshot};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub struct SearchReport {
    pub summary: StreamSummary,
    pub metrics: MetricsSnapshot,
    /// `(td, fd, dm)` of every trial written.
    pub trials: Vec<(usize, usize, f64)>,
}

pub struct FoldReport {
    pub results: Vec<GridSearchResult>,
    /// Files written, empty when no output directory is configured.
    pub products: Vec<PathBuf>,
    pub summary: Option<StreamSummary>,
}

#[derive(Clone)]
pub struct Runner {
    config: WorkflowConfig,
}

impl Runner {
    pub fn new(config: WorkflowConfig) -> Self {
        Self { config }
    }

    /// Synthetic observation described by the generator settings.
    pub fn observation(&self) -> anyhow::Result<Observation> {
        let sources: Vec<Box<dyn SampleSource>> = build_sources(&self.config.generator)?
            .into_iter()
            .map(|source| Box::new(source) as Box<dyn SampleSource>)
            .collect();
        Observation::assemble(sources, self.config.run.allow_gaps).context("assembling observation")
    }

    /// `.dat` files under the output directory, or an in-memory store.
    pub fn series_factory(&self) -> anyhow::Result<Arc<dyn SeriesSinkFactory>> {
        let output = &self.config.output;
        let Some(dir) = &output.dir else {
            return Ok(Arc::new(MemorySeriesFactory::new()));
        };
        let factory = DatFileFactory::new(dir, &output.rootname, output.beam)
            .with_context(|| format!("preparing series directory {}", dir.display()))?;
        Ok(Arc::new(factory))
    }

    pub fn execute_search(&self, factory: Arc<dyn SeriesSinkFactory>) -> anyhow::Result<SearchReport> {
        let plan = self.config.plan()?;
        let mut observation = self.observation()?;
        let mut search = DedispersionSearch::new(&plan, observation.layout(), &self.config.run, factory)
            .context("building dedispersion search")?;
        let block_len = search.block_length(observation.layout().tsamp, self.config.output.block_seconds);
        let metrics = MetricsRecorder::new();
        let summary = observation
            .stream(block_len, &self.config.run.segmentation, &mut search, &metrics)
            .context("streaming observation through the search")?;
        info!(
            "search finished: {} trials, {} samples used in {} segments",
            search.trial_count(),
            summary.samples_used,
            summary.segments
        );
        Ok(SearchReport {
            summary,
            metrics: metrics.snapshot(),
            trials: search.trials(),
        })
    }

    pub fn execute_fold(&self) -> anyhow::Result<FoldReport> {
        let candidates = self.config.candidates()?;
        ensure!(!candidates.is_empty(), "no candidates to fold");
        let mut observation = self.observation()?;
        let ref_epoch = observation.duration() / 2.0;
        let mut pipeline = FoldPipeline::new(
            &candidates,
            observation.layout(),
            ref_epoch,
            &self.config.fold,
            &self.config.run,
        )
        .context("building fold pipeline")?;
        let block_len = pipeline.block_length();
        let summary = observation
            .stream(block_len, &self.config.run.segmentation, &mut pipeline, &MetricsRecorder::new())
            .context("streaming observation through the folder")?;
        let archives = pipeline.into_archives(observation.start_mjd());
        let mut report = self.refine_and_write(&archives)?;
        report.summary = Some(summary);
        Ok(report)
    }

    /// Folds a persisted dedispersed series at every configured candidate.
    pub fn fold_series<P: AsRef<Path>>(&self, path: P, tsamp: f64, start_mjd: f64) -> anyhow::Result<FoldReport> {
        let path = path.as_ref();
        let candidates = self.config.candidates()?;
        ensure!(!candidates.is_empty(), "no candidates to fold");
        let series = read_series(path).with_context(|| format!("reading series {}", path.display()))?;
        let archives = candidates
            .iter()
            .map(|candidate| fold_series(&series, tsamp, start_mjd, candidate, &self.config.fold))
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("folding series {}", path.display()))?;
        self.refine_and_write(&archives)
    }

    fn refine_and_write(&self, archives: &[Archive]) -> anyhow::Result<FoldReport> {
        let results = refine(archives, self.config.fold.search, &self.config.run).context("refining candidates")?;
        let mut products = Vec::new();
        if let Some(dir) = &self.config.output.dir {
            let root = &self.config.output.rootname;
            let writer = SpftArchiveWriter::new(dir, root)
                .with_context(|| format!("preparing archive directory {}", dir.display()))?;
            for (idx, (archive, result)) in archives.iter().zip(&results).enumerate() {
                let files = writer
                    .write(idx + 1, archive, result)
                    .with_context(|| format!("writing archive of candidate {}", idx + 1))?;
                products.extend(files);
            }
            let table = dir.join(format!("{root}.cands"));
            write_candidate_table(&table, &results)
                .with_context(|| format!("writing candidate table {}", table.display()))?;
            products.push(table);
        }
        for (idx, result) in results.iter().enumerate() {
            info!(
                "candidate {}: DM {:.3} F0 {:.9} F1 {:.3e} S/N {:.1}{}",
                idx + 1,
                result.dm,
                result.f0,
                result.f1,
                result.snr,
                if result.converged { "" } else { " (not converged)" }
            );
        }
        Ok(FoldReport {
            results,
            products,
            summary: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::GeneratorConfig;
    use crate::workflow::config::OutputConfig;
    use pulsarcore::interface::SeriesId;
    use pulsarcore::pipeline::FoldSettings;
    use pulsarcore::{CandidateSpec, PlanEntry, TrialSpec};
    use std::io::Write;
    use tempfile::{tempdir, NamedTempFile};

    fn generator() -> GeneratorConfig {
        GeneratorConfig {
            nchans: 16,
            channel_width: 20.0,
            duration: 8.0,
            dm: 40.0,
            f0: 4.0,
            seed: 3,
            ..GeneratorConfig::default()
        }
    }

    fn search_config(dms: Vec<f64>) -> WorkflowConfig {
        WorkflowConfig {
            plan: vec![PlanEntry {
                td: 1,
                fd: 1,
                trials: TrialSpec::List(dms),
                rfi: Vec::new(),
            }],
            generator: generator(),
            ..WorkflowConfig::default()
        }
    }

    fn fold_config() -> WorkflowConfig {
        WorkflowConfig {
            fold: FoldSettings {
                nbin: 32,
                nsubband: 8,
                ..FoldSettings::default()
            },
            candidates: vec![CandidateSpec {
                dm: 40.0,
                f0: 4.0,
                f1: 0.0,
            }],
            generator: generator(),
            ..WorkflowConfig::default()
        }
    }

    #[test]
    fn search_writes_one_series_per_trial() {
        let store = MemorySeriesFactory::new();
        let runner = Runner::new(search_config(vec![0.0, 40.0]));
        let report = runner.execute_search(Arc::new(store.clone())).unwrap();
        assert_eq!(report.trials.len(), 2);
        assert_eq!(report.summary.samples_used, 8000);
        assert_eq!(report.metrics.samples, 8000);
        assert_eq!(store.len(), 2);
        let dedispersed = store.series(0, 40.0, 0).unwrap();
        assert!(dedispersed.len() > 7500 && dedispersed.len() <= 8000);
    }

    #[test]
    fn gapped_search_opens_a_second_segment() {
        let mut config = search_config(vec![10.0]);
        config.generator.nfiles = 2;
        config.generator.gap = 0.25;
        config.run.allow_gaps = true;
        let store = MemorySeriesFactory::new();
        let report = Runner::new(config).execute_search(Arc::new(store.clone())).unwrap();
        assert_eq!(report.summary.segments, 2);
        assert_eq!(report.metrics.resets, 1);
        assert!(store.series(0, 10.0, 0).is_some());
        assert!(store.series(0, 10.0, 1).is_some());
    }

    #[test]
    fn gapped_search_fails_without_allow_gaps() {
        let mut config = search_config(vec![10.0]);
        config.generator.nfiles = 2;
        config.generator.gap = 0.25;
        let runner = Runner::new(config);
        assert!(runner.execute_search(Arc::new(MemorySeriesFactory::new())).is_err());
    }

    #[test]
    fn ddplan_entries_are_searched() {
        let mut ddplan = NamedTempFile::new().unwrap();
        ddplan.write_all(b"1 1 0 20 2 0 0 0 0\n2 1 20 20 2 0 0 0 0 zdot\n").unwrap();
        let config = WorkflowConfig {
            plan_file: Some(ddplan.path().to_path_buf()),
            generator: generator(),
            ..WorkflowConfig::default()
        };
        let store = MemorySeriesFactory::new();
        let report = Runner::new(config).execute_search(Arc::new(store.clone())).unwrap();
        assert_eq!(report.trials.len(), 4);
        assert_eq!(report.trials[2], (2, 1, 20.0));
        assert_eq!(store.len(), 4);
        let full_rate = store.series(0, 20.0, 0).unwrap();
        let half_rate = store.series(1, 20.0, 0).unwrap();
        assert!(half_rate.len() < full_rate.len());
    }

    #[test]
    fn fold_recovers_the_injected_pulsar() {
        let dir = tempdir().unwrap();
        let mut config = fold_config();
        config.output = OutputConfig {
            dir: Some(dir.path().to_path_buf()),
            rootname: "sim".into(),
            ..OutputConfig::default()
        };
        let report = Runner::new(config).execute_fold().unwrap();
        let result = &report.results[0];
        assert!(result.snr > 10.0, "snr {}", result.snr);
        assert!(result.ddm.abs() <= 2.0 * result.dm_axis.step);
        assert!(result.df0.abs() <= 2.0 * result.f0_axis.step);
        assert!(dir.path().join("sim.cands").exists());
        assert_eq!(report.products.len(), 4);
        assert_eq!(report.summary.unwrap().samples_used, 8000);
    }

    #[test]
    fn fold_without_candidates_is_rejected() {
        let mut config = fold_config();
        config.candidates.clear();
        assert!(Runner::new(config).execute_fold().is_err());
    }

    #[test]
    fn persisted_series_folds_offline() {
        let dir = tempdir().unwrap();
        let mut config = search_config(vec![40.0]);
        config.output.dir = Some(dir.path().to_path_buf());
        let runner = Runner::new(config);
        runner.execute_search(runner.series_factory().unwrap()).unwrap();

        let path = DatFileFactory::new(dir.path(), "pulsar", 1).unwrap().path_for(SeriesId {
            entry: 0,
            trial: 0,
            dm: 40.0,
            segment: 0,
        });
        let mut offline = fold_config();
        offline.fold.nsubband = 1;
        let report = Runner::new(offline).fold_series(&path, 1e-3, 60_000.0).unwrap();
        assert_eq!(report.results.len(), 1);
        assert!(report.results[0].snr > 10.0, "snr {}", report.results[0].snr);
        assert!(report.products.is_empty());
    }
}
