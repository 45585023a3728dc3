use anyhow::Context;
use clap::Parser;
use generator::GeneratorConfig;
use pulsarcore::{CandidateSpec, Segmentation, TrialSpec};
use std::path::PathBuf;
use workflow::{FoldReport, Runner, WorkflowConfig};

mod generator;
mod workflow;

#[derive(Parser)]
#[command(author, version, about = "Pulsar search and fold workflow driver")]
struct Args {
    /// Load a workflow config from YAML; the remaining options are ignored
    #[arg(long)]
    workflow: Option<PathBuf>,
    /// Fold and refine candidates instead of writing dedispersed series
    #[arg(long, default_value_t = false)]
    fold: bool,
    /// Fold a persisted dedispersed series instead of a synthetic observation
    #[arg(long)]
    series: Option<PathBuf>,
    /// Sample period of --series, seconds
    #[arg(long, default_value_t = 1e-3)]
    series_tsamp: f64,
    #[arg(long, default_value_t = 60_000.0)]
    series_mjd: f64,
    /// Candidate list (DM in column 1, F0 in column 3, F1 in column 4)
    #[arg(long)]
    candfile: Option<PathBuf>,
    #[arg(long)]
    dm: Option<f64>,
    #[arg(long)]
    f0: Option<f64>,
    #[arg(long, default_value_t = 0.0)]
    f1: f64,
    /// First DM trial
    #[arg(long, default_value_t = 0.0)]
    dms: f64,
    #[arg(long, default_value_t = 1.0)]
    ddm: f64,
    #[arg(long, default_value_t = 100)]
    ndm: usize,
    /// ddplan file, one `td fd dms ddm ndm` entry per line; replaces --dms/--ddm/--ndm
    #[arg(long)]
    ddplan: Option<PathBuf>,
    #[arg(long, default_value_t = 1)]
    td: usize,
    #[arg(long, default_value_t = 1)]
    fd: usize,
    /// RFI recipe tokens, e.g. `--rfi zap 1170 1186 kadaneF 8 4 zdot`
    #[arg(long, num_args = 1.., allow_hyphen_values = true)]
    rfi: Vec<String>,
    #[arg(long, default_value_t = 1)]
    threads: usize,
    #[arg(long, default_value_t = 64)]
    nbin: usize,
    #[arg(long, default_value_t = 1.0)]
    tsubint: f64,
    #[arg(long, default_value_t = 32)]
    nsubband: usize,
    /// Report S/N at the nominal parameters only
    #[arg(long, default_value_t = false)]
    nosearch: bool,
    #[arg(long, default_value_t = 0.0)]
    lead_in: f64,
    #[arg(long, default_value_t = 0.0)]
    lead_out: f64,
    #[arg(long)]
    seglen: Option<f64>,
    #[arg(long, default_value_t = 0.0)]
    segskip: f64,
    #[arg(long, default_value_t = false)]
    allow_gaps: bool,
    #[arg(long, default_value = "pulsar")]
    rootname: String,
    #[arg(long)]
    outdir: Option<PathBuf>,
    /// Synthetic pulsar DM
    #[arg(long, default_value_t = 40.0)]
    sim_dm: f64,
    /// Synthetic pulsar spin frequency
    #[arg(long, default_value_t = 4.0)]
    sim_f0: f64,
    #[arg(long, default_value_t = 0.0)]
    sim_f1: f64,
    #[arg(long, default_value_t = 16.0)]
    sim_duration: f64,
    #[arg(long, default_value_t = 1)]
    sim_files: usize,
    #[arg(long, default_value_t = 0.0)]
    sim_gap: f64,
    #[arg(long, default_value_t = 0)]
    sim_impulses: usize,
    #[arg(long, default_value_t = 0)]
    seed: u64,
}

impl Args {
    fn workflow_config(&self) -> anyhow::Result<WorkflowConfig> {
        if let Some(path) = &self.workflow {
            return WorkflowConfig::load(path);
        }
        let trials = TrialSpec::Range {
            start: self.dms,
            step: self.ddm,
            count: self.ndm,
        };
        let mut config = WorkflowConfig::from_args(trials, self.td, self.fd, &self.rfi)?;
        if let Some(ddplan) = &self.ddplan {
            config.plan.clear();
            config.plan_file = Some(ddplan.clone());
        }
        config.run.threads = self.threads;
        config.run.allow_gaps = self.allow_gaps;
        config.run.segmentation = Segmentation {
            lead_in: self.lead_in,
            lead_out: self.lead_out,
            segment_length: self.seglen,
            segment_skip: self.segskip,
        };
        config.fold.nbin = self.nbin;
        config.fold.tsubint = self.tsubint;
        config.fold.nsubband = self.nsubband;
        config.fold.search.search = !self.nosearch;
        if let (Some(dm), Some(f0)) = (self.dm, self.f0) {
            config.candidates.push(CandidateSpec { dm, f0, f1: self.f1 });
        }
        config.candidate_file = self.candfile.clone();
        config.generator = GeneratorConfig {
            dm: self.sim_dm,
            f0: self.sim_f0,
            f1: self.sim_f1,
            duration: self.sim_duration,
            nfiles: self.sim_files,
            gap: self.sim_gap,
            impulses: self.sim_impulses,
            seed: self.seed,
            ..GeneratorConfig::default()
        };
        config.output.rootname = self.rootname.clone();
        config.output.dir = self.outdir.clone();
        config.validate().context("validating command-line workflow")?;
        Ok(config)
    }
}

fn print_fold_report(report: &FoldReport) {
    print!("{}", pulsarcore::interface::format_candidate_table(&report.results));
    for path in &report.products {
        println!("wrote {}", path.display());
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();
    let runner = Runner::new(args.workflow_config()?);

    if let Some(series) = &args.series {
        let report = runner.fold_series(series, args.series_tsamp, args.series_mjd)?;
        print_fold_report(&report);
    } else if args.fold {
        let report = runner.execute_fold()?;
        print_fold_report(&report);
    } else {
        let report = runner.execute_search(runner.series_factory()?)?;
        println!(
            "Search run -> trials {}, samples {}/{}, segments {}, blocks {}",
            report.trials.len(),
            report.summary.samples_used,
            report.summary.samples_read,
            report.summary.segments,
            report.metrics.blocks
        );
    }
    Ok(())
}
