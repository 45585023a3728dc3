use crate::generator::GeneratorConfig;
use anyhow::Context;
use pulsarcore::pipeline::FoldSettings;
use pulsarcore::{CandidateSpec, PlanEntry, RfiOp, RunConfig, TrialSpec};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Where and under which names products are written.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Output directory; `None` keeps search series in memory.
    pub dir: Option<PathBuf>,
    pub rootname: String,
    pub beam: usize,
    /// Target ingest block length for the search, seconds.
    pub block_seconds: f64,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: None,
            rootname: "pulsar".into(),
            beam: 1,
            block_seconds: 1.0,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    pub run: RunConfig,
    /// Dedispersion plan of the search workflow.
    pub plan: Vec<PlanEntry>,
    /// ddplan file whose entries follow `plan`.
    pub plan_file: Option<PathBuf>,
    pub fold: FoldSettings,
    pub candidates: Vec<CandidateSpec>,
    /// Candidate list file appended to `candidates`.
    pub candidate_file: Option<PathBuf>,
    pub generator: GeneratorConfig,
    pub output: OutputConfig,
}

impl WorkflowConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path_ref = path.as_ref();
        let contents = fs::read_to_string(path_ref)
            .with_context(|| format!("reading workflow config {}", path_ref.display()))?;
        let config: WorkflowConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("parsing workflow config {}", path_ref.display()))?;
        config
            .validate()
            .with_context(|| format!("validating workflow config {}", path_ref.display()))?;
        Ok(config)
    }

    /// Single-entry plan with the same conditioning for search and fold.
    pub fn from_args(trials: TrialSpec, td: usize, fd: usize, rfi_tokens: &[String]) -> anyhow::Result<Self> {
        let rfi = RfiOp::from_tokens(rfi_tokens).context("parsing RFI recipe")?;
        let config = Self {
            plan: vec![PlanEntry {
                td,
                fd,
                trials,
                rfi: rfi.clone(),
            }],
            fold: FoldSettings {
                td,
                fd,
                rfi,
                ..FoldSettings::default()
            },
            ..Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.run.validate().context("run settings")?;
        for (idx, entry) in self.plan.iter().enumerate() {
            entry
                .validate()
                .with_context(|| format!("plan entry {idx}"))?;
        }
        self.fold.validate().context("fold settings")?;
        Ok(())
    }

    /// Inline plan entries followed by those of `plan_file`.
    pub fn plan(&self) -> anyhow::Result<Vec<PlanEntry>> {
        let mut plan = self.plan.clone();
        if let Some(path) = &self.plan_file {
            let text = fs::read_to_string(path)
                .with_context(|| format!("reading ddplan {}", path.display()))?;
            let parsed = PlanEntry::parse_list(&text)
                .with_context(|| format!("parsing ddplan {}", path.display()))?;
            plan.extend(parsed);
        }
        Ok(plan)
    }

    /// Inline candidates followed by those of `candidate_file`.
    pub fn candidates(&self) -> anyhow::Result<Vec<CandidateSpec>> {
        let mut candidates = self.candidates.clone();
        if let Some(path) = &self.candidate_file {
            let text = fs::read_to_string(path)
                .with_context(|| format!("reading candidate file {}", path.display()))?;
            let parsed = CandidateSpec::parse_list(&text)
                .with_context(|| format!("parsing candidate file {}", path.display()))?;
            candidates.extend(parsed);
        }
        Ok(candidates)
    }
}
