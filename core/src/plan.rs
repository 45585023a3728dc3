//! Processing plan: DM trials, RFI recipes, segmentation and run-wide tunables.
//!
//! Everything here is parsed and validated once, before the first block is
//! read. Malformed entries surface as [`PipelineError::Configuration`].

use crate::prelude::{PipelineError, PipelineResult};
use serde::{Deserialize, Serialize};

/// One RFI mitigation step. Thresholds and extent limits are shared by the
/// whole recipe and live in [`RfiThresholds`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum RfiOp {
    Mask { td: usize, fd: usize },
    KadaneF { td: usize, fd: usize },
    KadaneT { td: usize, fd: usize },
    Zap { fmin: f64, fmax: f64 },
    Zdot,
    Zero,
}

impl RfiOp {
    /// Parses the flat token form, e.g. `["zap", "1170", "1186", "kadaneF", "2", "4", "zdot"]`.
    pub fn from_tokens<S: AsRef<str>>(tokens: &[S]) -> PipelineResult<Vec<RfiOp>> {
        let mut ops = Vec::new();
        let mut idx = 0;
        while idx < tokens.len() {
            let name = tokens[idx].as_ref();
            let op = match name {
                "mask" | "kadaneF" | "kadaneT" => {
                    let td = parse_arg::<usize, S>(tokens, idx + 1, name)?;
                    let fd = parse_arg::<usize, S>(tokens, idx + 2, name)?;
                    idx += 3;
                    match name {
                        "mask" => RfiOp::Mask { td, fd },
                        "kadaneF" => RfiOp::KadaneF { td, fd },
                        _ => RfiOp::KadaneT { td, fd },
                    }
                }
                "zap" => {
                    let fmin = parse_arg::<f64, S>(tokens, idx + 1, name)?;
                    let fmax = parse_arg::<f64, S>(tokens, idx + 2, name)?;
                    idx += 3;
                    RfiOp::Zap { fmin, fmax }
                }
                "zdot" => {
                    idx += 1;
                    RfiOp::Zdot
                }
                "zero" => {
                    idx += 1;
                    RfiOp::Zero
                }
                other => {
                    return Err(PipelineError::Configuration(format!(
                        "unknown RFI operation '{other}'"
                    )))
                }
            };
            op.validate()?;
            ops.push(op);
        }
        Ok(ops)
    }

    pub fn validate(&self) -> PipelineResult<()> {
        match *self {
            RfiOp::Mask { td, fd } | RfiOp::KadaneF { td, fd } | RfiOp::KadaneT { td, fd } => {
                if td == 0 || fd == 0 {
                    return Err(PipelineError::Configuration(format!(
                        "{self:?}: downsample factors must be at least 1"
                    )));
                }
            }
            RfiOp::Zap { fmin, fmax } => {
                if !(fmin.is_finite() && fmax.is_finite()) || fmin > fmax {
                    return Err(PipelineError::Configuration(format!(
                        "zap range [{fmin}, {fmax}] is not a valid frequency interval"
                    )));
                }
            }
            RfiOp::Zdot | RfiOp::Zero => {}
        }
        Ok(())
    }
}

fn parse_arg<T: std::str::FromStr, S: AsRef<str>>(
    tokens: &[S],
    idx: usize,
    op: &str,
) -> PipelineResult<T> {
    let token = tokens.get(idx).map(AsRef::as_ref).ok_or_else(|| {
        PipelineError::Configuration(format!("RFI operation '{op}' is missing arguments"))
    })?;
    token.parse().map_err(|_| {
        PipelineError::Configuration(format!(
            "RFI operation '{op}' has an invalid argument '{token}'"
        ))
    })
}

/// Detection thresholds shared by every RFI recipe of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RfiThresholds {
    /// S/N threshold of `mask` tiles.
    pub mask: f32,
    /// S/N threshold of `kadaneF` runs (squared before use).
    pub kadane_f: f32,
    /// S/N threshold of `kadaneT` runs (squared before use).
    pub kadane_t: f32,
    /// `kadaneF` only flags runs narrower than this, in MHz.
    pub kadane_f_limit_mhz: f64,
    /// `kadaneT` only flags runs shorter than this, in seconds.
    pub kadane_t_limit_s: f64,
}

impl Default for RfiThresholds {
    fn default() -> Self {
        Self {
            mask: 10.0,
            kadane_f: 7.0,
            kadane_t: 7.0,
            kadane_f_limit_mhz: 10.0,
            kadane_t_limit_s: 10e-3,
        }
    }
}

/// DM trials of one plan entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TrialSpec {
    Range { start: f64, step: f64, count: usize },
    List(Vec<f64>),
}

impl TrialSpec {
    pub fn dms(&self) -> Vec<f64> {
        match self {
            TrialSpec::Range { start, step, count } => {
                (0..*count).map(|i| start + i as f64 * step).collect()
            }
            TrialSpec::List(dms) => dms.clone(),
        }
    }

    pub fn validate(&self) -> PipelineResult<()> {
        let dms = self.dms();
        if dms.is_empty() {
            return Err(PipelineError::Configuration("DM trial list is empty".into()));
        }
        if let TrialSpec::Range { step, .. } = self {
            if !(step.is_finite() && *step >= 0.0) {
                return Err(PipelineError::Configuration(format!(
                    "DM step must be non-negative, got {step}"
                )));
            }
        }
        if let Some(bad) = dms.iter().find(|dm| !(dm.is_finite() && **dm >= 0.0)) {
            return Err(PipelineError::Configuration(format!(
                "DM trial {bad} is not a valid dispersion measure"
            )));
        }
        Ok(())
    }
}

/// One line of a dedispersion plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanEntry {
    #[serde(default = "default_factor")]
    pub td: usize,
    #[serde(default = "default_factor")]
    pub fd: usize,
    pub trials: TrialSpec,
    #[serde(default)]
    pub rfi: Vec<RfiOp>,
}

fn default_factor() -> usize {
    1
}

impl PlanEntry {
    pub fn validate(&self) -> PipelineResult<()> {
        if self.td == 0 || self.fd == 0 {
            return Err(PipelineError::Configuration(format!(
                "plan entry td={} fd={}: downsample factors must be at least 1",
                self.td, self.fd
            )));
        }
        self.trials.validate()?;
        self.rfi.iter().try_for_each(RfiOp::validate)
    }

    /// Parses a ddplan file, one entry per line:
    /// `td fd dm_start dm_step ndm` followed by four informational columns
    /// and then the RFI recipe tokens. `#` starts a comment line.
    pub fn parse_list(text: &str) -> PipelineResult<Vec<PlanEntry>> {
        let mut entries = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let columns: Vec<&str> = line.split_whitespace().collect();
            if columns.len() < 5 {
                return Err(PipelineError::Configuration(format!(
                    "ddplan line {} has {} columns, expected at least 5",
                    lineno + 1,
                    columns.len()
                )));
            }
            let bad = |idx: usize| {
                PipelineError::Configuration(format!(
                    "ddplan line {}: '{}' is not a valid column {}",
                    lineno + 1,
                    columns[idx],
                    idx + 1
                ))
            };
            let count = |idx: usize| columns[idx].parse::<usize>().map_err(|_| bad(idx));
            let number = |idx: usize| columns[idx].parse::<f64>().map_err(|_| bad(idx));
            let rfi = RfiOp::from_tokens(columns.get(RECIPE_COLUMN..).unwrap_or_default()).map_err(|err| {
                PipelineError::Configuration(format!("ddplan line {}: {err}", lineno + 1))
            })?;
            let entry = PlanEntry {
                td: count(0)?,
                fd: count(1)?,
                trials: TrialSpec::Range {
                    start: number(2)?,
                    step: number(3)?,
                    count: count(4)?,
                },
                rfi,
            };
            entry.validate()?;
            entries.push(entry);
        }
        Ok(entries)
    }
}

/// First ddplan column holding RFI recipe tokens.
const RECIPE_COLUMN: usize = 9;

/// Lead-in/lead-out skipping and periodic segmentation, all in seconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Segmentation {
    pub lead_in: f64,
    pub lead_out: f64,
    /// Length of each independent segment; `None` keeps one segment.
    pub segment_length: Option<f64>,
    /// Data skipped between consecutive segments.
    pub segment_skip: f64,
}

impl Segmentation {
    pub fn validate(&self) -> PipelineResult<()> {
        let ok = |v: f64| v.is_finite() && v >= 0.0;
        if !ok(self.lead_in) || !ok(self.lead_out) || !ok(self.segment_skip) {
            return Err(PipelineError::Configuration(
                "segmentation times must be non-negative".into(),
            ));
        }
        if let Some(length) = self.segment_length {
            if !(length.is_finite() && length > 0.0) {
                return Err(PipelineError::Configuration(format!(
                    "segment length must be positive, got {length}"
                )));
            }
        }
        Ok(())
    }
}

/// Immutable run-wide tunables passed to every pipeline at construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Worker threads; 0 lets rayon pick one per core.
    pub threads: usize,
    /// Demote inter-source time gaps to a warning plus a forced reset.
    pub allow_gaps: bool,
    pub rfi: RfiThresholds,
    pub segmentation: Segmentation,
    /// Largest dispersion delay a trial may need, in seconds.
    pub max_delay_seconds: Option<f64>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            threads: 1,
            allow_gaps: false,
            rfi: RfiThresholds::default(),
            segmentation: Segmentation::default(),
            max_delay_seconds: None,
        }
    }
}

impl RunConfig {
    pub fn validate(&self) -> PipelineResult<()> {
        self.segmentation.validate()?;
        if let Some(limit) = self.max_delay_seconds {
            if !(limit.is_finite() && limit >= 0.0) {
                return Err(PipelineError::Configuration(format!(
                    "maximum delay must be non-negative, got {limit}"
                )));
            }
        }
        Ok(())
    }

    pub fn thread_pool(&self) -> PipelineResult<rayon::ThreadPool> {
        rayon::ThreadPoolBuilder::new()
            .num_threads(self.threads)
            .build()
            .map_err(|err| PipelineError::Configuration(format!("worker pool: {err}")))
    }

    /// History capacity in samples at the given sample period.
    pub fn history_capacity(&self, tsamp: f64) -> Option<usize> {
        self.max_delay_seconds
            .map(|seconds| (seconds / tsamp).ceil() as usize)
    }
}

/// Nominal parameters of a candidate to fold and refine.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CandidateSpec {
    pub dm: f64,
    pub f0: f64,
    #[serde(default)]
    pub f1: f64,
}

impl CandidateSpec {
    pub fn validate(&self) -> PipelineResult<()> {
        if !(self.f0.is_finite() && self.f0 > 0.0) {
            return Err(PipelineError::Configuration(format!(
                "candidate F0 must be positive, got {}",
                self.f0
            )));
        }
        if !(self.dm.is_finite() && self.dm >= 0.0) || !self.f1.is_finite() {
            return Err(PipelineError::Configuration(format!(
                "candidate DM {} / F1 {} out of range",
                self.dm, self.f1
            )));
        }
        Ok(())
    }

    /// Parses a candidate file: whitespace-separated columns with the DM in
    /// column 1, F0 in column 3 and F1 in column 4; `#` starts a comment line.
    pub fn parse_list(text: &str) -> PipelineResult<Vec<CandidateSpec>> {
        let mut candidates = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let columns: Vec<&str> = line.split_whitespace().collect();
            if columns.len() < 5 {
                return Err(PipelineError::Configuration(format!(
                    "candidate line {} has {} columns, expected at least 5",
                    lineno + 1,
                    columns.len()
                )));
            }
            let number = |idx: usize| -> PipelineResult<f64> {
                columns[idx].parse().map_err(|_| {
                    PipelineError::Configuration(format!(
                        "candidate line {}: '{}' is not a number",
                        lineno + 1,
                        columns[idx]
                    ))
                })
            };
            let candidate = CandidateSpec {
                dm: number(1)?,
                f0: number(3)?,
                f1: number(4)?,
            };
            candidate.validate()?;
            candidates.push(candidate);
        }
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recipe_tokens_parse_into_typed_ops() {
        let tokens = ["zap", "1170", "1186", "mask", "2", "4", "kadaneF", "1", "8", "zdot", "zero"];
        let ops = RfiOp::from_tokens(&tokens).unwrap();
        assert_eq!(
            ops,
            vec![
                RfiOp::Zap { fmin: 1170.0, fmax: 1186.0 },
                RfiOp::Mask { td: 2, fd: 4 },
                RfiOp::KadaneF { td: 1, fd: 8 },
                RfiOp::Zdot,
                RfiOp::Zero,
            ]
        );
    }

    #[test]
    fn malformed_recipes_are_configuration_errors() {
        for tokens in [
            vec!["kadaneT", "1"],
            vec!["mask", "0", "1"],
            vec!["zap", "1500", "1400"],
            vec!["median"],
            vec!["mask", "two", "1"],
        ] {
            let err = RfiOp::from_tokens(&tokens).unwrap_err();
            assert!(matches!(err, PipelineError::Configuration(_)), "{tokens:?}");
        }
    }

    #[test]
    fn tagged_yaml_form_round_trips_through_json() {
        let ops: Vec<RfiOp> =
            serde_json::from_str(r#"[{"op":"kadaneF","td":2,"fd":4},{"op":"zdot"}]"#).unwrap();
        assert_eq!(ops, vec![RfiOp::KadaneF { td: 2, fd: 4 }, RfiOp::Zdot]);
    }

    #[test]
    fn trial_range_expands_in_order() {
        let spec = TrialSpec::Range { start: 10.0, step: 0.5, count: 4 };
        assert_eq!(spec.dms(), vec![10.0, 10.5, 11.0, 11.5]);
        assert!(TrialSpec::List(vec![]).validate().is_err());
        assert!(TrialSpec::List(vec![-1.0]).validate().is_err());
    }

    #[test]
    fn plan_entry_rejects_zero_downsample() {
        let entry = PlanEntry {
            td: 0,
            fd: 1,
            trials: TrialSpec::List(vec![0.0]),
            rfi: vec![],
        };
        assert!(entry.validate().is_err());
    }

    #[test]
    fn ddplan_lines_become_plan_entries() {
        let text = "# td fd dms ddm ndm\n\
1 1 0.0 0.5 100 0 0 0 0\n\
2\t4  50.0 1.0 40 x x x x zap 1170 1186 kadaneF 2 4 zdot\n\n\
4 4 90.0 2.0 20\n";
        let plan = PlanEntry::parse_list(text).unwrap();
        assert_eq!(plan.len(), 3);
        assert_eq!((plan[0].td, plan[0].fd), (1, 1));
        assert_eq!(plan[0].trials.dms().len(), 100);
        assert!(plan[0].rfi.is_empty());
        assert_eq!((plan[1].td, plan[1].fd), (2, 4));
        assert_eq!(plan[1].trials.dms()[1], 51.0);
        assert_eq!(
            plan[1].rfi,
            vec![
                RfiOp::Zap { fmin: 1170.0, fmax: 1186.0 },
                RfiOp::KadaneF { td: 2, fd: 4 },
                RfiOp::Zdot,
            ]
        );
        assert_eq!(plan[2].trials.dms().last(), Some(&128.0));
    }

    #[test]
    fn malformed_ddplan_lines_are_rejected() {
        for text in [
            "1 1 0.0 0.5",
            "1 x 0.0 0.5 10",
            "0 1 0.0 0.5 10",
            "1 1 0.0 0.5 0",
            "1 1 0.0 0.5 10 0 0 0 0 kadaneT 1",
        ] {
            let err = PlanEntry::parse_list(text).unwrap_err();
            assert!(matches!(err, PipelineError::Configuration(_)), "{text}");
        }
    }

    #[test]
    fn candidate_file_uses_dm_f0_f1_columns() {
        let text = "#id dm acc f0 f1 snr\n1 56.7 0.0 5.25 -1e-10 12.0\n\n2 3.0 0 100.5 0 8\n";
        let cands = CandidateSpec::parse_list(text).unwrap();
        assert_eq!(cands.len(), 2);
        assert_eq!(cands[0], CandidateSpec { dm: 56.7, f0: 5.25, f1: -1e-10 });
        assert_eq!(cands[1].f0, 100.5);
        assert!(CandidateSpec::parse_list("1 2 3").is_err());
        assert!(CandidateSpec::parse_list("1 2.0 0 0.0 0").is_err());
    }
}
