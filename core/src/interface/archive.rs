use crate::processing::fold::Archive;
use crate::processing::gridsearch::{
    DerivedParameters, GridAxis, GridSearchResult, TimingErrors, SPEED_OF_LIGHT,
};
use crate::prelude::PipelineResult;
use byteorder::{LittleEndian, WriteBytesExt};
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Persists a refined candidate for downstream tools.
pub trait ArchiveWriter {
    /// Writes candidate `id` and returns the files produced.
    fn write(&self, id: usize, archive: &Archive, result: &GridSearchResult) -> PipelineResult<Vec<PathBuf>>;
}

/// `<root>.spft` holds the folded cubes as raw little-endian f32, one
/// `(npol, nchan, nbin)` block per integration. `<root>_aligned.spft` holds
/// the channel profiles re-aligned at the refined parameters, shaped
/// `(nsubint, nchan, nbin)`. `<root>.json` describes both and carries the
/// refinement outcome.
#[derive(Debug, Clone)]
pub struct SpftArchiveWriter {
    dir: PathBuf,
    root: String,
}

#[derive(Serialize)]
struct IntegrationSummary {
    epoch: f64,
    start: f64,
    ffold: f64,
    tsubint: f64,
}

#[derive(Serialize)]
struct RefinementSummary {
    dm: f64,
    f0: f64,
    f1: f64,
    ddm: f64,
    df0: f64,
    df1: f64,
    snr: f64,
    width: usize,
    iterations: usize,
    converged: bool,
    errors: TimingErrors,
    derived: DerivedParameters,
    dm_axis: GridAxis,
    f0_axis: GridAxis,
    f1_axis: GridAxis,
    snr_dm: Vec<f64>,
    snr_ffdot: Vec<Vec<f64>>,
    profile: Vec<f32>,
    aligned_file: String,
    aligned_shape: [usize; 3],
}

#[derive(Serialize)]
struct ArchiveSummary {
    id: usize,
    data_file: String,
    dm: f64,
    f0: f64,
    f1: f64,
    ref_epoch: f64,
    ref_mjd: f64,
    start_mjd: f64,
    npol: usize,
    nchan: usize,
    nbin: usize,
    frequencies: Vec<f64>,
    integrations: Vec<IntegrationSummary>,
    refinement: RefinementSummary,
}

impl SpftArchiveWriter {
    pub fn new<P: AsRef<Path>>(dir: P, root: &str) -> PipelineResult<Self> {
        fs::create_dir_all(dir.as_ref())?;
        Ok(Self {
            dir: dir.as_ref().to_path_buf(),
            root: root.to_string(),
        })
    }

    fn stem(&self, id: usize) -> String {
        format!("{}_cand{:04}", self.root, id)
    }

    fn write_samples<'a, I>(path: &Path, samples: I) -> PipelineResult<()>
    where
        I: IntoIterator<Item = &'a f32>,
    {
        let mut writer = BufWriter::new(File::create(path)?);
        for &value in samples {
            writer.write_f32::<LittleEndian>(value)?;
        }
        writer.flush()?;
        Ok(())
    }
}

impl ArchiveWriter for SpftArchiveWriter {
    fn write(&self, id: usize, archive: &Archive, result: &GridSearchResult) -> PipelineResult<Vec<PathBuf>> {
        let stem = self.stem(id);
        let data_path = self.dir.join(format!("{stem}.spft"));
        let aligned_path = self.dir.join(format!("{stem}_aligned.spft"));
        let json_path = self.dir.join(format!("{stem}.json"));
        Self::write_samples(&data_path, archive.integrations.iter().flat_map(|i| i.data.iter()))?;
        Self::write_samples(&aligned_path, result.aligned.iter())?;
        let (nsub, nchan, nbin) = result.aligned.dim();

        let summary = ArchiveSummary {
            id,
            data_file: format!("{stem}.spft"),
            dm: archive.dm,
            f0: archive.f0,
            f1: archive.f1,
            ref_epoch: archive.ref_epoch,
            ref_mjd: archive.ref_mjd(),
            start_mjd: archive.start_mjd,
            npol: archive.integrations.first().map_or(1, |i| i.data.dim().0),
            nchan: archive.nchan(),
            nbin: archive.nbin,
            frequencies: archive.frequencies.clone(),
            integrations: archive
                .integrations
                .iter()
                .map(|i| IntegrationSummary {
                    epoch: i.epoch,
                    start: i.start,
                    ffold: i.ffold,
                    tsubint: i.tsubint,
                })
                .collect(),
            refinement: RefinementSummary {
                dm: result.dm,
                f0: result.f0,
                f1: result.f1,
                ddm: result.ddm,
                df0: result.df0,
                df1: result.df1,
                snr: result.snr,
                width: result.width,
                iterations: result.iterations,
                converged: result.converged,
                errors: result.errors,
                derived: result.derived,
                dm_axis: result.dm_axis,
                f0_axis: result.f0_axis,
                f1_axis: result.f1_axis,
                snr_dm: result.snr_dm.clone(),
                snr_ffdot: result.snr_ffdot.outer_iter().map(|row| row.to_vec()).collect(),
                profile: result.profile.clone(),
                aligned_file: format!("{stem}_aligned.spft"),
                aligned_shape: [nsub, nchan, nbin],
            },
        };
        let file = BufWriter::new(File::create(&json_path)?);
        serde_json::to_writer_pretty(file, &summary)?;
        Ok(vec![data_path, aligned_path, json_path])
    }
}

/// One `.cands` line per refined candidate: nominal and refined DM, F0, F1,
/// acceleration, then S/N.
pub fn format_candidate_table(results: &[GridSearchResult]) -> String {
    let mut table = String::from("#id dm_old dm_new f0_old f0_new f1_old f1_new acc_old acc_new snr\n");
    for (id, result) in results.iter().enumerate() {
        let acc_old = result.nominal_f1 / result.nominal_f0 * SPEED_OF_LIGHT;
        table.push_str(&format!(
            "{} {:.4} {:.4} {:.12} {:.12} {:.6e} {:.6e} {:.4} {:.4} {:.2}\n",
            id + 1,
            result.nominal_dm,
            result.dm,
            result.nominal_f0,
            result.f0,
            result.nominal_f1,
            result.f1,
            acc_old,
            result.derived.acc,
            result.snr
        ));
    }
    table
}

pub fn write_candidate_table<P: AsRef<Path>>(path: P, results: &[GridSearchResult]) -> PipelineResult<()> {
    fs::write(path, format_candidate_table(results))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::fold::Integration;
    use crate::processing::gridsearch::{GridSearch, GridSearchSettings};
    use ndarray::Array3;
    use tempfile::tempdir;

    fn archive() -> Archive {
        let integrations = (0..3)
            .map(|k| Integration {
                epoch: k as f64 - 1.0,
                start: k as f64 - 1.5,
                ffold: 2.0,
                tsubint: 1.0,
                data: Array3::from_shape_fn((1, 2, 8), |(_, ch, b)| {
                    if b == 3 { 10.0 + ch as f32 } else { (b as f32 * 0.3).sin() }
                }),
            })
            .collect();
        Archive {
            dm: 15.0,
            f0: 2.0,
            f1: 0.0,
            ref_epoch: 1.5,
            start_mjd: 60_000.0,
            frequencies: vec![1300.0, 1400.0],
            nbin: 8,
            integrations,
        }
    }

    #[test]
    fn spft_writer_emits_cubes_and_summary() {
        let dir = tempdir().unwrap();
        let archive = archive();
        let result = GridSearch::new(&archive, GridSearchSettings::default()).run();
        let writer = SpftArchiveWriter::new(dir.path(), "test").unwrap();
        let paths = writer.write(7, &archive, &result).unwrap();

        assert_eq!(paths[0].file_name().unwrap(), "test_cand0007.spft");
        assert_eq!(fs::metadata(&paths[0]).unwrap().len(), 3 * 2 * 8 * 4);
        assert_eq!(paths[1].file_name().unwrap(), "test_cand0007_aligned.spft");
        assert_eq!(result.aligned.dim(), (3, 2, 8));
        let aligned = crate::interface::timeseries::read_series(&paths[1]).unwrap();
        assert_eq!(aligned.len(), 3 * 2 * 8);
        assert_eq!(aligned, result.aligned.iter().copied().collect::<Vec<_>>());
        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&paths[2]).unwrap()).unwrap();
        assert_eq!(json["nbin"], 8);
        assert_eq!(json["refinement"]["aligned_file"], "test_cand0007_aligned.spft");
        assert_eq!(json["refinement"]["aligned_shape"], serde_json::json!([3, 2, 8]));
        assert_eq!(json["integrations"].as_array().unwrap().len(), 3);
        assert_eq!(json["refinement"]["snr_dm"].as_array().unwrap().len(), result.snr_dm.len());
    }

    #[test]
    fn candidate_table_has_header_and_one_line_per_candidate() {
        let archive = archive();
        let result = GridSearch::new(&archive, GridSearchSettings::default()).run();
        let table = format_candidate_table(&[result.clone(), result]);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("#id dm_old"));
        assert_eq!(lines[2].split_whitespace().count(), 10);
        assert!(lines[1].starts_with("1 15.0000"));
    }
}
