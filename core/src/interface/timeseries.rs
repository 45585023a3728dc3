use crate::prelude::{PipelineError, PipelineResult};
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Identifies one dedispersed series.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeriesId {
    /// Plan entry the trial belongs to.
    pub entry: usize,
    /// Trial index within its plan entry.
    pub trial: usize,
    pub dm: f64,
    pub segment: usize,
}

/// Destination of one dedispersed series (one trial, one segment).
pub trait SeriesSink: Send {
    fn write(&mut self, samples: &[f32]) -> PipelineResult<()>;
    fn finish(&mut self) -> PipelineResult<()>;
}

/// Opens a sink per trial and segment as segments begin.
pub trait SeriesSinkFactory: Send + Sync {
    fn create(&self, id: SeriesId) -> PipelineResult<Box<dyn SeriesSink>>;
}

/// Raw little-endian f32 file, no header.
pub struct DatFileSink {
    writer: BufWriter<File>,
}

impl DatFileSink {
    pub fn create<P: AsRef<Path>>(path: P) -> PipelineResult<Self> {
        let file = File::create(path.as_ref())?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }
}

impl SeriesSink for DatFileSink {
    fn write(&mut self, samples: &[f32]) -> PipelineResult<()> {
        for &value in samples {
            self.writer.write_f32::<LittleEndian>(value)?;
        }
        Ok(())
    }

    fn finish(&mut self) -> PipelineResult<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// `<root>_M<beam>_P<entry>_<segment>_T<trial>_DM<dm>.dat` files in one directory.
#[derive(Debug, Clone)]
pub struct DatFileFactory {
    dir: PathBuf,
    root: String,
    beam: usize,
}

impl DatFileFactory {
    pub fn new<P: AsRef<Path>>(dir: P, root: &str, beam: usize) -> PipelineResult<Self> {
        fs::create_dir_all(dir.as_ref())?;
        Ok(Self {
            dir: dir.as_ref().to_path_buf(),
            root: root.to_string(),
            beam,
        })
    }

    pub fn path_for(&self, id: SeriesId) -> PathBuf {
        self.dir.join(format!(
            "{}_M{:02}_P{:02}_{:04}_T{:04}_DM{:.4}.dat",
            self.root, self.beam, id.entry, id.segment, id.trial, id.dm
        ))
    }
}

impl SeriesSinkFactory for DatFileFactory {
    fn create(&self, id: SeriesId) -> PipelineResult<Box<dyn SeriesSink>> {
        Ok(Box::new(DatFileSink::create(self.path_for(id))?))
    }
}

/// Reads back a series written by [`DatFileSink`].
pub fn read_series<P: AsRef<Path>>(path: P) -> PipelineResult<Vec<f32>> {
    let bytes = fs::read(path.as_ref())?;
    if bytes.len() % 4 != 0 {
        return Err(PipelineError::InvalidInput(format!(
            "{} is {} bytes, not a whole number of f32 samples",
            path.as_ref().display(),
            bytes.len()
        )));
    }
    let mut samples = vec![0.0f32; bytes.len() / 4];
    LittleEndian::read_f32_into(&bytes, &mut samples);
    Ok(samples)
}

/// Plan entry, segment and trial index.
type SeriesKey = (usize, usize, usize);
type SeriesStore = Arc<Mutex<BTreeMap<SeriesKey, (f64, Vec<f32>)>>>;

/// In-memory sinks sharing one store; the simulator keeps series this way
/// when no output directory is requested.
#[derive(Clone, Default)]
pub struct MemorySeriesFactory {
    store: SeriesStore,
}

impl MemorySeriesFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Series of the trial at `dm` in plan entry `entry`.
    pub fn series(&self, entry: usize, dm: f64, segment: usize) -> Option<Vec<f32>> {
        let store = self.store.lock().ok()?;
        store
            .iter()
            .find(|((e, s, _), (trial_dm, _))| *e == entry && *s == segment && trial_dm.to_bits() == dm.to_bits())
            .map(|(_, (_, samples))| samples.clone())
    }

    pub fn len(&self) -> usize {
        self.store.lock().map(|store| store.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct MemorySeriesSink {
    key: SeriesKey,
    store: SeriesStore,
}

impl SeriesSink for MemorySeriesSink {
    fn write(&mut self, samples: &[f32]) -> PipelineResult<()> {
        let mut store = self
            .store
            .lock()
            .map_err(|_| PipelineError::InvalidInput("series store poisoned".into()))?;
        match store.get_mut(&self.key) {
            Some((_, series)) => series.extend_from_slice(samples),
            None => return Err(PipelineError::InvalidInput(format!("series {:?} was never opened", self.key))),
        }
        Ok(())
    }

    fn finish(&mut self) -> PipelineResult<()> {
        Ok(())
    }
}

impl SeriesSinkFactory for MemorySeriesFactory {
    fn create(&self, id: SeriesId) -> PipelineResult<Box<dyn SeriesSink>> {
        let key = (id.entry, id.segment, id.trial);
        let mut store = self
            .store
            .lock()
            .map_err(|_| PipelineError::InvalidInput("series store poisoned".into()))?;
        store.insert(key, (id.dm, Vec::new()));
        Ok(Box::new(MemorySeriesSink {
            key,
            store: Arc::clone(&self.store),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn id(entry: usize, trial: usize, dm: f64, segment: usize) -> SeriesId {
        SeriesId { entry, trial, dm, segment }
    }

    #[test]
    fn dat_files_are_named_and_read_back() {
        let dir = tempdir().unwrap();
        let factory = DatFileFactory::new(dir.path(), "obs", 3).unwrap();
        let path = factory.path_for(id(2, 5, 12.5, 1));
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "obs_M03_P02_0001_T0005_DM12.5000.dat"
        );

        let mut sink = factory.create(id(2, 5, 12.5, 1)).unwrap();
        sink.write(&[1.0, -2.5]).unwrap();
        sink.write(&[f32::MAX]).unwrap();
        sink.finish().unwrap();
        assert_eq!(read_series(&path).unwrap(), vec![1.0, -2.5, f32::MAX]);
        assert_eq!(fs::metadata(&path).unwrap().len(), 12);
    }

    #[test]
    fn close_trials_and_shared_dms_get_separate_files() {
        let dir = tempdir().unwrap();
        let factory = DatFileFactory::new(dir.path(), "obs", 1).unwrap();
        let fine_a = factory.path_for(id(0, 1, 0.010, 0));
        let fine_b = factory.path_for(id(0, 2, 0.012, 0));
        assert_ne!(fine_a, fine_b);
        let shared_a = factory.path_for(id(0, 1, 10.0, 0));
        let shared_b = factory.path_for(id(1, 0, 10.0, 0));
        assert_ne!(shared_a, shared_b);

        let mut a = factory.create(id(0, 1, 10.0, 0)).unwrap();
        let mut b = factory.create(id(1, 0, 10.0, 0)).unwrap();
        a.write(&[1.0, 2.0]).unwrap();
        b.write(&[3.0]).unwrap();
        a.finish().unwrap();
        b.finish().unwrap();
        assert_eq!(read_series(&shared_a).unwrap(), vec![1.0, 2.0]);
        assert_eq!(read_series(&shared_b).unwrap(), vec![3.0]);
    }

    #[test]
    fn truncated_file_is_invalid() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.dat");
        fs::write(&path, [0u8; 6]).unwrap();
        assert!(matches!(read_series(&path), Err(PipelineError::InvalidInput(_))));
    }

    #[test]
    fn memory_sinks_append_per_key() {
        let factory = MemorySeriesFactory::new();
        let mut a = factory.create(id(0, 0, 5.0, 0)).unwrap();
        a.write(&[1.0]).unwrap();
        a.write(&[2.0]).unwrap();
        factory.create(id(0, 0, 5.0, 1)).unwrap();
        let mut other = factory.create(id(1, 0, 5.0, 0)).unwrap();
        other.write(&[9.0]).unwrap();
        assert_eq!(factory.series(0, 5.0, 0), Some(vec![1.0, 2.0]));
        assert_eq!(factory.series(0, 5.0, 1), Some(vec![]));
        assert_eq!(factory.series(1, 5.0, 0), Some(vec![9.0]));
        assert_eq!(factory.len(), 3);
    }
}
