//! Per-run output: one dataset per channel, decay spectra and a run manifest.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::FluxUnit;
use crate::error::{PhantomError, PhantomResult};
use crate::run::RunResult;
use crate::spectrum::EmissionSpectrum;
use crate::tally::{ChannelHandle, EnergyBin, TallyAccumulator};

/// Manifest claimed by the run that owns the directory.
pub const RUN_MANIFEST_FILE: &str = "run.json";
/// Dataset name of the energy-deposit channel.
pub const EDEP_DATASET: &str = "Edep";
/// Bytes per binary record: three u32 indices and one f64 value
pub const BINARY_RECORD_SIZE: usize = 3 * 4 + 8;

/// One populated voxel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VoxelRecord {
    pub x: u32,
    pub y: u32,
    pub z: u32,
    pub value: f64,
}

/// Populated voxels of one channel, in ascending linear index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TallyDataset {
    pub name: String,
    pub unit: String,
    pub shape: [usize; 3],
    pub bin: Option<EnergyBin>,
    pub records: Vec<VoxelRecord>,
}

impl TallyDataset {
    /// Values are multiplied by `scale` on the way out.
    pub fn from_channel(
        tally: &TallyAccumulator,
        handle: ChannelHandle,
        name: impl Into<String>,
        unit: impl Into<String>,
        scale: f64,
    ) -> PhantomResult<Self> {
        let codec = tally.codec();
        let info = tally.channel_info(handle)?;
        let records = tally
            .entries(handle)?
            .into_iter()
            .map(|(idx, value)| {
                let (x, y, z) = codec.decode(idx);
                VoxelRecord {
                    x: x as u32,
                    y: y as u32,
                    z: z as u32,
                    value: value * scale,
                }
            })
            .collect();
        Ok(TallyDataset {
            name: name.into(),
            unit: unit.into(),
            shape: codec.shape(),
            bin: info.bin,
            records,
        })
    }
}

/// Output switches taken from `[output]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExportOptions {
    pub binary: bool,
    pub flux_unit: FluxUnit,
}

/// Contents of `run.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: Uuid,
    pub workers: usize,
    pub events: u64,
    pub flux_unit: FluxUnit,
    pub files: Vec<String>,
}

/// Writes every dataset of `result` into `dir`.
///
/// `run.json` is claimed first with `create_new`, so a directory that
/// already belongs to a run is refused before anything is overwritten. If
/// any later write fails the claim is released again, leaving the directory
/// open for a retry.
pub fn export_run(dir: &Path, result: &RunResult, options: &ExportOptions) -> PhantomResult<RunManifest> {
    fs::create_dir_all(dir).map_err(|e| PhantomError::io(dir, e))?;
    let manifest_path = dir.join(RUN_MANIFEST_FILE);
    let manifest_file = match OpenOptions::new().write(true).create_new(true).open(&manifest_path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            return Err(PhantomError::integrity(
                &manifest_path,
                "output directory already holds a run; choose another directory",
            ));
        }
        Err(e) => return Err(PhantomError::io(&manifest_path, e)),
    };

    match write_run(dir, &manifest_path, manifest_file, result, options) {
        Ok(manifest) => {
            info!(
                run_id = %result.run_id,
                dir = %dir.display(),
                files = manifest.files.len(),
                binary = options.binary,
                "run exported"
            );
            Ok(manifest)
        }
        Err(err) => {
            if let Err(e) = fs::remove_file(&manifest_path) {
                warn!(path = %manifest_path.display(), error = %e, "cannot release run manifest");
            }
            Err(err)
        }
    }
}

fn write_run(
    dir: &Path,
    manifest_path: &Path,
    manifest_file: File,
    result: &RunResult,
    options: &ExportOptions,
) -> PhantomResult<RunManifest> {
    let mut datasets = vec![TallyDataset::from_channel(
        &result.tally,
        result.channels.edep,
        EDEP_DATASET,
        "keV",
        1.0,
    )?];
    for (i, &handle) in result.channels.flux.iter().enumerate() {
        datasets.push(TallyDataset::from_channel(
            &result.tally,
            handle,
            format!("Fluence{:02}", i + 1),
            options.flux_unit.label(),
            options.flux_unit.scale(),
        )?);
    }

    let mut files = Vec::new();
    for dataset in &datasets {
        let json = format!("{}.json", dataset.name);
        write_json(&dir.join(&json), dataset)?;
        files.push(json);
        if options.binary {
            let bin = format!("{}.bin", dataset.name);
            write_binary(&dir.join(&bin), &dataset.records)?;
            files.push(bin);
        }
    }

    for (name, spectrum) in [
        ("spectrum_electron.json", &result.spectra.electron),
        ("spectrum_photon.json", &result.spectra.photon),
    ] {
        write_json::<EmissionSpectrum>(&dir.join(name), spectrum)?;
        files.push(name.to_string());
    }

    let manifest = RunManifest {
        run_id: result.run_id,
        workers: result.workers,
        events: result.events,
        flux_unit: options.flux_unit,
        files,
    };
    let mut writer = BufWriter::new(manifest_file);
    serde_json::to_writer_pretty(&mut writer, &manifest)
        .map_err(|e| PhantomError::io(manifest_path, io::Error::other(e)))?;
    writer.flush().map_err(|e| PhantomError::io(manifest_path, e))?;
    Ok(manifest)
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> PhantomResult<()> {
    let file = File::create(path).map_err(|e| PhantomError::io(path, e))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value)
        .map_err(|e| PhantomError::io(path, io::Error::other(e)))?;
    writer.flush().map_err(|e| PhantomError::io(path, e))
}

/// Little-endian `u32 x, u32 y, u32 z, f64 value` per record.
pub fn encode_records<W: Write>(writer: &mut W, records: &[VoxelRecord]) -> io::Result<()> {
    for record in records {
        writer.write_u32::<LittleEndian>(record.x)?;
        writer.write_u32::<LittleEndian>(record.y)?;
        writer.write_u32::<LittleEndian>(record.z)?;
        writer.write_f64::<LittleEndian>(record.value)?;
    }
    Ok(())
}

/// Inverse of [`encode_records`]; a trailing partial record is an error.
pub fn decode_records<R: Read>(reader: &mut R) -> io::Result<Vec<VoxelRecord>> {
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes)?;
    if bytes.len() % BINARY_RECORD_SIZE != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{} bytes is not a whole number of records", bytes.len()),
        ));
    }
    let mut cursor = io::Cursor::new(bytes);
    let count = cursor.get_ref().len() / BINARY_RECORD_SIZE;
    let mut records = Vec::with_capacity(count);
    for _ in 0..count {
        records.push(VoxelRecord {
            x: cursor.read_u32::<LittleEndian>()?,
            y: cursor.read_u32::<LittleEndian>()?,
            z: cursor.read_u32::<LittleEndian>()?,
            value: cursor.read_f64::<LittleEndian>()?,
        });
    }
    Ok(records)
}

fn write_binary(path: &Path, records: &[VoxelRecord]) -> PhantomResult<()> {
    let file = File::create(path).map_err(|e| PhantomError::io(path, e))?;
    let mut writer = BufWriter::new(file);
    encode_records(&mut writer, records)
        .and_then(|_| writer.flush())
        .map_err(|e| PhantomError::io(path, e))
}

/// Reads a `.json` dataset written by [`export_run`].
pub fn read_dataset(path: &Path) -> PhantomResult<TallyDataset> {
    let file = File::open(path).map_err(|source| PhantomError::FileNotFound {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_reader(BufReader::new(file))
        .map_err(|e| PhantomError::parse(path, "dataset", e.to_string()))
}

/// Records from a `.json` dataset or a `.bin` record file.
pub fn read_records(path: &Path) -> PhantomResult<Vec<VoxelRecord>> {
    let is_binary = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("bin"));
    if !is_binary {
        return Ok(read_dataset(path)?.records);
    }
    let file = File::open(path).map_err(|source| PhantomError::FileNotFound {
        path: path.to_path_buf(),
        source,
    })?;
    decode_records(&mut BufReader::new(file))
        .map_err(|e| PhantomError::parse(path, "binary records", e.to_string()))
}

/// One `x\ty\tz\tvalue` row per record.
pub fn write_text_dump<W: Write>(records: &[VoxelRecord], writer: &mut W) -> io::Result<()> {
    for r in records {
        writeln!(writer, "{:7}\t{:7}\t{:7}\t{:6.8}", r.x, r.y, r.z, r.value)?;
    }
    Ok(())
}

/// Default text-dump target next to `input`: same stem, `.dat` extension.
pub fn dump_path_for(input: &Path) -> PathBuf {
    input.with_extension("dat")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index_codec::IndexCodec;
    use crate::run::{RunCoordinator, WorkerResult};
    use crate::scoring::{NestedReplicaResolver, Scorer, ScoringSetup, Species, Step};
    use crate::spectrum::DecaySpectra;
    use crate::tally::EnergyBins;
    use std::sync::Arc;

    fn run_result() -> RunResult {
        let setup = Arc::new(
            ScoringSetup::new(
                IndexCodec::new(4, 4, 4),
                EnergyBins::from_upper_edges(vec![100.0, 200.0]).unwrap(),
                [Species::Photon],
                [1],
                2.0,
                false,
            )
            .unwrap(),
        );
        let mut scorer = Scorer::new(setup, NestedReplicaResolver);
        let mut step = Step::new(Species::Photon, 150.0, 1);
        step.touchable.replicas = [3, 1, 2];
        step.step_length = 1.0;
        step.energy_deposit = 12.5;
        scorer.process_step(&step);
        step.touchable.replicas = [0, 0, 0];
        scorer.process_step(&step);

        let coordinator = RunCoordinator::new();
        coordinator
            .submit(WorkerResult {
                worker: 0,
                events: 2,
                channels: scorer.channels().clone(),
                tally: scorer.into_tally(),
                spectra: DecaySpectra::default(),
            })
            .unwrap();
        coordinator.finish().unwrap()
    }

    #[test]
    fn writes_datasets_and_refuses_a_second_run() {
        let dir = tempfile::tempdir().unwrap();
        let result = run_result();
        let options = ExportOptions {
            binary: true,
            flux_unit: FluxUnit::PerCm2,
        };
        let manifest = export_run(dir.path(), &result, &options).unwrap();
        assert_eq!(manifest.events, 2);
        assert!(manifest.files.contains(&"Fluence02.bin".to_string()));
        assert!(manifest.files.contains(&"spectrum_photon.json".to_string()));

        let edep = read_dataset(&dir.path().join("Edep.json")).unwrap();
        assert_eq!(edep.shape, [4, 4, 4]);
        assert_eq!(
            edep.records,
            vec![
                VoxelRecord { x: 0, y: 0, z: 0, value: 12.5 },
                VoxelRecord { x: 1, y: 2, z: 3, value: 12.5 },
            ]
        );

        let fluence = read_dataset(&dir.path().join("Fluence02.json")).unwrap();
        assert_eq!(fluence.unit, "cm-2");
        assert_eq!(fluence.bin, Some(EnergyBin { low: 100.0, high: 200.0 }));
        assert_eq!(fluence.records[0].value, 50.0);
        assert!(read_dataset(&dir.path().join("Fluence01.json")).unwrap().records.is_empty());

        let binary = read_records(&dir.path().join("Fluence02.bin")).unwrap();
        assert_eq!(binary, fluence.records);

        let again = export_run(dir.path(), &result, &options);
        assert!(matches!(again, Err(PhantomError::DataIntegrity { .. })));
    }

    #[test]
    fn failed_export_releases_the_directory() {
        let dir = tempfile::tempdir().unwrap();
        let result = run_result();
        let options = ExportOptions::default();
        // a directory where a dataset file should go makes the write fail
        let blocker = dir.path().join("Fluence01.json");
        fs::create_dir(&blocker).unwrap();

        assert!(matches!(
            export_run(dir.path(), &result, &options),
            Err(PhantomError::Io { .. })
        ));
        assert!(!dir.path().join(RUN_MANIFEST_FILE).exists());

        fs::remove_dir(&blocker).unwrap();
        let manifest = export_run(dir.path(), &result, &options).unwrap();
        assert_eq!(manifest.run_id, result.run_id);
        let written: RunManifest =
            serde_json::from_str(&fs::read_to_string(dir.path().join(RUN_MANIFEST_FILE)).unwrap())
                .unwrap();
        assert_eq!(written, manifest);
    }

    #[test]
    fn text_dump_is_tab_separated() {
        let records = [
            VoxelRecord { x: 1, y: 22, z: 333, value: 0.5 },
            VoxelRecord { x: 0, y: 0, z: 0, value: 1.0 / 3.0 },
        ];
        let mut out = Vec::new();
        write_text_dump(&records, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(
            text,
            "      1\t     22\t    333\t0.50000000\n      0\t      0\t      0\t0.33333333\n"
        );
    }

    #[test]
    fn truncated_binary_is_rejected() {
        let mut bytes = Vec::new();
        encode_records(&mut bytes, &[VoxelRecord { x: 1, y: 2, z: 3, value: 4.0 }]).unwrap();
        assert_eq!(bytes.len(), BINARY_RECORD_SIZE);
        assert!(decode_records(&mut &bytes[..bytes.len() - 1]).is_err());
        assert_eq!(decode_records(&mut &bytes[..]).unwrap()[0].z, 3);
    }
}
