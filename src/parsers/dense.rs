use std::path::Path;

use tracing::debug;

use crate::error::{PhantomError, PhantomResult};
use crate::index_codec::IndexCodec;
use crate::parsers::manifest::Manifest;
use crate::source::{ProbabilityMap, SourceGrid, SourceMode};
use crate::utils::parser::DoseMapParser;
use crate::utils::tokens::TokenReader;
use crate::voxel_grid::VoxelGridHeader;

/// Dense dose maps: a `Data.dat` manifest listing per-slice intensity files.
pub struct DenseDoseMapParser;

impl DenseDoseMapParser {
    /// Creates the parser.
    pub fn new() -> Self {
        DenseDoseMapParser
    }
}

impl Default for DenseDoseMapParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Folds one slice header into the canonical grid. The first slice fixes
/// nx, ny, pitch and origin; later slices only add to nz.
fn stack_slice(
    grid: &mut Option<SourceGrid>,
    header: &VoxelGridHeader,
    file: &Path,
) -> PhantomResult<()> {
    let Some(canonical) = grid.as_mut() else {
        *grid = Some(SourceGrid::from_header(header));
        return Ok(());
    };
    for (axis, name) in [(0usize, "x"), (1, "y")] {
        if canonical.shape[axis] != header.shape[axis] {
            return Err(PhantomError::GeometryMismatch {
                axis: name,
                reason: format!(
                    "{} has {} voxels, first dose slice has {}",
                    file.display(),
                    header.shape[axis],
                    canonical.shape[axis]
                ),
            });
        }
    }
    let mut stacked = canonical.shape;
    stacked[2] = stacked[2].saturating_add(header.shape[2]);
    if IndexCodec::checked_voxel_count(stacked).is_none() {
        return Err(PhantomError::GeometryMismatch {
            axis: "z",
            reason: format!("{} overflows the voxel index", file.display()),
        });
    }
    canonical.shape = stacked;
    Ok(())
}

impl DoseMapParser for DenseDoseMapParser {
    fn supported_extensions(&self) -> Vec<&'static str> {
        vec!["dat"]
    }

    fn mode(&self) -> SourceMode {
        SourceMode::Dense
    }

    fn name(&self) -> &'static str {
        "Dense dose map"
    }

    fn parse_from_file(&self, file_path: &Path) -> PhantomResult<ProbabilityMap> {
        let manifest = Manifest::read_dose(file_path)?;

        let mut grid = None;
        let mut entries = Vec::new();
        let mut running_total = 0.0f64;
        let mut voxel_offset = 0usize;

        for file in &manifest.files {
            let mut tokens = TokenReader::open(file)?;
            let header = VoxelGridHeader::read_from(&mut tokens)?;
            stack_slice(&mut grid, &header, file)?;

            let count = header.voxel_count();
            for i in 0..count {
                let intensity: f64 = tokens.next("intensity")?;
                if !(intensity >= 0.0) || intensity.is_infinite() {
                    return Err(PhantomError::parse(
                        file,
                        "intensity",
                        format!("voxel {i} has invalid intensity {intensity}"),
                    ));
                }
                if intensity > 0.0 {
                    let next = running_total + intensity;
                    // A contribution lost to rounding carries no probability mass.
                    if next > running_total {
                        running_total = next;
                        entries.push((running_total, voxel_offset + i));
                    }
                }
            }
            voxel_offset += count;
            debug!(
                file = %file.display(),
                shape = ?header.shape,
                running_total,
                "dose slice read"
            );
        }

        let Some(grid) = grid else {
            return Err(PhantomError::parse(file_path, "file count", "no dose slices"));
        };
        ProbabilityMap::from_cumulative(grid, entries, file_path)
    }

    fn read_grid_from_file(&self, file_path: &Path) -> PhantomResult<SourceGrid> {
        let manifest = Manifest::read_dose(file_path)?;
        let mut grid = None;
        for file in &manifest.files {
            let mut tokens = TokenReader::open(file)?;
            let header = VoxelGridHeader::read_from(&mut tokens)?;
            stack_slice(&mut grid, &header, file)?;
        }
        grid.ok_or_else(|| PhantomError::parse(file_path, "file count", "no dose slices"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parsers::manifest::MANIFEST_FILE;

    fn write_dose_dir(slices: &[&str]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let mut manifest = format!("{}\n", slices.len());
        for (i, body) in slices.iter().enumerate() {
            let name = format!("dose{i}.txt");
            std::fs::write(dir.path().join(&name), body).unwrap();
            manifest.push_str(&name);
            manifest.push('\n');
        }
        std::fs::write(dir.path().join(MANIFEST_FILE), manifest).unwrap();
        dir
    }

    #[test]
    fn four_voxel_example() {
        let dir = write_dose_dir(&["2 2 1\n0 20\n0 20\n0 10\n0 10 0 30\n"]);
        let map = DenseDoseMapParser::new()
            .parse_from_file(&dir.path().join(MANIFEST_FILE))
            .unwrap();

        let entries: Vec<_> = map.entries().collect();
        assert_eq!(entries, vec![(0.25, 1), (1.0, 3)]);
        assert_eq!(map.grid().pitch, [10.0, 10.0, 10.0]);
        assert_eq!(map.grid().origin, [5.0, 5.0, 5.0]);
        assert_eq!(map.sample_position(0.1).unwrap(), [15.0, 5.0, 5.0]);
        assert_eq!(map.sample_position(0.5).unwrap(), [15.0, 15.0, 5.0]);
    }

    #[test]
    fn slices_accumulate_along_z() {
        let dir = write_dose_dir(&[
            "2 1 1\n0 2\n0 1\n0 1\n1 0\n",
            "2 1 2\n0 2\n0 1\n1 3\n0 1\n0 2\n",
        ]);
        let parser = DenseDoseMapParser::new();
        let manifest = dir.path().join(MANIFEST_FILE);
        let map = parser.parse_from_file(&manifest).unwrap();

        assert_eq!(map.grid().shape, [2, 1, 3]);
        let voxels: Vec<usize> = map.entries().map(|(_, v)| v).collect();
        assert_eq!(voxels, vec![0, 3, 5]);
        assert_eq!(map.max_key(), Some(1.0));
        assert_eq!(map.sample_position(0.99).unwrap(), [1.5, 0.5, 2.5]);

        let grid = parser.read_grid_from_file(&manifest).unwrap();
        assert_eq!(grid, *map.grid());
    }

    #[test]
    fn mismatched_slices_are_rejected() {
        let dir = write_dose_dir(&["2 1 1 0 2 0 1 0 1\n1 1\n", "3 1 1 0 3 0 1 1 2\n1 1 1\n"]);
        let result = DenseDoseMapParser::new().parse_from_file(&dir.path().join(MANIFEST_FILE));
        assert!(matches!(
            result,
            Err(PhantomError::GeometryMismatch { axis: "x", .. })
        ));
    }

    #[test]
    fn stacking_past_the_index_range_is_rejected() {
        let huge = "65536 65536 2147483648 0 1 0 1 0 1\n";
        let dir = write_dose_dir(&[huge, huge]);
        let result = DenseDoseMapParser::new().read_grid_from_file(&dir.path().join(MANIFEST_FILE));
        assert!(matches!(
            result,
            Err(PhantomError::GeometryMismatch { axis: "z", .. })
        ));
    }

    #[test]
    fn negative_and_missing_values_are_parse_errors() {
        let dir = write_dose_dir(&["2 1 1 0 2 0 1 0 1\n1 -1\n"]);
        let result = DenseDoseMapParser::new().parse_from_file(&dir.path().join(MANIFEST_FILE));
        assert!(matches!(result, Err(PhantomError::Parse { .. })));

        let dir = write_dose_dir(&["2 1 1 0 2 0 1 0 1\n1\n"]);
        let result = DenseDoseMapParser::new().parse_from_file(&dir.path().join(MANIFEST_FILE));
        assert!(matches!(result, Err(PhantomError::Parse { .. })));
    }

    #[test]
    fn all_zero_map_is_empty() {
        let dir = write_dose_dir(&["2 1 1 0 2 0 1 0 1\n0 0\n"]);
        let result = DenseDoseMapParser::new().parse_from_file(&dir.path().join(MANIFEST_FILE));
        assert!(matches!(result, Err(PhantomError::EmptyMap { .. })));
    }

    #[test]
    fn missing_slice_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(MANIFEST_FILE), "1 absent.txt").unwrap();
        let result = DenseDoseMapParser::new().parse_from_file(&dir.path().join(MANIFEST_FILE));
        assert!(matches!(result, Err(PhantomError::FileNotFound { .. })));
    }
}
