use std::path::Path;

use tracing::debug;

use crate::error::{PhantomError, PhantomResult};
use crate::index_codec::IndexCodec;
use crate::source::{ProbabilityMap, SourceGrid, SourceMode};
use crate::utils::parser::DoseMapParser;
use crate::utils::tokens::TokenReader;

/// Pre-accumulated dose map (`SparseDoseMap.g4d`).
///
/// Layout: `nx ny nz nz_bounds`, `xmin xmax`, `ymin ymax`, `zmin zmax`, then
/// `(voxel index, cumulative probability)` pairs until end of file.
/// `nz_bounds` is the number of z slices the z bounds describe; 0 means `nz`.
pub struct SparseDoseMapParser;

impl SparseDoseMapParser {
    /// Creates the parser.
    pub fn new() -> Self {
        SparseDoseMapParser
    }

    fn read_grid(tokens: &mut TokenReader) -> PhantomResult<SourceGrid> {
        let mut shape = [0usize; 3];
        for (axis, name) in ["nx", "ny", "nz"].into_iter().enumerate() {
            shape[axis] = tokens.next(name)?;
        }
        let z_divisions: usize = tokens.next("z slice count")?;

        let mut min = [0.0f64; 3];
        let mut max = [0.0f64; 3];
        for (axis, name) in ["x", "y", "z"].into_iter().enumerate() {
            min[axis] = tokens.next(&format!("{name}min"))?;
            max[axis] = tokens.next(&format!("{name}max"))?;
        }

        let divisions = [
            shape[0],
            shape[1],
            if z_divisions == 0 { shape[2] } else { z_divisions },
        ];
        for axis in 0..3 {
            if shape[axis] == 0 || divisions[axis] == 0 {
                return Err(PhantomError::parse(
                    tokens.path(),
                    "sparse header",
                    "voxel counts must be positive",
                ));
            }
            if !(max[axis] > min[axis]) {
                return Err(PhantomError::parse(
                    tokens.path(),
                    "sparse header",
                    format!("empty bounds [{}, {}] on axis {axis}", min[axis], max[axis]),
                ));
            }
        }

        if IndexCodec::checked_voxel_count(shape).is_none() {
            return Err(PhantomError::parse(
                tokens.path(),
                "sparse header",
                format!("voxel counts {shape:?} overflow the voxel index"),
            ));
        }

        let pitch = [0usize, 1, 2].map(|axis| (max[axis] - min[axis]) / divisions[axis] as f64);
        Ok(SourceGrid {
            shape,
            pitch,
            origin: [0usize, 1, 2].map(|axis| min[axis] + pitch[axis] / 2.0),
        })
    }
}

impl Default for SparseDoseMapParser {
    fn default() -> Self {
        Self::new()
    }
}

impl DoseMapParser for SparseDoseMapParser {
    fn supported_extensions(&self) -> Vec<&'static str> {
        vec!["g4d"]
    }

    fn mode(&self) -> SourceMode {
        SourceMode::Sparse
    }

    fn name(&self) -> &'static str {
        "Sparse dose map"
    }

    fn parse_from_file(&self, file_path: &Path) -> PhantomResult<ProbabilityMap> {
        let mut tokens = TokenReader::open(file_path)?;
        let grid = Self::read_grid(&mut tokens)?;

        let mut entries: Vec<(f64, usize)> = Vec::new();
        while let Some(voxel) = tokens.try_next::<usize>("voxel index")? {
            let key: f64 = tokens.next("cumulative probability")?;
            if key > 0.0 {
                entries.push((key, voxel));
            }
        }

        // Keys form an ordered map: sort, and a repeated key keeps its last voxel.
        entries.sort_by(|a, b| a.0.total_cmp(&b.0));
        let mut deduped: Vec<(f64, usize)> = Vec::with_capacity(entries.len());
        for entry in entries {
            match deduped.last_mut() {
                Some(last) if last.0 == entry.0 => *last = entry,
                _ => deduped.push(entry),
            }
        }
        debug!(
            file = %file_path.display(),
            shape = ?grid.shape,
            pairs = deduped.len(),
            "sparse dose map read"
        );

        ProbabilityMap::from_normalized(grid, deduped, file_path)
    }

    fn read_grid_from_file(&self, file_path: &Path) -> PhantomResult<SourceGrid> {
        let mut tokens = TokenReader::open(file_path)?;
        Self::read_grid(&mut tokens)
    }
}
