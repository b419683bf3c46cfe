//! Voxelized phantom: merged grid header plus one material index per voxel.

use std::path::Path;
use std::time::Instant;

use tracing::{debug, info};

use crate::error::{PhantomError, PhantomResult};
use crate::index_codec::IndexCodec;
use crate::material::{MaterialCatalog, MaterialIndex};
use crate::parsers::manifest::{MANIFEST_FILE, Manifest};
use crate::utils::tokens::TokenReader;
use crate::voxel_grid::VoxelGridHeader;

/// Upper bound on capacity reserved ahead of reading a slice.
const RESERVE_HINT: usize = 1 << 20;

/// Accumulates slice files in stacking order.
#[derive(Debug, Default)]
pub struct PhantomBuilder {
    slice_headers: Vec<VoxelGridHeader>,
    material_ids: Vec<MaterialIndex>,
}

impl PhantomBuilder {
    /// Empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens `path` (plain or `.gz`) and ingests it as the next slice.
    pub fn ingest_slice_file(
        &mut self,
        path: &Path,
        catalog: &MaterialCatalog,
    ) -> PhantomResult<VoxelGridHeader> {
        let tokens = TokenReader::open(path)?;
        self.ingest_slice(tokens, catalog)
    }

    /// Reads one header and `header.voxel_count()` organ tags, appending the
    /// resolved material indices.
    pub fn ingest_slice(
        &mut self,
        mut tokens: TokenReader,
        catalog: &MaterialCatalog,
    ) -> PhantomResult<VoxelGridHeader> {
        let header = VoxelGridHeader::read_from(&mut tokens)?;
        let count = header.voxel_count();
        // The count is untrusted until the tags are actually read.
        self.material_ids.reserve(count.min(RESERVE_HINT));

        for _ in 0..count {
            let tag: u32 = tokens.next("organ tag")?;
            let index = catalog
                .material_index_for_tag(tag)
                .map_err(|_| PhantomError::UnknownTag {
                    tag,
                    file: Some(tokens.path().to_path_buf()),
                })?;
            self.material_ids.push(index);
        }

        debug!(
            file = %tokens.path().display(),
            shape = ?header.shape,
            zmin = header.min[2],
            zmax = header.max[2],
            "ingested slice"
        );
        self.slice_headers.push(header.clone());
        Ok(header)
    }

    /// Merges the slice headers and checks one material index per voxel.
    pub fn finish(self) -> PhantomResult<PhantomGeometry> {
        let header = merge_headers(&self.slice_headers)?;
        if self.material_ids.len() != header.voxel_count() {
            return Err(PhantomError::GeometryMismatch {
                axis: "z",
                reason: format!(
                    "{} voxels ingested but merged grid {:?} holds {}",
                    self.material_ids.len(),
                    header.shape,
                    header.voxel_count()
                ),
            });
        }

        Ok(PhantomGeometry {
            codec: header.codec(),
            header,
            slice_count: self.slice_headers.len(),
            material_ids: self.material_ids,
        })
    }
}

/// Merges slice headers stacked along z.
pub fn merge_headers(headers: &[VoxelGridHeader]) -> PhantomResult<VoxelGridHeader> {
    VoxelGridHeader::merge_all(headers)
}

/// Read-only after construction; share behind an `Arc`.
#[derive(Debug, Clone)]
pub struct PhantomGeometry {
    header: VoxelGridHeader,
    codec: IndexCodec,
    slice_count: usize,
    material_ids: Vec<MaterialIndex>,
}

impl PhantomGeometry {
    /// Reads `Data.dat` in `data_dir` and ingests every listed slice in order.
    pub fn build(data_dir: &Path, catalog: &MaterialCatalog) -> PhantomResult<Self> {
        let start = Instant::now();
        let manifest = Manifest::read_phantom(&data_dir.join(MANIFEST_FILE))?;
        debug!(
            compression = ?manifest.compression,
            files = manifest.files.len(),
            "phantom manifest read"
        );

        let mut builder = PhantomBuilder::new();
        for file in &manifest.files {
            builder.ingest_slice_file(file, catalog)?;
        }
        let geometry = builder.finish()?;

        let header = geometry.header();
        info!(
            shape = ?header.shape,
            half_extent = ?header.half_extent,
            voxels = header.voxel_count(),
            slices = geometry.slice_count,
            centre = ?geometry.container_centre(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "phantom geometry built"
        );
        Ok(geometry)
    }

    /// Merged grid header.
    pub fn header(&self) -> &VoxelGridHeader {
        &self.header
    }

    /// Index codec of the merged grid.
    pub fn codec(&self) -> IndexCodec {
        self.codec
    }

    /// Voxel counts [nx, ny, nz].
    pub fn shape(&self) -> [usize; 3] {
        self.header.shape
    }

    /// Number of slice files ingested.
    pub fn slice_count(&self) -> usize {
        self.slice_count
    }

    /// Material index of voxel (ix, iy, iz); `IndexOutOfRange` outside the grid.
    pub fn material_at(&self, ix: usize, iy: usize, iz: usize) -> PhantomResult<MaterialIndex> {
        let idx = self.codec.checked_encode(ix, iy, iz)?;
        Ok(self.material_ids[idx])
    }

    /// Material index per voxel, in linear index order.
    pub fn material_ids(&self) -> &[MaterialIndex] {
        &self.material_ids
    }

    /// Volume of one voxel (mm^3).
    pub fn voxel_volume(&self) -> f64 {
        self.header.voxel_volume()
    }

    /// Placement offset of the voxel container.
    pub fn container_centre(&self) -> [f64; 3] {
        self.header.centre()
    }

    /// Half size of the voxel container.
    pub fn container_half_size(&self) -> [f64; 3] {
        self.header.container_half_size()
    }

    /// Voxel containing a point, if any.
    pub fn voxel_at_position(&self, position: [f64; 3]) -> Option<[usize; 3]> {
        let pitch = self.header.pitch();
        let mut index = [0usize; 3];
        for axis in 0..3 {
            let offset = (position[axis] - self.header.min[axis]) / pitch[axis];
            if !(offset >= 0.0) {
                return None;
            }
            let i = offset.floor() as usize;
            if i >= self.header.shape[axis] {
                return None;
            }
            index[axis] = i;
        }
        Some(index)
    }
}
