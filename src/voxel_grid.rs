use serde::{Deserialize, Serialize};

use crate::error::{PhantomError, PhantomResult};
use crate::index_codec::IndexCodec;
use crate::utils::tokens::TokenReader;

const AXES: [&str; 3] = ["x", "y", "z"];

/// Axis along which slice files are stacked.
pub const STACK_AXIS: usize = 2;

/// Grid description of one slice file, or of several merged slices.
///
/// Voxels are laid out with x varying fastest, then y, then z
/// (`index = iz * nx * ny + iy * nx + ix`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoxelGridHeader {
    /// Voxel counts [nx, ny, nz]
    pub shape: [usize; 3],
    /// Half voxel size per axis (mm)
    pub half_extent: [f64; 3],
    /// Lower bound per axis (mm)
    pub min: [f64; 3],
    /// Upper bound per axis (mm)
    pub max: [f64; 3],
}

impl VoxelGridHeader {
    /// Builds a header from counts and bounds, deriving the half extents.
    pub fn new(shape: [usize; 3], min: [f64; 3], max: [f64; 3]) -> Result<Self, String> {
        let mut half_extent = [0.0; 3];
        for axis in 0..3 {
            if shape[axis] == 0 {
                return Err(format!("voxel count along {} must be positive", AXES[axis]));
            }
            if !(max[axis] > min[axis]) {
                return Err(format!(
                    "bounds along {} are empty: [{}, {}]",
                    AXES[axis], min[axis], max[axis]
                ));
            }
            half_extent[axis] = (max[axis] - min[axis]) / (2.0 * shape[axis] as f64);
        }
        if IndexCodec::checked_voxel_count(shape).is_none() {
            return Err(format!(
                "voxel counts {} x {} x {} overflow the voxel index",
                shape[0], shape[1], shape[2]
            ));
        }

        Ok(VoxelGridHeader {
            shape,
            half_extent,
            min,
            max,
        })
    }

    /// Reads `nx ny nz`, `xmin xmax`, `ymin ymax`, `zmin zmax`.
    pub fn read_from(tokens: &mut TokenReader) -> PhantomResult<Self> {
        let mut shape = [0usize; 3];
        for (axis, count) in shape.iter_mut().enumerate() {
            *count = tokens.next(&format!("voxel count n{}", AXES[axis]))?;
        }
        let mut min = [0.0; 3];
        let mut max = [0.0; 3];
        for axis in 0..3 {
            min[axis] = tokens.next(&format!("{}min", AXES[axis]))?;
            max[axis] = tokens.next(&format!("{}max", AXES[axis]))?;
        }

        VoxelGridHeader::new(shape, min, max)
            .map_err(|reason| PhantomError::parse(tokens.path(), "slice header", reason))
    }

    /// nx * ny * nz; bounded by the check in [`VoxelGridHeader::new`].
    pub fn voxel_count(&self) -> usize {
        self.shape[0] * self.shape[1] * self.shape[2]
    }

    /// Index codec for this grid.
    pub fn codec(&self) -> IndexCodec {
        IndexCodec::from_shape(self.shape)
    }

    /// Full voxel size per axis.
    pub fn pitch(&self) -> [f64; 3] {
        self.half_extent.map(|h| 2.0 * h)
    }

    /// Volume of one voxel (mm^3).
    pub fn voxel_volume(&self) -> f64 {
        8.0 * self.half_extent[0] * self.half_extent[1] * self.half_extent[2]
    }

    /// Midpoint of the bounds; where the voxel container is placed.
    pub fn centre(&self) -> [f64; 3] {
        [0usize, 1, 2].map(|axis| (self.min[axis] + self.max[axis]) / 2.0)
    }

    /// Half size of the box holding every voxel.
    pub fn container_half_size(&self) -> [f64; 3] {
        [0usize, 1, 2].map(|axis| self.shape[axis] as f64 * self.half_extent[axis])
    }

    /// Combines two slices stacked along z.
    ///
    /// x and y must agree exactly (counts, half extents, bounds). Along z the
    /// counts add up and the bounds widen, so the operation is associative
    /// and commutative.
    pub fn merge(&self, other: &VoxelGridHeader) -> PhantomResult<VoxelGridHeader> {
        for axis in (0..3).filter(|&a| a != STACK_AXIS) {
            let name = AXES[axis];
            if self.shape[axis] != other.shape[axis] {
                return Err(PhantomError::GeometryMismatch {
                    axis: name,
                    reason: format!(
                        "voxel count {} vs {}",
                        self.shape[axis], other.shape[axis]
                    ),
                });
            }
            if !same(self.half_extent[axis], other.half_extent[axis]) {
                return Err(PhantomError::GeometryMismatch {
                    axis: name,
                    reason: format!(
                        "half voxel size {} vs {}",
                        self.half_extent[axis], other.half_extent[axis]
                    ),
                });
            }
            if !same(self.min[axis], other.min[axis]) || !same(self.max[axis], other.max[axis]) {
                return Err(PhantomError::GeometryMismatch {
                    axis: name,
                    reason: format!(
                        "bounds [{}, {}] vs [{}, {}]",
                        self.min[axis], self.max[axis], other.min[axis], other.max[axis]
                    ),
                });
            }
        }

        let mut merged = self.clone();
        let z = STACK_AXIS;
        merged.shape[z] = self.shape[z]
            .checked_add(other.shape[z])
            .filter(|&nz| {
                let mut shape = self.shape;
                shape[z] = nz;
                IndexCodec::checked_voxel_count(shape).is_some()
            })
            .ok_or_else(|| PhantomError::GeometryMismatch {
                axis: AXES[z],
                reason: format!(
                    "stacking {} and {} slices overflows the voxel index",
                    self.shape[z], other.shape[z]
                ),
            })?;
        merged.min[z] = self.min[z].min(other.min[z]);
        merged.max[z] = self.max[z].max(other.max[z]);
        merged.half_extent[z] = (merged.max[z] - merged.min[z]) / (2.0 * merged.shape[z] as f64);
        Ok(merged)
    }

    /// Folds a non-empty sequence of slice headers into one.
    pub fn merge_all(headers: &[VoxelGridHeader]) -> PhantomResult<VoxelGridHeader> {
        let Some((first, rest)) = headers.split_first() else {
            return Err(PhantomError::GeometryMismatch {
                axis: AXES[STACK_AXIS],
                reason: "no slice headers to merge".to_string(),
            });
        };
        rest.iter()
            .try_fold(first.clone(), |merged, header| merged.merge(header))
    }
}

fn same(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-9 * a.abs().max(b.abs()).max(1.0)
}
