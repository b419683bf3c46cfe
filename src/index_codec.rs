use serde::{Deserialize, Serialize};

use crate::error::{PhantomError, PhantomResult};

/// Linear index <-> (x, y, z) conversion for a grid of `nx * ny * nz` voxels.
///
/// Voxels are laid out with x varying fastest, then y, then z:
/// `idx = ix + iy * nx + iz * nx * ny`. Every component that addresses voxels
/// (geometry, source map, tallies) goes through this type so the layout is
/// defined once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexCodec {
    shape: [usize; 3],
}

impl IndexCodec {
    /// Codec for an `nx * ny * nz` grid.
    pub fn new(nx: usize, ny: usize, nz: usize) -> Self {
        IndexCodec {
            shape: [nx, ny, nz],
        }
    }

    /// Codec for `[nx, ny, nz]`.
    pub fn from_shape(shape: [usize; 3]) -> Self {
        IndexCodec { shape }
    }

    /// Voxel counts [nx, ny, nz].
    pub fn shape(&self) -> [usize; 3] {
        self.shape
    }

    /// Total number of voxels. Shapes come from validated headers, so the
    /// product fits in `usize`.
    pub fn voxel_count(&self) -> usize {
        self.shape[0] * self.shape[1] * self.shape[2]
    }

    /// `nx * ny * nz`, or `None` when the product overflows `usize`.
    pub fn checked_voxel_count(shape: [usize; 3]) -> Option<usize> {
        shape[0].checked_mul(shape[1])?.checked_mul(shape[2])
    }

    /// Whether (ix, iy, iz) lies inside the grid.
    pub fn contains(&self, ix: usize, iy: usize, iz: usize) -> bool {
        ix < self.shape[0] && iy < self.shape[1] && iz < self.shape[2]
    }

    /// Unchecked encode; callers must already know the voxel is inside the grid.
    #[inline]
    pub fn encode(&self, ix: usize, iy: usize, iz: usize) -> usize {
        let [nx, ny, _] = self.shape;
        ix + iy * nx + iz * nx * ny
    }

    /// Unchecked decode of a linear index.
    #[inline]
    pub fn decode(&self, idx: usize) -> (usize, usize, usize) {
        let [nx, ny, _] = self.shape;
        (idx % nx, (idx / nx) % ny, idx / (nx * ny))
    }

    /// Encode that fails with `IndexOutOfRange` outside the grid.
    pub fn checked_encode(&self, ix: usize, iy: usize, iz: usize) -> PhantomResult<usize> {
        if self.contains(ix, iy, iz) {
            Ok(self.encode(ix, iy, iz))
        } else {
            Err(PhantomError::IndexOutOfRange {
                index: [ix, iy, iz],
                shape: self.shape,
            })
        }
    }

    /// Decode that fails with `IndexOutOfRange` past the last voxel.
    pub fn checked_decode(&self, idx: usize) -> PhantomResult<(usize, usize, usize)> {
        if Self::checked_voxel_count(self.shape).is_none_or(|count| idx < count) {
            Ok(self.decode(idx))
        } else {
            let (ix, iy, iz) = self.decode(idx);
            Err(PhantomError::IndexOutOfRange {
                index: [ix, iy, iz],
                shape: self.shape,
            })
        }
    }
}
