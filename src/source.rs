//! Source-intensity map, inverse-CDF position sampling and direction sampling.

use std::f64::consts::PI;
use std::path::Path;
use std::sync::Arc;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{PhantomError, PhantomResult};
use crate::index_codec::IndexCodec;
use crate::parsers::{DenseDoseMapParser, SparseDoseMapParser};
use crate::utils::parser::DoseMapParser;
use crate::voxel_grid::VoxelGridHeader;

/// How the source map file is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceMode {
    /// Pick the reader from the file extension.
    #[default]
    Auto,
    /// Manifest of per-slice intensity files.
    Dense,
    /// One pre-accumulated cumulative map.
    Sparse,
}

/// Grid metadata of a source map. `origin` is the centre of voxel (0, 0, 0).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SourceGrid {
    pub shape: [usize; 3],
    pub pitch: [f64; 3],
    pub origin: [f64; 3],
}

impl SourceGrid {
    /// Grid of a dose slice header: pitch from the half extents, origin at the first voxel centre.
    pub fn from_header(header: &VoxelGridHeader) -> Self {
        let pitch = header.pitch();
        SourceGrid {
            shape: header.shape,
            pitch,
            origin: [0usize, 1, 2].map(|axis| header.min[axis] + pitch[axis] / 2.0),
        }
    }

    /// Index codec of the source grid.
    pub fn codec(&self) -> IndexCodec {
        IndexCodec::from_shape(self.shape)
    }

    /// Centre of voxel (ix, iy, iz).
    pub fn voxel_centre(&self, ix: usize, iy: usize, iz: usize) -> [f64; 3] {
        let index = [ix, iy, iz];
        [0usize, 1, 2].map(|axis| self.origin[axis] + self.pitch[axis] * index[axis] as f64)
    }
}

/// Cumulative distribution over voxels with positive source intensity.
///
/// Keys are strictly increasing and end at exactly 1.0. Immutable after
/// construction, so one map can be shared by every worker.
#[derive(Debug, Clone)]
pub struct ProbabilityMap {
    grid: SourceGrid,
    keys: Vec<f64>,
    voxels: Vec<usize>,
}

impl ProbabilityMap {
    /// Reads a dense manifest: per-slice intensity files, normalized by the
    /// grand total.
    pub fn build_dense(manifest: &Path) -> PhantomResult<Self> {
        DenseDoseMapParser::new().parse_from_file(manifest)
    }

    /// Reads a sparse `(voxel, cumulative probability)` file.
    pub fn build_sparse(path: &Path) -> PhantomResult<Self> {
        SparseDoseMapParser::new().parse_from_file(path)
    }

    /// Builds the map from `(cumulative mass, voxel)` pairs in insertion
    /// order and rescales by the final key.
    pub fn from_cumulative(
        grid: SourceGrid,
        entries: Vec<(f64, usize)>,
        source: &Path,
    ) -> PhantomResult<Self> {
        let Some(&(total, _)) = entries.last() else {
            return Err(PhantomError::EmptyMap {
                reason: format!("{} has no voxel with positive probability", source.display()),
            });
        };

        let voxel_count = grid.codec().voxel_count();
        let mut previous = 0.0;
        for &(key, voxel) in &entries {
            if !key.is_finite() || key <= previous {
                return Err(PhantomError::integrity(
                    source,
                    format!("cumulative key {key} does not exceed the previous key {previous}"),
                ));
            }
            if voxel >= voxel_count {
                return Err(PhantomError::integrity(
                    source,
                    format!("voxel index {voxel} is outside a grid of {voxel_count} voxels"),
                ));
            }
            previous = key;
        }

        let (keys, voxels): (Vec<f64>, Vec<usize>) = entries
            .into_iter()
            .map(|(key, voxel)| (key / total, voxel))
            .unzip();

        let map = ProbabilityMap { grid, keys, voxels };
        info!(
            source = %source.display(),
            shape = ?grid.shape,
            pitch = ?grid.pitch,
            origin = ?grid.origin,
            entries = map.len(),
            total,
            "source probability map built"
        );
        Ok(map)
    }

    /// Like [`ProbabilityMap::from_cumulative`], but warns when the input
    /// claims to be normalized and is not.
    pub fn from_normalized(
        grid: SourceGrid,
        entries: Vec<(f64, usize)>,
        source: &Path,
    ) -> PhantomResult<Self> {
        if let Some(&(last, _)) = entries.last() {
            if (last - 1.0).abs() > 1e-6 {
                warn!(
                    source = %source.display(),
                    final_key = last,
                    "cumulative map does not end at 1.0; renormalizing"
                );
            }
        }
        Self::from_cumulative(grid, entries, source)
    }

    /// Grid metadata used to place sampled voxels.
    pub fn grid(&self) -> &SourceGrid {
        &self.grid
    }

    /// Number of voxels with positive probability.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Largest cumulative key; 1.0 after construction.
    pub fn max_key(&self) -> Option<f64> {
        self.keys.last().copied()
    }

    /// `(cumulative key, voxel index)` pairs in key order.
    pub fn entries(&self) -> impl Iterator<Item = (f64, usize)> + '_ {
        self.keys.iter().copied().zip(self.voxels.iter().copied())
    }

    /// Voxel of the smallest key strictly greater than `variate`.
    pub fn sample_voxel(&self, variate: f64) -> PhantomResult<usize> {
        if !(0.0..1.0).contains(&variate) {
            return Err(PhantomError::EmptyMap {
                reason: format!("variate {variate} is outside [0, 1)"),
            });
        }
        let slot = self.keys.partition_point(|&key| key <= variate);
        self.voxels
            .get(slot)
            .copied()
            .ok_or_else(|| PhantomError::EmptyMap {
                reason: format!("no cumulative key exceeds variate {variate}"),
            })
    }

    /// Voxel-centre coordinates of the sampled voxel.
    pub fn sample_position(&self, variate: f64) -> PhantomResult<[f64; 3]> {
        let voxel = self.sample_voxel(variate)?;
        let (ix, iy, iz) = self.grid.codec().decode(voxel);
        Ok(self.grid.voxel_centre(ix, iy, iz))
    }
}

/// Angular wedge for emission directions, in radians.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SolidAngle {
    pub theta_min: f64,
    pub theta_max: f64,
    pub phi_min: f64,
    pub phi_max: f64,
}

impl SolidAngle {
    /// Wedge from polar and azimuth ranges in degrees.
    pub fn from_degrees(polar: [f64; 2], azimuth: [f64; 2]) -> Self {
        SolidAngle {
            theta_min: polar[0].to_radians(),
            theta_max: polar[1].to_radians(),
            phi_min: azimuth[0].to_radians(),
            phi_max: azimuth[1].to_radians(),
        }
    }
}

impl Default for SolidAngle {
    fn default() -> Self {
        SolidAngle {
            theta_min: 0.0,
            theta_max: PI,
            phi_min: 0.0,
            phi_max: 2.0 * PI,
        }
    }
}

/// Direction uniformly distributed over `wedge`, from two variates in [0, 1).
///
/// The vector points inward: `(-sinθ cosφ, -sinθ sinφ, -cosθ)`.
pub fn generate_isotropic_direction(r1: f64, r2: f64, wedge: &SolidAngle) -> [f64; 3] {
    let cos_min = wedge.theta_min.cos();
    let cos_theta = cos_min - r1 * (cos_min - wedge.theta_max.cos());
    let sin_theta = (1.0 - cos_theta * cos_theta).max(0.0).sqrt();
    let phi = wedge.phi_min + r2 * (wedge.phi_max - wedge.phi_min);

    let direction = [-sin_theta * phi.cos(), -sin_theta * phi.sin(), -cos_theta];
    let norm = direction.iter().map(|c| c * c).sum::<f64>().sqrt();
    direction.map(|c| c / norm)
}

/// Sampled position and direction of one primary.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PrimaryVertex {
    pub voxel: usize,
    pub position: [f64; 3],
    pub direction: [f64; 3],
}

/// Combines position and direction sampling for one primary.
#[derive(Debug, Clone)]
pub struct SourceSampler {
    map: Arc<ProbabilityMap>,
    wedge: SolidAngle,
}

impl SourceSampler {
    /// Sampler over a shared map; cheap to create per worker.
    pub fn new(map: Arc<ProbabilityMap>, wedge: SolidAngle) -> Self {
        SourceSampler { map, wedge }
    }

    /// The shared probability map.
    pub fn map(&self) -> &ProbabilityMap {
        &self.map
    }

    /// Draws three variates from `rng`: one for the voxel, two for the direction.
    pub fn generate<R: Rng + ?Sized>(&self, rng: &mut R) -> PhantomResult<PrimaryVertex> {
        let voxel = self.map.sample_voxel(rng.gen_range(0.0..1.0))?;
        let (ix, iy, iz) = self.map.grid().codec().decode(voxel);
        let position = self.map.grid().voxel_centre(ix, iy, iz);
        let direction = generate_isotropic_direction(
            rng.gen_range(0.0..1.0),
            rng.gen_range(0.0..1.0),
            &self.wedge,
        );
        Ok(PrimaryVertex {
            voxel,
            position,
            direction,
        })
    }
}
