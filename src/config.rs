//! Run configuration
//!
//! Loaded in three layers: TOML file, then `VOXEL_PHANTOM_*` environment
//! variables, then CLI flags (applied by the binary). Relative paths are
//! resolved against the directory of the configuration file.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PhantomError, PhantomResult};
use crate::scoring::{ResolverKind, Species};
use crate::source::{SolidAngle, SourceMode};

/// Overrides `phantom.data_dir`.
pub const ENV_DATA_DIR: &str = "VOXEL_PHANTOM_DATA_DIR";
/// Overrides `source.path`.
pub const ENV_SOURCE: &str = "VOXEL_PHANTOM_SOURCE";
/// Overrides `output.dir`.
pub const ENV_OUTPUT_DIR: &str = "VOXEL_PHANTOM_OUTPUT_DIR";
/// Overrides `run.workers`.
pub const ENV_WORKERS: &str = "VOXEL_PHANTOM_WORKERS";
/// Overrides `run.log_level`.
pub const ENV_LOG_LEVEL: &str = "VOXEL_PHANTOM_LOG_LEVEL";

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct PhantomConfig {
    pub phantom: PhantomSection,
    pub source: SourceSection,
    pub scoring: ScoringSection,
    pub output: OutputSection,
    pub run: RunSection,
}

/// Phantom data directory: `ECompDensity.txt`, `OrgantagvsName.txt`,
/// `Data.dat` and the slice files it lists
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct PhantomSection {
    pub data_dir: PathBuf,
}

impl Default for PhantomSection {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("phantom"),
        }
    }
}

/// `[source]`: source map and emission wedge.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SourceSection {
    /// Dense `Data.dat` manifest or sparse `.g4d` map
    pub path: PathBuf,
    pub mode: SourceMode,
    /// Polar angle range in degrees
    pub polar_deg: [f64; 2],
    /// Azimuth range in degrees
    pub azimuth_deg: [f64; 2],
}

impl Default for SourceSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from("source/Data.dat"),
            mode: SourceMode::Auto,
            polar_deg: [0.0, 180.0],
            azimuth_deg: [0.0, 360.0],
        }
    }
}

impl SourceSection {
    /// Emission wedge in radians.
    pub fn solid_angle(&self) -> SolidAngle {
        SolidAngle::from_degrees(self.polar_deg, self.azimuth_deg)
    }
}

/// Scoring inputs; list files are relative to `phantom.data_dir`
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ScoringSection {
    /// Upper edges of the flux energy bins (keV)
    pub energy_bins: PathBuf,
    /// Organ tags whose voxels score flux
    pub materials_of_interest: Option<PathBuf>,
    /// Organ names whose voxels score flux
    pub material_names_of_interest: Option<PathBuf>,
    pub species: Vec<String>,
    /// Replaces `species` when set
    pub species_file: Option<PathBuf>,
    pub weighted_flux: bool,
    pub resolver: ResolverKind,
}

impl Default for ScoringSection {
    fn default() -> Self {
        Self {
            energy_bins: PathBuf::from("Energybin1.txt"),
            materials_of_interest: Some(PathBuf::from("OrgantagOfInterest.txt")),
            material_names_of_interest: None,
            species: vec!["gamma".to_string()],
            species_file: None,
            weighted_flux: true,
            resolver: ResolverKind::NestedReplica,
        }
    }
}

/// Area unit of exported flux.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FluxUnit {
    #[default]
    PerCm2,
    PerMm2,
}

impl FluxUnit {
    /// Multiplier from the internal mm⁻² to this unit.
    pub fn scale(self) -> f64 {
        match self {
            FluxUnit::PerCm2 => 100.0,
            FluxUnit::PerMm2 => 1.0,
        }
    }

    /// Unit string written into datasets.
    pub fn label(self) -> &'static str {
        match self {
            FluxUnit::PerCm2 => "cm-2",
            FluxUnit::PerMm2 => "mm-2",
        }
    }
}

/// `[output]`: export target and format.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct OutputSection {
    pub dir: PathBuf,
    /// Also write little-endian `.bin` datasets
    pub binary: bool,
    pub flux_unit: FluxUnit,
}

impl Default for OutputSection {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("output"),
            binary: false,
            flux_unit: FluxUnit::PerCm2,
        }
    }
}

/// `[run]`: workers, seed and log level.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RunSection {
    pub workers: usize,
    pub seed: u64,
    pub log_level: String,
}

impl Default for RunSection {
    fn default() -> Self {
        Self {
            workers: 4,
            seed: 12345,
            log_level: "info".to_string(),
        }
    }
}

impl PhantomConfig {
    /// Parses TOML; missing sections take their defaults.
    pub fn from_toml_str(content: &str) -> PhantomResult<Self> {
        toml::from_str(content).map_err(|e| PhantomError::Config(format!("invalid TOML: {e}")))
    }

    /// Flux species from `species_file` if set, otherwise from `species`.
    pub fn flux_species(&self) -> PhantomResult<Vec<Species>> {
        let names = match &self.scoring.species_file {
            Some(path) => crate::parsers::lists::read_name_list(path)?,
            None => self.scoring.species.clone(),
        };
        names.iter().map(|name| name.parse()).collect()
    }
}

/// Loads `config_path`, applies environment overrides, resolves relative
/// paths and validates.
pub fn load_config(config_path: &Path) -> PhantomResult<PhantomConfig> {
    load_config_with(config_path, |key| std::env::var(key).ok())
}

/// [`load_config`] with an explicit variable lookup.
pub fn load_config_with<F>(config_path: &Path, lookup: F) -> PhantomResult<PhantomConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let content = fs::read_to_string(config_path).map_err(|source| PhantomError::FileNotFound {
        path: config_path.to_path_buf(),
        source,
    })?;
    let mut config = PhantomConfig::from_toml_str(&content)?;

    apply_overrides_from(&mut config, lookup);

    let base = config_path.parent().unwrap_or_else(|| Path::new("."));
    resolve_relative(&mut config, base);
    validate(&config)?;

    debug!(config = %config_path.display(), ?config, "configuration loaded");
    Ok(config)
}

/// Supported variables:
/// - `VOXEL_PHANTOM_DATA_DIR` -> `phantom.data_dir`
/// - `VOXEL_PHANTOM_SOURCE` -> `source.path`
/// - `VOXEL_PHANTOM_OUTPUT_DIR` -> `output.dir`
/// - `VOXEL_PHANTOM_WORKERS` -> `run.workers` (ignored unless a number)
/// - `VOXEL_PHANTOM_LOG_LEVEL` -> `run.log_level`
pub fn apply_overrides_from<F>(config: &mut PhantomConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = lookup(ENV_DATA_DIR) {
        config.phantom.data_dir = PathBuf::from(value);
    }
    if let Some(value) = lookup(ENV_SOURCE) {
        config.source.path = PathBuf::from(value);
    }
    if let Some(value) = lookup(ENV_OUTPUT_DIR) {
        config.output.dir = PathBuf::from(value);
    }
    if let Some(value) = lookup(ENV_WORKERS) {
        if let Ok(workers) = value.parse::<usize>() {
            config.run.workers = workers;
        }
    }
    if let Some(value) = lookup(ENV_LOG_LEVEL) {
        config.run.log_level = value;
    }
}

fn rebase(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

/// Anchors relative paths: data, source and output at `base`, scoring lists
/// at the (anchored) data directory.
pub fn resolve_relative(config: &mut PhantomConfig, base: &Path) {
    rebase(&mut config.phantom.data_dir, base);
    rebase(&mut config.source.path, base);
    rebase(&mut config.output.dir, base);

    let data_dir = config.phantom.data_dir.clone();
    let scoring = &mut config.scoring;
    rebase(&mut scoring.energy_bins, &data_dir);
    for path in [
        &mut scoring.materials_of_interest,
        &mut scoring.material_names_of_interest,
        &mut scoring.species_file,
    ]
    .into_iter()
    .flatten()
    {
        rebase(path, &data_dir);
    }
}

/// Collects every problem before failing.
pub fn validate(config: &PhantomConfig) -> PhantomResult<()> {
    let mut errors = Vec::new();

    if config.run.workers == 0 {
        errors.push("run.workers must be at least 1".to_string());
    }
    if config.run.log_level.trim().is_empty() {
        errors.push("run.log_level must not be empty".to_string());
    }

    let [polar_min, polar_max] = config.source.polar_deg;
    if !(0.0 <= polar_min && polar_min < polar_max && polar_max <= 180.0) {
        errors.push(format!(
            "source.polar_deg [{polar_min}, {polar_max}] must satisfy 0 <= min < max <= 180"
        ));
    }
    let [azimuth_min, azimuth_max] = config.source.azimuth_deg;
    if !(0.0 <= azimuth_min && azimuth_min < azimuth_max && azimuth_max <= 360.0) {
        errors.push(format!(
            "source.azimuth_deg [{azimuth_min}, {azimuth_max}] must satisfy 0 <= min < max <= 360"
        ));
    }

    if config.scoring.species_file.is_none() {
        if config.scoring.species.is_empty() {
            errors.push("scoring.species must name at least one particle".to_string());
        }
        for name in &config.scoring.species {
            if name.parse::<Species>().is_err() {
                errors.push(format!("scoring.species: unknown particle '{name}'"));
            }
        }
    }

    if errors.is_empty() {
        return Ok(());
    }
    let messages = errors
        .iter()
        .map(|e| format!("  - {e}"))
        .collect::<Vec<_>>()
        .join("\n");
    Err(PhantomError::Config(format!("validation failed:\n{messages}")))
}
