use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{info, warn};

use crate::config::PhantomConfig;
use crate::error::PhantomResult;
use crate::material::{MaterialCatalog, MaterialIndex};
use crate::parser_registry::ParserRegistry;
use crate::parsers::lists::{read_energy_bins, read_name_list, read_tag_list};
use crate::phantom::PhantomGeometry;
use crate::scoring::{
    CopyNumberResolver, IndexResolver, NestedReplicaResolver, PositionResolver, ResolverKind,
    ScoringSetup, Species,
};
use crate::source::{ProbabilityMap, SolidAngle, SourceGrid, SourceSampler};
use crate::tally::{EnergyBin, EnergyBins};
use crate::voxel_grid::VoxelGridHeader;

/// Immutable setup shared by every worker; passed explicitly, never global
#[derive(Debug, Clone)]
pub struct PhantomContext {
    pub catalog: Arc<MaterialCatalog>,
    pub geometry: Arc<PhantomGeometry>,
    pub source: Arc<ProbabilityMap>,
    pub wedge: SolidAngle,
    pub scoring: Arc<ScoringSetup>,
    pub resolver: ResolverKind,
}

impl PhantomContext {
    /// Catalog, then geometry, then source map, then scoring setup.
    pub fn build(config: &PhantomConfig) -> PhantomResult<Self> {
        let start = Instant::now();
        let data_dir = &config.phantom.data_dir;

        let catalog = MaterialCatalog::load_from_dir(data_dir)?;
        let geometry = PhantomGeometry::build(data_dir, &catalog)?;
        let source = ParserRegistry::new().load(&config.source.path, config.source.mode)?;
        if source.grid().shape != geometry.shape() {
            warn!(
                source = ?source.grid().shape,
                phantom = ?geometry.shape(),
                "source map and phantom grids differ in shape"
            );
        }

        let scoring = Self::scoring_setup(config, &catalog, &geometry)?;

        let context = PhantomContext {
            catalog: Arc::new(catalog),
            geometry: Arc::new(geometry),
            source: Arc::new(source),
            wedge: config.source.solid_angle(),
            scoring: Arc::new(scoring),
            resolver: config.scoring.resolver,
        };
        info!(
            materials = context.catalog.len(),
            voxels = context.geometry.header().voxel_count(),
            source_entries = context.source.len(),
            energy_bins = context.scoring.bins().len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "phantom context ready"
        );
        Ok(context)
    }

    fn scoring_setup(
        config: &PhantomConfig,
        catalog: &MaterialCatalog,
        geometry: &PhantomGeometry,
    ) -> PhantomResult<ScoringSetup> {
        let scoring = &config.scoring;
        let bins = EnergyBins::from_upper_edges(read_energy_bins(&scoring.energy_bins)?)?;

        let mut materials: Vec<MaterialIndex> = Vec::new();
        if let Some(path) = &scoring.materials_of_interest {
            materials.extend(catalog.materials_of_interest(&read_tag_list(path)?)?);
        }
        if let Some(path) = &scoring.material_names_of_interest {
            materials.extend(catalog.materials_named(&read_name_list(path)?)?);
        }
        if materials.is_empty() {
            warn!("no materials of interest configured; flux channels will stay empty");
        }

        let species = config.flux_species()?;
        let setup = ScoringSetup::new(
            geometry.codec(),
            bins,
            species,
            materials,
            geometry.voxel_volume(),
            scoring.weighted_flux,
        )?;
        info!(
            species = ?setup.flux_species(),
            materials_of_interest = ?setup.materials_of_interest(),
            voxel_volume = setup.voxel_volume(),
            weighted = scoring.weighted_flux,
            "scoring configured"
        );
        Ok(setup)
    }

    /// A per-worker sampler over the shared source map.
    pub fn sampler(&self) -> SourceSampler {
        SourceSampler::new(Arc::clone(&self.source), self.wedge)
    }

    /// The index-resolution strategy matching the transport geometry.
    pub fn resolver(&self) -> Box<dyn IndexResolver> {
        match self.resolver {
            ResolverKind::NestedReplica => Box::new(NestedReplicaResolver),
            ResolverKind::CopyNumber => Box::new(CopyNumberResolver::new(self.geometry.codec())),
            ResolverKind::Position => Box::new(PositionResolver::new(Arc::clone(&self.geometry))),
        }
    }

    /// Setup summary printed by `inspect`.
    pub fn summary(&self) -> ContextSummary {
        ContextSummary {
            phantom: self.geometry.header().clone(),
            slices: self.geometry.slice_count(),
            voxel_volume: self.geometry.voxel_volume(),
            container_centre: self.geometry.container_centre(),
            materials: self
                .catalog
                .materials()
                .iter()
                .enumerate()
                .map(|(index, m)| MaterialSummary {
                    index,
                    organ_tag: m.organ_tag,
                    name: m.name.clone(),
                    density: m.density,
                })
                .collect(),
            source: *self.source.grid(),
            source_entries: self.source.len(),
            energy_bins: self.scoring.bins().iter().collect(),
            flux_species: self.scoring.flux_species(),
            materials_of_interest: self.scoring.materials_of_interest(),
        }
    }
}

/// One catalog entry in the summary.
#[derive(Debug, Clone, Serialize)]
pub struct MaterialSummary {
    pub index: MaterialIndex,
    pub organ_tag: u32,
    pub name: String,
    pub density: f64,
}

/// What `inspect` prints.
#[derive(Debug, Clone, Serialize)]
pub struct ContextSummary {
    pub phantom: VoxelGridHeader,
    pub slices: usize,
    pub voxel_volume: f64,
    pub container_centre: [f64; 3],
    pub materials: Vec<MaterialSummary>,
    pub source: SourceGrid,
    pub source_entries: usize,
    pub energy_bins: Vec<EnergyBin>,
    pub flux_species: Vec<Species>,
    pub materials_of_interest: Vec<MaterialIndex>,
}
