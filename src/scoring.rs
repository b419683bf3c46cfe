//! Step model and the channel-selection policy that turns steps into tally entries.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use ahash::AHashSet;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::{PhantomError, PhantomResult};
use crate::index_codec::IndexCodec;
use crate::material::MaterialIndex;
use crate::phantom::PhantomGeometry;
use crate::tally::{ChannelHandle, EnergyBins, TallyAccumulator};

/// Energy-deposit channel name.
pub const EDEP_CHANNEL: &str = "totalEDep";
/// Flux channels are `PhotonCellFlux00`, `PhotonCellFlux01`, ...
pub const FLUX_CHANNEL_PREFIX: &str = "PhotonCellFlux";

/// Particle species the scorer distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Species {
    Electron,
    Photon,
    Positron,
    Proton,
    Neutron,
    Alpha,
    /// Any ion or nucleus
    Nucleus,
}

impl Species {
    /// Canonical particle name.
    pub fn name(self) -> &'static str {
        match self {
            Species::Electron => "e-",
            Species::Photon => "gamma",
            Species::Positron => "e+",
            Species::Proton => "proton",
            Species::Neutron => "neutron",
            Species::Alpha => "alpha",
            Species::Nucleus => "nucleus",
        }
    }

    /// Ions and alphas; excluded from decay spectra.
    pub fn is_nucleus(self) -> bool {
        matches!(self, Species::Nucleus | Species::Alpha)
    }
}

impl fmt::Display for Species {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Species {
    type Err = PhantomError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "e-" | "electron" => Ok(Species::Electron),
            "gamma" | "photon" => Ok(Species::Photon),
            "e+" | "positron" => Ok(Species::Positron),
            "proton" => Ok(Species::Proton),
            "neutron" => Ok(Species::Neutron),
            "alpha" => Ok(Species::Alpha),
            "nucleus" | "GenericIon" => Ok(Species::Nucleus),
            other => Err(PhantomError::Config(format!("unknown particle species '{other}'"))),
        }
    }
}

impl TryFrom<String> for Species {
    type Error = PhantomError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Species> for String {
    fn from(species: Species) -> Self {
        species.name().to_string()
    }
}

/// Replica numbers by nesting depth plus the copy number of the pre-step volume.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Touchable {
    pub replicas: [i64; 3],
    pub copy_number: i64,
}

/// Track data needed by the decay-spectrum filter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackInfo {
    /// 1 for the primary
    pub track_id: u32,
    /// 1 on the first step of a track
    pub step_number: u32,
    pub creator_process: Option<String>,
}

/// One transport step as reported by the engine. Energies in keV, lengths in mm.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub species: Species,
    /// Pre-step kinetic energy
    pub kinetic_energy: f64,
    pub step_length: f64,
    pub energy_deposit: f64,
    pub weight: f64,
    /// Pre-step material
    pub material: MaterialIndex,
    pub position: [f64; 3],
    pub touchable: Touchable,
    pub track: TrackInfo,
}

impl Step {
    /// Step of unit weight with no length or deposit.
    pub fn new(species: Species, kinetic_energy: f64, material: MaterialIndex) -> Self {
        Step {
            species,
            kinetic_energy,
            step_length: 0.0,
            energy_deposit: 0.0,
            weight: 1.0,
            material,
            position: [0.0; 3],
            touchable: Touchable::default(),
            track: TrackInfo::default(),
        }
    }
}

/// Maps a step to the voxel it is scored in.
pub trait IndexResolver: Send + Sync {
    fn resolve(&self, step: &Step) -> Option<[usize; 3]>;
}

impl IndexResolver for Box<dyn IndexResolver> {
    fn resolve(&self, step: &Step) -> Option<[usize; 3]> {
        self.as_ref().resolve(step)
    }
}

fn non_negative(value: i64) -> Option<usize> {
    usize::try_from(value).ok()
}

/// Nested replicas: z slab at depth 0, x at depth 1, y at depth 2.
#[derive(Debug, Clone, Copy, Default)]
pub struct NestedReplicaResolver;

impl IndexResolver for NestedReplicaResolver {
    fn resolve(&self, step: &Step) -> Option<[usize; 3]> {
        let [iz, ix, iy] = step.touchable.replicas;
        Some([non_negative(ix)?, non_negative(iy)?, non_negative(iz)?])
    }
}

/// Copy number is the linear voxel index.
#[derive(Debug, Clone, Copy)]
pub struct CopyNumberResolver {
    codec: IndexCodec,
}

impl CopyNumberResolver {
    /// Resolver decoding copy numbers on `codec`.
    pub fn new(codec: IndexCodec) -> Self {
        CopyNumberResolver { codec }
    }
}

impl IndexResolver for CopyNumberResolver {
    fn resolve(&self, step: &Step) -> Option<[usize; 3]> {
        let idx = non_negative(step.touchable.copy_number)?;
        let (ix, iy, iz) = self.codec.checked_decode(idx).ok()?;
        Some([ix, iy, iz])
    }
}

/// Locates the pre-step position in the phantom grid.
#[derive(Debug, Clone)]
pub struct PositionResolver {
    geometry: Arc<PhantomGeometry>,
}

impl PositionResolver {
    /// Resolver over a shared phantom geometry.
    pub fn new(geometry: Arc<PhantomGeometry>) -> Self {
        PositionResolver { geometry }
    }
}

impl IndexResolver for PositionResolver {
    fn resolve(&self, step: &Step) -> Option<[usize; 3]> {
        self.geometry.voxel_at_position(step.position)
    }
}

/// Which `IndexResolver` a context builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolverKind {
    #[default]
    NestedReplica,
    CopyNumber,
    Position,
}

/// Handles of the channels a [`ScoringSetup`] registers.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoringChannels {
    pub edep: ChannelHandle,
    pub flux: Vec<ChannelHandle>,
}

/// Which steps count toward which channel. Shared read-only by all workers.
#[derive(Debug, Clone)]
pub struct ScoringSetup {
    codec: IndexCodec,
    bins: EnergyBins,
    flux_species: AHashSet<Species>,
    materials_of_interest: AHashSet<MaterialIndex>,
    voxel_volume: f64,
    weighted_flux: bool,
}

impl ScoringSetup {
    /// Filters and channel layout; `voxel_volume` must be positive.
    pub fn new(
        codec: IndexCodec,
        bins: EnergyBins,
        flux_species: impl IntoIterator<Item = Species>,
        materials_of_interest: impl IntoIterator<Item = MaterialIndex>,
        voxel_volume: f64,
        weighted_flux: bool,
    ) -> PhantomResult<Self> {
        if !(voxel_volume > 0.0) {
            return Err(PhantomError::Config(format!(
                "voxel volume must be positive, got {voxel_volume}"
            )));
        }
        Ok(ScoringSetup {
            codec,
            bins,
            flux_species: flux_species.into_iter().collect(),
            materials_of_interest: materials_of_interest.into_iter().collect(),
            voxel_volume,
            weighted_flux,
        })
    }

    /// Index codec of the scored grid.
    pub fn codec(&self) -> IndexCodec {
        self.codec
    }

    /// Flux energy bins.
    pub fn bins(&self) -> &EnergyBins {
        &self.bins
    }

    /// Volume dividing track length into flux (mm^3).
    pub fn voxel_volume(&self) -> f64 {
        self.voxel_volume
    }

    /// Whether `species` scores flux.
    pub fn accepts_species(&self, species: Species) -> bool {
        self.flux_species.contains(&species)
    }

    /// Whether steps in `material` score flux.
    pub fn is_material_of_interest(&self, material: MaterialIndex) -> bool {
        self.materials_of_interest.contains(&material)
    }

    /// Sorted, for logs and run metadata.
    pub fn flux_species(&self) -> Vec<Species> {
        let mut species: Vec<_> = self.flux_species.iter().copied().collect();
        species.sort();
        species
    }

    /// Materials scoring flux, sorted.
    pub fn materials_of_interest(&self) -> Vec<MaterialIndex> {
        let mut materials: Vec<_> = self.materials_of_interest.iter().copied().collect();
        materials.sort_unstable();
        materials
    }

    /// A fresh accumulator with `totalEDep` followed by one flux channel per
    /// energy bin. Every worker gets the same layout, so results merge.
    pub fn new_accumulator(&self) -> (TallyAccumulator, ScoringChannels) {
        let mut tally = TallyAccumulator::new(self.codec);
        let edep = tally.add_channel(EDEP_CHANNEL, None);
        let flux = tally.add_flux_channels(FLUX_CHANNEL_PREFIX, &self.bins);
        (tally, ScoringChannels { edep, flux })
    }
}

/// Applies the scoring policy of a [`ScoringSetup`] to steps, writing into
/// one worker-owned accumulator.
pub struct Scorer<R: IndexResolver = Box<dyn IndexResolver>> {
    setup: Arc<ScoringSetup>,
    resolver: R,
    tally: TallyAccumulator,
    channels: ScoringChannels,
}

impl<R: IndexResolver> Scorer<R> {
    /// Scorer with a fresh accumulator laid out by `setup`.
    pub fn new(setup: Arc<ScoringSetup>, resolver: R) -> Self {
        let (tally, channels) = setup.new_accumulator();
        Scorer {
            setup,
            resolver,
            tally,
            channels,
        }
    }

    /// Shared scoring configuration.
    pub fn setup(&self) -> &ScoringSetup {
        &self.setup
    }

    /// Handles of the registered channels.
    pub fn channels(&self) -> &ScoringChannels {
        &self.channels
    }

    /// Accumulated values.
    pub fn tally(&self) -> &TallyAccumulator {
        &self.tally
    }

    /// Clears all channels between runs.
    pub fn reset(&mut self) {
        self.tally.reset_all();
    }

    /// Gives up the accumulator for reduction.
    pub fn into_tally(self) -> TallyAccumulator {
        self.tally
    }

    /// Scores one step; returns how many channels received a contribution.
    ///
    /// Energy deposit is scored for every step with a nonzero deposit. Flux
    /// (`step_length / voxel_volume`, optionally weighted) goes to the bin
    /// holding the pre-step kinetic energy, for accepted species in materials
    /// of interest only.
    pub fn process_step(&mut self, step: &Step) -> usize {
        let Some([ix, iy, iz]) = self.resolver.resolve(step) else {
            trace!(touchable = ?step.touchable, "step outside the voxel grid skipped");
            return 0;
        };
        if !self.tally.codec().contains(ix, iy, iz) {
            trace!(index = ?[ix, iy, iz], "resolved voxel outside the grid skipped");
            return 0;
        }

        let mut scored = 0;
        if step.energy_deposit != 0.0
            && self
                .tally
                .accumulate(self.channels.edep, ix, iy, iz, step.energy_deposit, step.weight)
                .is_ok()
        {
            scored += 1;
        }

        if step.step_length == 0.0
            || !self.setup.accepts_species(step.species)
            || !self.setup.is_material_of_interest(step.material)
        {
            return scored;
        }
        let Some(bin) = self.setup.bins.bin_for(step.kinetic_energy) else {
            return scored;
        };

        let flux = step.step_length / self.setup.voxel_volume;
        let weight = if self.setup.weighted_flux { step.weight } else { 1.0 };
        if self
            .tally
            .accumulate(self.channels.flux[bin], ix, iy, iz, flux, weight)
            .is_ok()
        {
            scored += 1;
        }
        scored
    }
}
