//! Sparse per-voxel tallies: one hash map per channel, keyed by linear voxel index.

use std::collections::BTreeMap;
use std::fmt;

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

use crate::error::{PhantomError, PhantomResult};
use crate::index_codec::IndexCodec;

/// Opaque reference to a registered channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelHandle(usize);

impl ChannelHandle {
    /// Position of the channel in registration order.
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Half-open kinetic-energy interval `[low, high)` in keV.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EnergyBin {
    pub low: f64,
    pub high: f64,
}

impl EnergyBin {
    /// `low <= energy < high`.
    pub fn contains(&self, energy: f64) -> bool {
        energy >= self.low && energy < self.high
    }
}

/// Contiguous energy bins built from upper edges; the first bin starts at 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnergyBins {
    upper_edges: Vec<f64>,
}

impl EnergyBins {
    /// Bins from strictly increasing upper edges; the first bin starts at 0.
    pub fn from_upper_edges(upper_edges: Vec<f64>) -> PhantomResult<Self> {
        if upper_edges.is_empty() {
            return Err(PhantomError::Config("at least one energy bin is required".into()));
        }
        let mut low = 0.0;
        for &edge in &upper_edges {
            if !(edge > low) || !edge.is_finite() {
                return Err(PhantomError::Config(format!(
                    "energy bin edge {edge} does not exceed {low}"
                )));
            }
            low = edge;
        }
        Ok(EnergyBins { upper_edges })
    }

    /// Number of bins.
    pub fn len(&self) -> usize {
        self.upper_edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.upper_edges.is_empty()
    }

    /// Bin `i`, if any.
    pub fn bin(&self, i: usize) -> Option<EnergyBin> {
        let high = *self.upper_edges.get(i)?;
        let low = if i == 0 { 0.0 } else { self.upper_edges[i - 1] };
        Some(EnergyBin { low, high })
    }

    /// Bins in ascending energy.
    pub fn iter(&self) -> impl Iterator<Item = EnergyBin> + '_ {
        (0..self.len()).filter_map(|i| self.bin(i))
    }

    /// Bin index holding `energy`, if it lies in `[0, last edge)`.
    pub fn bin_for(&self, energy: f64) -> Option<usize> {
        if !(energy >= 0.0) {
            return None;
        }
        let i = self.upper_edges.partition_point(|&edge| edge <= energy);
        (i < self.upper_edges.len()).then_some(i)
    }
}

/// Registration data of one channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelInfo {
    pub name: String,
    pub bin: Option<EnergyBin>,
}

#[derive(Debug, Clone)]
struct Channel {
    info: ChannelInfo,
    values: AHashMap<usize, f64>,
}

/// Per-worker tally store.
///
/// Absent keys mean zero. Not shared across threads; workers merge at end
/// of run.
#[derive(Debug, Clone)]
pub struct TallyAccumulator {
    codec: IndexCodec,
    channels: Vec<Channel>,
}

impl TallyAccumulator {
    /// Accumulator with no channels over `codec`'s grid.
    pub fn new(codec: IndexCodec) -> Self {
        TallyAccumulator {
            codec,
            channels: Vec::new(),
        }
    }

    /// Index codec used to key the entries.
    pub fn codec(&self) -> IndexCodec {
        self.codec
    }

    /// Registers a channel; handles are dense and start at 0.
    pub fn add_channel(&mut self, name: impl Into<String>, bin: Option<EnergyBin>) -> ChannelHandle {
        let handle = ChannelHandle(self.channels.len());
        self.channels.push(Channel {
            info: ChannelInfo {
                name: name.into(),
                bin,
            },
            values: AHashMap::new(),
        });
        handle
    }

    /// One channel per bin, named `{prefix}00`, `{prefix}01`, ...
    pub fn add_flux_channels(&mut self, prefix: &str, bins: &EnergyBins) -> Vec<ChannelHandle> {
        bins.iter()
            .enumerate()
            .map(|(i, bin)| self.add_channel(format!("{prefix}{i:02}"), Some(bin)))
            .collect()
    }

    fn channel(&self, handle: ChannelHandle) -> PhantomResult<&Channel> {
        self.channels
            .get(handle.0)
            .ok_or(PhantomError::UnknownChannel { handle: handle.0 })
    }

    /// Name and energy bin of a channel.
    pub fn channel_info(&self, handle: ChannelHandle) -> PhantomResult<&ChannelInfo> {
        Ok(&self.channel(handle)?.info)
    }

    /// Handle of the channel called `name`.
    pub fn handle_named(&self, name: &str) -> Option<ChannelHandle> {
        self.channels
            .iter()
            .position(|c| c.info.name == name)
            .map(ChannelHandle)
    }

    /// All handles in registration order.
    pub fn handles(&self) -> impl Iterator<Item = ChannelHandle> + '_ {
        (0..self.channels.len()).map(ChannelHandle)
    }

    /// Number of registered channels.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Adds `value * weight` at voxel `(ix, iy, iz)`.
    pub fn accumulate(
        &mut self,
        handle: ChannelHandle,
        ix: usize,
        iy: usize,
        iz: usize,
        value: f64,
        weight: f64,
    ) -> PhantomResult<()> {
        let idx = self.codec.checked_encode(ix, iy, iz)?;
        self.accumulate_index(handle, idx, value * weight)
    }

    /// Adds `amount` at a linear voxel index.
    pub fn accumulate_index(&mut self, handle: ChannelHandle, idx: usize, amount: f64) -> PhantomResult<()> {
        if idx >= self.codec.voxel_count() {
            self.codec.checked_decode(idx)?;
        }
        let channel = self
            .channels
            .get_mut(handle.0)
            .ok_or(PhantomError::UnknownChannel { handle: handle.0 })?;
        *channel.values.entry(idx).or_insert(0.0) += amount;
        Ok(())
    }

    /// Accumulated value, or `None` when the voxel never scored.
    pub fn value_at(&self, handle: ChannelHandle, ix: usize, iy: usize, iz: usize) -> Option<f64> {
        let idx = self.codec.checked_encode(ix, iy, iz).ok()?;
        self.channels.get(handle.0)?.values.get(&idx).copied()
    }

    /// Number of voxels holding a value in this channel.
    pub fn populated(&self, handle: ChannelHandle) -> usize {
        self.channels.get(handle.0).map_or(0, |c| c.values.len())
    }

    /// Clears one channel's entries; the registration stays.
    pub fn reset_channel(&mut self, handle: ChannelHandle) -> PhantomResult<()> {
        let channel = self
            .channels
            .get_mut(handle.0)
            .ok_or(PhantomError::UnknownChannel { handle: handle.0 })?;
        channel.values.clear();
        Ok(())
    }

    /// Clears every channel's entries.
    pub fn reset_all(&mut self) {
        for channel in &mut self.channels {
            channel.values.clear();
        }
    }

    /// Sums `other` into `self`. Both must have the same grid and channel
    /// layout (names and bins, in registration order).
    pub fn merge(&mut self, other: &TallyAccumulator) -> PhantomResult<()> {
        if self.codec != other.codec {
            return Err(layout_mismatch(format!(
                "grid {:?} vs {:?}",
                self.codec.shape(),
                other.codec.shape()
            )));
        }
        if self.channels.len() != other.channels.len() {
            return Err(layout_mismatch(format!(
                "{} channels vs {}",
                self.channels.len(),
                other.channels.len()
            )));
        }
        for (mine, theirs) in self.channels.iter().zip(&other.channels) {
            if mine.info != theirs.info {
                return Err(layout_mismatch(format!(
                    "channel '{}' vs '{}'",
                    mine.info.name, theirs.info.name
                )));
            }
        }

        for (mine, theirs) in self.channels.iter_mut().zip(&other.channels) {
            for (&idx, &value) in &theirs.values {
                *mine.values.entry(idx).or_insert(0.0) += value;
            }
        }
        Ok(())
    }

    /// `(linear index, value)` pairs in ascending index order.
    pub fn entries(&self, handle: ChannelHandle) -> PhantomResult<Vec<(usize, f64)>> {
        let sorted: BTreeMap<usize, f64> = self
            .channel(handle)?
            .values
            .iter()
            .map(|(&idx, &value)| (idx, value))
            .collect();
        Ok(sorted.into_iter().collect())
    }
}

fn layout_mismatch(reason: String) -> PhantomError {
    PhantomError::DataIntegrity {
        path: "<tally merge>".into(),
        reason: format!("tally layouts differ: {reason}"),
    }
}
