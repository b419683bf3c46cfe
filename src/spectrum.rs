use serde::{Deserialize, Serialize};

use crate::error::{PhantomError, PhantomResult};
use crate::scoring::{Species, Step};

/// Creator process of the tracks the spectra record.
pub const DECAY_PROCESS: &str = "RadioactiveDecay";
/// Bins of each decay spectrum.
pub const SPECTRUM_BINS: usize = 1000;
/// Upper edge of the decay-product spectra (keV)
pub const SPECTRUM_MAX_KEV: f64 = 1000.0;

/// Fixed-width weighted histogram over `[low, high)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmissionSpectrum {
    pub low: f64,
    pub high: f64,
    pub counts: Vec<f64>,
    pub underflow: f64,
    pub overflow: f64,
    pub entries: u64,
}

impl EmissionSpectrum {
    /// Empty histogram of `bins` equal bins over `[low, high)`.
    pub fn new(bins: usize, low: f64, high: f64) -> Self {
        EmissionSpectrum {
            low,
            high,
            counts: vec![0.0; bins],
            underflow: 0.0,
            overflow: 0.0,
            entries: 0,
        }
    }

    /// 1 keV bins over 0 to 1 MeV.
    pub fn decay_products() -> Self {
        Self::new(SPECTRUM_BINS, 0.0, SPECTRUM_MAX_KEV)
    }

    /// Width of one bin (keV).
    pub fn bin_width(&self) -> f64 {
        (self.high - self.low) / self.counts.len() as f64
    }

    /// Adds `weight` to the bin of `energy`, or to underflow/overflow.
    pub fn fill(&mut self, energy: f64, weight: f64) {
        self.entries += 1;
        if energy < self.low {
            self.underflow += weight;
        } else if energy >= self.high {
            self.overflow += weight;
        } else if let Some(last) = self.counts.len().checked_sub(1) {
            let bin = ((energy - self.low) / self.bin_width()) as usize;
            // Rounding at the top edge
            self.counts[bin.min(last)] += weight;
        }
    }

    /// Weighted sum of the in-range bins.
    pub fn integral(&self) -> f64 {
        self.counts.iter().sum()
    }

    /// Adds `other` bin by bin; binnings must match.
    pub fn merge(&mut self, other: &EmissionSpectrum) -> PhantomResult<()> {
        if self.counts.len() != other.counts.len() || self.low != other.low || self.high != other.high {
            return Err(PhantomError::DataIntegrity {
                path: "<spectrum merge>".into(),
                reason: format!(
                    "binning differs: {} bins over [{}, {}) vs {} bins over [{}, {})",
                    self.counts.len(),
                    self.low,
                    self.high,
                    other.counts.len(),
                    other.low,
                    other.high
                ),
            });
        }
        for (mine, theirs) in self.counts.iter_mut().zip(&other.counts) {
            *mine += theirs;
        }
        self.underflow += other.underflow;
        self.overflow += other.overflow;
        self.entries += other.entries;
        Ok(())
    }

    /// Zeroes every bin and counter.
    pub fn reset(&mut self) {
        self.counts.iter_mut().for_each(|c| *c = 0.0);
        self.underflow = 0.0;
        self.overflow = 0.0;
        self.entries = 0;
    }
}

/// Kinetic-energy spectra of electrons and photons emitted by radioactive decay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecaySpectra {
    pub electron: EmissionSpectrum,
    pub photon: EmissionSpectrum,
}

impl Default for DecaySpectra {
    fn default() -> Self {
        DecaySpectra {
            electron: EmissionSpectrum::decay_products(),
            photon: EmissionSpectrum::decay_products(),
        }
    }
}

impl DecaySpectra {
    /// True for the first step of a secondary created by radioactive decay
    /// that is not itself a nucleus.
    pub fn is_decay_product(step: &Step) -> bool {
        step.track.step_number == 1
            && step.track.track_id != 1
            && step.track.creator_process.as_deref() == Some(DECAY_PROCESS)
            && !step.species.is_nucleus()
    }

    /// Fills the matching spectrum with the pre-step kinetic energy; returns
    /// whether the step was recorded.
    pub fn record(&mut self, step: &Step) -> bool {
        if !Self::is_decay_product(step) {
            return false;
        }
        let spectrum = match step.species {
            Species::Electron => &mut self.electron,
            Species::Photon => &mut self.photon,
            _ => return false,
        };
        spectrum.fill(step.kinetic_energy, step.weight);
        true
    }

    /// Adds both spectra of `other`.
    pub fn merge(&mut self, other: &DecaySpectra) -> PhantomResult<()> {
        self.electron.merge(&other.electron)?;
        self.photon.merge(&other.photon)
    }

    /// Zeroes both spectra.
    pub fn reset(&mut self) {
        self.electron.reset();
        self.photon.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scoring::TrackInfo;

    fn decay_step(species: Species, energy: f64) -> Step {
        let mut step = Step::new(species, energy, 1);
        step.track = TrackInfo {
            track_id: 4,
            step_number: 1,
            creator_process: Some(DECAY_PROCESS.to_string()),
        };
        step
    }

    #[test]
    fn fills_one_kev_bins() {
        let mut spectrum = EmissionSpectrum::decay_products();
        spectrum.fill(0.0, 1.0);
        spectrum.fill(511.0, 2.0);
        spectrum.fill(511.9, 1.0);
        spectrum.fill(1000.0, 1.0);
        spectrum.fill(-1.0, 1.0);

        assert_eq!(spectrum.counts[0], 1.0);
        assert_eq!(spectrum.counts[511], 3.0);
        assert_eq!(spectrum.overflow, 1.0);
        assert_eq!(spectrum.underflow, 1.0);
        assert_eq!(spectrum.entries, 5);
        assert_eq!(spectrum.integral(), 4.0);
    }

    #[test]
    fn only_decay_products_are_recorded() {
        let mut spectra = DecaySpectra::default();
        assert!(spectra.record(&decay_step(Species::Electron, 100.0)));
        assert!(spectra.record(&decay_step(Species::Photon, 661.7)));
        assert!(!spectra.record(&decay_step(Species::Nucleus, 0.1)));
        assert!(!spectra.record(&decay_step(Species::Positron, 200.0)));

        let mut later = decay_step(Species::Photon, 661.7);
        later.track.step_number = 2;
        assert!(!spectra.record(&later));

        let mut primary = decay_step(Species::Photon, 661.7);
        primary.track.track_id = 1;
        assert!(!spectra.record(&primary));

        let mut compton = decay_step(Species::Electron, 50.0);
        compton.track.creator_process = Some("compt".to_string());
        assert!(!spectra.record(&compton));

        assert_eq!(spectra.electron.counts[100], 1.0);
        assert_eq!(spectra.photon.counts[661], 1.0);
        assert_eq!(spectra.photon.entries, 1);
    }

    #[test]
    fn merge_requires_equal_binning() {
        let mut a = DecaySpectra::default();
        let mut b = DecaySpectra::default();
        a.record(&decay_step(Species::Electron, 10.0));
        b.record(&decay_step(Species::Electron, 10.5));
        a.merge(&b).unwrap();
        assert_eq!(a.electron.counts[10], 2.0);
        assert_eq!(a.electron.entries, 2);

        let mut coarse = EmissionSpectrum::new(10, 0.0, 1000.0);
        assert!(coarse.merge(&a.photon).is_err());

        a.reset();
        assert_eq!(a.electron.integral(), 0.0);
    }
}
