use std::collections::BTreeMap;
use std::time::Instant;

use parking_lot::Mutex;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::context::PhantomContext;
use crate::error::{PhantomError, PhantomResult};
use crate::scoring::{Scorer, ScoringChannels, Step};
use crate::source::{PrimaryVertex, SourceSampler};
use crate::spectrum::DecaySpectra;
use crate::tally::TallyAccumulator;

/// Progress is logged for every event id divisible by this.
pub const PROGRESS_INTERVAL: u64 = 1000;

/// Seed of worker `index` for a run seeded with `seed`.
pub fn worker_seed(seed: u64, index: usize) -> u64 {
    seed.wrapping_add((index as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15))
}

/// Per-thread state: sampler, scorer with its own accumulator, decay spectra.
/// Nothing here is shared, so the step path takes no locks.
pub struct Worker {
    index: usize,
    sampler: SourceSampler,
    scorer: Scorer,
    spectra: DecaySpectra,
    rng: StdRng,
    current_event: Option<u64>,
    events: u64,
}

impl Worker {
    /// Worker `index` with an RNG derived from the run seed.
    pub fn new(index: usize, context: &PhantomContext, seed: u64) -> Self {
        Worker {
            index,
            sampler: context.sampler(),
            scorer: Scorer::new(context.scoring.clone(), context.resolver()),
            spectra: DecaySpectra::default(),
            rng: StdRng::seed_from_u64(worker_seed(seed, index)),
            current_event: None,
            events: 0,
        }
    }

    /// Worker index; fixes the reduction order.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Events completed since the last reset.
    pub fn events(&self) -> u64 {
        self.events
    }

    /// Channel handles of this worker's accumulator.
    pub fn channels(&self) -> &ScoringChannels {
        self.scorer.channels()
    }

    /// This worker's accumulator.
    pub fn tally(&self) -> &TallyAccumulator {
        self.scorer.tally()
    }

    /// This worker's decay spectra.
    pub fn spectra(&self) -> &DecaySpectra {
        &self.spectra
    }

    /// Samples the next primary vertex.
    pub fn generate_primary(&mut self) -> PhantomResult<PrimaryVertex> {
        self.sampler.generate(&mut self.rng)
    }

    /// Marks the start of event `event_id`.
    pub fn begin_event(&mut self, event_id: u64) {
        self.current_event = Some(event_id);
    }

    /// Scores the step and records it in the decay spectra when it qualifies.
    pub fn process_step(&mut self, step: &Step) -> usize {
        let scored = self.scorer.process_step(step);
        self.spectra.record(step);
        scored
    }

    /// Counts the event and logs progress every `PROGRESS_INTERVAL` ids.
    pub fn end_of_event(&mut self) {
        if let Some(event_id) = self.current_event.take() {
            self.events += 1;
            if event_id % PROGRESS_INTERVAL == 0 {
                info!(worker = self.index, event = event_id, ">>> event");
            }
        }
    }

    /// Clears tallies and spectra between runs; channel layout is kept.
    pub fn reset(&mut self) {
        self.scorer.reset();
        self.spectra.reset();
        self.current_event = None;
        self.events = 0;
    }

    /// Hands the worker's tallies over for reduction.
    pub fn finish(self) -> WorkerResult {
        debug!(
            worker = self.index,
            events = self.events,
            edep_voxels = self.scorer.tally().populated(self.scorer.channels().edep),
            "worker finished"
        );
        WorkerResult {
            worker: self.index,
            events: self.events,
            channels: self.scorer.channels().clone(),
            tally: self.scorer.into_tally(),
            spectra: self.spectra,
        }
    }
}

/// What one worker hands over at end of run.
#[derive(Debug, Clone)]
pub struct WorkerResult {
    pub worker: usize,
    pub events: u64,
    pub channels: ScoringChannels,
    pub tally: TallyAccumulator,
    pub spectra: DecaySpectra,
}

/// Run identity and counts.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub workers: usize,
    pub events: u64,
}

/// Reduced result of all workers.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub run_id: Uuid,
    pub workers: usize,
    pub events: u64,
    pub channels: ScoringChannels,
    pub tally: TallyAccumulator,
    pub spectra: DecaySpectra,
}

impl RunResult {
    /// Identity and counts of the reduced run.
    pub fn summary(&self) -> RunSummary {
        RunSummary {
            run_id: self.run_id,
            workers: self.workers,
            events: self.events,
        }
    }
}

/// Collects worker results for one run. The only shared mutable object;
/// touched once per worker at end of run.
pub struct RunCoordinator {
    run_id: Uuid,
    /// `None` once the run has been reduced.
    results: Mutex<Option<BTreeMap<usize, WorkerResult>>>,
    started_at: Instant,
}

impl RunCoordinator {
    /// Coordinator for a new run with a fresh id.
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            results: Mutex::new(Some(BTreeMap::new())),
            started_at: Instant::now(),
        }
    }

    /// Id stamped on the reduced result and the export manifest.
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Hands over one worker's result. Fails after `finish` or when the
    /// worker index was already submitted.
    pub fn submit(&self, result: WorkerResult) -> PhantomResult<()> {
        let mut guard = self.results.lock();
        let Some(results) = guard.as_mut() else {
            return Err(self.integrity(format!(
                "worker {} submitted after the run finished",
                result.worker
            )));
        };
        if results.contains_key(&result.worker) {
            return Err(self.integrity(format!("worker {} submitted twice", result.worker)));
        }
        results.insert(result.worker, result);
        Ok(())
    }

    /// Number of results received so far; 0 once finished.
    pub fn submitted(&self) -> usize {
        self.results.lock().as_ref().map_or(0, BTreeMap::len)
    }

    /// Reduces in ascending worker index, so the floating-point sums are the
    /// same on every run with the same inputs. With nothing submitted yet the
    /// call fails and the run stays open.
    pub fn finish(&self) -> PhantomResult<RunResult> {
        let results = {
            let mut guard = self.results.lock();
            match guard.as_ref() {
                None => return Err(self.integrity("run already finished".to_string())),
                Some(results) if results.is_empty() => {
                    return Err(self.integrity("no worker results to reduce".to_string()));
                }
                Some(_) => {}
            }
            guard.take().unwrap_or_default()
        };

        let workers = results.len();
        let mut iter = results.into_values();
        let Some(first) = iter.next() else {
            return Err(self.integrity("no worker results to reduce".to_string()));
        };

        let mut reduced = RunResult {
            run_id: self.run_id,
            workers,
            events: first.events,
            channels: first.channels,
            tally: first.tally,
            spectra: first.spectra,
        };
        for result in iter {
            if result.channels != reduced.channels {
                return Err(self.integrity(format!(
                    "worker {} registered a different channel layout",
                    result.worker
                )));
            }
            reduced.tally.merge(&result.tally)?;
            reduced.spectra.merge(&result.spectra)?;
            reduced.events += result.events;
        }

        info!(
            run_id = %self.run_id,
            workers,
            events = reduced.events,
            elapsed_ms = self.started_at.elapsed().as_millis() as u64,
            "run reduced"
        );
        Ok(reduced)
    }

    fn integrity(&self, reason: String) -> PhantomError {
        PhantomError::DataIntegrity {
            path: format!("<run {}>", self.run_id).into(),
            reason,
        }
    }
}

impl Default for RunCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index_codec::IndexCodec;
    use crate::scoring::{NestedReplicaResolver, ScoringSetup, Species};
    use crate::spectrum::DECAY_PROCESS;
    use crate::tally::EnergyBins;
    use rayon::prelude::*;
    use std::sync::Arc;

    fn setup() -> Arc<ScoringSetup> {
        Arc::new(
            ScoringSetup::new(
                IndexCodec::new(3, 3, 3),
                EnergyBins::from_upper_edges(vec![100.0, 1000.0]).unwrap(),
                [Species::Photon],
                [1],
                1.0,
                true,
            )
            .unwrap(),
        )
    }

    fn worker_result(worker: usize, steps: &[Step]) -> WorkerResult {
        let mut scorer = Scorer::new(setup(), NestedReplicaResolver);
        let mut spectra = DecaySpectra::default();
        for step in steps {
            scorer.process_step(step);
            spectra.record(step);
        }
        WorkerResult {
            worker,
            events: steps.len() as u64,
            channels: scorer.channels().clone(),
            tally: scorer.into_tally(),
            spectra,
        }
    }

    fn deposit(replicas: [i64; 3], edep: f64) -> Step {
        let mut step = Step::new(Species::Photon, 50.0, 1);
        step.touchable.replicas = replicas;
        step.energy_deposit = edep;
        step.step_length = 0.5;
        step
    }

    #[test]
    fn reduction_sums_in_worker_order() {
        let coordinator = RunCoordinator::new();
        coordinator
            .submit(worker_result(1, &[deposit([0, 0, 0], 1.0)]))
            .unwrap();
        coordinator
            .submit(worker_result(0, &[deposit([0, 0, 0], 2.0), deposit([2, 1, 1], 4.0)]))
            .unwrap();
        assert_eq!(coordinator.submitted(), 2);

        let result = coordinator.finish().unwrap();
        assert_eq!(result.workers, 2);
        assert_eq!(result.events, 3);
        assert_eq!(result.run_id, coordinator.run_id());
        let edep = result.channels.edep;
        assert_eq!(result.tally.value_at(edep, 0, 0, 0), Some(3.0));
        assert_eq!(result.tally.value_at(edep, 1, 1, 2), Some(4.0));
        assert_eq!(result.tally.value_at(result.channels.flux[0], 0, 0, 0), Some(1.0));
    }

    #[test]
    fn duplicates_and_second_finish_are_rejected() {
        let coordinator = RunCoordinator::new();
        coordinator.submit(worker_result(0, &[])).unwrap();
        assert!(coordinator.submit(worker_result(0, &[])).is_err());

        coordinator.finish().unwrap();
        assert!(coordinator.finish().is_err());
        assert!(coordinator.submit(worker_result(1, &[])).is_err());

        assert!(RunCoordinator::new().finish().is_err());
    }

    #[test]
    fn early_finish_leaves_the_run_open() {
        let coordinator = RunCoordinator::new();
        assert!(coordinator.finish().is_err());
        coordinator
            .submit(worker_result(0, &[deposit([0, 0, 0], 1.0)]))
            .unwrap();
        let result = coordinator.finish().unwrap();
        assert_eq!(result.workers, 1);
        assert_eq!(coordinator.submitted(), 0);
    }

    #[test]
    fn racing_submits_are_either_reduced_or_rejected() {
        for _ in 0..50 {
            let coordinator = RunCoordinator::new();
            coordinator
                .submit(worker_result(0, &[deposit([0, 0, 0], 1.0)]))
                .unwrap();
            let (accepted, result) = std::thread::scope(|scope| {
                let late = scope.spawn(|| {
                    (1..8)
                        .filter(|&worker| {
                            coordinator
                                .submit(worker_result(worker, &[deposit([0, 0, 0], 1.0)]))
                                .is_ok()
                        })
                        .count()
                });
                let result = coordinator.finish().unwrap();
                (late.join().unwrap(), result)
            });
            // every accepted submission made it into the reduction
            assert_eq!(result.workers, 1 + accepted);
            assert_eq!(result.tally.value_at(result.channels.edep, 0, 0, 0), Some(result.workers as f64));
        }
    }

    #[test]
    fn parallel_workers_reduce_deterministically() {
        let steps: Vec<Step> = (0..600)
            .map(|i| deposit([i % 3, (i / 3) % 3, (i / 9) % 3], 0.1 * (i % 7) as f64 + 0.01))
            .collect();

        let reduce = || {
            let coordinator = RunCoordinator::new();
            steps
                .par_chunks(100)
                .enumerate()
                .for_each(|(worker, chunk)| {
                    coordinator.submit(worker_result(worker, chunk)).unwrap();
                });
            let result = coordinator.finish().unwrap();
            result.tally.entries(result.channels.edep).unwrap()
        };

        let first = reduce();
        let second = reduce();
        assert_eq!(first.len(), 27);
        assert_eq!(first, second);
        let total: f64 = first.iter().map(|(_, v)| v).sum();
        let expected: f64 = steps.iter().map(|s| s.energy_deposit).sum();
        approx::assert_relative_eq!(total, expected, epsilon = 1e-9);
    }

    #[test]
    fn spectra_are_reduced_with_tallies() {
        let mut decay = Step::new(Species::Electron, 250.0, 0);
        decay.track.track_id = 3;
        decay.track.step_number = 1;
        decay.track.creator_process = Some(DECAY_PROCESS.to_string());

        let coordinator = RunCoordinator::new();
        coordinator.submit(worker_result(0, &[decay.clone()])).unwrap();
        coordinator.submit(worker_result(1, &[decay])).unwrap();
        let result = coordinator.finish().unwrap();
        assert_eq!(result.spectra.electron.counts[250], 2.0);
    }
}
