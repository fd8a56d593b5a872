//! LETHE - Blob garbage collection
//!
//! ## Cycle
//! ```text
//! Idle -> Selecting -> Batching -> Rewriting -> Committing -> Idle
//!                         |
//!                         +-> Idle (nothing to do, or batch below the floor)
//! ```
//! - **Selecting**: sample candidate files and rank them ([`picker`])
//! - **Batching**: claim files up to `max_gc_batch_size`
//! - **Rewriting**: copy live records into new files ([`job`])
//! - **Committing**: repoint keys, then obsolete the sources

pub mod job;
pub mod picker;
pub mod scheduler;

use self::job::GcJob;
use self::picker::{BatchDecision, GcPicker, PickerPolicy};
use super::metrics::EngineMetrics;
use super::EngineCore;
use crate::error::Result;

pub use self::scheduler::GcScheduler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcState {
    Idle,
    Selecting,
    Batching,
    Rewriting,
    Committing,
}

/// What one GC cycle accomplished.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    pub files: usize,
    pub estimated_discardable: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub records_rewritten: usize,
    /// Live records whose key moved on before the commit.
    pub records_stale: usize,
    pub outputs: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcOutcome {
    NoCandidates,
    /// Candidates existed but their estimated garbage stayed below
    /// `min_gc_batch_size`; their claims were released.
    Deferred { estimated: u64 },
    Completed(GcStats),
}

/// State of one cycle, logged on every transition.
#[derive(Debug)]
pub struct GcCycle {
    generation: u64,
    state: GcState,
}

impl GcCycle {
    pub fn new(generation: u64) -> Self {
        Self {
            generation,
            state: GcState::Idle,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> GcState {
        self.state
    }

    pub fn enter(&mut self, next: GcState) {
        log::debug!("gc cycle {}: {:?} -> {:?}", self.generation, self.state, next);
        self.state = next;
    }
}

/// Run one complete cycle on the calling thread.
pub fn run_cycle(core: &EngineCore) -> Result<GcOutcome> {
    let generation = core.next_gc_generation();
    let mut cycle = GcCycle::new(generation);
    let policy = PickerPolicy::from_config(&core.config);

    cycle.enter(GcState::Selecting);
    let candidates = GcPicker::new(&policy, &core.sampler, &core.base, &core.metrics)
        .select(core.files.gc_candidates());

    cycle.enter(GcState::Batching);
    let outcome = match picker::form_batch(candidates, &policy) {
        BatchDecision::Empty => GcOutcome::NoCandidates,
        BatchDecision::Deferred { estimated } => {
            EngineMetrics::add(&core.metrics.gc_deferred, 1);
            log::debug!(
                "gc cycle {} deferred: {} estimated discardable bytes below floor {}",
                generation,
                estimated,
                policy.min_batch_size
            );
            GcOutcome::Deferred { estimated }
        }
        BatchDecision::Ready(batch) => {
            let stats = GcJob::new(core, batch).run(&mut cycle)?;
            GcOutcome::Completed(stats)
        }
    };
    cycle.enter(GcState::Idle);
    Ok(outcome)
}
