//! LETHE - Background GC scheduler
//!
//! ## Threads
//! - **Coordinator**: wakes on the `gc_interval` timer or on a trigger from
//!   flush and compaction, and hands cycles to idle workers
//! - **Workers** (`max_background_gc`): each runs one [`run_cycle`] at a
//!   time; batches are disjoint because files are claimed before use

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, select, Receiver, Sender};
use parking_lot::Mutex;

use super::{run_cycle, GcOutcome};
use crate::engine::EngineCore;
use crate::error::Result;

struct Shared {
    core: Arc<EngineCore>,
    disabled: AtomicBool,
    in_flight: AtomicUsize,
    max_workers: usize,
    trigger_tx: Sender<()>,
}

pub struct GcScheduler {
    shared: Arc<Shared>,
    shutdown_tx: Mutex<Option<Sender<()>>>,
    coordinator: Mutex<Option<JoinHandle<()>>>,
}

impl GcScheduler {
    pub fn start(core: Arc<EngineCore>) -> Result<Self> {
        let interval = core.config.gc_interval();
        let max_workers = core.config.max_background_gc();
        let disabled = core.config.disable_background_gc();
        let (trigger_tx, trigger_rx) = channel::bounded(1);
        let (shutdown_tx, shutdown_rx) = channel::bounded::<()>(0);

        let shared = Arc::new(Shared {
            core,
            disabled: AtomicBool::new(disabled),
            in_flight: AtomicUsize::new(0),
            max_workers,
            trigger_tx,
        });

        let coordinator = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("lethe-gc".into())
                .spawn(move || coordinate(shared, interval, trigger_rx, shutdown_rx))?
        };
        log::info!(
            "gc scheduler started ({} workers, interval {:?}, {})",
            max_workers,
            interval,
            if disabled { "disabled" } else { "enabled" }
        );

        Ok(Self {
            shared,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            coordinator: Mutex::new(Some(coordinator)),
        })
    }

    /// Ask for a cycle soon. Coalesces with any trigger already pending.
    pub fn trigger(&self) {
        let _ = self.shared.trigger_tx.try_send(());
    }

    pub fn set_disabled(&self, disabled: bool) {
        if self.shared.disabled.swap(disabled, Ordering::AcqRel) != disabled {
            log::info!("background gc {}", if disabled { "disabled" } else { "enabled" });
        }
        if !disabled {
            self.trigger();
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.shared.disabled.load(Ordering::Acquire)
    }

    /// Stop the coordinator and wait for running cycles to finish.
    pub fn shutdown(&self) {
        drop(self.shutdown_tx.lock().take());
        if let Some(handle) = self.coordinator.lock().take() {
            if handle.join().is_err() {
                log::error!("gc coordinator thread panicked");
            }
        }
    }
}

impl Drop for GcScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn coordinate(
    shared: Arc<Shared>,
    interval: Duration,
    trigger_rx: Receiver<()>,
    shutdown_rx: Receiver<()>,
) {
    let (work_tx, work_rx) = channel::bounded::<()>(shared.max_workers);
    let mut workers = Vec::with_capacity(shared.max_workers);
    for id in 0..shared.max_workers {
        let shared = Arc::clone(&shared);
        let work_rx = work_rx.clone();
        let spawned = thread::Builder::new()
            .name(format!("lethe-gc-{}", id))
            .spawn(move || work(shared, work_rx));
        match spawned {
            Ok(handle) => workers.push(handle),
            Err(e) => log::error!("failed to spawn gc worker {}: {}", id, e),
        }
    }
    drop(work_rx);

    let ticker = channel::tick(interval);
    loop {
        select! {
            recv(shutdown_rx) -> _ => break,
            recv(ticker) -> _ => dispatch(&shared, &work_tx),
            recv(trigger_rx) -> _ => dispatch(&shared, &work_tx),
        }
    }

    drop(work_tx);
    for handle in workers {
        if handle.join().is_err() {
            log::error!("gc worker thread panicked");
        }
    }
    log::debug!("gc coordinator stopped");
}

/// Start one more cycle if a worker is free.
fn dispatch(shared: &Shared, work_tx: &Sender<()>) {
    if shared.disabled.load(Ordering::Acquire) {
        return;
    }
    let claimed = shared
        .in_flight
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
            (n < shared.max_workers).then_some(n + 1)
        });
    if claimed.is_ok() && work_tx.try_send(()).is_err() {
        shared.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

fn work(shared: Arc<Shared>, work_rx: Receiver<()>) {
    for () in work_rx.iter() {
        let more = match run_cycle(&shared.core) {
            Ok(GcOutcome::Completed(_)) => true,
            Ok(GcOutcome::Deferred { .. } | GcOutcome::NoCandidates) => false,
            // Already logged and counted by the job; the next cycle retries.
            Err(_) => false,
        };
        shared.in_flight.fetch_sub(1, Ordering::AcqRel);
        if more {
            // There may be more garbage than one batch could take.
            let _ = shared.trigger_tx.try_send(());
        }
    }
}
