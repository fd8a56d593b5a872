//! LETHE - Obsolete file reaper
//! Periodically deletes obsolete blob files once nothing references them.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, select, Receiver, Sender};
use parking_lot::Mutex;

use super::blob::BlobFileSet;
use crate::error::Result;

pub struct ObsoleteFileReaper {
    shutdown_tx: Mutex<Option<Sender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ObsoleteFileReaper {
    pub fn start(files: Arc<BlobFileSet>, period: Duration) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = channel::bounded::<()>(0);
        let handle = thread::Builder::new()
            .name("lethe-reaper".into())
            .spawn(move || reap(files, period, shutdown_rx))?;
        log::info!("obsolete file reaper started (period {:?})", period);
        Ok(Self {
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn stop(&self) {
        drop(self.shutdown_tx.lock().take());
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                log::error!("reaper thread panicked");
            }
        }
    }
}

impl Drop for ObsoleteFileReaper {
    fn drop(&mut self) {
        self.stop();
    }
}

fn reap(files: Arc<BlobFileSet>, period: Duration, shutdown_rx: Receiver<()>) {
    let ticker = channel::tick(period);
    loop {
        select! {
            recv(shutdown_rx) -> _ => break,
            recv(ticker) -> _ => match files.purge_obsolete() {
                Ok(stats) if stats.deleted + stats.failed > 0 => log::debug!(
                    "reaper pass: {} deleted, {} failed, {} waiting",
                    stats.deleted,
                    stats.failed,
                    stats.waiting
                ),
                Ok(_) => {}
                // Failed deletions stay in the catalog and are retried.
                Err(e) => log::error!("reaper pass failed: {}", e),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::metrics::EngineMetrics;
    use crate::types::CompressionType;

    #[test]
    fn test_reaper_deletes_unreferenced_obsolete_files() {
        let dir = tempfile::tempdir().unwrap();
        let files = Arc::new(
            BlobFileSet::open(dir.path(), false, Arc::new(EngineMetrics::new())).unwrap(),
        );
        let handle = files.register_new(0, CompressionType::None).unwrap();
        let number = handle.file_number();
        std::fs::write(handle.path(), b"placeholder").unwrap();
        files.mark_obsolete(&handle).unwrap();
        drop(handle);

        let reaper = ObsoleteFileReaper::start(Arc::clone(&files), Duration::from_millis(10)).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while files.get(number).is_some() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        reaper.stop();
        assert!(files.get(number).is_none());
        assert!(!files.file_path(number).exists());
    }
}
