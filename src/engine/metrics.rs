//! LETHE - Engine Metrics & Observability
//! Atomic counters for foreground traffic, blob storage and the GC
//! lifecycle, updated lock-free from every thread.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Atomic operation counters for the Lethe engine.
///
/// All counters use `Ordering::Relaxed`: they are for observability, not
/// synchronization.
#[derive(Debug)]
pub struct EngineMetrics {
    pub puts: AtomicU64,
    pub gets: AtomicU64,
    pub deletes: AtomicU64,
    /// Values kept inline in the LSM-tree.
    pub inline_writes: AtomicU64,
    /// Values routed to blob files.
    pub blob_writes: AtomicU64,
    pub blob_bytes_written: AtomicU64,
    pub blob_files_created: AtomicU64,
    pub flushes: AtomicU64,
    pub compactions: AtomicU64,
    /// GC cycles that executed a batch.
    pub gc_batches: AtomicU64,
    /// Cycles where candidates stayed below `min_gc_batch_size`.
    pub gc_deferred: AtomicU64,
    pub gc_aborted: AtomicU64,
    pub gc_bytes_read: AtomicU64,
    pub gc_bytes_written: AtomicU64,
    pub gc_records_rewritten: AtomicU64,
    pub gc_files_sampled: AtomicU64,
    pub files_obsoleted: AtomicU64,
    pub files_reaped: AtomicU64,
    pub reap_failures: AtomicU64,
    pub level_merge_records: AtomicU64,
    pub fallback_records: AtomicU64,
    pub range_merge_marks: AtomicU64,
    engine_started: Instant,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self {
            puts: AtomicU64::new(0),
            gets: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            inline_writes: AtomicU64::new(0),
            blob_writes: AtomicU64::new(0),
            blob_bytes_written: AtomicU64::new(0),
            blob_files_created: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
            compactions: AtomicU64::new(0),
            gc_batches: AtomicU64::new(0),
            gc_deferred: AtomicU64::new(0),
            gc_aborted: AtomicU64::new(0),
            gc_bytes_read: AtomicU64::new(0),
            gc_bytes_written: AtomicU64::new(0),
            gc_records_rewritten: AtomicU64::new(0),
            gc_files_sampled: AtomicU64::new(0),
            files_obsoleted: AtomicU64::new(0),
            files_reaped: AtomicU64::new(0),
            reap_failures: AtomicU64::new(0),
            level_merge_records: AtomicU64::new(0),
            fallback_records: AtomicU64::new(0),
            range_merge_marks: AtomicU64::new(0),
            engine_started: Instant::now(),
        }
    }

    /// Bump a counter by `n`.
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    pub fn record_put(&self, value_size: usize, to_blob: bool) {
        self.puts.fetch_add(1, Ordering::Relaxed);
        if to_blob {
            self.blob_writes.fetch_add(1, Ordering::Relaxed);
            self.blob_bytes_written
                .fetch_add(value_size as u64, Ordering::Relaxed);
        } else {
            self.inline_writes.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_get(&self) {
        self.gets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime_secs(&self) -> f64 {
        self.engine_started.elapsed().as_secs_f64()
    }

    /// puts + gets + deletes.
    pub fn total_ops(&self) -> u64 {
        self.puts.load(Ordering::Relaxed)
            + self.gets.load(Ordering::Relaxed)
            + self.deletes.load(Ordering::Relaxed)
    }

    /// Format metrics as a human-readable report.
    pub fn report(&self) -> String {
        let g = |c: &AtomicU64| c.load(Ordering::Relaxed);
        format!(
            "\n═══ LETHE Engine Metrics ═══\n\
             Operations:\n\
               puts:      {} ({} inline, {} blob)\n\
               gets:      {}\n\
               deletes:   {}\n\
               flushes:   {}\n\
               compactions: {}\n\
             Blob storage:\n\
               files created: {}\n\
               bytes written: {}\n\
             Garbage collection:\n\
               batches:   {} ({} deferred, {} aborted)\n\
               sampled:   {} files\n\
               read:      {} bytes\n\
               rewritten: {} records, {} bytes\n\
               obsoleted: {} files\n\
               reaped:    {} files ({} failures)\n\
             Merges:\n\
               level merge: {} records\n\
               fallback:    {} records\n\
               range marks: {} files\n\
             Uptime: {:.2}s",
            g(&self.puts),
            g(&self.inline_writes),
            g(&self.blob_writes),
            g(&self.gets),
            g(&self.deletes),
            g(&self.flushes),
            g(&self.compactions),
            g(&self.blob_files_created),
            g(&self.blob_bytes_written),
            g(&self.gc_batches),
            g(&self.gc_deferred),
            g(&self.gc_aborted),
            g(&self.gc_files_sampled),
            g(&self.gc_bytes_read),
            g(&self.gc_records_rewritten),
            g(&self.gc_bytes_written),
            g(&self.files_obsoleted),
            g(&self.files_reaped),
            g(&self.reap_failures),
            g(&self.level_merge_records),
            g(&self.fallback_records),
            g(&self.range_merge_marks),
            self.uptime_secs(),
        )
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_operations() {
        let m = EngineMetrics::new();

        m.record_put(10, false);
        m.record_put(5000, true);
        m.record_get();
        m.record_delete();

        assert_eq!(m.puts.load(Ordering::Relaxed), 2);
        assert_eq!(m.inline_writes.load(Ordering::Relaxed), 1);
        assert_eq!(m.blob_writes.load(Ordering::Relaxed), 1);
        assert_eq!(m.blob_bytes_written.load(Ordering::Relaxed), 5000);
        assert_eq!(m.total_ops(), 4);
    }

    #[test]
    fn test_report_format() {
        let m = EngineMetrics::new();
        EngineMetrics::add(&m.gc_batches, 2);
        let report = m.report();
        assert!(report.contains("batches:   2"));
        assert!(report.contains("reaped:"));
    }

    #[test]
    fn test_default() {
        let m = EngineMetrics::default();
        assert_eq!(m.total_ops(), 0);
        assert_eq!(EngineMetrics::get(&m.files_reaped), 0);
    }
}
