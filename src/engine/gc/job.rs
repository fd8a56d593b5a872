//! LETHE - GC job
//! Rewrites the live records of one claimed batch and commits the result.

use super::picker::GcBatch;
use super::{GcCycle, GcState, GcStats};
use crate::engine::lsm::{IndexProbe, RewriteMode};
use crate::engine::metrics::EngineMetrics;
use crate::engine::rewrite::{BlobRewriter, RewriteTarget};
use crate::engine::EngineCore;
use crate::error::{LetheError, Result};

pub struct GcJob<'a> {
    core: &'a EngineCore,
    batch: GcBatch,
}

impl<'a> GcJob<'a> {
    pub fn new(core: &'a EngineCore, batch: GcBatch) -> Self {
        Self { core, batch }
    }

    /// Rewrite and commit. On error the batch is aborted: partial outputs
    /// are deleted, sources go back to `Normal`, and the error is returned
    /// after being logged and counted.
    pub fn run(self, cycle: &mut GcCycle) -> Result<GcStats> {
        let core = self.core;
        let mut stats = GcStats {
            files: self.batch.files.len(),
            estimated_discardable: self.batch.estimated_discardable,
            ..GcStats::default()
        };

        cycle.enter(GcState::Rewriting);
        let target = if core.run_mode.is_fallback() {
            RewriteTarget::Inline
        } else {
            let level = self.batch.files.iter().map(|f| f.level()).max().unwrap_or(0);
            RewriteTarget::Blob { level }
        };
        let mut rewriter = BlobRewriter::new(core, target);
        match self.rewrite_sources(&mut rewriter) {
            Ok(bytes_read) => stats.bytes_read = bytes_read,
            Err(e) => {
                rewriter.abandon();
                return Err(self.abort(cycle, e));
            }
        }
        let output = rewriter.into_output();
        stats.bytes_written = output.bytes_written();
        stats.outputs = output.outputs().len();

        cycle.enter(GcState::Committing);
        let mode = if core.config.gc_merge_rewrite() {
            RewriteMode::MergeOperand {
                generation: cycle.generation(),
            }
        } else {
            RewriteMode::CompareAndSet
        };
        let commit = match output.commit(core, mode) {
            Ok(commit) => commit,
            Err(e) => return Err(self.abort(cycle, e)),
        };
        stats.records_rewritten = commit.applied;
        stats.records_stale = commit.stale;

        for file in &self.batch.files {
            if let Err(e) = core.files.mark_obsolete(file) {
                log::error!("failed to obsolete gc source {}: {}", file.file_number(), e);
                file.release();
            }
        }

        let metrics = &core.metrics;
        EngineMetrics::add(&metrics.gc_batches, 1);
        EngineMetrics::add(&metrics.gc_bytes_read, stats.bytes_read);
        EngineMetrics::add(&metrics.gc_bytes_written, stats.bytes_written);
        EngineMetrics::add(&metrics.gc_records_rewritten, stats.records_rewritten as u64);
        if target == RewriteTarget::Inline {
            EngineMetrics::add(&metrics.fallback_records, stats.records_rewritten as u64);
        }
        log::info!(
            "gc cycle {}: {} files, read {} bytes, rewrote {} records ({} stale) into {} files",
            cycle.generation(),
            stats.files,
            stats.bytes_read,
            stats.records_rewritten,
            stats.records_stale,
            stats.outputs
        );
        Ok(stats)
    }

    /// Copy every record that is still current into `rewriter`.
    fn rewrite_sources(&self, rewriter: &mut BlobRewriter<'_>) -> Result<u64> {
        let mut bytes_read = 0;
        for file in &self.batch.files {
            let reader = file.reader()?;
            for record in reader.iter()? {
                let record = record?;
                bytes_read += record.index.size;
                if self.core.base.is_live(&record.key, &record.index) {
                    rewriter.add(record.key, record.index, record.value)?;
                }
            }
        }
        rewriter.finish()?;
        Ok(bytes_read)
    }

    fn abort(&self, cycle: &GcCycle, err: LetheError) -> LetheError {
        self.batch.release();
        EngineMetrics::add(&self.core.metrics.gc_aborted, 1);
        log::error!(
            "gc cycle {} aborted in {:?}, {} source files released: {}",
            cycle.generation(),
            cycle.state(),
            self.batch.files.len(),
            err
        );
        err
    }
}
