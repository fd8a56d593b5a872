//! LETHE - GC candidate selection and batching
//!
//! ## Admission order
//! 1. Files marked for merge by range merge, oldest first
//! 2. Files whose sampled discardable ratio exceeds
//!    `blob_file_discardable_ratio`, highest ratio first
//! 3. Small files (below `merge_small_file_threshold`) holding some
//!    garbage, when there are at least two of them to merge

use std::sync::Arc;

use crate::config::Config;
use crate::engine::blob::BlobFileHandle;
use crate::engine::lsm::IndexProbe;
use crate::engine::metrics::EngineMetrics;
use crate::engine::sampler::Sampler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionReason {
    RangeMerge,
    Discardable,
    SmallFile,
}

#[derive(Debug, Clone)]
pub struct Candidate {
    pub file: Arc<BlobFileHandle>,
    pub reason: AdmissionReason,
    /// Bytes this file is expected to give back.
    pub estimated_discardable: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PickerPolicy {
    pub discardable_ratio: f64,
    pub small_file_threshold: u64,
    pub min_batch_size: u64,
    pub max_batch_size: u64,
}

impl PickerPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            discardable_ratio: config.blob_file_discardable_ratio(),
            small_file_threshold: config.merge_small_file_threshold(),
            min_batch_size: config.min_gc_batch_size(),
            max_batch_size: config.max_gc_batch_size(),
        }
    }
}

pub struct GcPicker<'a> {
    policy: &'a PickerPolicy,
    sampler: &'a Sampler,
    probe: &'a dyn IndexProbe,
    metrics: &'a EngineMetrics,
}

impl<'a> GcPicker<'a> {
    pub fn new(
        policy: &'a PickerPolicy,
        sampler: &'a Sampler,
        probe: &'a dyn IndexProbe,
        metrics: &'a EngineMetrics,
    ) -> Self {
        Self {
            policy,
            sampler,
            probe,
            metrics,
        }
    }

    /// Rank `files` in admission order. Files that qualify for nothing are
    /// left out.
    pub fn select(&self, files: Vec<Arc<BlobFileHandle>>) -> Vec<Candidate> {
        let mut forced = Vec::new();
        let mut sampled: Vec<(f64, Candidate)> = Vec::new();
        let mut small = Vec::new();

        for file in files {
            if file.is_marked_for_merge() {
                forced.push(Candidate {
                    estimated_discardable: file.discardable_bytes(),
                    reason: AdmissionReason::RangeMerge,
                    file,
                });
                continue;
            }

            // Live accounting is exact between samples; only files it
            // flags are worth reading.
            if file.discardable_ratio() > self.policy.discardable_ratio {
                match self.sampler.sample(&file, self.probe) {
                    Ok(result) => {
                        EngineMetrics::add(&self.metrics.gc_files_sampled, 1);
                        let ratio = result.ratio();
                        if ratio > self.policy.discardable_ratio {
                            sampled.push((
                                ratio,
                                Candidate {
                                    estimated_discardable: (file.data_bytes() as f64 * ratio)
                                        as u64,
                                    reason: AdmissionReason::Discardable,
                                    file,
                                },
                            ));
                            continue;
                        }
                    }
                    Err(e) => {
                        log::warn!("skipping blob file {} for gc: {}", file.file_number(), e);
                        continue;
                    }
                }
            }

            if file.file_size() < self.policy.small_file_threshold && file.discardable_bytes() > 0
            {
                small.push(Candidate {
                    estimated_discardable: file.discardable_bytes(),
                    reason: AdmissionReason::SmallFile,
                    file,
                });
            }
        }

        forced.sort_by_key(|c| c.file.creation_sequence());
        sampled.sort_by(|a, b| b.0.total_cmp(&a.0));

        let mut ranked = forced;
        ranked.extend(sampled.into_iter().map(|(_, c)| c));
        if small.len() >= 2 {
            small.sort_by_key(|c| c.file.creation_sequence());
            ranked.extend(small);
        }
        ranked
    }
}

/// Files claimed for one GC job.
#[derive(Debug)]
pub struct GcBatch {
    pub files: Vec<Arc<BlobFileHandle>>,
    pub estimated_discardable: u64,
    pub total_size: u64,
}

impl GcBatch {
    /// Return every file to `Normal` without touching it.
    pub fn release(&self) {
        for file in &self.files {
            file.release();
        }
    }
}

#[derive(Debug)]
pub enum BatchDecision {
    Empty,
    Deferred { estimated: u64 },
    Ready(GcBatch),
}

/// Claim candidates in order until the next one would push the batch past
/// `max_batch_size`. A first candidate larger than the cap is still taken.
pub fn form_batch(candidates: Vec<Candidate>, policy: &PickerPolicy) -> BatchDecision {
    let mut batch = GcBatch {
        files: Vec::new(),
        estimated_discardable: 0,
        total_size: 0,
    };
    for candidate in candidates {
        let size = candidate.file.file_size();
        if !batch.files.is_empty() && batch.total_size + size > policy.max_batch_size {
            break;
        }
        // Another worker may have claimed it since the snapshot.
        if !candidate.file.try_claim() {
            continue;
        }
        batch.total_size += size;
        batch.estimated_discardable += candidate.estimated_discardable;
        batch.files.push(candidate.file);
    }

    if batch.files.is_empty() {
        return BatchDecision::Empty;
    }
    if batch.estimated_discardable < policy.min_batch_size {
        batch.release();
        return BatchDecision::Deferred {
            estimated: batch.estimated_discardable,
        };
    }
    BatchDecision::Ready(batch)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::engine::blob::{BlobFileMeta, FileState};
    use crate::types::{CompressionType, StoredValue};

    struct NoKeys;

    impl IndexProbe for NoKeys {
        fn current(&self, _key: &[u8]) -> Option<StoredValue> {
            None
        }
    }

    fn handle(number: u64, data_bytes: u64, live: u64) -> Arc<BlobFileHandle> {
        let mut meta = BlobFileMeta::new(number, 0, number, CompressionType::None);
        meta.sealed = true;
        meta.data_bytes = data_bytes;
        meta.file_size = data_bytes + 64;
        let h = BlobFileHandle::new(PathBuf::from(format!("{:06}.blob", number)), meta);
        h.set_live_bytes(live);
        Arc::new(h)
    }

    fn policy(min: u64, max: u64) -> PickerPolicy {
        PickerPolicy {
            discardable_ratio: 0.5,
            small_file_threshold: 0,
            min_batch_size: min,
            max_batch_size: max,
        }
    }

    fn candidate(file: Arc<BlobFileHandle>, estimated: u64) -> Candidate {
        Candidate {
            file,
            reason: AdmissionReason::Discardable,
            estimated_discardable: estimated,
        }
    }

    #[test]
    fn test_forced_candidates_come_first() {
        let policy = policy(0, u64::MAX);
        let sampler = Sampler::new(1.0);
        let metrics = EngineMetrics::new();
        let forced = handle(9, 1000, 1000);
        forced.mark_for_merge();
        let clean = handle(3, 1000, 1000);

        let ranked = GcPicker::new(&policy, &sampler, &NoKeys, &metrics)
            .select(vec![clean, Arc::clone(&forced)]);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].reason, AdmissionReason::RangeMerge);
        assert_eq!(ranked[0].file.file_number(), 9);
        // The clean file was never sampled: accounting shows no garbage.
        assert_eq!(EngineMetrics::get(&metrics.gc_files_sampled), 0);
    }

    #[test]
    fn test_small_files_need_a_partner() {
        let mut policy = policy(0, u64::MAX);
        policy.small_file_threshold = 10_000;
        policy.discardable_ratio = 1.0;
        let sampler = Sampler::new(1.0);
        let metrics = EngineMetrics::new();

        let lone = vec![handle(1, 1000, 900)];
        let picker = GcPicker::new(&policy, &sampler, &NoKeys, &metrics);
        assert!(picker.select(lone).is_empty());

        let pair = vec![handle(1, 1000, 900), handle(2, 1000, 500)];
        let ranked = picker.select(pair);
        assert_eq!(ranked.len(), 2);
        assert!(ranked.iter().all(|c| c.reason == AdmissionReason::SmallFile));

        // Without garbage, small files are left alone.
        let clean = vec![handle(1, 1000, 1000), handle(2, 1000, 1000)];
        assert!(picker.select(clean).is_empty());
    }

    #[test]
    fn test_small_files_count_only_their_garbage_toward_the_floor() {
        let mut policy = policy(500, u64::MAX);
        policy.small_file_threshold = 10_000;
        policy.discardable_ratio = 1.0;
        let sampler = Sampler::new(1.0);
        let metrics = EngineMetrics::new();
        let files = vec![handle(1, 1000, 900), handle(2, 1000, 800)];

        let ranked = GcPicker::new(&policy, &sampler, &NoKeys, &metrics).select(files.clone());
        assert_eq!(
            ranked.iter().map(|c| c.estimated_discardable).collect::<Vec<_>>(),
            vec![100, 200]
        );
        let decision = form_batch(ranked, &policy);
        assert!(matches!(decision, BatchDecision::Deferred { estimated: 300 }));
        assert!(files.iter().all(|f| f.state() == FileState::Normal));
    }

    #[test]
    fn test_forced_candidate_estimate_is_its_garbage() {
        let policy = policy(0, u64::MAX);
        let sampler = Sampler::new(1.0);
        let metrics = EngineMetrics::new();
        let forced = handle(4, 1000, 700);
        forced.mark_for_merge();

        let ranked = GcPicker::new(&policy, &sampler, &NoKeys, &metrics).select(vec![forced]);
        assert_eq!(ranked[0].estimated_discardable, 300);
    }

    #[test]
    fn test_batch_respects_cap() {
        let files: Vec<_> = (1..=4).map(|n| handle(n, 1000, 0)).collect();
        let candidates = files.iter().map(|f| candidate(Arc::clone(f), 1000)).collect();

        let BatchDecision::Ready(batch) = form_batch(candidates, &policy(0, 2200)) else {
            panic!("expected a batch");
        };
        assert_eq!(batch.files.len(), 2);
        assert!(batch.total_size <= 2200);
        assert_eq!(files[0].state(), FileState::BeingGc);
        assert_eq!(files[2].state(), FileState::Normal);
    }

    #[test]
    fn test_oversized_first_candidate_still_runs() {
        let file = handle(1, 10_000, 0);
        let decision = form_batch(vec![candidate(file, 10_000)], &policy(0, 100));
        assert!(matches!(decision, BatchDecision::Ready(b) if b.files.len() == 1));
    }

    #[test]
    fn test_batch_below_floor_is_deferred_and_released() {
        let files: Vec<_> = (1..=2).map(|n| handle(n, 1000, 0)).collect();
        let candidates = files.iter().map(|f| candidate(Arc::clone(f), 400)).collect();

        let decision = form_batch(candidates, &policy(1000, u64::MAX));
        assert!(matches!(decision, BatchDecision::Deferred { estimated: 800 }));
        assert!(files.iter().all(|f| f.state() == FileState::Normal));
    }

    #[test]
    fn test_claimed_files_are_skipped() {
        let busy = handle(1, 1000, 0);
        assert!(busy.try_claim());
        let free = handle(2, 1000, 0);
        let decision = form_batch(
            vec![candidate(busy, 1000), candidate(Arc::clone(&free), 1000)],
            &policy(0, u64::MAX),
        );
        let BatchDecision::Ready(batch) = decision else {
            panic!("expected a batch");
        };
        assert_eq!(batch.files.len(), 1);
        assert_eq!(batch.files[0].file_number(), 2);
    }
}
