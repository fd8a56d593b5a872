//! LETHE - Level merge
//!
//! When a compaction writes into one of the two bottom levels, blob values
//! that still live in files of a shallower level (or in files range merge
//! marked) are copied into a new file at the output level. Over time each
//! bottom level ends up with its own sorted run of blob files.

use super::lsm::compaction::CompactionEvent;
use super::metrics::EngineMetrics;
use super::rewrite::{self, CommitStats, RewriteTarget};
use super::EngineCore;
use crate::config::Config;
use crate::error::Result;

/// Whether a compaction into this event's output level triggers a merge.
pub fn applies(config: &Config, event: &CompactionEvent) -> bool {
    config.level_merge() && event.output_level + 2 >= config.num_levels()
}

pub fn merge(core: &EngineCore, event: &CompactionEvent) -> Result<CommitStats> {
    let output_level = event.output_level;
    let stats = rewrite::rewrite_entries(
        core,
        event.blob_entries(),
        RewriteTarget::Blob {
            level: output_level,
        },
        |file| file.level() < output_level || file.is_marked_for_merge(),
    )?;
    EngineMetrics::add(&core.metrics.level_merge_records, stats.applied as u64);
    if stats.applied > 0 {
        log::info!(
            "level merge into L{}: {} values rewritten, {} stale",
            output_level,
            stats.applied,
            stats.stale
        );
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StoredValue;

    fn event(output_level: usize) -> CompactionEvent {
        CompactionEvent {
            output_level,
            is_last_level: output_level == 6,
            range: None,
            entries: Vec::new(),
            dropped_tombstones: 0,
        }
    }

    #[test]
    fn test_applies_only_to_bottom_two_levels() {
        let config = Config::builder("/tmp/lethe").with_level_merge(true).build().unwrap();
        assert!(!applies(&config, &event(0)));
        assert!(!applies(&config, &event(4)));
        assert!(applies(&config, &event(5)));
        assert!(applies(&config, &event(6)));

        let off = Config::new("/tmp/lethe");
        assert!(!applies(&off, &event(6)));
    }

    #[test]
    fn test_merge_moves_shallow_values_to_output_level() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::builder(dir.path())
            .with_min_blob_size(32)
            .with_level_merge(true)
            .with_disable_background_gc(true)
            .with_sync_writes(false)
            .build()
            .unwrap();
        let core = EngineCore::open(config).unwrap();
        for i in 0..4u8 {
            core.put(vec![i], vec![i; 64]).unwrap();
        }
        core.flush().unwrap();
        core.compact_range(None, None, 6).unwrap();

        for i in 0..4u8 {
            let Some(StoredValue::Blob(index)) = core.base.get(&[i]) else {
                panic!("expected a blob index");
            };
            assert_eq!(core.files.get(index.file_number).unwrap().level(), 6);
            assert_eq!(core.get(&[i]).unwrap(), Some(vec![i; 64]));
        }
        assert_eq!(EngineMetrics::get(&core.metrics.level_merge_records), 4);
    }
}
