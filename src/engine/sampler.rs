//! LETHE - Discardable-ratio sampler
//!
//! Estimates how much of a sealed blob file is garbage by reading a random
//! contiguous window of records and asking the LSM-tree whether each one is
//! still the current value of its key.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::blob::BlobFileHandle;
use super::lsm::IndexProbe;
use crate::error::Result;

/// Bytes examined by one sample and how many of them were dead.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SampleResult {
    pub sampled_bytes: u64,
    pub discardable_bytes: u64,
    pub records: usize,
}

impl SampleResult {
    pub fn ratio(&self) -> f64 {
        if self.sampled_bytes == 0 {
            return 0.0;
        }
        self.discardable_bytes as f64 / self.sampled_bytes as f64
    }
}

pub struct Sampler {
    /// Fraction of each file's record bytes to read.
    ratio: f64,
    rng: Mutex<StdRng>,
}

impl Sampler {
    pub fn new(ratio: f64) -> Self {
        Self {
            ratio,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Deterministic start offsets, for tests.
    pub fn with_seed(ratio: f64, seed: u64) -> Self {
        Self {
            ratio,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Sample `file` and remember the estimate on its handle.
    ///
    /// Starts at a random record and reads forward, wrapping at the end,
    /// until `ratio` of the file's record bytes were covered. A ratio of 1
    /// reads the whole file.
    pub fn sample(&self, file: &BlobFileHandle, probe: &dyn IndexProbe) -> Result<SampleResult> {
        let reader = file.reader()?;
        let count = reader.record_count().unwrap_or(0);
        let mut result = SampleResult::default();
        if count == 0 {
            file.set_sampled_ratio(0.0);
            return Ok(result);
        }

        let target = if self.ratio >= 1.0 {
            u64::MAX
        } else {
            ((file.data_bytes() as f64 * self.ratio).ceil() as u64).max(1)
        };
        let start = if self.ratio >= 1.0 {
            0
        } else {
            self.rng.lock().gen_range(0..count)
        };

        for step in 0..count {
            let Some(index) = reader.index_at((start + step) % count) else {
                break;
            };
            let record = reader.read(&index)?;
            result.sampled_bytes += index.size;
            result.records += 1;
            if !probe.is_live(&record.key, &index) {
                result.discardable_bytes += index.size;
            }
            if result.sampled_bytes >= target {
                break;
            }
        }

        file.set_sampled_ratio(result.ratio());
        log::debug!(
            "sampled blob file {}: {} records, discardable ratio {:.3}",
            file.file_number(),
            result.records,
            result.ratio()
        );
        Ok(result)
    }
}

impl std::fmt::Debug for Sampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sampler").field("ratio", &self.ratio).finish()
    }
}
