//! LETHE - Shared rewrite path
//!
//! GC, level merge and fallback all move live values somewhere else and
//! then point their keys at the new location. [`BlobRewriter`] writes the
//! new copies; [`RewriteOutput::commit`] updates the LSM-tree, skipping any
//! key that changed after its value was read.

use std::mem;
use std::sync::Arc;

use super::blob::compression::{self, BlobCodec};
use super::blob::{BlobFileBuilder, BlobFileHandle};
use super::lsm::RewriteMode;
use super::EngineCore;
use crate::error::Result;
use crate::types::{BlobIndex, CompressionType, Key, StoredValue, Value};

/// Where rewritten values go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewriteTarget {
    /// New blob files at this level.
    Blob { level: usize },
    /// Back into the LSM-tree, used in fallback mode.
    Inline,
}

/// One key to repoint once the new copy is durable.
#[derive(Debug, Clone)]
pub struct PendingRewrite {
    pub key: Key,
    pub expected: BlobIndex,
    pub replacement: StoredValue,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitStats {
    pub applied: usize,
    /// Keys overwritten or deleted while the rewrite ran.
    pub stale: usize,
}

struct OpenOutput {
    builder: BlobFileBuilder,
    handle: Arc<BlobFileHandle>,
}

/// Writes rewritten values into new output files.
///
/// Outputs are claimed while they are written so GC ignores them and they
/// are not obsoleted before the commit gives them live bytes.
pub struct BlobRewriter<'a> {
    core: &'a EngineCore,
    target: RewriteTarget,
    codec: BlobCodec,
    /// Values held back until there is enough data to train a dictionary.
    staged: Vec<(Key, BlobIndex, Value)>,
    staged_bytes: usize,
    dictionary_decided: bool,
    current: Option<OpenOutput>,
    outputs: Vec<Arc<BlobFileHandle>>,
    pending: Vec<PendingRewrite>,
    bytes_written: u64,
}

impl<'a> BlobRewriter<'a> {
    pub fn new(core: &'a EngineCore, target: RewriteTarget) -> Self {
        let config = &core.config;
        let codec = BlobCodec::new(config.blob_file_compression(), config.compression_options());
        let wants_dictionary = codec.compression() == CompressionType::Zstd
            && config.compression_options().max_dict_bytes > 0;
        Self {
            core,
            target,
            codec,
            staged: Vec::new(),
            staged_bytes: 0,
            dictionary_decided: !wants_dictionary,
            current: None,
            outputs: Vec::new(),
            pending: Vec::new(),
            bytes_written: 0,
        }
    }

    /// Queue `value`, currently stored at `expected`, for rewriting.
    pub fn add(&mut self, key: Key, expected: BlobIndex, value: Value) -> Result<()> {
        let level = match self.target {
            RewriteTarget::Inline => {
                self.pending.push(PendingRewrite {
                    key,
                    expected,
                    replacement: StoredValue::Inline(value),
                });
                return Ok(());
            }
            RewriteTarget::Blob { level } => level,
        };

        if !self.dictionary_decided {
            self.staged_bytes += value.len();
            self.staged.push((key, expected, value));
            if self.staged_bytes >= self.core.config.compression_options().train_bytes() {
                self.train_and_drain(level)?;
            }
            return Ok(());
        }
        self.append(level, key, expected, &value)
    }

    /// Seal every output. After this the rewrite is ready to commit.
    pub fn finish(&mut self) -> Result<()> {
        if let RewriteTarget::Blob { level } = self.target {
            if !self.staged.is_empty() {
                self.train_and_drain(level)?;
            }
        }
        self.seal_current()
    }

    pub fn into_output(self) -> RewriteOutput {
        RewriteOutput {
            pending: self.pending,
            outputs: self.outputs,
            bytes_written: self.bytes_written,
        }
    }

    /// Throw away every output written so far.
    pub fn abandon(mut self) {
        if let Some(open) = self.current.take() {
            let number = open.handle.file_number();
            open.builder.abandon();
            self.outputs.push(open.handle);
            log::debug!("abandoned rewrite output {}", number);
        }
        for handle in self.outputs.drain(..) {
            if let Err(e) = self.core.files.drop_file(handle.file_number()) {
                log::warn!(
                    "failed to drop rewrite output {}: {}",
                    handle.file_number(),
                    e
                );
            }
        }
    }

    fn train_and_drain(&mut self, level: usize) -> Result<()> {
        let staged = mem::take(&mut self.staged);
        self.staged_bytes = 0;
        let samples: Vec<Value> = staged.iter().map(|(_, _, v)| v.clone()).collect();
        let options = self.core.config.compression_options();
        if let Some(dict) = compression::train_dictionary(self.codec.compression(), options, &samples)
        {
            log::debug!("trained {} byte dictionary from {} samples", dict.len(), samples.len());
            self.codec = self.codec.clone().with_dictionary(dict);
        }
        self.dictionary_decided = true;
        for (key, expected, value) in staged {
            self.append(level, key, expected, &value)?;
        }
        Ok(())
    }

    fn append(&mut self, level: usize, key: Key, expected: BlobIndex, value: &[u8]) -> Result<()> {
        let mut open = match self.current.take() {
            Some(open) => open,
            None => self.open_output(level)?,
        };
        let index = match open.builder.add(&key, value) {
            Ok(index) => index,
            Err(e) => {
                self.current = Some(open);
                return Err(e);
            }
        };
        self.bytes_written += index.size;
        self.pending.push(PendingRewrite {
            key,
            expected,
            replacement: StoredValue::Blob(index),
        });
        let full = open.builder.file_size() >= self.core.config.blob_file_target_size();
        self.current = Some(open);
        if full {
            self.seal_current()?;
        }
        Ok(())
    }

    fn open_output(&self, level: usize) -> Result<OpenOutput> {
        let handle = self
            .core
            .files
            .register_new(level, self.codec.compression())?;
        handle.try_claim();
        let builder = BlobFileBuilder::create(
            handle.path().to_path_buf(),
            handle.file_number(),
            self.codec.clone(),
            false,
            self.core.config.sync_writes(),
        );
        match builder {
            Ok(builder) => Ok(OpenOutput { builder, handle }),
            Err(e) => {
                if let Err(drop_err) = self.core.files.drop_file(handle.file_number()) {
                    log::warn!("failed to drop output {}: {}", handle.file_number(), drop_err);
                }
                Err(e)
            }
        }
    }

    fn seal_current(&mut self) -> Result<()> {
        let Some(open) = self.current.take() else {
            return Ok(());
        };
        let handle = Arc::clone(&open.handle);
        match open.builder.finish() {
            Ok(sealed) => {
                self.outputs.push(Arc::clone(&handle));
                self.core.files.seal(&handle, &sealed)
            }
            Err(e) => {
                self.outputs.push(handle);
                Err(e)
            }
        }
    }
}

/// Sealed outputs plus the index updates that make them visible.
#[derive(Debug)]
pub struct RewriteOutput {
    pending: Vec<PendingRewrite>,
    outputs: Vec<Arc<BlobFileHandle>>,
    bytes_written: u64,
}

impl RewriteOutput {
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn outputs(&self) -> &[Arc<BlobFileHandle>] {
        &self.outputs
    }

    /// Point every still-current key at its new copy.
    ///
    /// Outputs are released afterwards whether or not the commit finished;
    /// one that ended up with no live bytes is obsoleted.
    pub fn commit(self, core: &EngineCore, mode: RewriteMode) -> Result<CommitStats> {
        let mut stats = CommitStats::default();
        let result = self.apply(core, mode, &mut stats);
        for output in &self.outputs {
            output.release();
            if output.live_bytes() == 0 {
                core.files.mark_obsolete(output)?;
            }
        }
        result.map(|()| stats)
    }

    fn apply(&self, core: &EngineCore, mode: RewriteMode, stats: &mut CommitStats) -> Result<()> {
        for rewrite in &self.pending {
            // Credit first so a racing overwrite cannot debit bytes that
            // were never counted.
            let new_index = rewrite.replacement.blob_index().copied();
            if let Some(index) = &new_index {
                core.files.credit(index);
            }
            let applied =
                core.base
                    .rewrite(&rewrite.key, &rewrite.expected, rewrite.replacement.clone(), mode);
            match applied {
                Ok(true) => {
                    core.files.debit(&rewrite.expected)?;
                    stats.applied += 1;
                }
                Ok(false) => {
                    if let Some(index) = &new_index {
                        core.files.debit(index)?;
                    }
                    stats.stale += 1;
                }
                Err(e) => {
                    if let Some(index) = &new_index {
                        core.files.debit(index)?;
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}

/// Rewrite the blob values among `entries` whose file passes `select`, then
/// commit with compare-and-set. Used on the compaction path.
pub fn rewrite_entries<'e>(
    core: &EngineCore,
    entries: impl Iterator<Item = (&'e Key, &'e BlobIndex)>,
    target: RewriteTarget,
    select: impl Fn(&BlobFileHandle) -> bool,
) -> Result<CommitStats> {
    let mut rewriter = BlobRewriter::new(core, target);
    if let Err(e) = stage_entries(core, entries, &select, &mut rewriter) {
        rewriter.abandon();
        return Err(e);
    }
    let output = rewriter.into_output();
    if !output.is_empty() {
        log::debug!(
            "rewriting {} values ({:?}, {} bytes written)",
            output.len(),
            target,
            output.bytes_written()
        );
    }
    output.commit(core, RewriteMode::CompareAndSet)
}

fn stage_entries<'e>(
    core: &EngineCore,
    entries: impl Iterator<Item = (&'e Key, &'e BlobIndex)>,
    select: &impl Fn(&BlobFileHandle) -> bool,
    rewriter: &mut BlobRewriter<'_>,
) -> Result<()> {
    for (key, index) in entries {
        // A missing file means the key has already moved on.
        let Some(file) = core.files.get(index.file_number) else {
            continue;
        };
        if !select(&file) {
            continue;
        }
        let value = file.get(key, index)?;
        rewriter.add(key.clone(), *index, value)?;
    }
    rewriter.finish()
}
