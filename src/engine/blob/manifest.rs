//! LETHE - Blob Manifest
//! Append-only log of blob file catalog changes.
//!
//! ## Binary Format (per edit)
//! ```text
//! [len: 4 bytes (LE)][crc: 4 bytes (LE)][bincode ManifestEdit: len bytes]
//! ```

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

use super::meta::BlobFileMeta;
use crate::error::{LetheError, Result};
use crate::types::FileNumber;

pub const MANIFEST_NAME: &str = "MANIFEST";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ManifestEdit {
    AddFile(BlobFileMeta),
    SealFile(BlobFileMeta),
    ObsoleteFile(FileNumber),
    DeleteFile(FileNumber),
}

/// Catalog state rebuilt from the manifest.
#[derive(Debug, Default)]
pub struct ManifestState {
    /// File number -> (meta, obsolete).
    pub files: BTreeMap<FileNumber, (BlobFileMeta, bool)>,
    /// Highest file number ever allocated, including deleted files.
    pub max_file_number: FileNumber,
}

impl ManifestState {
    fn apply(&mut self, edit: ManifestEdit) {
        match edit {
            // Re-adding a file revives it.
            ManifestEdit::AddFile(meta) => {
                self.max_file_number = self.max_file_number.max(meta.file_number);
                self.files.insert(meta.file_number, (meta, false));
            }
            ManifestEdit::SealFile(meta) => {
                self.max_file_number = self.max_file_number.max(meta.file_number);
                let obsolete = self
                    .files
                    .get(&meta.file_number)
                    .map_or(false, |(_, o)| *o);
                self.files.insert(meta.file_number, (meta, obsolete));
            }
            ManifestEdit::ObsoleteFile(number) => {
                if let Some((_, obsolete)) = self.files.get_mut(&number) {
                    *obsolete = true;
                }
            }
            ManifestEdit::DeleteFile(number) => {
                self.max_file_number = self.max_file_number.max(number);
                self.files.remove(&number);
            }
        }
    }
}

pub struct Manifest {
    path: PathBuf,
    file: File,
    sync: bool,
}

impl Manifest {
    /// Replay the manifest in `dir`, then rewrite it as a compact snapshot.
    pub fn open(dir: &Path, sync: bool) -> Result<(Self, ManifestState)> {
        let path = dir.join(MANIFEST_NAME);
        let state = Self::replay(&path)?;

        let tmp = path.with_extension("tmp");
        {
            let mut out = File::create(&tmp)?;
            for (meta, obsolete) in state.files.values() {
                out.write_all(&encode(&ManifestEdit::AddFile(meta.clone()))?)?;
                if *obsolete {
                    out.write_all(&encode(&ManifestEdit::ObsoleteFile(meta.file_number))?)?;
                }
            }
            // Keep the high-water mark so deleted numbers are never reused.
            if !state.files.contains_key(&state.max_file_number) && state.max_file_number > 0 {
                out.write_all(&encode(&ManifestEdit::DeleteFile(state.max_file_number))?)?;
            }
            out.sync_all()?;
        }
        fs::rename(&tmp, &path)?;

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok((Self { path, file, sync }, state))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, edit: &ManifestEdit) -> Result<()> {
        self.file.write_all(&encode(edit)?)?;
        if self.sync {
            self.file.sync_data()?;
        }
        Ok(())
    }

    fn replay(path: &Path) -> Result<ManifestState> {
        let data = match fs::read(path) {
            Ok(d) => d,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(ManifestState::default()),
            Err(e) => return Err(e.into()),
        };
        let mut state = ManifestState::default();
        let mut buf = &data[..];
        while buf.remaining() >= 8 {
            let len = (&buf[..4]).get_u32_le() as usize;
            let crc = (&buf[4..8]).get_u32_le();
            if buf.remaining() < 8 + len {
                log::warn!("manifest {:?}: ignoring torn tail", path);
                break;
            }
            let payload = &buf[8..8 + len];
            if crc32fast::hash(payload) != crc {
                if buf.remaining() == 8 + len {
                    log::warn!("manifest {:?}: dropping torn final edit", path);
                    break;
                }
                return Err(LetheError::Corruption(format!(
                    "manifest {:?} CRC mismatch",
                    path
                )));
            }
            state.apply(bincode::deserialize(payload)?);
            buf.advance(8 + len);
        }
        Ok(state)
    }
}

fn encode(edit: &ManifestEdit) -> Result<Vec<u8>> {
    let payload = bincode::serialize(edit)?;
    let mut buf = Vec::with_capacity(payload.len() + 8);
    buf.put_u32_le(payload.len() as u32);
    buf.put_u32_le(crc32fast::hash(&payload));
    buf.put_slice(&payload);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CompressionType;

    fn meta(file_number: FileNumber) -> BlobFileMeta {
        BlobFileMeta::new(file_number, 0, file_number, CompressionType::None)
    }

    #[test]
    fn test_replay_tracks_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (mut manifest, state) = Manifest::open(dir.path(), true).unwrap();
            assert!(state.files.is_empty());
            manifest.append(&ManifestEdit::AddFile(meta(1))).unwrap();
            manifest.append(&ManifestEdit::AddFile(meta(2))).unwrap();
            let mut sealed = meta(2);
            sealed.sealed = true;
            manifest.append(&ManifestEdit::SealFile(sealed)).unwrap();
            manifest.append(&ManifestEdit::ObsoleteFile(2)).unwrap();
            manifest.append(&ManifestEdit::AddFile(meta(3))).unwrap();
            manifest.append(&ManifestEdit::DeleteFile(3)).unwrap();
        }
        let (_, state) = Manifest::open(dir.path(), true).unwrap();
        assert_eq!(state.files.len(), 2);
        assert!(!state.files[&1].1);
        assert!(state.files[&2].0.sealed);
        assert!(state.files[&2].1);
        assert_eq!(state.max_file_number, 3);
    }

    #[test]
    fn test_add_after_obsolete_revives() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (mut manifest, _) = Manifest::open(dir.path(), true).unwrap();
            manifest.append(&ManifestEdit::AddFile(meta(4))).unwrap();
            manifest.append(&ManifestEdit::ObsoleteFile(4)).unwrap();
            manifest.append(&ManifestEdit::AddFile(meta(4))).unwrap();
        }
        let (_, state) = Manifest::open(dir.path(), true).unwrap();
        assert!(!state.files[&4].1);
    }

    #[test]
    fn test_snapshot_keeps_high_water_mark() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (mut manifest, _) = Manifest::open(dir.path(), true).unwrap();
            manifest.append(&ManifestEdit::AddFile(meta(9))).unwrap();
            manifest.append(&ManifestEdit::DeleteFile(9)).unwrap();
        }
        // First reopen rewrites the snapshot; the second must still see 9.
        drop(Manifest::open(dir.path(), true).unwrap());
        let (_, state) = Manifest::open(dir.path(), true).unwrap();
        assert!(state.files.is_empty());
        assert_eq!(state.max_file_number, 9);
    }
}
