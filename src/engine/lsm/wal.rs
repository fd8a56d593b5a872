//! LETHE - Write-Ahead Log (WAL)
//! Logs every LSM mutation before it is applied to the MemTable, and
//! snapshots the MemTable into a checkpoint so the log can be truncated.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut};

use super::memtable::{BaseEntry, MemTable};
use crate::error::{LetheError, Result};
use crate::types::{Key, MergeOperand, StoredValue};

/// Operation type for WAL entries.
#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(u8)]
enum OpType {
    Put = 1,
    Delete = 2,
    Merge = 3,
}

impl OpType {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(OpType::Put),
            2 => Some(OpType::Delete),
            3 => Some(OpType::Merge),
            _ => None,
        }
    }
}

/// Write-Ahead Log for crash recovery and durability.
///
/// ## Binary Format (per entry)
/// ```text
/// [op_type: 1 byte][key_len: 4 bytes (LE)][key: N bytes][payload_len: 4 bytes (LE)][payload: M bytes][crc: 4 bytes]
/// ```
/// The payload is a bincode-encoded `StoredValue` (put) or `MergeOperand`
/// (merge), and empty for deletes.
pub struct WriteAheadLog {
    path: PathBuf,
    file: File,
    sync: bool,
}

impl WriteAheadLog {
    /// Open or create a WAL file at the specified path.
    pub fn open(path: PathBuf, sync: bool) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path, file, sync })
    }

    fn encode(op: OpType, key: &[u8], payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(13 + key.len() + payload.len());
        buf.put_u8(op as u8);
        buf.put_u32_le(key.len() as u32);
        buf.put_slice(key);
        buf.put_u32_le(payload.len() as u32);
        buf.put_slice(payload);
        let crc = crc32fast::hash(&buf);
        buf.put_u32_le(crc);
        buf
    }

    fn append(&mut self, encoded: &[u8]) -> Result<()> {
        self.file.write_all(encoded)?;
        if self.sync {
            self.file.sync_data()?;
        }
        Ok(())
    }

    pub fn append_put(&mut self, key: &[u8], value: &StoredValue) -> Result<()> {
        let payload = bincode::serialize(value)?;
        self.append(&Self::encode(OpType::Put, key, &payload))
    }

    pub fn append_delete(&mut self, key: &[u8]) -> Result<()> {
        self.append(&Self::encode(OpType::Delete, key, &[]))
    }

    pub fn append_merge(&mut self, key: &[u8], operand: &MergeOperand) -> Result<()> {
        let payload = bincode::serialize(operand)?;
        self.append(&Self::encode(OpType::Merge, key, &payload))
    }

    /// Replay a WAL file on top of `table`.
    ///
    /// A torn record at the tail (crash mid-append) ends replay; a CRC
    /// mismatch in the middle of the log is reported as corruption.
    pub fn replay(path: &Path, table: &mut MemTable) -> Result<usize> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let mut data = Vec::new();
        BufReader::new(file).read_to_end(&mut data)?;

        let mut buf = &data[..];
        let mut applied = 0;
        while !buf.is_empty() {
            let record_start = data.len() - buf.len();
            let Some((op_byte, key, payload, record_len)) = Self::decode(buf) else {
                log::warn!(
                    "WAL {:?}: ignoring torn tail at offset {}",
                    path,
                    record_start
                );
                break;
            };
            let crc_at = record_len - 4;
            let expected = (&buf[crc_at..record_len]).get_u32_le();
            if crc32fast::hash(&buf[..crc_at]) != expected {
                if record_len == buf.len() {
                    log::warn!("WAL {:?}: dropping torn final record", path);
                    break;
                }
                return Err(LetheError::Corruption(format!(
                    "WAL CRC mismatch at offset {}",
                    record_start
                )));
            }
            let op = OpType::from_u8(op_byte).ok_or_else(|| {
                LetheError::Corruption(format!(
                    "WAL record at offset {} has unknown op {}",
                    record_start, op_byte
                ))
            })?;
            match op {
                OpType::Put => {
                    let value: StoredValue = bincode::deserialize(payload)?;
                    table.insert(key.to_vec(), value);
                }
                OpType::Delete => {
                    table.delete(key.to_vec());
                }
                OpType::Merge => {
                    let operand: MergeOperand = bincode::deserialize(payload)?;
                    table.merge(key, operand);
                }
            }
            applied += 1;
            buf = &buf[record_len..];
        }
        Ok(applied)
    }

    /// Parse one record header; `None` if the buffer is too short.
    fn decode(buf: &[u8]) -> Option<(u8, &[u8], &[u8], usize)> {
        let mut cursor = buf;
        if cursor.remaining() < 5 {
            return None;
        }
        let op = cursor.get_u8();
        let key_len = cursor.get_u32_le() as usize;
        if cursor.remaining() < key_len + 4 {
            return None;
        }
        let key_start = 5;
        cursor.advance(key_len);
        let payload_len = cursor.get_u32_le() as usize;
        if cursor.remaining() < payload_len + 4 {
            return None;
        }
        let payload_start = key_start + key_len + 4;
        let record_len = payload_start + payload_len + 4;
        Some((
            op,
            &buf[key_start..key_start + key_len],
            &buf[payload_start..payload_start + payload_len],
            record_len,
        ))
    }

    /// Truncate the WAL file (called after a successful checkpoint).
    pub fn truncate(&mut self) -> Result<()> {
        self.file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        self.file.sync_all()?;
        self.file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        Ok(())
    }
}

/// Write a full snapshot of the table: `[crc: 4 bytes][bincode entries]`.
pub fn write_checkpoint(path: &Path, table: &MemTable) -> Result<()> {
    let body = bincode::serialize(table.entries())?;
    let mut buf = Vec::with_capacity(body.len() + 4);
    buf.put_u32_le(crc32fast::hash(&body));
    buf.put_slice(&body);

    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(&buf)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Load a checkpoint written by [`write_checkpoint`]; empty if absent.
pub fn read_checkpoint(path: &Path) -> Result<MemTable> {
    let data = match fs::read(path) {
        Ok(d) => d,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(MemTable::new()),
        Err(e) => return Err(e.into()),
    };
    if data.len() < 4 {
        return Err(LetheError::RecoveryFailed(format!(
            "checkpoint {:?} is truncated",
            path
        )));
    }
    let mut header = &data[..4];
    let expected = header.get_u32_le();
    let body = &data[4..];
    if crc32fast::hash(body) != expected {
        return Err(LetheError::Corruption(format!(
            "checkpoint {:?} CRC mismatch",
            path
        )));
    }
    let entries: BTreeMap<Key, BaseEntry> = bincode::deserialize(body)?;
    Ok(MemTable::from_entries(entries))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BlobIndex;

    fn index() -> BlobIndex {
        BlobIndex {
            file_number: 3,
            offset: 24,
            size: 90,
        }
    }

    #[test]
    fn test_replay_put_delete_merge() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("base.wal");
        {
            let mut wal = WriteAheadLog::open(path.clone(), true).unwrap();
            wal.append_put(b"a", &StoredValue::Inline(b"1".to_vec())).unwrap();
            wal.append_put(b"b", &StoredValue::Blob(index())).unwrap();
            wal.append_delete(b"a").unwrap();
            wal.append_merge(
                b"b",
                &MergeOperand {
                    expected: index(),
                    replacement: StoredValue::Inline(b"moved".to_vec()),
                    generation: 4,
                },
            )
            .unwrap();
        }
        let mut table = MemTable::new();
        assert_eq!(WriteAheadLog::replay(&path, &mut table).unwrap(), 4);
        assert_eq!(table.get(b"a"), None);
        assert_eq!(table.get(b"b"), Some(StoredValue::Inline(b"moved".to_vec())));
    }

    #[test]
    fn test_replay_ignores_torn_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("base.wal");
        {
            let mut wal = WriteAheadLog::open(path.clone(), true).unwrap();
            wal.append_put(b"a", &StoredValue::Inline(b"1".to_vec())).unwrap();
        }
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[1, 9, 0]).unwrap();

        let mut table = MemTable::new();
        assert_eq!(WriteAheadLog::replay(&path, &mut table).unwrap(), 1);
        assert_eq!(table.get(b"a"), Some(StoredValue::Inline(b"1".to_vec())));
    }

    #[test]
    fn test_unknown_op_with_valid_crc_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("base.wal");
        {
            let mut wal = WriteAheadLog::open(path.clone(), true).unwrap();
            wal.append_put(b"a", &StoredValue::Inline(b"1".to_vec())).unwrap();
        }
        let mut record = vec![99u8];
        record.put_u32_le(1);
        record.put_slice(b"z");
        record.put_u32_le(0);
        let crc = crc32fast::hash(&record);
        record.put_u32_le(crc);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&record).unwrap();

        let mut table = MemTable::new();
        let err = WriteAheadLog::replay(&path, &mut table).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_truncate_empties_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("base.wal");
        let mut wal = WriteAheadLog::open(path.clone(), false).unwrap();
        wal.append_delete(b"gone").unwrap();
        wal.truncate().unwrap();
        let mut table = MemTable::new();
        assert_eq!(WriteAheadLog::replay(&path, &mut table).unwrap(), 0);
    }

    #[test]
    fn test_checkpoint_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("base.checkpoint");
        let mut table = MemTable::new();
        table.insert(b"x".to_vec(), StoredValue::Blob(index()));
        write_checkpoint(&path, &table).unwrap();
        let loaded = read_checkpoint(&path).unwrap();
        assert_eq!(loaded.get(b"x"), Some(StoredValue::Blob(index())));
        assert!(read_checkpoint(&dir.path().join("missing")).unwrap().entries().is_empty());
    }
}
