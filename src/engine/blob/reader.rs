//! LETHE - Blob File Reader
//! Random reads by [`BlobIndex`] and sequential iteration for GC.

use std::fs::File;
use std::io;
use std::path::Path;

use super::compression::BlobCodec;
use super::format::{self, FileHeader, Footer, FOOTER_SIZE, HEADER_SIZE};
use crate::error::{LetheError, Result};
use crate::types::{BlobIndex, FileNumber, Key, Value};

/// Trailer data available once a file is sealed.
#[derive(Debug, Clone)]
struct SealedLayout {
    footer: Footer,
    offsets: Vec<u64>,
}

/// A decoded record together with the index that addresses it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobRecord {
    pub key: Key,
    pub value: Value,
    pub index: BlobIndex,
}

/// Read side of one blob file. Records are immutable once written, so a
/// read at a fixed offset always observes the same bytes.
pub struct BlobFileReader {
    file_number: FileNumber,
    file: File,
    codec: BlobCodec,
    sealed: Option<SealedLayout>,
}

impl BlobFileReader {
    /// Open a blob file. Unsealed files (still being appended) are readable
    /// up to their current length.
    pub fn open(path: &Path, file_number: FileNumber) -> Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();

        let mut header_buf = [0u8; HEADER_SIZE as usize];
        read_exact_at(&file, &mut header_buf, 0)?;
        let header = FileHeader::decode(&header_buf)?;
        let mut codec = BlobCodec::new(header.compression, &Default::default());

        let mut sealed = None;
        if len >= HEADER_SIZE + FOOTER_SIZE {
            let mut footer_buf = [0u8; FOOTER_SIZE as usize];
            read_exact_at(&file, &mut footer_buf, len - FOOTER_SIZE)?;
            // An unsealed file ends in record bytes, not a footer.
            if let Ok(footer) = Footer::decode(&footer_buf) {
                let index_len = check_layout(&footer, len).ok_or_else(|| {
                    LetheError::Corruption(format!(
                        "blob file {} footer does not fit a {} byte file",
                        file_number, len
                    ))
                })?;
                if footer.dict_len > 0 {
                    let mut dict = vec![0u8; footer.dict_len as usize];
                    read_exact_at(&file, &mut dict, footer.data_end)?;
                    codec = codec.with_dictionary(dict);
                }
                let mut index_buf = vec![0u8; index_len as usize];
                read_exact_at(&file, &mut index_buf, footer.index_offset)?;
                let offsets = format::decode_offsets(&index_buf, footer.record_count)?;
                sealed = Some(SealedLayout { footer, offsets });
            }
        }

        Ok(Self {
            file_number,
            file,
            codec,
            sealed,
        })
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.is_some()
    }

    /// End of the record area.
    pub fn data_end(&self) -> Result<u64> {
        match &self.sealed {
            Some(layout) => Ok(layout.footer.data_end),
            None => Ok(self.file.metadata()?.len()),
        }
    }

    /// Index addressing the `i`-th record of a sealed file.
    pub fn index_at(&self, i: usize) -> Option<BlobIndex> {
        let layout = self.sealed.as_ref()?;
        let offset = *layout.offsets.get(i)?;
        let end = layout
            .offsets
            .get(i + 1)
            .copied()
            .unwrap_or(layout.footer.data_end);
        Some(BlobIndex {
            file_number: self.file_number,
            offset,
            size: end - offset,
        })
    }

    pub fn record_count(&self) -> Option<usize> {
        self.sealed.as_ref().map(|s| s.offsets.len())
    }

    /// Read and verify the record addressed by `index`.
    pub fn read(&self, index: &BlobIndex) -> Result<BlobRecord> {
        if index.file_number != self.file_number {
            return Err(LetheError::Corruption(format!(
                "index for file {} used on file {}",
                index.file_number, self.file_number
            )));
        }
        let data_end = self.data_end()?;
        let end = index.offset.checked_add(index.size);
        if index.offset < HEADER_SIZE || end.map_or(true, |end| end > data_end) {
            return Err(LetheError::Corruption(format!(
                "blob index {}:{}+{} is past the end of the file ({})",
                index.file_number, index.offset, index.size, data_end
            )));
        }

        let mut buf = vec![0u8; index.size as usize];
        read_exact_at(&self.file, &mut buf, index.offset)?;
        let raw = format::decode_record(&buf)?;
        let value = self.codec.decompress(raw.payload, raw.value_len)?;
        Ok(BlobRecord {
            key: raw.key.to_vec(),
            value,
            index: *index,
        })
    }

    /// Read the value for `key`, checking that the record belongs to it.
    pub fn get(&self, key: &[u8], index: &BlobIndex) -> Result<Value> {
        let record = self.read(index)?;
        if record.key != key {
            return Err(LetheError::Corruption(format!(
                "blob record at {}:{} belongs to another key",
                index.file_number, index.offset
            )));
        }
        Ok(record.value)
    }

    /// Iterate over every record of a sealed file in append order.
    pub fn iter(&self) -> Result<BlobRecordIter<'_>> {
        if self.sealed.is_none() {
            return Err(LetheError::Corruption(format!(
                "blob file {} is not sealed",
                self.file_number
            )));
        }
        Ok(BlobRecordIter {
            reader: self,
            next: 0,
        })
    }
}

/// Length of the offset index, or `None` when the footer's regions do not
/// line up inside a file of `len` bytes.
fn check_layout(footer: &Footer, len: u64) -> Option<u64> {
    let index_end = len.checked_sub(FOOTER_SIZE)?;
    let dict_end = footer.data_end.checked_add(footer.dict_len as u64)?;
    if footer.data_end < HEADER_SIZE || dict_end > footer.index_offset {
        return None;
    }
    index_end.checked_sub(footer.index_offset)
}

/// Positional read. Does not move a shared cursor, so concurrent readers
/// need no lock.
#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset) {
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Sequential iterator over a sealed blob file.
pub struct BlobRecordIter<'a> {
    reader: &'a BlobFileReader,
    next: usize,
}

impl Iterator for BlobRecordIter<'_> {
    type Item = Result<BlobRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.reader.index_at(self.next)?;
        self.next += 1;
        Some(self.reader.read(&index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::blob::builder::BlobFileBuilder;
    use crate::types::CompressionType;
    use std::sync::Arc;

    fn write_file(path: &Path, records: usize) -> Vec<(Key, BlobIndex)> {
        let mut b =
            BlobFileBuilder::create(path.to_path_buf(), 1, BlobCodec::uncompressed(), false, false)
                .unwrap();
        let mut out = Vec::new();
        for i in 0..records {
            let key = format!("key{:04}", i).into_bytes();
            let index = b.add(&key, &vec![i as u8; 256]).unwrap();
            out.push((key, index));
        }
        b.finish().unwrap();
        out
    }

    #[test]
    fn test_concurrent_reads_see_their_own_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("000001.blob");
        let records = Arc::new(write_file(&path, 64));
        let reader = Arc::new(BlobFileReader::open(&path, 1).unwrap());

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let reader = Arc::clone(&reader);
                let records = Arc::clone(&records);
                std::thread::spawn(move || {
                    for round in 0..50 {
                        let i = (t * 17 + round * 7) % records.len();
                        let (key, index) = &records[i];
                        assert_eq!(reader.get(key, index).unwrap(), vec![i as u8; 256]);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn test_footer_past_end_of_file_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("000002.blob");
        let header = FileHeader {
            compression: CompressionType::None,
        };
        let footer = Footer {
            data_end: HEADER_SIZE,
            dict_len: 0,
            index_offset: 1 << 20,
            record_count: 0,
        };
        let mut bytes = header.encode().to_vec();
        bytes.extend_from_slice(&footer.encode());
        std::fs::write(&path, bytes).unwrap();

        let err = BlobFileReader::open(&path, 2).err().unwrap();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_dictionary_overlapping_index_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("000003.blob");
        let header = FileHeader {
            compression: CompressionType::None,
        };
        let footer = Footer {
            data_end: HEADER_SIZE,
            dict_len: 64,
            index_offset: HEADER_SIZE,
            record_count: 0,
        };
        let mut bytes = header.encode().to_vec();
        bytes.extend_from_slice(&footer.encode());
        std::fs::write(&path, bytes).unwrap();

        assert!(BlobFileReader::open(&path, 3).err().unwrap().is_corruption());
    }
}
