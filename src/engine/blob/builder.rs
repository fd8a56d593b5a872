//! LETHE - Blob File Builder
//! Append side of a blob file, from header to sealed footer.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::compression::BlobCodec;
use super::format::{self, FileHeader, Footer, HEADER_SIZE};
use crate::engine::lsm::compaction::KeyRange;
use crate::error::{LetheError, Result};
use crate::types::{BlobIndex, CompressionType, FileNumber};

/// Summary of a sealed file, recorded in the manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedFile {
    pub file_number: FileNumber,
    pub file_size: u64,
    /// Bytes taken by records.
    pub data_bytes: u64,
    pub record_count: u64,
    pub range: Option<KeyRange>,
    pub has_dictionary: bool,
}

/// Writes one blob file. Records are appended in order and never changed.
pub struct BlobFileBuilder {
    file_number: FileNumber,
    path: PathBuf,
    writer: BufWriter<File>,
    codec: BlobCodec,
    offset: u64,
    offsets: Vec<u64>,
    range: Option<KeyRange>,
    /// Make each record visible to readers as soon as it is added.
    flush_each_record: bool,
    sync: bool,
}

impl BlobFileBuilder {
    pub fn create(
        path: PathBuf,
        file_number: FileNumber,
        codec: BlobCodec,
        flush_each_record: bool,
        sync: bool,
    ) -> Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(LetheError::from_append)?;
        let mut writer = BufWriter::with_capacity(64 * 1024, file);
        let header = FileHeader {
            compression: codec.compression(),
        };
        writer.write_all(&header.encode()).map_err(LetheError::from_append)?;
        if flush_each_record {
            writer.flush().map_err(LetheError::from_append)?;
        }

        Ok(Self {
            file_number,
            path,
            writer,
            codec,
            offset: HEADER_SIZE,
            offsets: Vec::new(),
            range: None,
            flush_each_record,
            sync,
        })
    }

    pub fn file_number(&self) -> FileNumber {
        self.file_number
    }

    /// Bytes written so far, header included.
    pub fn file_size(&self) -> u64 {
        self.offset
    }

    pub fn record_count(&self) -> usize {
        self.offsets.len()
    }

    pub fn compression(&self) -> CompressionType {
        self.codec.compression()
    }

    /// Append a record and return the index addressing it.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<BlobIndex> {
        let payload = self.codec.compress(value)?;
        let record = format::encode_record(key, value.len(), &payload);
        self.writer.write_all(&record).map_err(LetheError::from_append)?;
        if self.flush_each_record {
            self.writer.flush().map_err(LetheError::from_append)?;
            if self.sync {
                self.writer.get_ref().sync_data().map_err(LetheError::from_append)?;
            }
        }

        let index = BlobIndex {
            file_number: self.file_number,
            offset: self.offset,
            size: record.len() as u64,
        };
        self.offsets.push(self.offset);
        self.offset += record.len() as u64;
        match &mut self.range {
            Some(range) => range.extend(key),
            None => self.range = Some(KeyRange::new(key.to_vec(), key.to_vec())),
        }
        Ok(index)
    }

    /// Write dictionary, offset index and footer; the file is immutable after.
    pub fn finish(mut self) -> Result<SealedFile> {
        let data_end = self.offset;
        let dict = self.codec.dictionary().map(<[u8]>::to_vec).unwrap_or_default();
        self.writer.write_all(&dict).map_err(LetheError::from_append)?;
        let index_offset = data_end + dict.len() as u64;
        let index_block = format::encode_offsets(&self.offsets);
        self.writer.write_all(&index_block).map_err(LetheError::from_append)?;
        let footer = Footer {
            data_end,
            dict_len: dict.len() as u32,
            index_offset,
            record_count: self.offsets.len() as u64,
        };
        self.writer.write_all(&footer.encode()).map_err(LetheError::from_append)?;
        self.writer.flush().map_err(LetheError::from_append)?;
        self.writer.get_ref().sync_all()?;

        let file_size = index_offset + index_block.len() as u64 + format::FOOTER_SIZE;
        log::debug!(
            "sealed blob file {} ({} records, {} bytes)",
            self.file_number,
            self.offsets.len(),
            file_size
        );
        Ok(SealedFile {
            file_number: self.file_number,
            file_size,
            data_bytes: data_end - HEADER_SIZE,
            record_count: self.offsets.len() as u64,
            range: self.range,
            has_dictionary: !dict.is_empty(),
        })
    }

    /// Drop the file without sealing it, e.g. when a GC batch aborts.
    pub fn abandon(self) {
        let path = self.path.clone();
        drop(self);
        if let Err(e) = fs::remove_file(&path) {
            log::warn!("failed to remove abandoned blob file {:?}: {}", path, e);
        }
    }

    /// Seal a file left unsealed by a crash: keep every record that passes
    /// its CRC check, truncate the torn tail, then write the trailer.
    pub fn recover_unsealed(path: &Path, file_number: FileNumber) -> Result<SealedFile> {
        let mut data = Vec::new();
        File::open(path)?.read_to_end(&mut data)?;
        let header = FileHeader::decode(&data)?;
        if header.compression != CompressionType::None && !header.compression.is_supported() {
            return Err(LetheError::RecoveryFailed(format!(
                "blob file {} uses {:?}, not available in this build",
                file_number, header.compression
            )));
        }

        let mut offsets = Vec::new();
        let mut range: Option<KeyRange> = None;
        let mut pos = HEADER_SIZE as usize;
        while let Some(len) = format::record_len(&data[pos..]) {
            let end = pos + len as usize;
            if end > data.len() {
                break;
            }
            let Ok(record) = format::decode_record(&data[pos..end]) else {
                break;
            };
            match &mut range {
                Some(r) => r.extend(record.key),
                None => range = Some(KeyRange::new(record.key.to_vec(), record.key.to_vec())),
            }
            offsets.push(pos as u64);
            pos = end;
        }
        if pos < data.len() {
            log::warn!(
                "blob file {}: dropping {} torn bytes during recovery",
                file_number,
                data.len() - pos
            );
        }

        let data_end = pos as u64;
        let mut file = OpenOptions::new().write(true).open(path)?;
        file.set_len(data_end)?;
        file.seek(SeekFrom::Start(data_end))?;
        let index_block = format::encode_offsets(&offsets);
        let footer = Footer {
            data_end,
            dict_len: 0,
            index_offset: data_end,
            record_count: offsets.len() as u64,
        };
        file.write_all(&index_block)?;
        file.write_all(&footer.encode())?;
        file.sync_all()?;

        Ok(SealedFile {
            file_number,
            file_size: data_end + index_block.len() as u64 + format::FOOTER_SIZE,
            data_bytes: data_end - HEADER_SIZE,
            record_count: offsets.len() as u64,
            range,
            has_dictionary: false,
        })
    }
}
