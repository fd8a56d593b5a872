//! LETHE - Blob File Format
//!
//! ## Layout
//! ```text
//! [header: 12 bytes][record 1]...[record N][dictionary][offset index][footer: 40 bytes]
//! ```
//!
//! Header: `[magic: 4][version: 4][compression: 1][reserved: 3]`
//!
//! Record: `[crc: 4][key_len: 4][value_len: 4][payload_len: 4][key][payload]`,
//! all little-endian. The CRC covers everything after itself. `value_len` is
//! the uncompressed value length, `payload_len` the stored length.
//!
//! The dictionary, offset index and footer only exist once the file is
//! sealed. The offset index is `record_count` u64 offsets followed by a CRC.
//! Footer: `[data_end: 8][dict_len: 4][index_offset: 8][record_count: 8][crc: 4][magic: 8]`.

use bytes::{Buf, BufMut};

use crate::error::{LetheError, Result};
use crate::types::CompressionType;

pub const BLOB_MAGIC: u32 = 0x4C42_4C42; // "BLBL"
pub const FOOTER_MAGIC: u64 = 0x4C45_5448_4553_4541;
pub const BLOB_VERSION: u32 = 1;

pub const HEADER_SIZE: u64 = 12;
pub const RECORD_HEADER_SIZE: u64 = 16;
pub const FOOTER_SIZE: u64 = 40;

/// Fixed file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub compression: CompressionType,
}

impl FileHeader {
    pub fn encode(&self) -> [u8; HEADER_SIZE as usize] {
        let mut out = [0u8; HEADER_SIZE as usize];
        let mut buf = &mut out[..];
        buf.put_u32_le(BLOB_MAGIC);
        buf.put_u32_le(BLOB_VERSION);
        buf.put_u8(self.compression as u8);
        out
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE as usize {
            return Err(LetheError::Corruption("blob file header truncated".into()));
        }
        let magic = buf.get_u32_le();
        if magic != BLOB_MAGIC {
            return Err(LetheError::Corruption(format!(
                "bad blob file magic {:#x}",
                magic
            )));
        }
        let version = buf.get_u32_le();
        if version != BLOB_VERSION {
            return Err(LetheError::Corruption(format!(
                "unsupported blob file version {}",
                version
            )));
        }
        let tag = buf.get_u8();
        let compression = CompressionType::from_u8(tag)
            .ok_or_else(|| LetheError::Corruption(format!("unknown compression tag {}", tag)))?;
        Ok(Self { compression })
    }
}

/// Encode one record. `payload` is the value as stored (maybe compressed).
pub fn encode_record(key: &[u8], value_len: usize, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(RECORD_HEADER_SIZE as usize + key.len() + payload.len());
    buf.put_u32_le(0); // crc placeholder
    buf.put_u32_le(key.len() as u32);
    buf.put_u32_le(value_len as u32);
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(key);
    buf.put_slice(payload);
    let crc = crc32fast::hash(&buf[4..]);
    (&mut buf[..4]).put_u32_le(crc);
    buf
}

/// A record parsed from a byte slice.
#[derive(Debug, PartialEq, Eq)]
pub struct RawRecord<'a> {
    pub key: &'a [u8],
    pub value_len: usize,
    pub payload: &'a [u8],
}

/// Length of the record starting at `buf`, read from its header only.
pub fn record_len(mut buf: &[u8]) -> Option<u64> {
    if buf.len() < RECORD_HEADER_SIZE as usize {
        return None;
    }
    buf.advance(4);
    let key_len = buf.get_u32_le() as u64;
    buf.advance(4);
    let payload_len = buf.get_u32_le() as u64;
    Some(RECORD_HEADER_SIZE + key_len + payload_len)
}

/// Decode and verify a complete record.
pub fn decode_record(buf: &[u8]) -> Result<RawRecord<'_>> {
    let len = record_len(buf)
        .ok_or_else(|| LetheError::Corruption("blob record header truncated".into()))?;
    if len as usize != buf.len() {
        return Err(LetheError::Corruption(format!(
            "blob record length {} does not match index size {}",
            len,
            buf.len()
        )));
    }
    let mut header = buf;
    let crc = header.get_u32_le();
    if crc32fast::hash(&buf[4..]) != crc {
        return Err(LetheError::Corruption("blob record CRC mismatch".into()));
    }
    let key_len = header.get_u32_le() as usize;
    let value_len = header.get_u32_le() as usize;
    let key_start = RECORD_HEADER_SIZE as usize;
    Ok(RawRecord {
        key: &buf[key_start..key_start + key_len],
        value_len,
        payload: &buf[key_start + key_len..],
    })
}

/// Sealed file trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footer {
    /// End of the record area; the dictionary starts here.
    pub data_end: u64,
    pub dict_len: u32,
    pub index_offset: u64,
    pub record_count: u64,
}

impl Footer {
    pub fn encode(&self) -> [u8; FOOTER_SIZE as usize] {
        let mut out = [0u8; FOOTER_SIZE as usize];
        {
            let mut buf = &mut out[..];
            buf.put_u64_le(self.data_end);
            buf.put_u32_le(self.dict_len);
            buf.put_u64_le(self.index_offset);
            buf.put_u64_le(self.record_count);
        }
        let crc = crc32fast::hash(&out[..28]);
        let mut tail = &mut out[28..];
        tail.put_u32_le(crc);
        tail.put_u64_le(FOOTER_MAGIC);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != FOOTER_SIZE as usize {
            return Err(LetheError::Corruption("blob file footer truncated".into()));
        }
        let mut tail = &buf[28..];
        let crc = tail.get_u32_le();
        let magic = tail.get_u64_le();
        if magic != FOOTER_MAGIC {
            return Err(LetheError::Corruption("blob file is not sealed".into()));
        }
        if crc32fast::hash(&buf[..28]) != crc {
            return Err(LetheError::Corruption("blob file footer CRC mismatch".into()));
        }
        let mut body = buf;
        Ok(Self {
            data_end: body.get_u64_le(),
            dict_len: body.get_u32_le(),
            index_offset: body.get_u64_le(),
            record_count: body.get_u64_le(),
        })
    }
}

/// Encode the offset index block.
pub fn encode_offsets(offsets: &[u64]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(offsets.len() * 8 + 4);
    for offset in offsets {
        buf.put_u64_le(*offset);
    }
    let crc = crc32fast::hash(&buf);
    buf.put_u32_le(crc);
    buf
}

pub fn decode_offsets(buf: &[u8], record_count: u64) -> Result<Vec<u64>> {
    let body_len = record_count as usize * 8;
    if buf.len() != body_len + 4 {
        return Err(LetheError::Corruption("blob offset index truncated".into()));
    }
    let (mut body, mut crc_bytes) = buf.split_at(body_len);
    if crc32fast::hash(body) != crc_bytes.get_u32_le() {
        return Err(LetheError::Corruption("blob offset index CRC mismatch".into()));
    }
    let mut offsets = Vec::with_capacity(record_count as usize);
    while body.has_remaining() {
        offsets.push(body.get_u64_le());
    }
    Ok(offsets)
}
