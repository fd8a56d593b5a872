//! LETHE - Blob value compression
//! Per-file codec for record payloads. Zstd is available behind the
//! `compression` cargo feature, optionally with a trained dictionary.

use crate::config::CompressionOptions;
use crate::error::{LetheError, Result};
use crate::types::CompressionType;

/// Compresses and decompresses record payloads of one blob file.
#[derive(Clone)]
pub struct BlobCodec {
    compression: CompressionType,
    level: i32,
    #[cfg_attr(not(feature = "compression"), allow(dead_code))]
    window_bits: i32,
    dictionary: Option<Vec<u8>>,
}

impl std::fmt::Debug for BlobCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobCodec")
            .field("compression", &self.compression)
            .field("level", &self.level)
            .field("dictionary_len", &self.dictionary.as_ref().map(Vec::len))
            .finish()
    }
}

impl BlobCodec {
    pub fn new(compression: CompressionType, options: &CompressionOptions) -> Self {
        Self {
            compression,
            level: options.effective_level(),
            window_bits: options.window_bits,
            dictionary: None,
        }
    }

    pub fn uncompressed() -> Self {
        Self::new(CompressionType::None, &CompressionOptions::default())
    }

    pub fn with_dictionary(mut self, dictionary: Vec<u8>) -> Self {
        if !dictionary.is_empty() {
            self.dictionary = Some(dictionary);
        }
        self
    }

    pub fn compression(&self) -> CompressionType {
        self.compression
    }

    pub fn dictionary(&self) -> Option<&[u8]> {
        self.dictionary.as_deref()
    }

    pub fn compress(&self, value: &[u8]) -> Result<Vec<u8>> {
        match self.compression {
            CompressionType::None => Ok(value.to_vec()),
            #[cfg(feature = "compression")]
            CompressionType::Zstd => self.zstd_compress(value),
            other => Err(LetheError::Config(format!(
                "compression {:?} is not available in this build",
                other
            ))),
        }
    }

    pub fn decompress(&self, payload: &[u8], value_len: usize) -> Result<Vec<u8>> {
        let value = match self.compression {
            CompressionType::None => payload.to_vec(),
            #[cfg(feature = "compression")]
            CompressionType::Zstd => {
                let mut decompressor = match &self.dictionary {
                    Some(dict) => zstd::bulk::Decompressor::with_dictionary(dict)?,
                    None => zstd::bulk::Decompressor::new()?,
                };
                decompressor
                    .decompress(payload, value_len)
                    .map_err(|e| LetheError::Corruption(format!("zstd: {}", e)))?
            }
            other => {
                return Err(LetheError::Corruption(format!(
                    "blob file uses unsupported compression {:?}",
                    other
                )))
            }
        };
        if value.len() != value_len {
            return Err(LetheError::Corruption(format!(
                "decompressed {} bytes, expected {}",
                value.len(),
                value_len
            )));
        }
        Ok(value)
    }

    #[cfg(feature = "compression")]
    fn zstd_compress(&self, value: &[u8]) -> Result<Vec<u8>> {
        use zstd::stream::raw::CParameter;

        let mut compressor = match &self.dictionary {
            Some(dict) => zstd::bulk::Compressor::with_dictionary(self.level, dict)?,
            None => zstd::bulk::Compressor::new(self.level)?,
        };
        // Negative window bits are a zlib convention; only a zstd window log applies.
        if (10..=27).contains(&self.window_bits) {
            compressor.set_parameter(CParameter::WindowLog(self.window_bits as u32))?;
        }
        Ok(compressor.compress(value)?)
    }
}

/// Train a dictionary from buffered values; `None` if training is off or
/// fails, in which case the file is written without one.
pub fn train_dictionary(
    compression: CompressionType,
    options: &CompressionOptions,
    samples: &[Vec<u8>],
) -> Option<Vec<u8>> {
    if compression != CompressionType::Zstd || options.max_dict_bytes == 0 || samples.is_empty() {
        return None;
    }
    #[cfg(feature = "compression")]
    {
        match zstd::dict::from_samples(samples, options.max_dict_bytes as usize) {
            Ok(dict) => return Some(dict),
            Err(e) => log::warn!("zstd dictionary training failed, writing without: {}", e),
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uncompressed_codec_is_identity() {
        let codec = BlobCodec::uncompressed();
        let payload = codec.compress(b"plain value").unwrap();
        assert_eq!(payload, b"plain value");
        assert_eq!(codec.decompress(&payload, 11).unwrap(), b"plain value");
    }

    #[test]
    fn test_length_mismatch_is_corruption() {
        let codec = BlobCodec::uncompressed();
        assert!(codec.decompress(b"abc", 4).unwrap_err().is_corruption());
    }

    #[test]
    fn test_no_dictionary_without_zstd() {
        let options = CompressionOptions {
            max_dict_bytes: 1024,
            ..Default::default()
        };
        let samples = vec![b"sample".to_vec(); 8];
        assert!(train_dictionary(CompressionType::None, &options, &samples).is_none());
    }

    #[cfg(feature = "compression")]
    #[test]
    fn test_zstd_round_trip() {
        let codec = BlobCodec::new(CompressionType::Zstd, &CompressionOptions::default());
        let value = vec![b'z'; 8192];
        let payload = codec.compress(&value).unwrap();
        assert!(payload.len() < value.len());
        assert_eq!(codec.decompress(&payload, value.len()).unwrap(), value);
    }
}
