//! Blob compression.
//!
//! Compression applies to stored response blobs only, mappings and tag
//! entries are small and always stored as is.

use std::fmt::Debug;

use thiserror::Error;

/// Compression or decompression failure.
#[derive(Debug, Error)]
pub enum CompressionError {
    #[error("compression failed: {0}")]
    Compress(std::io::Error),
    #[error("decompression failed: {0}")]
    Decompress(std::io::Error),
}

/// Byte-level codec applied to stored blobs.
pub trait Compressor: Debug + Send + Sync {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError>;

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError>;

    /// Short name used in logs.
    fn name(&self) -> &'static str;
}

/// Stores blobs unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughCompressor;

impl Compressor for PassthroughCompressor {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        Ok(data.to_vec())
    }

    fn name(&self) -> &'static str {
        "passthrough"
    }
}

#[cfg(feature = "gzip")]
mod gzip {
    use std::io::{Read, Write};

    use flate2::Compression;
    use flate2::read::GzDecoder;
    use flate2::write::GzEncoder;

    use super::{CompressionError, Compressor};

    /// Gzip compression backed by `flate2`.
    #[derive(Debug, Clone, Copy)]
    pub struct GzipCompressor {
        level: u32,
    }

    impl GzipCompressor {
        /// Compression level between 0 and 9.
        pub fn with_level(level: u32) -> Self {
            Self {
                level: level.min(9),
            }
        }
    }

    impl Default for GzipCompressor {
        fn default() -> Self {
            Self { level: 6 }
        }
    }

    impl Compressor for GzipCompressor {
        fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::new(self.level));
            encoder.write_all(data).map_err(CompressionError::Compress)?;
            encoder.finish().map_err(CompressionError::Compress)
        }

        fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
            let mut decoded = Vec::new();
            GzDecoder::new(data)
                .read_to_end(&mut decoded)
                .map_err(CompressionError::Decompress)?;
            Ok(decoded)
        }

        fn name(&self) -> &'static str {
            "gzip"
        }
    }
}

#[cfg(feature = "gzip")]
pub use gzip::GzipCompressor;

#[cfg(feature = "zstd")]
mod zstd_impl {
    use super::{CompressionError, Compressor};

    /// Zstandard compression.
    #[derive(Debug, Clone, Copy)]
    pub struct ZstdCompressor {
        level: i32,
    }

    impl ZstdCompressor {
        pub fn with_level(level: i32) -> Self {
            Self { level }
        }
    }

    impl Default for ZstdCompressor {
        fn default() -> Self {
            Self { level: 3 }
        }
    }

    impl Compressor for ZstdCompressor {
        fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
            zstd::encode_all(data, self.level).map_err(CompressionError::Compress)
        }

        fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
            zstd::decode_all(data).map_err(CompressionError::Decompress)
        }

        fn name(&self) -> &'static str {
            "zstd"
        }
    }
}

#[cfg(feature = "zstd")]
pub use zstd_impl::ZstdCompressor;
