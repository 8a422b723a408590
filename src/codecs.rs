//! Chunk compression for the write path.
//!
//! Unlike a general Zarr reader, this service never has to decode arbitrary
//! codec pipelines: every chunk it reads back (slice read-modify-write,
//! rechunking) is a chunk it wrote itself, compressed with a single
//! numcodecs-style compressor recorded in `.zarray`. One enum covers the
//! compressors the output may carry; endianness is not a codec concern here,
//! it lives in the dtype and is applied at the typed-buffer layer.

use std::io::Read;

use flate2::Compression;
use flate2::read::{GzDecoder, GzEncoder, ZlibDecoder, ZlibEncoder};

use crate::error::{ConvertError, ConvertResult};
use crate::metadata::v2::ZarrCompressor;

/// numcodecs LZ4 blocks carry the uncompressed size as a 4-byte
/// little-endian prefix.
const LZ4_SIZE_PREFIX_BYTES: usize = 4;

/// The chunk compressor of one array, resolved from its `.zarray` config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compressor {
    Zlib { level: u32 },
    Gzip { level: u32 },
    Zstd { level: i32 },
    Lz4 { acceleration: i32 },
}

impl Compressor {
    /// Resolve a numcodecs compressor config. Levels outside each codec's
    /// accepted range are clamped rather than rejected, matching how the
    /// numcodecs implementations behave.
    pub fn from_config(config: &ZarrCompressor) -> ConvertResult<Self> {
        let level = |key: &str, default: i64| {
            config
                .config
                .get(key)
                .and_then(|v| v.as_i64())
                .unwrap_or(default)
        };
        match config.id.to_lowercase().as_str() {
            "zlib" => Ok(Compressor::Zlib {
                level: level("level", 1).clamp(0, 9) as u32,
            }),
            "gzip" => Ok(Compressor::Gzip {
                level: level("level", 5).clamp(0, 9) as u32,
            }),
            "zstd" => Ok(Compressor::Zstd {
                level: level("level", 5).clamp(0, 9) as i32,
            }),
            "lz4" => Ok(Compressor::Lz4 {
                acceleration: level("acceleration", 1).clamp(0, 9) as i32,
            }),
            other => Err(ConvertError::Metadata(format!(
                "Unsupported compressor '{other}'; this store only carries \
                 zlib, gzip, zstd or lz4 chunks"
            ))),
        }
    }

    /// Compress one chunk's element buffer.
    pub fn encode(&self, data: &[u8]) -> ConvertResult<Vec<u8>> {
        match self {
            Compressor::Zlib { level } => {
                read_to_vec(ZlibEncoder::new(data, Compression::new(*level)))
                    .map_err(|e| ConvertError::Encode(format!("Zlib compress failed: {e}")))
            }
            Compressor::Gzip { level } => {
                read_to_vec(GzEncoder::new(data, Compression::new(*level)))
                    .map_err(|e| ConvertError::Encode(format!("Gzip compress failed: {e}")))
            }
            Compressor::Zstd { level } => zstd::bulk::compress(data, *level)
                .map_err(|e| ConvertError::Encode(format!("Zstd compress failed: {e}"))),
            Compressor::Lz4 { .. } => {
                let compressed = lz4_flex::block::compress(data);
                let mut out = Vec::with_capacity(LZ4_SIZE_PREFIX_BYTES + compressed.len());
                out.extend_from_slice(&(data.len() as u32).to_le_bytes());
                out.extend_from_slice(&compressed);
                Ok(out)
            }
        }
    }

    /// Decompress one chunk back into its element buffer.
    pub fn decode(&self, data: &[u8]) -> ConvertResult<Vec<u8>> {
        match self {
            Compressor::Zlib { .. } => read_to_vec(ZlibDecoder::new(data))
                .map_err(|e| ConvertError::Decode(format!("Zlib decompress failed: {e}"))),
            Compressor::Gzip { .. } => read_to_vec(GzDecoder::new(data))
                .map_err(|e| ConvertError::Decode(format!("Gzip decompress failed: {e}"))),
            Compressor::Zstd { .. } => zstd::stream::decode_all(data)
                .map_err(|e| ConvertError::Decode(format!("Zstd decompress failed: {e}"))),
            Compressor::Lz4 { .. } => {
                if data.len() < LZ4_SIZE_PREFIX_BYTES {
                    return Err(ConvertError::Decode(
                        "LZ4 chunk is missing its 4-byte size prefix".into(),
                    ));
                }
                let (prefix, payload) = data.split_at(LZ4_SIZE_PREFIX_BYTES);
                let size = u32::from_le_bytes(prefix.try_into().unwrap()) as usize;
                lz4_flex::block::decompress(payload, size)
                    .map_err(|e| ConvertError::Decode(format!("LZ4 decompress failed: {e}")))
            }
        }
    }
}

fn read_to_vec(mut reader: impl Read) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    reader.read_to_end(&mut out)?;
    Ok(out)
}
