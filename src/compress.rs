//! pluggable block compression
//!
//! a codec turns an uncompressed block into (payload, stored_uncompressed).
//! when the compressed form is not strictly smaller than the input, the
//! input bytes are emitted as-is and the flag is set; readers see the flag
//! in the metadata header or the size field and skip decompression.
//!
//! `none` never compresses and marks every block stored, which still yields
//! a valid image (it advertises the zlib type id but no block ever needs
//! inflating). useful for byte-level tests.

use std::io::Read;
use std::thread::JoinHandle;

use crate::error::{Error, Result};

/// on-disk compression ids from the superblock
pub const COMP_ZLIB: u16 = 1;
pub const COMP_XZ: u16 = 4;
pub const COMP_LZ4: u16 = 5;
pub const COMP_ZSTD: u16 = 6;

/// compression algorithm for data blocks, fragments and metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    /// store everything uncompressed
    None,
    Zlib,
    Xz,
    Lz4,
    Zstd,
}

impl Codec {
    /// parse a compressor name as given on the command line or in config
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "none" => Ok(Codec::None),
            "zlib" | "gzip" => Ok(Codec::Zlib),
            "xz" => Ok(Codec::Xz),
            "lz4" => Ok(Codec::Lz4),
            "zstd" => Ok(Codec::Zstd),
            other => Err(Error::UnknownCompressor(other.to_string())),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Codec::None => "none",
            Codec::Zlib => "zlib",
            Codec::Xz => "xz",
            Codec::Lz4 => "lz4",
            Codec::Zstd => "zstd",
        }
    }

    /// compression id recorded in the superblock
    pub fn type_id(self) -> u16 {
        match self {
            // identity images mark every block stored, so the id is never
            // consulted by a reader; zlib keeps the superblock well-formed
            Codec::None | Codec::Zlib => COMP_ZLIB,
            Codec::Xz => COMP_XZ,
            Codec::Lz4 => COMP_LZ4,
            Codec::Zstd => COMP_ZSTD,
        }
    }

    /// compress one block; returns (payload, stored_uncompressed)
    pub fn compress(self, data: &[u8]) -> Result<(Vec<u8>, bool)> {
        let compressed = match self {
            Codec::None => return Ok((data.to_vec(), true)),
            Codec::Zlib => {
                let mut out = Vec::new();
                flate2::read::ZlibEncoder::new(data, flate2::Compression::new(9))
                    .read_to_end(&mut out)
                    .map_err(|e| self.fail(e))?;
                out
            }
            Codec::Xz => {
                let mut out = Vec::new();
                xz2::read::XzEncoder::new(data, 6)
                    .read_to_end(&mut out)
                    .map_err(|e| self.fail(e))?;
                out
            }
            Codec::Lz4 => lz4_flex::block::compress(data),
            Codec::Zstd => zstd::encode_all(data, 3).map_err(|e| self.fail(e))?,
        };

        if compressed.len() < data.len() {
            Ok((compressed, false))
        } else {
            Ok((data.to_vec(), true))
        }
    }

    /// decompress a payload known to hold at most `max` bytes
    ///
    /// used by dedup read-back verification and by tests reading the image.
    pub fn decompress(self, data: &[u8], max: usize) -> Result<Vec<u8>> {
        match self {
            Codec::None => Ok(data.to_vec()),
            Codec::Zlib => {
                let mut out = Vec::with_capacity(max);
                flate2::read::ZlibDecoder::new(data)
                    .take(max as u64)
                    .read_to_end(&mut out)
                    .map_err(|e| self.fail(e))?;
                Ok(out)
            }
            Codec::Xz => {
                let mut out = Vec::with_capacity(max);
                xz2::read::XzDecoder::new(data)
                    .take(max as u64)
                    .read_to_end(&mut out)
                    .map_err(|e| self.fail(e))?;
                Ok(out)
            }
            Codec::Lz4 => {
                let mut out = vec![0u8; max];
                let n = lz4_flex::block::decompress_into(data, &mut out)
                    .map_err(|e| self.fail(e))?;
                out.truncate(n);
                Ok(out)
            }
            Codec::Zstd => zstd::decode_all(data).map_err(|e| self.fail(e)),
        }
    }

    fn fail(self, err: impl std::fmt::Display) -> Error {
        Error::Compression {
            codec: self.name(),
            message: err.to_string(),
        }
    }
}

/// where a block's compression work runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchPolicy {
    /// on its own thread, started now
    Eager,
    /// on whichever thread consumes the job
    Deferred,
}

/// in-flight compression of one block
///
/// eager jobs overlap compression of queued blocks with the serial write
/// path; deferred jobs keep everything on one thread for single-threaded
/// builds. either way `wait` yields the (payload, stored) pair exactly once.
pub enum CompressJob {
    Eager(JoinHandle<Result<(Vec<u8>, bool)>>),
    Deferred { codec: Codec, data: Vec<u8> },
}

impl CompressJob {
    pub fn spawn(codec: Codec, data: Vec<u8>, policy: LaunchPolicy) -> Self {
        match policy {
            LaunchPolicy::Eager => {
                CompressJob::Eager(std::thread::spawn(move || codec.compress(&data)))
            }
            LaunchPolicy::Deferred => CompressJob::Deferred { codec, data },
        }
    }

    /// obtain the compressed payload, running the work here if deferred
    pub fn wait(self) -> Result<(Vec<u8>, bool)> {
        match self {
            CompressJob::Eager(handle) => handle.join().map_err(|_| Error::Compression {
                codec: "worker",
                message: "compression thread panicked".to_string(),
            })?,
            CompressJob::Deferred { codec, data } => codec.compress(&data),
        }
    }
}
