//! sqz - SquashFS image builder
//!
//! builds deterministic read-only compressed filesystem images in the
//! SquashFS on-disk format from a stream of filesystem entries. designed
//! for packaging and embedded-image pipelines that want compact,
//! reproducible images without shelling out to mksquashfs.
//!
//! # Core concepts
//!
//! - **Tree**: the in-memory directory tree accumulating inodes (dirs,
//!   regular files, symlinks, devices, fifos, sockets) and their metadata
//! - **Blocks**: file content is chunked at `1 << block_log`, compressed on
//!   a worker and written in enqueue order
//! - **Fragments**: sub-block file tails are packed together into shared
//!   fragment blocks
//! - **Dedup**: identical blocks and tails are collapsed to one on-disk
//!   copy, keyed by rolling Adler-32 and confirmed byte-for-byte
//!
//! # Example usage
//!
//! ```no_run
//! use sqz::{Config, ImageWriter};
//! use std::path::Path;
//!
//! let mut writer = ImageWriter::create(Path::new("rootfs.sqsh"), Config::default()).unwrap();
//! let file = writer.put_regular_for_path("/etc/motd").unwrap();
//! writer.write(file, b"welcome\n").unwrap();
//! writer.finish_file(file).unwrap();
//! writer.put_symlink_for_path("/etc/mtab", "/proc/self/mounts").unwrap();
//! let bytes_used = writer.finish().unwrap();
//! ```

mod buffer;
mod checksum;
mod compress;
mod config;
mod dedup;
mod emit;
mod error;
mod ids;
mod metadata;
mod pending;
mod queue;
mod tree;
mod writer;

pub mod fs;

pub use compress::{Codec, LaunchPolicy};
pub use config::Config;
pub use error::{Error, IoResultExt, Result};
pub use metadata::{MetaAddress, META_BLOCK_SIZE, META_STORED_FLAG};
pub use pending::{FragmentEntry, DATA_SIZE_MASK, DATA_STORED_FLAG};
pub use tree::{DevKind, FileId, IpcKind, NodeId, FRAGMENT_NONE, XATTR_NONE};
pub use writer::{
    ImageWriter, PAD_SIZE, SQFS_MAGIC, SQFS_MAJOR, SQFS_MINOR, SUPERBLOCK_SIZE,
};
