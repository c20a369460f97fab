//! source tree scanning for the CLI
//!
//! reads the metadata the image needs from a local filesystem entry,
//! without following symlinks.

use std::fs::Metadata;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::Path;

use crate::error::{IoResultExt, Result};

/// file type of a source entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceType {
    Regular,
    Directory,
    Symlink,
    BlockDevice,
    CharDevice,
    Fifo,
    Socket,
}

impl SourceType {
    /// detect file type from metadata; `None` for anything exotic
    pub fn from_metadata(meta: &Metadata) -> Option<Self> {
        let ft = meta.file_type();
        if ft.is_file() {
            Some(SourceType::Regular)
        } else if ft.is_dir() {
            Some(SourceType::Directory)
        } else if ft.is_symlink() {
            Some(SourceType::Symlink)
        } else if ft.is_block_device() {
            Some(SourceType::BlockDevice)
        } else if ft.is_char_device() {
            Some(SourceType::CharDevice)
        } else if ft.is_fifo() {
            Some(SourceType::Fifo)
        } else if ft.is_socket() {
            Some(SourceType::Socket)
        } else {
            None
        }
    }
}

/// metadata for one source entry, in image terms
#[derive(Debug, Clone)]
pub struct SourceMetadata {
    pub file_type: Option<SourceType>,
    pub uid: u32,
    pub gid: u32,
    /// permission bits only; the type lives in the inode
    pub mode: u16,
    pub mtime: u32,
    /// kernel-encoded device number, meaningful for devices only
    pub rdev: u32,
    pub size: u64,
}

impl SourceMetadata {
    /// read metadata from a path (does not follow symlinks)
    pub fn from_path(path: &Path) -> Result<Self> {
        let meta = std::fs::symlink_metadata(path).with_path(path)?;
        Ok(Self::from_std_metadata(&meta))
    }

    pub fn from_std_metadata(meta: &Metadata) -> Self {
        let rdev = encode_rdev(
            nix::sys::stat::major(meta.rdev()),
            nix::sys::stat::minor(meta.rdev()),
        );
        Self {
            file_type: SourceType::from_metadata(meta),
            uid: meta.uid(),
            gid: meta.gid(),
            mode: (meta.mode() & 0o7777) as u16,
            mtime: meta.mtime().clamp(0, i64::from(u32::MAX)) as u32,
            rdev,
            size: meta.len(),
        }
    }
}

/// encode a device number the way the kernel (and the image format) does:
/// minor in the low byte and above bit 19, major in bits 8..19
pub fn encode_rdev(major: u64, minor: u64) -> u32 {
    ((minor & 0xff) | ((major & 0xfff) << 8) | ((minor & !0xff) << 12)) as u32
}
