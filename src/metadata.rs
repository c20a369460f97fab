//! metadata stream writer
//!
//! inode, directory, fragment and id tables are all streams of metadata
//! blocks: up to 8 KiB of uncompressed bytes behind a 16-bit header whose
//! low 15 bits are the on-disk payload length and whose high bit marks a
//! payload stored uncompressed. note this flag lives at bit 15 of a 16-bit
//! field; data blocks and fragments use bit 24 of a 32-bit size instead.
//!
//! the writer stages emitted blocks in memory so addresses handed out by
//! `put` stay stable until the whole stream is copied into the image.

use std::io::Write;

use crate::compress::Codec;
use crate::error::Result;

/// uncompressed capacity of one metadata block
pub const META_BLOCK_SIZE: usize = 8192;
pub const META_BLOCK_SIZE_LB: u32 = 13;

/// bit 15 of the block header: payload stored uncompressed
pub const META_STORED_FLAG: u16 = 0x8000;

/// address of a byte inside a metadata stream
///
/// `block` is the byte offset of the owning block's header within the
/// stream; `offset` is the position inside the decompressed block. packed
/// into a u64 this is the inode reference format of the superblock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetaAddress {
    pub block: u32,
    pub offset: u16,
}

impl MetaAddress {
    pub fn packed(self) -> u64 {
        (u64::from(self.block) << 16) | u64::from(self.offset)
    }
}

/// length-prefixed compressed metadata block stream
pub struct MetaWriter {
    codec: Codec,
    /// emitted blocks, headers included
    staged: Vec<u8>,
    /// accumulator for the block being filled, < META_BLOCK_SIZE after
    /// every public call
    block: Vec<u8>,
}

impl MetaWriter {
    pub fn new(codec: Codec) -> Self {
        Self {
            codec,
            staged: Vec::new(),
            block: Vec::with_capacity(META_BLOCK_SIZE),
        }
    }

    /// address the next `put` will return
    pub fn address(&self) -> MetaAddress {
        MetaAddress {
            block: self.staged.len() as u32,
            offset: self.block.len() as u16,
        }
    }

    /// append bytes to the stream, emitting full blocks as they fill
    ///
    /// returns the address of the first appended byte. the address is taken
    /// before any flush, so it is valid even when the append spans blocks.
    /// an empty put is a position probe.
    pub fn put(&mut self, bytes: &[u8]) -> Result<MetaAddress> {
        let addr = self.address();
        let mut rest = bytes;
        while !rest.is_empty() {
            let room = META_BLOCK_SIZE - self.block.len();
            let take = room.min(rest.len());
            self.block.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.block.len() == META_BLOCK_SIZE {
                self.emit_block()?;
            }
        }
        Ok(addr)
    }

    /// emit the partial tail block, if any
    pub fn flush(&mut self) -> Result<()> {
        if self.block.is_empty() {
            Ok(())
        } else {
            self.emit_block()
        }
    }

    fn emit_block(&mut self) -> Result<()> {
        let (payload, stored) = self.codec.compress(&self.block)?;
        let header = payload.len() as u16 | if stored { META_STORED_FLAG } else { 0 };
        self.staged.extend_from_slice(&header.to_le_bytes());
        self.staged.extend_from_slice(&payload);
        self.block.clear();
        Ok(())
    }

    /// total staged bytes (block headers included)
    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }

    /// the staged stream, block headers included
    pub fn staged(&self) -> &[u8] {
        &self.staged
    }

    /// copy the staged stream to the image
    pub fn out<W: Write>(&self, sink: &mut W) -> std::io::Result<()> {
        sink.write_all(&self.staged)
    }
}
