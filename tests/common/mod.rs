//! minimal SquashFS reader used to verify built images
//!
//! independent of the writer: parses the superblock, decompresses the
//! metadata streams, walks directories and reassembles file content from
//! data blocks and fragments. panics on malformed input, which is exactly
//! what a test wants.

use std::collections::BTreeMap;
use std::path::Path;

use sqz::{Codec, DATA_SIZE_MASK, DATA_STORED_FLAG, FRAGMENT_NONE};

const META_STORED: u16 = 0x8000;

fn u16_at(b: &[u8], at: usize) -> u16 {
    u16::from_le_bytes(b[at..at + 2].try_into().unwrap())
}

fn u32_at(b: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(b[at..at + 4].try_into().unwrap())
}

fn u64_at(b: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(b[at..at + 8].try_into().unwrap())
}

#[derive(Debug, Clone)]
pub struct Superblock {
    pub magic: u32,
    pub inode_count: u32,
    pub modification_time: u32,
    pub block_size: u32,
    pub fragment_count: u32,
    pub compression: u16,
    pub block_log: u16,
    pub flags: u16,
    pub id_count: u16,
    pub major: u16,
    pub minor: u16,
    pub root_inode: u64,
    pub bytes_used: u64,
    pub id_table_start: u64,
    pub xattr_table_start: u64,
    pub inode_table_start: u64,
    pub directory_table_start: u64,
    pub fragment_table_start: u64,
    pub lookup_table_start: u64,
}

impl Superblock {
    fn parse(b: &[u8]) -> Self {
        Self {
            magic: u32_at(b, 0),
            inode_count: u32_at(b, 4),
            modification_time: u32_at(b, 8),
            block_size: u32_at(b, 12),
            fragment_count: u32_at(b, 16),
            compression: u16_at(b, 20),
            block_log: u16_at(b, 22),
            flags: u16_at(b, 24),
            id_count: u16_at(b, 26),
            major: u16_at(b, 28),
            minor: u16_at(b, 30),
            root_inode: u64_at(b, 32),
            bytes_used: u64_at(b, 40),
            id_table_start: u64_at(b, 48),
            xattr_table_start: u64_at(b, 56),
            inode_table_start: u64_at(b, 64),
            directory_table_start: u64_at(b, 72),
            fragment_table_start: u64_at(b, 80),
            lookup_table_start: u64_at(b, 88),
        }
    }
}

#[derive(Debug, Clone)]
pub enum InodeData {
    Dir {
        start_block: u32,
        offset: u16,
        filesize: u32,
        parent: u32,
    },
    Reg {
        start_block: u64,
        file_size: u64,
        fragment: u32,
        fragment_offset: u32,
        block_sizes: Vec<u32>,
    },
    Sym {
        target: Vec<u8>,
    },
    Dev {
        rdev: u32,
    },
    Ipc,
}

#[derive(Debug, Clone)]
pub struct Inode {
    /// on-disk type code: 1..7 short, 8..14 extended
    pub type_code: u16,
    pub mode: u16,
    pub uid_idx: u16,
    pub gid_idx: u16,
    pub mtime: u32,
    pub number: u32,
    pub nlink: u32,
    pub data: InodeData,
}

impl Inode {
    pub fn is_dir(&self) -> bool {
        matches!(self.data, InodeData::Dir { .. })
    }
}

pub struct Image {
    pub raw: Vec<u8>,
    pub superblock: Superblock,
    codec: Codec,
    inode_stream: Vec<u8>,
    inode_blocks: BTreeMap<u32, usize>,
    dir_stream: Vec<u8>,
    dir_blocks: BTreeMap<u32, usize>,
    /// (start_block, size-with-flag) per fragment block
    pub fragments: Vec<(u64, u32)>,
    pub ids: Vec<u32>,
}

impl Image {
    pub fn open(path: &Path) -> Self {
        let raw = std::fs::read(path).unwrap();
        let superblock = Superblock::parse(&raw);
        assert_eq!(superblock.magic, sqz::SQFS_MAGIC, "bad magic");
        let codec = match superblock.compression {
            1 => Codec::Zlib,
            4 => Codec::Xz,
            5 => Codec::Lz4,
            6 => Codec::Zstd,
            other => panic!("unexpected compression id {}", other),
        };

        let (inode_stream, inode_blocks) = parse_meta_stream(
            &raw,
            superblock.inode_table_start as usize,
            superblock.directory_table_start as usize,
            codec,
        );

        // the directory stream ends where the fragment table's metadata
        // blocks begin; the index array tells us where that is
        let frag_index_count = (superblock.fragment_count as usize).div_ceil(512);
        let mut frag_block_offsets = Vec::new();
        for i in 0..frag_index_count {
            frag_block_offsets.push(u64_at(&raw, superblock.fragment_table_start as usize + i * 8));
        }
        let dir_end = frag_block_offsets
            .first()
            .copied()
            .unwrap_or(superblock.fragment_table_start) as usize;
        let (dir_stream, dir_blocks) = parse_meta_stream(
            &raw,
            superblock.directory_table_start as usize,
            dir_end,
            codec,
        );

        let mut frag_bytes = Vec::new();
        for off in &frag_block_offsets {
            frag_bytes.extend(parse_meta_block(&raw, *off as usize, codec));
        }
        let mut fragments = Vec::new();
        for i in 0..superblock.fragment_count as usize {
            let start = u64_at(&frag_bytes, i * 16);
            let size = u32_at(&frag_bytes, i * 16 + 8);
            assert_eq!(u32_at(&frag_bytes, i * 16 + 12), 0, "fragment pad word");
            fragments.push((start, size));
        }

        let id_index_count = (superblock.id_count as usize).div_ceil(2048);
        let mut id_bytes = Vec::new();
        for i in 0..id_index_count {
            let off = u64_at(&raw, superblock.id_table_start as usize + i * 8);
            id_bytes.extend(parse_meta_block(&raw, off as usize, codec));
        }
        let ids = (0..superblock.id_count as usize)
            .map(|i| u32_at(&id_bytes, i * 4))
            .collect();

        Self {
            raw,
            superblock,
            codec,
            inode_stream,
            inode_blocks,
            dir_stream,
            dir_blocks,
            fragments,
            ids,
        }
    }

    pub fn root(&self) -> Inode {
        let block = (self.superblock.root_inode >> 16) as u32;
        let offset = (self.superblock.root_inode & 0xffff) as u16;
        self.inode_at(block, offset)
    }

    pub fn inode_at(&self, block: u32, offset: u16) -> Inode {
        let at = self.inode_blocks[&block] + offset as usize;
        self.parse_inode(at)
    }

    fn parse_inode(&self, at: usize) -> Inode {
        let s = &self.inode_stream;
        let type_code = u16_at(s, at);
        let mode = u16_at(s, at + 2);
        let uid_idx = u16_at(s, at + 4);
        let gid_idx = u16_at(s, at + 6);
        let mtime = u32_at(s, at + 8);
        let number = u32_at(s, at + 12);
        let body = at + 16;

        let (nlink, data) = match type_code {
            // basic directory
            1 => (
                u32_at(s, body + 4),
                InodeData::Dir {
                    start_block: u32_at(s, body),
                    filesize: u32::from(u16_at(s, body + 8)),
                    offset: u16_at(s, body + 10),
                    parent: u32_at(s, body + 12),
                },
            ),
            // extended directory
            8 => (
                u32_at(s, body),
                InodeData::Dir {
                    filesize: u32_at(s, body + 4),
                    start_block: u32_at(s, body + 8),
                    parent: u32_at(s, body + 12),
                    offset: u16_at(s, body + 18),
                },
            ),
            // basic file
            2 => {
                let start_block = u64::from(u32_at(s, body));
                let fragment = u32_at(s, body + 4);
                let fragment_offset = u32_at(s, body + 8);
                let file_size = u64::from(u32_at(s, body + 12));
                let block_sizes =
                    self.read_block_sizes(body + 16, file_size, fragment != FRAGMENT_NONE);
                (
                    1,
                    InodeData::Reg {
                        start_block,
                        file_size,
                        fragment,
                        fragment_offset,
                        block_sizes,
                    },
                )
            }
            // extended file
            9 => {
                let start_block = u64_at(s, body);
                let file_size = u64_at(s, body + 8);
                let nlink = u32_at(s, body + 24);
                let fragment = u32_at(s, body + 28);
                let fragment_offset = u32_at(s, body + 32);
                let block_sizes =
                    self.read_block_sizes(body + 40, file_size, fragment != FRAGMENT_NONE);
                (
                    nlink,
                    InodeData::Reg {
                        start_block,
                        file_size,
                        fragment,
                        fragment_offset,
                        block_sizes,
                    },
                )
            }
            // symlink
            3 | 10 => {
                let nlink = u32_at(s, body);
                let tlen = u32_at(s, body + 4) as usize;
                (
                    nlink,
                    InodeData::Sym {
                        target: s[body + 8..body + 8 + tlen].to_vec(),
                    },
                )
            }
            // block/char device
            4 | 5 | 11 | 12 => (
                u32_at(s, body),
                InodeData::Dev {
                    rdev: u32_at(s, body + 4),
                },
            ),
            // fifo/socket
            6 | 7 | 13 | 14 => (u32_at(s, body), InodeData::Ipc),
            other => panic!("unknown inode type {}", other),
        };

        Inode {
            type_code,
            mode,
            uid_idx,
            gid_idx,
            mtime,
            number,
            nlink,
            data,
        }
    }

    fn read_block_sizes(&self, at: usize, file_size: u64, has_fragment: bool) -> Vec<u32> {
        let block_size = u64::from(self.superblock.block_size);
        let count = if has_fragment {
            file_size / block_size
        } else {
            file_size.div_ceil(block_size)
        } as usize;
        (0..count)
            .map(|i| u32_at(&self.inode_stream, at + i * 4))
            .collect()
    }

    /// list a directory: (name, child inode) in stored order
    pub fn read_dir(&self, dir: &Inode) -> Vec<(String, Inode)> {
        let (start_block, offset, filesize) = match &dir.data {
            InodeData::Dir {
                start_block,
                offset,
                filesize,
                ..
            } => (*start_block, *offset, *filesize),
            _ => panic!("not a directory"),
        };

        let mut entries = Vec::new();
        if filesize <= 3 {
            return entries;
        }
        let mut pos = self.dir_blocks[&start_block] + offset as usize;
        let end = pos + filesize as usize - 3;
        let s = &self.dir_stream;

        while pos < end {
            let count = u32_at(s, pos) as usize + 1;
            let inode_block = u32_at(s, pos + 4);
            let base_number = u32_at(s, pos + 8);
            pos += 12;
            for _ in 0..count {
                let inode_offset = u16_at(s, pos);
                let delta = i16::from_le_bytes([s[pos + 2], s[pos + 3]]);
                let short_type = u16_at(s, pos + 4);
                let name_len = u16_at(s, pos + 6) as usize + 1;
                pos += 8;
                let name = String::from_utf8(s[pos..pos + name_len].to_vec()).unwrap();
                pos += name_len;

                let inode = self.inode_at(inode_block, inode_offset);
                assert_eq!(
                    i64::from(inode.number),
                    i64::from(base_number) + i64::from(delta),
                    "dentry delta for {}",
                    name
                );
                assert_eq!(
                    (inode.type_code - 1) % 7 + 1,
                    short_type,
                    "dentry type for {}",
                    name
                );
                entries.push((name, inode));
            }
        }
        assert_eq!(pos, end, "directory listing length");
        entries
    }

    /// resolve an absolute path
    pub fn lookup(&self, path: &str) -> Option<Inode> {
        let mut current = self.root();
        for component in path.split('/').filter(|c| !c.is_empty()) {
            let entries = self.read_dir(&current);
            current = entries.into_iter().find(|(name, _)| name == component)?.1;
        }
        Some(current)
    }

    /// reassemble a regular file's content from blocks and fragment
    pub fn read_file(&self, inode: &Inode) -> Vec<u8> {
        let (start_block, file_size, fragment, fragment_offset, sizes) = match &inode.data {
            InodeData::Reg {
                start_block,
                file_size,
                fragment,
                fragment_offset,
                block_sizes,
            } => (
                *start_block,
                *file_size,
                *fragment,
                *fragment_offset,
                block_sizes.clone(),
            ),
            _ => panic!("not a regular file"),
        };

        let block_size = self.superblock.block_size as usize;
        let mut out = Vec::new();
        let mut pos = start_block as usize;
        for size in sizes {
            let len = (size & DATA_SIZE_MASK) as usize;
            let payload = &self.raw[pos..pos + len];
            if size & DATA_STORED_FLAG != 0 {
                out.extend_from_slice(payload);
            } else {
                out.extend(self.codec.decompress(payload, block_size).unwrap());
            }
            pos += len;
        }

        if fragment != FRAGMENT_NONE {
            let (frag_start, frag_size) = self.fragments[fragment as usize];
            let len = (frag_size & DATA_SIZE_MASK) as usize;
            let payload = &self.raw[frag_start as usize..frag_start as usize + len];
            let block = if frag_size & DATA_STORED_FLAG != 0 {
                payload.to_vec()
            } else {
                self.codec.decompress(payload, block_size).unwrap()
            };
            let tail_len = (file_size as usize) - out.len();
            let start = fragment_offset as usize;
            out.extend_from_slice(&block[start..start + tail_len]);
        }

        assert_eq!(out.len() as u64, file_size, "file size accounting");
        out
    }

    pub fn uid_of(&self, inode: &Inode) -> u32 {
        self.ids[inode.uid_idx as usize]
    }

    pub fn gid_of(&self, inode: &Inode) -> u32 {
        self.ids[inode.gid_idx as usize]
    }
}

/// decompress a whole metadata stream; maps block offset to stream offset
fn parse_meta_stream(
    raw: &[u8],
    start: usize,
    end: usize,
    codec: Codec,
) -> (Vec<u8>, BTreeMap<u32, usize>) {
    let mut out = Vec::new();
    let mut blocks = BTreeMap::new();
    let mut pos = start;
    while pos < end {
        blocks.insert((pos - start) as u32, out.len());
        let (block, consumed) = parse_meta_block_inner(raw, pos, codec);
        out.extend(block);
        pos += consumed;
    }
    assert_eq!(pos, end, "metadata stream length");
    (out, blocks)
}

/// decompress a single metadata block at an absolute offset
fn parse_meta_block(raw: &[u8], at: usize, codec: Codec) -> Vec<u8> {
    parse_meta_block_inner(raw, at, codec).0
}

fn parse_meta_block_inner(raw: &[u8], at: usize, codec: Codec) -> (Vec<u8>, usize) {
    let header = u16_at(raw, at);
    let len = usize::from(header & !META_STORED);
    let payload = &raw[at + 2..at + 2 + len];
    let block = if header & META_STORED != 0 {
        payload.to_vec()
    } else {
        codec.decompress(payload, sqz::META_BLOCK_SIZE).unwrap()
    };
    (block, 2 + len)
}
