//! image writer orchestrator
//!
//! `ImageWriter` owns everything mutable: the output file, the tree, the
//! fragment accumulator, the work queue and the writer worker. the client
//! thread performs tree operations and feeds file content one file at a
//! time; full blocks are enqueued for compression and the worker writes
//! them in queue order. `finish` drains the pipeline, serializes the tree
//! and lays down the trailer tables and superblock.
//!
//! lifecycle is one-way: building, then finalizing, then closed. a failure
//! on the worker latches `writer_failed`; every client operation that
//! touches the queue observes it and finalization refuses to produce an
//! image.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::buffer::ByteBuffer;
use crate::checksum::{block_digest, checksum_of};
use crate::compress::{Codec, CompressJob, LaunchPolicy};
use crate::config::Config;
use crate::dedup::{DedupTables, FragmentRef};
use crate::emit::{assign_inode_numbers, serialize_tree};
use crate::error::{Error, Result};
use crate::ids::IdTable;
use crate::metadata::{MetaWriter, META_BLOCK_SIZE_LB};
use crate::pending::{
    FragmentTable, OutputFile, PendingWrite, DATA_SIZE_MASK, DATA_STORED_FLAG,
};
use crate::queue::BoundedQueue;
use crate::tree::{DevKind, FileId, IpcKind, NodeId, NodeKind, RegData, Tree};

pub const SQFS_MAGIC: u32 = 0x7371_7368;
pub const SQFS_MAJOR: u16 = 4;
pub const SQFS_MINOR: u16 = 0;
/// superblock size; data starts right after it
pub const SUPERBLOCK_SIZE: u64 = 96;
/// the image is zero-padded to this granularity before the superblock lands
pub const PAD_SIZE: u64 = 4096;
const TABLE_NOT_PRESENT: u64 = u64::MAX;

/// builds one SquashFS image
pub struct ImageWriter {
    config: Config,
    codec: Codec,
    block_size: usize,
    tree: Tree,
    out: Arc<OutputFile>,
    queue: Arc<BoundedQueue<PendingWrite>>,
    worker: Option<JoinHandle<()>>,
    failed: Arc<AtomicBool>,
    fragments: Arc<FragmentTable>,
    current_block: Vec<u8>,
    current_fragment: Vec<u8>,
    /// fragments enqueued so far == index the accumulator will take
    fragment_count: u32,
    /// file currently receiving content; content is strictly file-at-a-time
    current_file: Option<FileId>,
    dedup: Option<DedupTables>,
    finished_data: bool,
}

impl ImageWriter {
    /// create the image file and start the writer worker
    pub fn create(path: &Path, config: Config) -> Result<Self> {
        config.validate()?;
        let codec = config.codec()?;
        let block_size = config.block_size();

        let out = Arc::new(OutputFile::create(path)?);
        out.seek_to(SUPERBLOCK_SIZE)?;

        let queue = Arc::new(BoundedQueue::<PendingWrite>::new(
            BoundedQueue::<PendingWrite>::default_capacity(),
        ));
        let failed = Arc::new(AtomicBool::new(false));
        let fragments = Arc::new(FragmentTable::new());

        let worker = if config.single_threaded {
            None
        } else {
            let queue = Arc::clone(&queue);
            let out = Arc::clone(&out);
            let failed = Arc::clone(&failed);
            Some(
                std::thread::Builder::new()
                    .name("sqz-writer".to_string())
                    .spawn(move || {
                        // keep draining after a failure so pushers never
                        // block on a dead consumer; the latch is checked by
                        // the client side
                        while let Some(pending) = queue.pop() {
                            if pending.complete(&out).is_err() {
                                failed.store(true, Ordering::Release);
                            }
                        }
                    })
                    .expect("spawn writer thread"),
            )
        };

        let dedup = config.dedup.then(DedupTables::new);

        Ok(Self {
            config,
            codec,
            block_size,
            tree: Tree::new(),
            out,
            queue,
            worker,
            failed,
            fragments,
            current_block: Vec::with_capacity(block_size),
            current_fragment: Vec::with_capacity(block_size),
            fragment_count: 0,
            current_file: None,
            dedup,
            finished_data: false,
        })
    }

    // --- tree operations -------------------------------------------------

    pub fn root(&self) -> NodeId {
        self.tree.root()
    }

    pub fn get_or_create_subdir(&mut self, parent: NodeId, name: &str) -> Result<NodeId> {
        self.tree.get_or_create_subdir(parent, name)
    }

    pub fn put_regular(&mut self, parent: NodeId, name: &str) -> Result<FileId> {
        self.tree.put_regular(parent, name)
    }

    pub fn put_symlink(&mut self, parent: NodeId, name: &str, target: &str) -> Result<NodeId> {
        self.tree.put_symlink(parent, name, target)
    }

    pub fn put_device(
        &mut self,
        parent: NodeId,
        name: &str,
        kind: DevKind,
        rdev: u32,
    ) -> Result<NodeId> {
        self.tree.put_device(parent, name, kind, rdev)
    }

    pub fn put_ipc(&mut self, parent: NodeId, name: &str, kind: IpcKind) -> Result<NodeId> {
        self.tree.put_ipc(parent, name, kind)
    }

    pub fn subdir_for_path(&mut self, path: &str) -> Result<NodeId> {
        self.tree.subdir_for_path(path)
    }

    pub fn put_regular_for_path(&mut self, path: &str) -> Result<FileId> {
        self.tree.put_regular_for_path(path)
    }

    pub fn put_symlink_for_path(&mut self, path: &str, target: &str) -> Result<NodeId> {
        self.tree.put_symlink_for_path(path, target)
    }

    pub fn put_device_for_path(&mut self, path: &str, kind: DevKind, rdev: u32) -> Result<NodeId> {
        self.tree.put_device_for_path(path, kind, rdev)
    }

    pub fn put_ipc_for_path(&mut self, path: &str, kind: IpcKind) -> Result<NodeId> {
        self.tree.put_ipc_for_path(path, kind)
    }

    pub fn set_mode(&mut self, node: impl Into<NodeId>, mode: u16) {
        self.tree.node_mut(node.into()).mode = mode;
    }

    pub fn set_uid(&mut self, node: impl Into<NodeId>, uid: u32) {
        self.tree.node_mut(node.into()).uid = uid;
    }

    pub fn set_gid(&mut self, node: impl Into<NodeId>, gid: u32) {
        self.tree.node_mut(node.into()).gid = gid;
    }

    pub fn set_mtime(&mut self, node: impl Into<NodeId>, mtime: u32) {
        self.tree.node_mut(node.into()).mtime = mtime;
    }

    pub fn set_xattr(&mut self, node: impl Into<NodeId>, xattr: u32) {
        self.tree.node_mut(node.into()).xattr = xattr;
    }

    // --- file content ----------------------------------------------------

    /// append content bytes to an open regular file
    ///
    /// content is ingested one file at a time: all writes for a file must
    /// happen between its `put_regular` and its `finish_file`.
    pub fn write(&mut self, file: FileId, mut buf: &[u8]) -> Result<()> {
        self.check_failed()?;
        if buf.is_empty() {
            return Ok(());
        }
        match self.current_file {
            None => self.current_file = Some(file),
            Some(open) => assert_eq!(open, file, "interleaved file content"),
        }

        self.reg_mut(file).file_size += buf.len() as u64;
        while !buf.is_empty() {
            let room = self.block_size - self.current_block.len();
            let take = room.min(buf.len());
            self.current_block.extend_from_slice(&buf[..take]);
            buf = &buf[take..];
            if self.current_block.len() == self.block_size {
                self.enqueue_block(file)?;
            }
        }
        Ok(())
    }

    /// close a regular file: dedup its blocks, pack its tail
    pub fn finish_file(&mut self, file: FileId) -> Result<()> {
        self.check_failed()?;
        if let Some(open) = self.current_file {
            assert_eq!(open, file, "interleaved file content");
        }
        self.current_file = None;

        // whole-file dedup runs before the tail is packed, while this
        // file's blocks are still the newest bytes in the image
        if self.dedup.is_some() {
            self.dedup_blocks(file)?;
        }
        if !self.current_block.is_empty() {
            self.put_fragment(file)?;
        }
        self.check_failed()
    }

    /// drain the data pipeline; idempotent
    pub fn finish_data(&mut self) -> Result<()> {
        if !self.finished_data {
            self.finished_data = true;
            self.flush_fragment()?;
            self.queue.finish();
            if let Some(worker) = self.worker.take() {
                if worker.join().is_err() {
                    self.failed.store(true, Ordering::Release);
                }
            }
        }
        self.check_failed()
    }

    /// finalize: drain data, serialize the tree, write tables and
    /// superblock. returns `bytes_used`.
    pub fn finish(mut self) -> Result<u64> {
        self.finish_data()?;

        let root = self.tree.root();
        let next_inode = assign_inode_numbers(&mut self.tree, root);

        let mut inode_writer = MetaWriter::new(self.codec);
        let mut dentry_writer = MetaWriter::new(self.codec);
        let mut ids = IdTable::new();
        let root_addr = serialize_tree(
            &mut self.tree,
            &mut inode_writer,
            &mut dentry_writer,
            &mut ids,
            root,
            next_inode,
        )?;
        inode_writer.flush()?;
        dentry_writer.flush()?;

        let inode_table_start = self.out.position()?;
        self.out.append(inode_writer.staged())?;
        let directory_table_start = self.out.position()?;
        self.out.append(dentry_writer.staged())?;

        let fragment_entries = self.fragments.snapshot();
        let fragment_table_start = self.write_indexed_table(fragment_entries.len(), 4, |b, i| {
            let entry = &fragment_entries[i];
            b.u64(entry.start_block);
            b.u32(entry.size);
            b.u32(0);
        })?;

        let id_list = ids.ids().to_vec();
        let id_table_start = self.write_indexed_table(id_list.len(), 2, |b, i| {
            b.u32(id_list[i]);
        })?;

        let bytes_used = self.out.position()?;
        self.out.pad_to(PAD_SIZE)?;

        let mut header = ByteBuffer::with_capacity(SUPERBLOCK_SIZE as usize);
        header.u32(SQFS_MAGIC);
        header.u32(next_inode - 1);
        header.u32(self.config.modification_time);
        header.u32(1u32 << self.config.block_log);
        header.u32(fragment_entries.len() as u32);
        header.u16(self.codec.type_id());
        header.u16(self.config.block_log as u16);
        header.u16(0); // flags
        header.u16(id_list.len() as u16);
        header.u16(SQFS_MAJOR);
        header.u16(SQFS_MINOR);
        header.u64(root_addr.packed());
        header.u64(bytes_used);
        header.u64(id_table_start);
        header.u64(TABLE_NOT_PRESENT); // xattr table
        header.u64(inode_table_start);
        header.u64(directory_table_start);
        header.u64(fragment_table_start);
        header.u64(TABLE_NOT_PRESENT); // export lookup table
        self.out.write_at(0, header.as_slice())?;
        self.out.sync()?;

        Ok(bytes_used)
    }

    /// write one indexed trailer table: the entries as a metadata stream,
    /// then one u64 file offset per metadata block
    ///
    /// returns the offset of the index array, which is what the superblock
    /// records; the metadata blocks precede it.
    fn write_indexed_table(
        &self,
        count: usize,
        entry_size_lb: u32,
        mut entry: impl FnMut(&mut ByteBuffer, usize),
    ) -> Result<u64> {
        let per_block = 1usize << (META_BLOCK_SIZE_LB - entry_size_lb);
        let table_start = self.out.position()?;

        let mut table = MetaWriter::new(self.codec);
        let mut indices = ByteBuffer::new();
        for i in 0..count {
            let mut buf = ByteBuffer::with_capacity(1 << entry_size_lb);
            entry(&mut buf, i);
            let addr = table.put(buf.as_slice())?;
            if i % per_block == 0 {
                indices.u64(table_start + u64::from(addr.block));
            }
        }
        table.flush()?;
        self.out.append(table.staged())?;

        let index_start = self.out.position()?;
        self.out.append(indices.as_slice())?;
        Ok(index_start)
    }

    // --- internals -------------------------------------------------------

    fn check_failed(&self) -> Result<()> {
        if self.failed.load(Ordering::Acquire) {
            Err(Error::WriterFailed)
        } else {
            Ok(())
        }
    }

    fn reg(&self, file: FileId) -> &RegData {
        match &self.tree.node(file.into()).kind {
            NodeKind::Reg(reg) => reg,
            _ => unreachable!("FileId always points at a regular file"),
        }
    }

    fn reg_mut(&mut self, file: FileId) -> &mut RegData {
        match &mut self.tree.node_mut(file.into()).kind {
            NodeKind::Reg(reg) => reg,
            _ => unreachable!("FileId always points at a regular file"),
        }
    }

    /// hand the full accumulator to the write pipeline
    fn enqueue_block(&mut self, file: FileId) -> Result<()> {
        let data = std::mem::take(&mut self.current_block);
        if self.dedup.is_some() {
            let digest = block_digest(&data);
            self.reg_mut(file).digests.push(digest);
        }
        let reg = self.reg_mut(file);
        reg.enqueued += 1;
        let blocks = reg.blocks.clone();
        self.submit(data, |job| PendingWrite::Block { job, blocks })
    }

    fn enqueue_fragment(&mut self) -> Result<()> {
        let data = std::mem::take(&mut self.current_fragment);
        self.fragment_count += 1;
        let fragments = Arc::clone(&self.fragments);
        self.submit(data, |job| PendingWrite::Fragment { job, fragments })
    }

    fn submit(
        &mut self,
        data: Vec<u8>,
        build: impl FnOnce(CompressJob) -> PendingWrite,
    ) -> Result<()> {
        if self.worker.is_none() {
            let job = CompressJob::spawn(self.codec, data, LaunchPolicy::Deferred);
            let result = build(job).complete(&self.out);
            if result.is_err() {
                self.failed.store(true, Ordering::Release);
            }
            result
        } else {
            let job = CompressJob::spawn(self.codec, data, LaunchPolicy::Eager);
            self.queue.push(build(job));
            Ok(())
        }
    }

    fn flush_fragment(&mut self) -> Result<()> {
        if self.current_fragment.is_empty() {
            Ok(())
        } else {
            self.enqueue_fragment()
        }
    }

    /// pack the current tail into the shared fragment accumulator
    fn put_fragment(&mut self, file: FileId) -> Result<()> {
        let len = self.current_block.len();
        debug_assert!(len > 0 && len < self.block_size);

        let digest = self
            .dedup
            .is_some()
            .then(|| (checksum_of(&self.current_block), len as u32));
        if let (Some(tables), Some(digest)) = (&self.dedup, digest) {
            if let Some(existing) = tables.find_fragment(digest) {
                if self.fragment_matches(existing)? {
                    let reg = self.reg_mut(file);
                    reg.fragment = existing.fragment;
                    reg.fragment_offset = existing.offset;
                    self.current_block.clear();
                    return Ok(());
                }
            }
        }

        if self.current_fragment.len() + len > self.block_size {
            self.flush_fragment()?;
        }
        let offset = self.current_fragment.len() as u32;
        self.current_fragment.extend_from_slice(&self.current_block);
        self.current_block.clear();

        let fragment = self.fragment_count;
        let reg = self.reg_mut(file);
        reg.fragment = fragment;
        reg.fragment_offset = offset;
        if let (Some(tables), Some(digest)) = (&mut self.dedup, digest) {
            tables.record_fragment(digest, FragmentRef { fragment, offset });
        }
        Ok(())
    }

    /// confirm a fragment-dedup candidate byte-for-byte
    ///
    /// the candidate is either still in the accumulator or already in the
    /// image; the latter requires waiting for its table entry and reading
    /// the fragment block back.
    fn fragment_matches(&self, existing: FragmentRef) -> Result<bool> {
        let tail: &[u8] = &self.current_block;
        let start = existing.offset as usize;

        if existing.fragment == self.fragment_count {
            return Ok(self.current_fragment.get(start..start + tail.len()) == Some(tail));
        }

        let entry = self.fragments.wait_for(existing.fragment, &self.failed)?;
        let on_disk = (entry.size & DATA_SIZE_MASK) as usize;
        let raw = self.out.read_at(entry.start_block, on_disk)?;
        let block = if entry.size & DATA_STORED_FLAG != 0 {
            raw
        } else {
            self.codec.decompress(&raw, self.block_size)?
        };
        Ok(block.get(start..start + tail.len()) == Some(tail))
    }

    /// collapse this file onto an earlier identical one, block-wise
    fn dedup_blocks(&mut self, file: FileId) -> Result<()> {
        let (digests, enqueued, blocks) = {
            let reg = self.reg(file);
            (reg.digests.clone(), reg.enqueued, reg.blocks.clone())
        };
        if enqueued == 0 {
            return Ok(());
        }
        blocks.wait_for_len(enqueued, &self.failed)?;

        let tables = self.dedup.as_mut().expect("dedup enabled");
        if let Some(prior) = tables.find_blocks(&digests) {
            let prior = prior.clone();
            let (our_start, our_sizes) = blocks.snapshot();
            let written: u64 = our_sizes
                .iter()
                .map(|s| u64::from(s & DATA_SIZE_MASK))
                .sum();
            // drop the freshly written copy only when it is still the tail
            // of the image; otherwise the bytes stay as garbage and only
            // the references collapse
            if self.out.position()? == our_start + written {
                self.out.truncate_to(our_start)?;
            }
            self.reg_mut(file).blocks = prior;
        } else {
            tables.record_blocks(digests, blocks);
        }
        Ok(())
    }
}

impl Drop for ImageWriter {
    fn drop(&mut self) {
        // make sure the worker is joined even on early error returns
        let _ = self.finish_data();
    }
}
