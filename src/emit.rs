//! inode and directory table serialization
//!
//! finalization walks the tree twice in the same post-order (children in
//! sorted name order, then the node itself). the first pass assigns inode
//! numbers, so every child's number is smaller than its parent's and the
//! root carries the largest. the second pass serializes: a directory first
//! recurses so each child's inode address and number are known, then writes
//! its dentry segments, then its own inode.
//!
//! inodes come in a short and an extended form distinguished by the type
//! field: the extended code minus 7. directory entries always carry the
//! short code.

use crate::buffer::ByteBuffer;
use crate::error::Result;
use crate::ids::IdTable;
use crate::metadata::{MetaAddress, MetaWriter};
use crate::tree::{NodeId, NodeKind, Tree, XATTR_NONE};

/// assign inode numbers from 1 in post-order and sort directory entries
///
/// returns the next unassigned number (root's number + 1), which doubles as
/// the root's recorded parent.
pub fn assign_inode_numbers(tree: &mut Tree, root: NodeId) -> u32 {
    let mut next = 1u32;
    assign_rec(tree, root, &mut next);
    next
}

fn assign_rec(tree: &mut Tree, id: NodeId, next: &mut u32) {
    let children: Vec<NodeId> = match &mut tree.node_mut(id).kind {
        NodeKind::Dir(dir) => {
            dir.entries
                .sort_by(|a, b| a.name.as_bytes().cmp(b.name.as_bytes()));
            dir.entries.iter().map(|e| e.node).collect()
        }
        _ => Vec::new(),
    };
    for child in children {
        assign_rec(tree, child, next);
    }
    tree.node_mut(id).inode_number = *next;
    *next += 1;
}

/// serialize every inode and directory table through the metadata writers
///
/// numbers must already be assigned. returns the root inode's address.
pub fn serialize_tree(
    tree: &mut Tree,
    inode_writer: &mut MetaWriter,
    dentry_writer: &mut MetaWriter,
    ids: &mut IdTable,
    root: NodeId,
    root_parent: u32,
) -> Result<MetaAddress> {
    let mut emitter = Emitter {
        tree,
        inode_writer,
        dentry_writer,
        ids,
    };
    emitter.write_inode(root, root_parent)?;
    Ok(emitter.tree.node(root).inode_address)
}

struct Emitter<'a> {
    tree: &'a mut Tree,
    inode_writer: &'a mut MetaWriter,
    dentry_writer: &'a mut MetaWriter,
    ids: &'a mut IdTable,
}

/// the delta a dentry can encode relative to its segment header
fn within16(base: u32, number: u32) -> bool {
    let diff = i64::from(number) - i64::from(base);
    diff > -0x8000 && diff < 0x7fff
}

impl Emitter<'_> {
    fn write_inode(&mut self, id: NodeId, parent_number: u32) -> Result<()> {
        if let NodeKind::Dir(dir) = &self.tree.node(id).kind {
            let children: Vec<NodeId> = dir.entries.iter().map(|e| e.node).collect();
            let my_number = self.tree.node(id).inode_number;
            for child in children {
                self.write_inode(child, my_number)?;
            }
            self.write_dirtable(id)?;
            self.write_dir_inode(id, parent_number)
        } else {
            self.write_leaf_inode(id)
        }
    }

    /// common 16-byte inode prefix; offset 0 is patched for short forms
    fn common(&mut self, id: NodeId) -> Result<ByteBuffer> {
        let node = self.tree.node(id);
        let (uid, gid) = (node.uid, node.gid);
        let (inode_type, mode, mtime, number) =
            (node.kind.inode_type(), node.mode, node.mtime, node.inode_number);
        let uid_idx = self.ids.lookup(uid)?;
        let gid_idx = self.ids.lookup(gid)?;

        let mut b = ByteBuffer::with_capacity(64);
        b.u16(inode_type);
        b.u16(mode);
        b.u16(uid_idx);
        b.u16(gid_idx);
        b.u32(mtime);
        b.u32(number);
        Ok(b)
    }

    fn finish_inode(&mut self, id: NodeId, buffer: &ByteBuffer) -> Result<()> {
        let addr = self.inode_writer.put(buffer.as_slice())?;
        self.tree.node_mut(id).inode_address = addr;
        Ok(())
    }

    fn write_dir_inode(&mut self, id: NodeId, parent_number: u32) -> Result<()> {
        let mut b = self.common(id)?;

        let node = self.tree.node(id);
        let (nlink, xattr, inode_type) = (node.nlink, node.xattr, node.kind.inode_type());
        let (filesize, start_block, start_offset) = match &node.kind {
            NodeKind::Dir(dir) => (dir.filesize, dir.table_start_block, dir.table_start_offset),
            _ => unreachable!(),
        };

        if filesize > 0xffff || xattr != XATTR_NONE {
            b.u32(nlink);
            b.u32(filesize);
            b.u32(start_block);
            b.u32(parent_number);
            b.u16(0); // no directory index
            b.u16(start_offset);
            b.u32(xattr);
        } else {
            b.put_u16(0, inode_type - 7);
            b.u32(start_block);
            b.u32(nlink);
            b.u16(filesize as u16);
            b.u16(start_offset);
            b.u32(parent_number);
        }
        self.finish_inode(id, &b)
    }

    fn write_leaf_inode(&mut self, id: NodeId) -> Result<()> {
        let mut b = self.common(id)?;
        let node = self.tree.node(id);
        let (nlink, xattr, inode_type) = (node.nlink, node.xattr, node.kind.inode_type());
        let has_xattr = xattr != XATTR_NONE;

        match &node.kind {
            NodeKind::Reg(reg) => {
                let (start_block, sizes) = reg.blocks.snapshot();
                let (file_size, fragment, offset) =
                    (reg.file_size, reg.fragment, reg.fragment_offset);

                let short =
                    start_block <= 0xffff && file_size <= 0xffff && nlink == 1 && !has_xattr;
                if short {
                    b.put_u16(0, inode_type - 7);
                    b.u32(start_block as u32);
                    b.u32(fragment);
                    b.u32(offset);
                    b.u32(file_size as u32);
                } else {
                    b.u64(start_block);
                    b.u64(file_size);
                    b.u64(0); // sparse
                    b.u32(nlink);
                    b.u32(fragment);
                    b.u32(offset);
                    b.u32(xattr);
                }
                self.finish_inode(id, &b)?;

                // the block-size list rides the inode stream directly after
                // the inode and is read sequentially with it
                let mut list = ByteBuffer::with_capacity(sizes.len() * 4);
                for size in &sizes {
                    list.u32(*size);
                }
                self.inode_writer.put(list.as_slice())?;
                Ok(())
            }
            NodeKind::Sym { target } => {
                b.u32(nlink);
                b.u32(target.len() as u32);
                b.raw(target.as_bytes());
                if has_xattr {
                    b.u32(xattr);
                } else {
                    b.put_u16(0, inode_type - 7);
                }
                self.finish_inode(id, &b)
            }
            NodeKind::Dev { rdev, .. } => {
                let rdev = *rdev;
                b.u32(nlink);
                b.u32(rdev);
                if has_xattr {
                    b.u32(xattr);
                } else {
                    b.put_u16(0, inode_type - 7);
                }
                self.finish_inode(id, &b)
            }
            NodeKind::Ipc { .. } => {
                b.u32(nlink);
                if has_xattr {
                    b.u32(xattr);
                } else {
                    b.put_u16(0, inode_type - 7);
                }
                self.finish_inode(id, &b)
            }
            NodeKind::Dir(_) => unreachable!(),
        }
    }

    /// write a directory's dentry segments; computes nlink and filesize
    fn write_dirtable(&mut self, id: NodeId) -> Result<()> {
        let addr = self.dentry_writer.put(&[])?;
        {
            let node = self.tree.node_mut(id);
            node.nlink = 2;
            match &mut node.kind {
                NodeKind::Dir(dir) => {
                    dir.table_start_block = addr.block;
                    dir.table_start_offset = addr.offset;
                    dir.filesize = 3;
                }
                _ => unreachable!(),
            }
        }

        let entries: Vec<(String, NodeId)> = match &self.tree.node(id).kind {
            NodeKind::Dir(dir) => dir
                .entries
                .iter()
                .map(|e| (e.name.clone(), e.node))
                .collect(),
            _ => unreachable!(),
        };

        let mut offset = 0;
        while offset < entries.len() {
            offset = self.write_dirtable_segment(id, &entries, offset)?;
        }
        Ok(())
    }

    fn write_dirtable_segment(
        &mut self,
        dir_id: NodeId,
        entries: &[(String, NodeId)],
        start: usize,
    ) -> Result<usize> {
        let first = self.tree.node(entries[start].1);
        let header_block = first.inode_address.block;
        let header_number = first.inode_number;

        let mut count = 1;
        while start + count < entries.len() {
            let node = self.tree.node(entries[start + count].1);
            if node.inode_address.block == header_block
                && within16(header_number, node.inode_number)
            {
                count += 1;
            } else {
                break;
            }
        }

        let mut header = ByteBuffer::with_capacity(12);
        header.u32(count as u32 - 1);
        header.u32(header_block);
        header.u32(header_number);
        self.dentry_writer.put(header.as_slice())?;

        let mut written = 12u32;
        let mut new_subdirs = 0u32;
        for (name, child_id) in &entries[start..start + count] {
            let child = self.tree.node(*child_id);
            let mut entry = ByteBuffer::with_capacity(8 + name.len());
            entry.u16(child.inode_address.offset);
            entry.i16((i64::from(child.inode_number) - i64::from(header_number)) as i16);
            entry.u16(child.kind.inode_type() - 7);
            entry.u16(name.len() as u16 - 1);
            entry.raw(name.as_bytes());
            if matches!(child.kind, NodeKind::Dir(_)) {
                new_subdirs += 1;
            }
            self.dentry_writer.put(entry.as_slice())?;
            written += 8 + name.len() as u32;
        }

        let node = self.tree.node_mut(dir_id);
        node.nlink += new_subdirs;
        match &mut node.kind {
            NodeKind::Dir(dir) => dir.filesize += written,
            _ => unreachable!(),
        }
        Ok(start + count)
    }
}
