//! in-memory directory tree
//!
//! the tree accumulates every filesystem entry destined for the image:
//! directories, regular files, symlinks, device nodes, fifos and sockets.
//! nodes live in an arena and are addressed by `NodeId`; a directory's
//! entries hold ids, never references, so the ingest code can hold a file
//! id across arbitrary tree growth.
//!
//! entries are kept in insertion order and checked for duplicates by linear
//! scan (directories are usually small); serialization sorts them by name.

use crate::checksum::BlockDigest;
use crate::error::{Error, Result};
use crate::metadata::MetaAddress;
use crate::pending::SharedBlockList;

/// sentinel: no xattr entry for this inode
pub const XATTR_NONE: u32 = 0xffff_ffff;
/// sentinel: file has no fragment tail
pub const FRAGMENT_NONE: u32 = 0xffff_ffff;

/// node handle into the tree arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u32);

/// handle to a regular file accepting content
///
/// only `put_regular`/`put_regular_for_path` mint these, so content can
/// never be written into a non-regular node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileId(pub(crate) NodeId);

impl From<FileId> for NodeId {
    fn from(f: FileId) -> NodeId {
        f.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevKind {
    Block,
    Char,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcKind {
    Fifo,
    Socket,
}

/// one name in a directory
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub node: NodeId,
}

#[derive(Debug, Default)]
pub struct DirData {
    pub entries: Vec<DirEntry>,
    /// dentry-stream address of this directory's table, set at serialization
    pub table_start_block: u32,
    pub table_start_offset: u16,
    /// dentry bytes attributed to this directory, seeded to 3 on-disk
    pub filesize: u32,
}

pub struct RegData {
    pub blocks: SharedBlockList,
    pub file_size: u64,
    pub fragment: u32,
    pub fragment_offset: u32,
    /// data blocks handed to the write queue so far
    pub enqueued: usize,
    /// per-block fingerprints, collected only when dedup is on
    pub digests: Vec<BlockDigest>,
}

impl RegData {
    fn new() -> Self {
        Self {
            blocks: SharedBlockList::new(),
            file_size: 0,
            fragment: FRAGMENT_NONE,
            fragment_offset: 0,
            enqueued: 0,
            digests: Vec::new(),
        }
    }
}

pub enum NodeKind {
    Dir(DirData),
    Reg(RegData),
    Sym { target: String },
    Dev { kind: DevKind, rdev: u32 },
    Ipc { kind: IpcKind },
}

impl NodeKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            NodeKind::Dir(_) => "directory",
            NodeKind::Reg(_) => "regular",
            NodeKind::Sym { .. } => "symlink",
            NodeKind::Dev {
                kind: DevKind::Block,
                ..
            } => "block device",
            NodeKind::Dev {
                kind: DevKind::Char,
                ..
            } => "char device",
            NodeKind::Ipc {
                kind: IpcKind::Fifo,
                ..
            } => "fifo",
            NodeKind::Ipc {
                kind: IpcKind::Socket,
                ..
            } => "socket",
        }
    }

    /// extended inode type code; the short form is this minus 7
    pub fn inode_type(&self) -> u16 {
        match self {
            NodeKind::Dir(_) => 8,
            NodeKind::Reg(_) => 9,
            NodeKind::Sym { .. } => 10,
            NodeKind::Dev {
                kind: DevKind::Block,
                ..
            } => 11,
            NodeKind::Dev {
                kind: DevKind::Char,
                ..
            } => 12,
            NodeKind::Ipc {
                kind: IpcKind::Fifo,
                ..
            } => 13,
            NodeKind::Ipc {
                kind: IpcKind::Socket,
                ..
            } => 14,
        }
    }

    fn same_shape(&self, other: &NodeKind) -> bool {
        self.inode_type() == other.inode_type()
    }
}

pub struct Node {
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    pub mtime: u32,
    pub xattr: u32,
    pub nlink: u32,
    /// assigned in post-order during finalization; 0 until then
    pub inode_number: u32,
    /// inode-stream address, set when the inode is serialized
    pub inode_address: MetaAddress,
    pub kind: NodeKind,
}

impl Node {
    fn new(kind: NodeKind) -> Self {
        let mode = match kind {
            NodeKind::Dir(_) => 0o755,
            _ => 0o644,
        };
        Self {
            mode,
            uid: 0,
            gid: 0,
            mtime: 0,
            xattr: XATTR_NONE,
            nlink: 1,
            inode_number: 0,
            inode_address: MetaAddress::default(),
            kind,
        }
    }
}

/// the directory tree arena; node 0 is the root directory
pub struct Tree {
    nodes: Vec<Node>,
}

impl Tree {
    pub fn new() -> Self {
        Self {
            nodes: vec![Node::new(NodeKind::Dir(DirData::default()))],
        }
    }

    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0 as usize]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn alloc(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    fn dir_entries(&self, id: NodeId) -> &[DirEntry] {
        match &self.node(id).kind {
            NodeKind::Dir(dir) => &dir.entries,
            _ => panic!("node is not a directory"),
        }
    }

    fn push_entry(&mut self, parent: NodeId, name: &str, node: NodeId) {
        match &mut self.node_mut(parent).kind {
            NodeKind::Dir(dir) => dir.entries.push(DirEntry {
                name: name.to_string(),
                node,
            }),
            _ => panic!("node is not a directory"),
        }
    }

    fn find_child(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        self.dir_entries(parent)
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.node)
    }

    /// return the named subdirectory, creating it if absent
    ///
    /// a non-directory already holding the name is a type conflict.
    pub fn get_or_create_subdir(&mut self, parent: NodeId, name: &str) -> Result<NodeId> {
        validate_entry_name(name)?;
        if let Some(existing) = self.find_child(parent, name) {
            return match &self.node(existing).kind {
                NodeKind::Dir(_) => Ok(existing),
                other => Err(Error::TypeConflict {
                    name: name.to_string(),
                    existing: other.type_name(),
                    requested: "directory",
                }),
            };
        }
        let child = self.alloc(Node::new(NodeKind::Dir(DirData::default())));
        self.push_entry(parent, name, child);
        Ok(child)
    }

    fn put_leaf(&mut self, parent: NodeId, name: &str, kind: NodeKind) -> Result<NodeId> {
        validate_entry_name(name)?;
        if let Some(existing) = self.find_child(parent, name) {
            let node = self.node(existing);
            if !node.kind.same_shape(&kind) {
                return Err(Error::TypeConflict {
                    name: name.to_string(),
                    existing: node.kind.type_name(),
                    requested: kind.type_name(),
                });
            }
            // same-typed overwrite starts the leaf over, metadata included
            self.nodes[existing.0 as usize] = Node::new(kind);
            return Ok(existing);
        }
        let child = self.alloc(Node::new(kind));
        self.push_entry(parent, name, child);
        Ok(child)
    }

    pub fn put_regular(&mut self, parent: NodeId, name: &str) -> Result<FileId> {
        self.put_leaf(parent, name, NodeKind::Reg(RegData::new()))
            .map(FileId)
    }

    pub fn put_symlink(&mut self, parent: NodeId, name: &str, target: &str) -> Result<NodeId> {
        self.put_leaf(
            parent,
            name,
            NodeKind::Sym {
                target: target.to_string(),
            },
        )
    }

    pub fn put_device(
        &mut self,
        parent: NodeId,
        name: &str,
        kind: DevKind,
        rdev: u32,
    ) -> Result<NodeId> {
        self.put_leaf(parent, name, NodeKind::Dev { kind, rdev })
    }

    pub fn put_ipc(&mut self, parent: NodeId, name: &str, kind: IpcKind) -> Result<NodeId> {
        self.put_leaf(parent, name, NodeKind::Ipc { kind })
    }

    /// resolve a `/`-separated path to a directory, creating as needed
    ///
    /// empty components are skipped; an empty path or bare `/` is the root.
    pub fn subdir_for_path(&mut self, path: &str) -> Result<NodeId> {
        let mut current = self.root();
        for component in path.split('/').filter(|c| !c.is_empty()) {
            current = self.get_or_create_subdir(current, component)?;
        }
        Ok(current)
    }

    /// split a leaf path into (created parent dir, final name)
    fn leaf_parent_for_path<'p>(&mut self, path: &'p str) -> Result<(NodeId, &'p str)> {
        if path.ends_with('/') || path.split('/').all(|c| c.is_empty()) {
            return Err(Error::InvalidPath(path.to_string()));
        }
        let (dir, name) = match path.rfind('/') {
            Some(pos) => (&path[..pos], &path[pos + 1..]),
            None => ("", path),
        };
        let parent = self.subdir_for_path(dir)?;
        Ok((parent, name))
    }

    pub fn put_regular_for_path(&mut self, path: &str) -> Result<FileId> {
        let (parent, name) = self.leaf_parent_for_path(path)?;
        self.put_regular(parent, name)
    }

    pub fn put_symlink_for_path(&mut self, path: &str, target: &str) -> Result<NodeId> {
        let (parent, name) = self.leaf_parent_for_path(path)?;
        self.put_symlink(parent, name, target)
    }

    pub fn put_device_for_path(&mut self, path: &str, kind: DevKind, rdev: u32) -> Result<NodeId> {
        let (parent, name) = self.leaf_parent_for_path(path)?;
        self.put_device(parent, name, kind, rdev)
    }

    pub fn put_ipc_for_path(&mut self, path: &str, kind: IpcKind) -> Result<NodeId> {
        let (parent, name) = self.leaf_parent_for_path(path)?;
        self.put_ipc(parent, name, kind)
    }
}

impl Default for Tree {
    fn default() -> Self {
        Self::new()
    }
}

/// validate a directory entry name
fn validate_entry_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidEntryName("empty name".to_string()));
    }
    if name.contains('/') {
        return Err(Error::InvalidEntryName(format!(
            "name contains '/': {}",
            name
        )));
    }
    if name.contains('\0') {
        return Err(Error::InvalidEntryName(format!(
            "name contains null byte: {}",
            name
        )));
    }
    if name == "." || name == ".." {
        return Err(Error::InvalidEntryName(format!("reserved name: {}", name)));
    }
    if name.len() > 256 {
        return Err(Error::NameTooLong {
            name: name.chars().take(32).collect(),
            len: name.len(),
        });
    }
    Ok(())
}
