//! scheduled compression+write units and the state they land in
//!
//! a pending write is one block's journey from uncompressed bytes to bytes
//! in the image: a data block records its offset and size into the owning
//! file's shared block list, a fragment block appends to the fragment
//! table. the single writer worker completes pending writes in queue order,
//! so offsets captured at write time are monotonic.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::compress::CompressJob;
use crate::error::{Error, IoResultExt, Result};

/// bit 24 of a data-block or fragment size: payload stored uncompressed
pub const DATA_STORED_FLAG: u32 = 1 << 24;
pub const DATA_SIZE_MASK: u32 = DATA_STORED_FLAG - 1;

/// the image file, shared between the ingest thread and the writer worker
///
/// the mutex is held across tell+write so recorded start offsets are exact.
/// the cursor always rests at the append position.
pub struct OutputFile {
    path: PathBuf,
    file: Mutex<File>,
}

impl OutputFile {
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .with_path(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    /// write at the current append position, returning the offset written at
    pub fn append(&self, bytes: &[u8]) -> Result<u64> {
        let mut file = self.file.lock().unwrap();
        let tell = file.stream_position().with_path(&self.path)?;
        file.write_all(bytes).with_path(&self.path)?;
        Ok(tell)
    }

    /// current append position
    pub fn position(&self) -> Result<u64> {
        let mut file = self.file.lock().unwrap();
        file.stream_position().with_path(&self.path)
    }

    /// read bytes from an arbitrary offset, restoring the append position
    pub fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut file = self.file.lock().unwrap();
        let pos = file.stream_position().with_path(&self.path)?;
        file.seek(SeekFrom::Start(offset)).with_path(&self.path)?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf).with_path(&self.path)?;
        file.seek(SeekFrom::Start(pos)).with_path(&self.path)?;
        Ok(buf)
    }

    /// drop everything past `offset` and continue appending there
    ///
    /// only valid while the dropped bytes are the newest in the file.
    pub fn truncate_to(&self, offset: u64) -> Result<()> {
        let mut file = self.file.lock().unwrap();
        file.set_len(offset).with_path(&self.path)?;
        file.seek(SeekFrom::Start(offset)).with_path(&self.path)?;
        Ok(())
    }

    /// move the append position (used once, to skip the superblock)
    pub fn seek_to(&self, offset: u64) -> Result<()> {
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(offset)).with_path(&self.path)?;
        Ok(())
    }

    /// zero-fill to the next multiple of `alignment`, if not already aligned
    pub fn pad_to(&self, alignment: u64) -> Result<u64> {
        let mut file = self.file.lock().unwrap();
        let pos = file.stream_position().with_path(&self.path)?;
        let rem = pos % alignment;
        if rem != 0 {
            let fill = vec![0u8; (alignment - rem) as usize];
            file.write_all(&fill).with_path(&self.path)?;
        }
        file.stream_position().with_path(&self.path)
    }

    /// write at an absolute offset without disturbing the append position
    pub fn write_at(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        let mut file = self.file.lock().unwrap();
        let pos = file.stream_position().with_path(&self.path)?;
        file.seek(SeekFrom::Start(offset)).with_path(&self.path)?;
        file.write_all(bytes).with_path(&self.path)?;
        file.seek(SeekFrom::Start(pos)).with_path(&self.path)?;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        let file = self.file.lock().unwrap();
        file.sync_all().with_path(&self.path)
    }
}

struct BlockListState {
    start_block: Option<u64>,
    sizes: Vec<u32>,
}

/// a regular file's block list, shared with the writer worker
///
/// the ingest thread can finish a file and move on while its blocks are
/// still compressing; the worker appends each block's on-disk size here as
/// it lands. cloning shares the same list, which is also how whole-file
/// dedup collapses two files onto one set of blocks.
#[derive(Clone)]
pub struct SharedBlockList {
    inner: Arc<(Mutex<BlockListState>, Condvar)>,
}

impl SharedBlockList {
    pub fn new() -> Self {
        Self {
            inner: Arc::new((
                Mutex::new(BlockListState {
                    start_block: None,
                    sizes: Vec::new(),
                }),
                Condvar::new(),
            )),
        }
    }

    /// record one written block: capture the start offset on first use,
    /// append the size-with-flag
    pub fn record(&self, tell: u64, size_with_flag: u32) {
        let (lock, cv) = &*self.inner;
        let mut state = lock.lock().unwrap();
        if state.start_block.is_none() {
            state.start_block = Some(tell);
        }
        state.sizes.push(size_with_flag);
        drop(state);
        cv.notify_all();
    }

    /// (start offset, sizes) as of now; start is 0 for an all-fragment file
    pub fn snapshot(&self) -> (u64, Vec<u32>) {
        let (lock, _) = &*self.inner;
        let state = lock.lock().unwrap();
        (state.start_block.unwrap_or(0), state.sizes.clone())
    }

    /// block until `n` sizes have been recorded or the writer fails
    pub fn wait_for_len(&self, n: usize, failed: &AtomicBool) -> Result<()> {
        let (lock, cv) = &*self.inner;
        let mut state = lock.lock().unwrap();
        while state.sizes.len() < n {
            if failed.load(Ordering::Acquire) {
                return Err(Error::WriterFailed);
            }
            let (next, _) = cv.wait_timeout(state, Duration::from_millis(50)).unwrap();
            state = next;
        }
        Ok(())
    }
}

impl Default for SharedBlockList {
    fn default() -> Self {
        Self::new()
    }
}

/// one fragment block's location in the image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentEntry {
    pub start_block: u64,
    /// low 24 bits length, bit 24 stored-uncompressed
    pub size: u32,
}

/// the fragment table, appended by the writer worker as fragment blocks land
///
/// dedup verification reads fragments back from the image and must wait for
/// the entry of the fragment it is examining; the condvar covers that.
pub struct FragmentTable {
    state: Mutex<Vec<FragmentEntry>>,
    cv: Condvar,
}

impl FragmentTable {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(Vec::new()),
            cv: Condvar::new(),
        }
    }

    pub fn append(&self, entry: FragmentEntry) {
        let mut entries = self.state.lock().unwrap();
        entries.push(entry);
        drop(entries);
        self.cv.notify_all();
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<FragmentEntry> {
        self.state.lock().unwrap().clone()
    }

    /// block until the entry at `index` exists or the writer fails
    pub fn wait_for(&self, index: u32, failed: &AtomicBool) -> Result<FragmentEntry> {
        let mut entries = self.state.lock().unwrap();
        loop {
            if let Some(entry) = entries.get(index as usize) {
                return Ok(*entry);
            }
            if failed.load(Ordering::Acquire) {
                return Err(Error::WriterFailed);
            }
            let (next, _) = self
                .cv
                .wait_timeout(entries, Duration::from_millis(50))
                .unwrap();
            entries = next;
        }
    }
}

impl Default for FragmentTable {
    fn default() -> Self {
        Self::new()
    }
}

/// a block scheduled for compression and writing
pub enum PendingWrite {
    /// data block of one regular file
    Block {
        job: CompressJob,
        blocks: SharedBlockList,
    },
    /// shared fragment block
    Fragment {
        job: CompressJob,
        fragments: Arc<FragmentTable>,
    },
}

impl PendingWrite {
    /// obtain the payload, write it, record where it landed
    pub fn complete(self, out: &OutputFile) -> Result<()> {
        match self {
            PendingWrite::Block { job, blocks } => {
                let (payload, stored) = job.wait()?;
                let tell = out.append(&payload)?;
                let size = payload.len() as u32 | if stored { DATA_STORED_FLAG } else { 0 };
                blocks.record(tell, size);
            }
            PendingWrite::Fragment { job, fragments } => {
                let (payload, stored) = job.wait()?;
                let tell = out.append(&payload)?;
                let size = payload.len() as u32 | if stored { DATA_STORED_FLAG } else { 0 };
                fragments.append(FragmentEntry {
                    start_block: tell,
                    size,
                });
            }
        }
        Ok(())
    }
}
