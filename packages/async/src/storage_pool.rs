//! The chunked storage pool.
//!
//! A pool is a fixed-capacity set of chunks backed by files under one or
//! more device directories. Chunk 0 of the pool is the conventional chunk
//! holding the metadata block; every other chunk is an append-only stream
//! of serialized records. Whether a sequential chunk currently belongs to
//! the fast ring, the slow ring or the free list is recorded in the
//! metadata block, not here.

use std::cell::Cell;
use std::fs::{File, OpenOptions};
use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use crate::error::IoError;
use crate::offset::{ChunkOffset, CHUNK_CAPACITY};

/// The roles a chunk can have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkType {
    /// The single conventional chunk: metadata plus the root-offset ring.
    Cnv,
    /// A sequential, append-only chunk of serialized nodes.
    Seq,
}

/// How to open a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Discard any existing contents.
    Truncate,
    /// Open existing contents; fails if the pool was never created.
    OpenExisting,
}

/// Pool creation flags.
#[derive(Debug, Clone)]
pub struct CreationFlags {
    /// Round-robin chunk ids across devices instead of filling each device
    /// in turn.
    pub interleave_chunks_evenly: bool,
    /// Per-chunk capacity; production pools use [`CHUNK_CAPACITY`], tests
    /// shrink it to exercise rotation and compaction cheaply.
    pub chunk_capacity: u64,
    /// Number of sequential chunks in the pool.
    pub chunk_count: u32,
    /// Open read-only; any number of read-only openers may share a pool
    /// with one writer.
    pub read_only: bool,
}

impl Default for CreationFlags {
    fn default() -> Self {
        Self {
            interleave_chunks_evenly: false,
            chunk_capacity: CHUNK_CAPACITY,
            chunk_count: 32,
            read_only: false,
        }
    }
}

/// A strong handle to one chunk.
pub struct Chunk {
    id: u32,
    file: File,
    capacity: u64,
    size: Cell<u64>,
}

impl Chunk {
    /// The chunk id.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Capacity in bytes.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Current append position.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size.get()
    }

    /// Bytes still appendable.
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.capacity - self.size.get()
    }

    /// The read descriptor and the base offset reads are relative to.
    #[must_use]
    pub fn read_fd(&self) -> (RawFd, u64) {
        (self.file.as_raw_fd(), 0)
    }

    /// Reserve an `n_bytes` append window. Returns the write descriptor and
    /// the absolute offset the caller must submit the write at.
    ///
    /// # Panics
    /// Panics if the reservation exceeds the chunk capacity; callers gate
    /// on [`Self::remaining`].
    pub fn write_fd(&self, n_bytes: u64) -> (RawFd, u64) {
        let at = self.size.get();
        assert!(
            at + n_bytes <= self.capacity,
            "chunk {} append window overflows capacity",
            self.id
        );
        self.size.set(at + n_bytes);
        (self.file.as_raw_fd(), at)
    }

    /// Rewind the append position, discarding bytes past `new_size`.
    ///
    /// # Errors
    /// Returns the truncate failure, if any.
    pub fn truncate(&self, new_size: u64) -> Result<(), IoError> {
        let ret = unsafe { libc::ftruncate(self.file.as_raw_fd(), new_size as libc::off_t) };
        if ret != 0 {
            return Err(IoError::Failure(std::io::Error::last_os_error()));
        }
        self.size.set(new_size);
        Ok(())
    }

    /// Persist appended bytes to the device.
    ///
    /// # Errors
    /// Returns the sync failure, if any.
    pub fn sync(&self) -> Result<(), IoError> {
        self.file.sync_data().map_err(IoError::Failure)
    }
}

/// A fixed-capacity set of chunks across one or more devices.
pub struct StoragePool {
    cnv: Rc<Chunk>,
    seq: Vec<Rc<Chunk>>,
    chunk_capacity: u64,
}

impl StoragePool {
    /// Create or open the pool under the given device directories.
    ///
    /// # Errors
    /// Fails if a device directory is missing, the writer lock is already
    /// held, or `OpenExisting` finds no pool.
    pub fn open(
        paths: &[PathBuf],
        mode: OpenMode,
        flags: &CreationFlags,
    ) -> Result<Self, IoError> {
        if paths.is_empty() {
            return Err(IoError::Pool("no device paths configured".into()));
        }
        if flags.chunk_capacity > ChunkOffset::MAX_OFFSET + 1 {
            return Err(IoError::Pool(format!(
                "chunk capacity {} exceeds the 28 bit in-chunk offset space",
                flags.chunk_capacity
            )));
        }
        if u64::from(flags.chunk_count) > ChunkOffset::MAX_ID {
            return Err(IoError::Pool(format!(
                "chunk count {} exceeds the 20 bit id space",
                flags.chunk_count
            )));
        }
        for path in paths {
            if !path.is_dir() {
                return Err(IoError::Pool(format!(
                    "device path {} is not a directory",
                    path.display()
                )));
            }
        }

        let truncate = mode == OpenMode::Truncate && !flags.read_only;
        let cnv_path = device_for(paths, 0, flags).join("cnv.triedb");
        if mode == OpenMode::OpenExisting && !cnv_path.exists() {
            return Err(IoError::Pool(format!(
                "no existing pool at {}",
                cnv_path.display()
            )));
        }

        let cnv_file = open_chunk_file(&cnv_path, truncate, flags.read_only)?;
        lock_writer(&cnv_file, flags.read_only)?;
        let cnv = Rc::new(Chunk {
            id: 0,
            size: Cell::new(file_len(&cnv_file)?),
            file: cnv_file,
            capacity: flags.chunk_capacity,
        });

        let mut seq = Vec::with_capacity(flags.chunk_count as usize);
        for id in 0..flags.chunk_count {
            let path = device_for(paths, id as usize + 1, flags)
                .join(format!("seq-{id:05x}.triedb"));
            let file = open_chunk_file(&path, truncate, flags.read_only)?;
            seq.push(Rc::new(Chunk {
                id,
                size: Cell::new(file_len(&file)?),
                file,
                capacity: flags.chunk_capacity,
            }));
        }

        tracing::debug!(
            devices = paths.len(),
            chunks = seq.len(),
            chunk_capacity = flags.chunk_capacity,
            truncated = truncate,
            "storage pool opened"
        );

        Ok(Self {
            cnv,
            seq,
            chunk_capacity: flags.chunk_capacity,
        })
    }

    /// Number of chunks with the given role.
    #[must_use]
    pub fn chunks(&self, chunk_type: ChunkType) -> u32 {
        match chunk_type {
            ChunkType::Cnv => 1,
            ChunkType::Seq => self.seq.len() as u32,
        }
    }

    /// Per-chunk capacity.
    #[must_use]
    pub fn chunk_capacity(&self) -> u64 {
        self.chunk_capacity
    }

    /// Acquire a strong handle to a chunk.
    ///
    /// # Panics
    /// Panics on an out-of-range id.
    #[must_use]
    pub fn chunk(&self, chunk_type: ChunkType, id: u32) -> Rc<Chunk> {
        match chunk_type {
            ChunkType::Cnv => {
                assert_eq!(id, 0, "the pool has a single conventional chunk");
                Rc::clone(&self.cnv)
            }
            ChunkType::Seq => Rc::clone(&self.seq[id as usize]),
        }
    }

    /// Map I/O descriptors for a chunk. All chunks are activated at open,
    /// so this is a handle acquisition.
    #[must_use]
    pub fn activate_chunk(&self, chunk_type: ChunkType, id: u32) -> Rc<Chunk> {
        self.chunk(chunk_type, id)
    }
}

fn device_for<'a>(paths: &'a [PathBuf], slot: usize, flags: &CreationFlags) -> &'a Path {
    let index = if flags.interleave_chunks_evenly {
        slot % paths.len()
    } else {
        (slot * paths.len()) / (flags.chunk_count as usize + 1)
    };
    &paths[index.min(paths.len() - 1)]
}

fn open_chunk_file(path: &Path, truncate: bool, read_only: bool) -> Result<File, IoError> {
    let mut options = OpenOptions::new();
    if read_only {
        options.read(true);
    } else {
        options.read(true).write(true).create(true);
        if truncate {
            options.truncate(true);
        }
    }
    options.open(path).map_err(IoError::Failure)
}

fn file_len(file: &File) -> Result<u64, IoError> {
    Ok(file.metadata().map_err(IoError::Failure)?.len())
}

fn lock_writer(file: &File, read_only: bool) -> Result<(), IoError> {
    let op = if read_only {
        libc::LOCK_SH | libc::LOCK_NB
    } else {
        libc::LOCK_EX | libc::LOCK_NB
    };
    let ret = unsafe { libc::flock(file.as_raw_fd(), op) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
            return Err(IoError::Pool(
                "storage pool is already open for writing by another process".into(),
            ));
        }
        return Err(IoError::Failure(err));
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn small_flags() -> CreationFlags {
        CreationFlags {
            chunk_capacity: 1 << 20,
            chunk_count: 4,
            ..CreationFlags::default()
        }
    }

    #[test]
    fn truncate_then_reopen_existing() {
        let dir = tempfile::tempdir().unwrap();
        let paths = vec![dir.path().to_path_buf()];
        {
            let pool = StoragePool::open(&paths, OpenMode::Truncate, &small_flags()).unwrap();
            let chunk = pool.chunk(ChunkType::Seq, 1);
            let (_, at) = chunk.write_fd(512);
            assert_eq!(at, 0);
            assert_eq!(chunk.size(), 512);
        }
        let pool = StoragePool::open(&paths, OpenMode::OpenExisting, &small_flags()).unwrap();
        assert_eq!(pool.chunks(ChunkType::Seq), 4);
    }

    #[test]
    fn open_existing_without_pool_fails() {
        let dir = tempfile::tempdir().unwrap();
        let paths = vec![dir.path().to_path_buf()];
        let err = StoragePool::open(&paths, OpenMode::OpenExisting, &small_flags());
        assert!(err.is_err());
    }

    #[test]
    fn append_windows_do_not_overlap() {
        let dir = tempfile::tempdir().unwrap();
        let paths = vec![dir.path().to_path_buf()];
        let pool = StoragePool::open(&paths, OpenMode::Truncate, &small_flags()).unwrap();
        let chunk = pool.chunk(ChunkType::Seq, 0);
        let (_, a) = chunk.write_fd(4096);
        let (_, b) = chunk.write_fd(512);
        assert_eq!(a, 0);
        assert_eq!(b, 4096);
        assert_eq!(chunk.remaining(), (1 << 20) - 4608);
    }

    #[test]
    fn truncate_rewinds_append_position() {
        let dir = tempfile::tempdir().unwrap();
        let paths = vec![dir.path().to_path_buf()];
        let pool = StoragePool::open(&paths, OpenMode::Truncate, &small_flags()).unwrap();
        let chunk = pool.chunk(ChunkType::Seq, 2);
        chunk.write_fd(8192);
        chunk.truncate(512).unwrap();
        assert_eq!(chunk.size(), 512);
        let (_, at) = chunk.write_fd(512);
        assert_eq!(at, 512);
    }

    #[test]
    fn second_writer_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let paths = vec![dir.path().to_path_buf()];
        let _pool = StoragePool::open(&paths, OpenMode::Truncate, &small_flags()).unwrap();
        let second = StoragePool::open(&paths, OpenMode::OpenExisting, &small_flags());
        assert!(second.is_err());

        let mut ro = small_flags();
        ro.read_only = true;
        let reader = StoragePool::open(&paths, OpenMode::OpenExisting, &ro);
        assert!(reader.is_ok());
    }
}
