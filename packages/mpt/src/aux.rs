//! The update context shared by every trie operation.
//!
//! [`UpdateAux`] owns the storage pool, the I/O engine, the metadata block
//! and the buffered node writers for the fast and slow rings. It implements
//! the append protocol (reserve, buffer, background write), chunk rotation
//! through the metadata free list, the commit sequence that makes node
//! writes durable before a root offset is published, and the rewind run on
//! reopen after an unclean death. A metadata-less in-memory mode backs the
//! plain trie tests.

use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;

use triedb_async::{
    Buffers, ChunkOffset, ChunkType, CompactVirtualChunkOffset, CreationFlags, IoEngine, IoError,
    OpenMode, PoolBuffer, Receiver, StoragePool, WriteBufferSender, connect, DISK_PAGE_SIZE,
    INVALID_COMPACT_VIRTUAL_OFFSET, INVALID_OFFSET,
};

use crate::config::{OnDiskDbConfig, ReadOnlyOnDiskDbConfig};
use crate::error::DbError;
use crate::metadata::{ChunkList, DbMetadata};
use crate::node::{Node, DISK_SIZE_BYTES};

/// Trie depth up to which freshly written nodes stay cached in memory.
pub const CACHE_LEVELS: usize = 4;

struct Writer {
    chunk_id: Option<u32>,
    buffer: Option<PoolBuffer>,
    used: usize,
    base: u64,
}

impl Writer {
    const fn new() -> Self {
        Self {
            chunk_id: None,
            buffer: None,
            used: 0,
            base: 0,
        }
    }
}

struct SlotReceiver(Rc<RefCell<Option<Result<PoolBuffer, IoError>>>>);

impl Receiver for SlotReceiver {
    type Result = PoolBuffer;

    fn set_value(&mut self, _engine: &mut IoEngine, result: Result<PoolBuffer, IoError>) {
        *self.0.borrow_mut() = Some(result);
    }
}

struct WriteErrorReceiver(Rc<RefCell<Vec<IoError>>>);

impl Receiver for WriteErrorReceiver {
    type Result = usize;

    fn set_value(&mut self, _engine: &mut IoEngine, result: Result<usize, IoError>) {
        if let Err(err) = result {
            tracing::error!(%err, "background node write failed");
            self.0.borrow_mut().push(err);
        }
    }
}

struct DiskBackend {
    pool: StoragePool,
    io: IoEngine,
    metadata: DbMetadata,
    wfast: Writer,
    wslow: Writer,
    write_errors: Rc<RefCell<Vec<IoError>>>,
    dirty_chunks: HashSet<u32>,
    read_only: bool,
}

/// The context threaded through upsert, find, traverse and compaction.
pub struct UpdateAux {
    backend: Option<DiskBackend>,
}

impl UpdateAux {
    /// A purely in-memory context: every node stays cached, nothing is
    /// written, offsets are invalid.
    #[must_use]
    pub fn in_memory() -> Self {
        Self { backend: None }
    }

    /// Open (or truncate) an on-disk pool for writing and recover from an
    /// unclean death if the dirty byte says so.
    ///
    /// # Errors
    /// Propagates pool, mapping and metadata failures; a magic mismatch is
    /// fatal [`DbError::MetadataCorrupt`].
    pub fn open(config: &OnDiskDbConfig) -> Result<Self, DbError> {
        let flags = CreationFlags {
            interleave_chunks_evenly: config.interleave_chunks_evenly,
            chunk_capacity: config.chunk_capacity,
            chunk_count: config.chunk_count,
            read_only: false,
        };
        let mode = if config.truncate {
            OpenMode::Truncate
        } else {
            OpenMode::OpenExisting
        };
        let fresh = config.truncate;
        let pool = StoragePool::open(&config.dbname_paths, mode, &flags)?;
        let io = IoEngine::new(&pool, Buffers::new(config.rd_buf_count, config.wr_buf_count));
        let cnv_fd = pool.chunk(ChunkType::Cnv, 0).read_fd().0;
        let metadata = if fresh {
            DbMetadata::create(
                cnv_fd,
                config.chunk_count,
                config.chunk_capacity,
                config.slow_fast_ratio,
            )?
        } else {
            DbMetadata::open(cnv_fd, config.chunk_count, false)?
        };
        let mut backend = DiskBackend {
            pool,
            io,
            metadata,
            wfast: Writer::new(),
            wslow: Writer::new(),
            write_errors: Rc::new(RefCell::new(Vec::new())),
            dirty_chunks: HashSet::new(),
            read_only: false,
        };
        backend.recover()?;
        Ok(Self {
            backend: Some(backend),
        })
    }

    /// Open an existing pool read-only. Any number of read-only openers may
    /// share a pool with one writer.
    ///
    /// # Errors
    /// Propagates pool and metadata failures.
    pub fn open_read_only(config: &ReadOnlyOnDiskDbConfig) -> Result<Self, DbError> {
        let flags = CreationFlags {
            interleave_chunks_evenly: false,
            chunk_capacity: config.chunk_capacity,
            chunk_count: config.chunk_count,
            read_only: true,
        };
        let pool = StoragePool::open(&config.dbname_paths, OpenMode::OpenExisting, &flags)?;
        let io = IoEngine::new(&pool, Buffers::new(config.rd_buf_count, 1));
        let cnv_fd = pool.chunk(ChunkType::Cnv, 0).read_fd().0;
        let metadata = DbMetadata::open(cnv_fd, config.chunk_count, true)?;
        Ok(Self {
            backend: Some(DiskBackend {
                pool,
                io,
                metadata,
                wfast: Writer::new(),
                wslow: Writer::new(),
                write_errors: Rc::new(RefCell::new(Vec::new())),
                dirty_chunks: HashSet::new(),
                read_only: true,
            }),
        })
    }

    /// Whether the context is backed by a pool.
    #[must_use]
    pub fn is_on_disk(&self) -> bool {
        self.backend.is_some()
    }

    /// Whether the context may write.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.backend.as_ref().is_some_and(|b| b.read_only)
    }

    /// The metadata block, when on disk.
    #[must_use]
    pub fn metadata(&self) -> Option<&DbMetadata> {
        self.backend.as_ref().map(|b| &b.metadata)
    }

    /// Drain the reactor; see the engine's `poll`.
    pub fn poll(&mut self, blocking: bool, max_completions: usize) -> usize {
        self.backend
            .as_mut()
            .map_or(0, |b| b.io.poll(blocking, max_completions))
    }

    /// Serialize and append `node` to the fast or slow ring. The assigned
    /// offset returns immediately; the write completes in the background.
    /// In-memory contexts return invalid offsets.
    ///
    /// # Errors
    /// [`DbError::StorageExhausted`] when no free chunk remains.
    pub fn write_node(
        &mut self,
        node: &Node,
        to_fast: bool,
    ) -> Result<(ChunkOffset, CompactVirtualChunkOffset), DbError> {
        let Some(backend) = self.backend.as_mut() else {
            return Ok((INVALID_OFFSET, INVALID_COMPACT_VIRTUAL_OFFSET));
        };
        let mut record = Vec::with_capacity(node.get_disk_size());
        node.serialize_into(&mut record);
        let list = if to_fast {
            ChunkList::Fast
        } else {
            ChunkList::Slow
        };
        backend.append_record(list, &record)
    }

    /// Read and parse the node at `offset`, driving the reactor until the
    /// read completes.
    ///
    /// # Errors
    /// Propagates read failures and corrupt records.
    pub fn read_node_blocking(&mut self, offset: ChunkOffset) -> Result<Box<Node>, DbError> {
        let backend = self
            .backend
            .as_mut()
            .expect("disk reads require an on-disk context");
        backend.read_node_blocking(offset)
    }

    /// The engine, for callers that drive their own receivers.
    ///
    /// # Panics
    /// Panics on an in-memory context.
    pub fn io_mut(&mut self) -> &mut IoEngine {
        &mut self
            .backend
            .as_mut()
            .expect("the reactor requires an on-disk context")
            .io
    }

    /// Current append position of a ring, as a chunk offset.
    #[must_use]
    pub fn append_position(&self, list: ChunkList) -> ChunkOffset {
        let Some(backend) = self.backend.as_ref() else {
            return INVALID_OFFSET;
        };
        backend.append_position(list)
    }

    /// The virtual offset the next append to `list` would receive.
    #[must_use]
    pub fn next_virtual_offset(&self, list: ChunkList) -> CompactVirtualChunkOffset {
        let Some(backend) = self.backend.as_ref() else {
            return INVALID_COMPACT_VIRTUAL_OFFSET;
        };
        let Some(chunk_id) = backend.current_chunk(list) else {
            return INVALID_COMPACT_VIRTUAL_OFFSET;
        };
        let count = backend.metadata.chunk_info(chunk_id).insertion_count();
        CompactVirtualChunkOffset::new(count as u16, backend.append_position(list).offset())
    }

    /// Make every buffered node write durable, then publish `root_offset`
    /// for `version` and stamp the metadata clean.
    ///
    /// # Errors
    /// Surfaces any background write failure before the root is published;
    /// the version is then not visible.
    pub fn commit(&mut self, version: i64, root_offset: ChunkOffset) -> Result<(), DbError> {
        let Some(backend) = self.backend.as_mut() else {
            return Ok(());
        };
        backend.commit(version, root_offset)
    }

    /// The compaction target for the next upsert: the virtual end of the
    /// oldest fast chunk, once the fast ring has outgrown the configured
    /// slow-to-fast ratio. `None` means nothing needs migrating.
    #[must_use]
    pub fn compaction_target(&self) -> Option<CompactVirtualChunkOffset> {
        let backend = self.backend.as_ref()?;
        let meta = &backend.metadata;
        let total = backend.pool.chunks(triedb_async::ChunkType::Seq) as f32;
        let ratio = meta.slow_fast_ratio().max(0.0);
        let max_fast = ((total / (1.0 + ratio)).ceil() as usize).max(1);
        if meta.list_len(ChunkList::Fast) <= max_fast {
            return None;
        }
        let oldest = meta.list_begin(ChunkList::Fast)?;
        if Some(oldest) == backend.current_chunk(ChunkList::Fast) {
            return None;
        }
        let count = meta.chunk_info(oldest).insertion_count();
        Some(CompactVirtualChunkOffset::new(
            count as u16,
            ChunkOffset::MAX_OFFSET,
        ))
    }

    /// After a commit, recycle fast chunks wholly below the compaction
    /// `threshold`: every live node in them has been forwarded, so their
    /// capacity returns to the free list. Versions that still referenced
    /// them fall out of the readable window.
    ///
    /// # Errors
    /// Propagates truncate failures.
    pub fn release_compacted(
        &mut self,
        threshold: CompactVirtualChunkOffset,
    ) -> Result<(), DbError> {
        let Some(backend) = self.backend.as_mut() else {
            return Ok(());
        };
        let previous = backend.metadata.last_compact_offset(ChunkList::Fast);
        while let Some(head) = backend.metadata.list_begin(ChunkList::Fast) {
            if Some(head) == backend.current_chunk(ChunkList::Fast) {
                break;
            }
            let count = backend.metadata.chunk_info(head).insertion_count();
            let end = CompactVirtualChunkOffset::new(count as u16, ChunkOffset::MAX_OFFSET);
            if end > threshold {
                break;
            }
            backend.release_chunk(head)?;
            tracing::info!(chunk = head, "compacted chunk recycled");
        }
        backend
            .metadata
            .set_last_compact_offset(ChunkList::Fast, threshold);
        backend.metadata.set_last_compact_offset_range(
            ChunkList::Fast,
            threshold.to_bits().wrapping_sub(previous.to_bits()),
        );
        Ok(())
    }

    /// Block until all background writes have completed.
    pub fn flush(&mut self) -> Result<(), DbError> {
        if let Some(backend) = self.backend.as_mut() {
            backend.flush_writers()?;
            backend.io.wait_until_done();
            backend.take_write_errors()?;
        }
        Ok(())
    }
}

impl DiskBackend {
    fn writer(&mut self, list: ChunkList) -> &mut Writer {
        match list {
            ChunkList::Fast => &mut self.wfast,
            ChunkList::Slow => &mut self.wslow,
            ChunkList::Free => unreachable!("the free list takes no appends"),
        }
    }

    fn take_writer(&mut self, list: ChunkList) -> Writer {
        std::mem::replace(self.writer(list), Writer::new())
    }

    fn put_writer(&mut self, list: ChunkList, w: Writer) {
        *self.writer(list) = w;
    }

    fn current_chunk(&self, list: ChunkList) -> Option<u32> {
        let w = match list {
            ChunkList::Fast => &self.wfast,
            ChunkList::Slow => &self.wslow,
            ChunkList::Free => return None,
        };
        w.chunk_id.or_else(|| self.metadata.list_end(list))
    }

    fn append_position(&self, list: ChunkList) -> ChunkOffset {
        let (w, id) = match list {
            ChunkList::Fast => (&self.wfast, self.wfast.chunk_id),
            ChunkList::Slow => (&self.wslow, self.wslow.chunk_id),
            ChunkList::Free => return INVALID_OFFSET,
        };
        match id.or_else(|| self.metadata.list_end(list)) {
            Some(chunk_id) => {
                let at = if w.chunk_id.is_some() {
                    w.base + w.used as u64
                } else {
                    self.pool.chunk(ChunkType::Seq, chunk_id).size()
                };
                ChunkOffset::new(chunk_id, at).with_spare(0)
            }
            None => INVALID_OFFSET,
        }
    }

    fn append_record(
        &mut self,
        list: ChunkList,
        record: &[u8],
    ) -> Result<(ChunkOffset, CompactVirtualChunkOffset), DbError> {
        assert!(!self.read_only, "append on a read-only instance");
        let mut w = self.take_writer(list);
        let result = self.append_record_inner(&mut w, list, record);
        self.put_writer(list, w);
        result
    }

    fn append_record_inner(
        &mut self,
        w: &mut Writer,
        list: ChunkList,
        record: &[u8],
    ) -> Result<(ChunkOffset, CompactVirtualChunkOffset), DbError> {
        let len = record.len();
        // Bind a chunk on first use, picking up the tail of the list where
        // the previous session stopped.
        if w.chunk_id.is_none() {
            match self.metadata.list_end(list) {
                Some(id) => {
                    w.chunk_id = Some(id);
                    w.base = self.pool.chunk(ChunkType::Seq, id).size();
                }
                None => self.rotate(w, list)?,
            }
        }
        let chunk_id = w.chunk_id.expect("bound above");
        let chunk = self.pool.chunk(ChunkType::Seq, chunk_id);
        if w.base + (w.used + len) as u64 > chunk.capacity() {
            self.flush_writer(w)?;
            self.rotate(w, list)?;
        }
        if w.buffer.is_none() {
            w.buffer = Some(self.io.acquire_write_buffer());
            w.used = 0;
        }
        let buffer_capacity = w.buffer.as_ref().expect("just filled").capacity();
        if w.used + len > buffer_capacity {
            self.flush_writer(w)?;
            w.buffer = Some(self.io.acquire_write_buffer());
            w.used = 0;
        }
        assert!(len <= buffer_capacity, "node record exceeds a write buffer");

        let chunk_id = w.chunk_id.expect("writer is bound");
        let at = w.base + w.used as u64;
        let pages = read_span_pages(at, len);
        let mut offset = ChunkOffset::new(chunk_id, at);
        offset.set_spare(pages);
        let count = self.metadata.chunk_info(chunk_id).insertion_count();
        let virtual_offset = CompactVirtualChunkOffset::new(count as u16, at);

        let buffer = w.buffer.as_mut().expect("buffer is present");
        buffer[w.used..w.used + len].copy_from_slice(record);
        w.used += len;
        self.dirty_chunks.insert(chunk_id);
        Ok((offset, virtual_offset))
    }

    fn flush_writer(&mut self, w: &mut Writer) -> Result<(), DbError> {
        let Some(mut buffer) = w.buffer.take() else {
            return Ok(());
        };
        if w.used == 0 {
            return Ok(());
        }
        let chunk_id = w.chunk_id.expect("flushing a bound writer");
        let chunk = self.pool.chunk(ChunkType::Seq, chunk_id);
        let padded = w.used.div_ceil(DISK_PAGE_SIZE as usize) * DISK_PAGE_SIZE as usize;
        // Reused buffers carry stale bytes past the payload.
        buffer[w.used..padded].fill(0);
        buffer.set_len(padded);
        let (_, at) = chunk.write_fd(padded as u64);
        assert_eq!(at, w.base, "append window raced the writer");
        self.io.initiate(Box::new(connect(
            WriteBufferSender::new(chunk_id, at, padded, buffer),
            WriteErrorReceiver(Rc::clone(&self.write_errors)),
        )));
        w.base += padded as u64;
        w.used = 0;
        Ok(())
    }

    fn flush_writers(&mut self) -> Result<(), DbError> {
        for list in [ChunkList::Fast, ChunkList::Slow] {
            let mut w = self.take_writer(list);
            let result = self.flush_writer(&mut w);
            self.put_writer(list, w);
            result?;
        }
        Ok(())
    }

    fn rotate(&mut self, w: &mut Writer, list: ChunkList) -> Result<(), DbError> {
        let id = self.metadata.pop_free().ok_or(DbError::StorageExhausted)?;
        let chunk = self.pool.chunk(ChunkType::Seq, id);
        chunk.truncate(0)?;
        self.metadata.append(list, id);
        self.metadata.free_capacity_sub(chunk.capacity());
        tracing::debug!(chunk = id, ?list, "rotated to a fresh chunk");
        w.chunk_id = Some(id);
        w.base = 0;
        w.used = 0;
        w.buffer = None;
        Ok(())
    }

    fn take_write_errors(&mut self) -> Result<(), DbError> {
        let mut errors = self.write_errors.borrow_mut();
        if let Some(err) = errors.pop() {
            errors.clear();
            return Err(DbError::Io(err));
        }
        Ok(())
    }

    fn read_node_blocking(&mut self, offset: ChunkOffset) -> Result<Box<Node>, DbError> {
        let (aligned, bytes) = node_read_span(offset);
        let slot = Rc::new(RefCell::new(None));
        self.io
            .read(aligned, bytes, SlotReceiver(Rc::clone(&slot)));
        let buffer = loop {
            if let Some(result) = slot.borrow_mut().take() {
                break result.map_err(DbError::Io)?;
            }
            self.io.poll(true, 1);
        };
        parse_node_page(&buffer, offset)
    }

    fn commit(&mut self, version: i64, root_offset: ChunkOffset) -> Result<(), DbError> {
        assert!(!self.read_only, "commit on a read-only instance");
        assert!(version >= 0, "negative versions are reserved");
        self.flush_writers()?;
        self.io.wait_until_done();
        self.take_write_errors()?;
        // Node bytes must be durable before the root offset is visible.
        for chunk_id in self.dirty_chunks.drain() {
            self.pool.chunk(ChunkType::Seq, chunk_id).sync()?;
        }
        let wip_fast = self.append_position(ChunkList::Fast);
        let wip_slow = self.append_position(ChunkList::Slow);

        {
            let _guard = self.metadata.hold_dirty();
            let version = version as u64;
            let next = self.metadata.max_version().map_or(0, |max| max + 1);
            if version != next {
                self.metadata.fast_forward_next_version(version);
            }
            self.metadata.append_root_offset(root_offset);
            self.metadata.set_start_of_wip_offset_fast(wip_fast);
            self.metadata.set_start_of_wip_offset_slow(wip_slow);
        }
        self.metadata.flush();
        tracing::debug!(version, root = %root_offset, "version committed");
        Ok(())
    }

    fn recover(&mut self) -> Result<(), DbError> {
        if !self.metadata.is_dirty() {
            // Metadata is clean, but a crash mid-upsert (before the commit
            // ever took the dirty guard) can still leave buffered node
            // bytes past the last clean point. Rewind them.
            self.rewind_list(ChunkList::Fast, self.metadata.start_of_wip_offset_fast())?;
            self.rewind_list(ChunkList::Slow, self.metadata.start_of_wip_offset_slow())?;
            return Ok(());
        }
        let committed = self.metadata.max_version().is_some_and(|max| {
            let root = self.metadata.root_offset(max);
            !root.is_invalid()
                && (self.within_wip_region(root, self.metadata.start_of_wip_offset_fast())
                    || self.within_wip_region(root, self.metadata.start_of_wip_offset_slow()))
        });
        if committed {
            // The ring advanced before the dirty byte could clear: the
            // commit happened. Adopt the current append positions.
            let wip_fast = self.append_position(ChunkList::Fast);
            let wip_slow = self.append_position(ChunkList::Slow);
            self.metadata.set_start_of_wip_offset_fast(wip_fast);
            self.metadata.set_start_of_wip_offset_slow(wip_slow);
            self.metadata.clear_dirty();
            tracing::info!("recovery: ring already advanced, commit adopted");
            return Ok(());
        }
        self.rewind_list(ChunkList::Fast, self.metadata.start_of_wip_offset_fast())?;
        self.rewind_list(ChunkList::Slow, self.metadata.start_of_wip_offset_slow())?;
        self.metadata.clear_dirty();
        self.metadata.flush();
        tracing::info!("recovery: uncommitted version discarded");
        Ok(())
    }

    /// Whether `offset` falls inside the work-in-progress region that
    /// starts at `wip` (the wip chunk past the wip offset, or any chunk
    /// appended to the fast list after it).
    fn within_wip_region(&self, offset: ChunkOffset, wip: ChunkOffset) -> bool {
        if wip.is_invalid() {
            return false;
        }
        if offset.id() == wip.id() {
            return offset.offset() >= wip.offset();
        }
        let mut cursor = self.metadata.chunk_info(wip.id()).next_chunk_id();
        while let Some(id) = cursor {
            if id == offset.id() {
                return true;
            }
            cursor = self.metadata.chunk_info(id).next_chunk_id();
        }
        false
    }

    fn rewind_list(&mut self, list: ChunkList, wip: ChunkOffset) -> Result<(), DbError> {
        if wip.is_invalid() {
            // Nothing was ever committed to this ring; every chunk on it is
            // work in progress.
            while let Some(id) = self.metadata.list_end(list) {
                self.release_chunk(id)?;
            }
            return Ok(());
        }
        // Chunks appended after the wip chunk carry only uncommitted bytes.
        while let Some(id) = self.metadata.list_end(list) {
            if id == wip.id() {
                break;
            }
            self.release_chunk(id)?;
        }
        let chunk = self.pool.chunk(ChunkType::Seq, wip.id());
        if chunk.size() > wip.offset() {
            tracing::debug!(
                chunk = wip.id(),
                from = chunk.size(),
                to = wip.offset(),
                "rewinding work in progress"
            );
            chunk.truncate(wip.offset())?;
        }
        Ok(())
    }

    fn release_chunk(&mut self, id: u32) -> Result<(), DbError> {
        let chunk = self.pool.chunk(ChunkType::Seq, id);
        chunk.truncate(0)?;
        self.metadata.remove(id);
        self.metadata.append(ChunkList::Free, id);
        self.metadata.free_capacity_add(chunk.capacity());
        Ok(())
    }
}

/// Number of 512 byte pages a read starting at the page containing `at`
/// must cover to span `len` bytes of record.
fn read_span_pages(at: u64, len: usize) -> u16 {
    let within = (at % DISK_PAGE_SIZE) as usize;
    ((within + len) as u64).div_ceil(DISK_PAGE_SIZE) as u16
}

/// The page-aligned start and byte count to read so the record at `offset`
/// (page count carried in its spare bits) is fully covered.
pub(crate) fn node_read_span(offset: ChunkOffset) -> (ChunkOffset, usize) {
    assert!(!offset.is_invalid(), "read at the invalid offset");
    let aligned = offset.offset() & !(DISK_PAGE_SIZE - 1);
    let pages = usize::from(offset.spare()).max(1);
    let bytes = (pages * DISK_PAGE_SIZE as usize).min(triedb_async::READ_BUFFER_SIZE);
    (ChunkOffset::new(offset.id(), aligned), bytes)
}

/// Parse the record at `offset` out of a page-aligned read that covered it.
pub(crate) fn parse_node_page(buffer: &[u8], offset: ChunkOffset) -> Result<Box<Node>, DbError> {
    let delta = (offset.offset() % DISK_PAGE_SIZE) as usize;
    if buffer.len() < delta + DISK_SIZE_BYTES {
        return Err(DbError::Io(IoError::ShortRead {
            wanted: delta + DISK_SIZE_BYTES,
            got: buffer.len(),
        }));
    }
    let len = u32::from_le_bytes(
        buffer[delta..delta + DISK_SIZE_BYTES]
            .try_into()
            .expect("4 byte window"),
    ) as usize;
    let start = delta + DISK_SIZE_BYTES;
    if buffer.len() < start + len {
        return Err(DbError::Io(IoError::ShortRead {
            wanted: start + len,
            got: buffer.len(),
        }));
    }
    Ok(Node::deserialize(&buffer[start..start + len])?)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::node::make_node;
    use crate::nibbles::NibblesView;
    use std::path::PathBuf;

    fn small_config(dir: &std::path::Path, truncate: bool) -> OnDiskDbConfig {
        OnDiskDbConfig {
            truncate,
            chunk_capacity: 1 << 20,
            chunk_count: 4,
            compaction: false,
            ..OnDiskDbConfig::new(vec![PathBuf::from(dir)])
        }
    }

    fn sample_node(value: &[u8]) -> Box<Node> {
        make_node(
            0,
            &mut [],
            NibblesView::from_bytes(&[0x12]),
            Some(value),
            0,
            0,
        )
    }

    #[test]
    fn write_then_read_node_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut aux = UpdateAux::open(&small_config(dir.path(), true)).unwrap();
        let node = sample_node(b"payload");
        let (offset, _) = aux.write_node(&node, true).unwrap();
        assert!(!offset.is_invalid());
        aux.flush().unwrap();

        let restored = aux.read_node_blocking(offset).unwrap();
        assert_eq!(restored.value(), b"payload");
    }

    #[test]
    fn offsets_pack_tightly_within_a_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let mut aux = UpdateAux::open(&small_config(dir.path(), true)).unwrap();
        let node = sample_node(b"x");
        let (a, _) = aux.write_node(&node, true).unwrap();
        let (b, _) = aux.write_node(&node, true).unwrap();
        assert_eq!(a.id(), b.id());
        assert_eq!(
            b.offset() - a.offset(),
            node.get_disk_size() as u64,
            "records are packed back to back"
        );
    }

    #[test]
    fn commit_publishes_and_reopen_sees_it() {
        let dir = tempfile::tempdir().unwrap();
        let offset;
        {
            let mut aux = UpdateAux::open(&small_config(dir.path(), true)).unwrap();
            let node = sample_node(b"v0");
            offset = aux.write_node(&node, true).unwrap().0;
            aux.commit(0, offset).unwrap();
        }
        let mut aux = UpdateAux::open(&small_config(dir.path(), false)).unwrap();
        let meta = aux.metadata().unwrap();
        assert_eq!(meta.max_version(), Some(0));
        assert_eq!(meta.root_offset(0), offset);
        let node = aux.read_node_blocking(offset).unwrap();
        assert_eq!(node.value(), b"v0");
    }

    #[test]
    fn uncommitted_writes_rewind_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let committed;
        {
            let mut aux = UpdateAux::open(&small_config(dir.path(), true)).unwrap();
            let node = sample_node(b"committed");
            committed = aux.write_node(&node, true).unwrap().0;
            aux.commit(0, committed).unwrap();

            // A second version is buffered and flushed but never
            // committed; the dirty byte stays set.
            let meta_dirty = {
                let node = sample_node(b"lost");
                let _ = aux.write_node(&node, true).unwrap();
                aux.flush().unwrap();
                aux.metadata().unwrap().hold_dirty()
            };
            std::mem::forget(meta_dirty);
        }
        let mut aux = UpdateAux::open(&small_config(dir.path(), false)).unwrap();
        assert!(!aux.metadata().unwrap().is_dirty());
        assert_eq!(aux.metadata().unwrap().max_version(), Some(0));
        let node = aux.read_node_blocking(committed).unwrap();
        assert_eq!(node.value(), b"committed");
        // The wip region was truncated back to the committed end.
        let wip = aux.metadata().unwrap().start_of_wip_offset_fast();
        assert_eq!(aux.append_position(ChunkList::Fast), wip);
    }

    #[test]
    fn in_memory_writes_are_invalid_offsets() {
        let mut aux = UpdateAux::in_memory();
        let node = sample_node(b"ram");
        let (offset, voff) = aux.write_node(&node, true).unwrap();
        assert!(offset.is_invalid());
        assert!(voff.is_invalid());
    }
}
