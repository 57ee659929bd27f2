//! The crash-consistent metadata block.
//!
//! The head of the conventional chunk is memory-mapped and accessed in
//! place: a magic, the chunk-info count, a dirty byte, the free capacity
//! counter, the 1024-entry root-offset ring, the work-in-progress append
//! offsets, compaction bookkeeping, three chunk list heads and one packed
//! 8 byte record per pool chunk.
//!
//! The dirty byte is the sole cross-restart signal: every mutation runs
//! under a scoped [`DirtyGuard`] that stores 1 on entry and 0 on exit, so a
//! process that died mid-mutation is detected on reopen and its
//! work-in-progress is rewound.

use std::cell::Cell;
use std::os::fd::RawFd;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

use triedb_async::{ChunkOffset, CompactVirtualChunkOffset, DISK_PAGE_SIZE, INVALID_OFFSET};
use triedb_utils::ensure::ensure;
use triedb_utils::hex::to_hex;

use crate::error::DbError;

/// Magic bytes at offset zero of the conventional chunk.
pub const MAGIC: &[u8; 4] = b"MND5";

/// Entries in the root-offset ring; also the history window length.
pub const ROOT_OFFSETS_SIZE: u64 = 1024;

/// Chunk id sentinel terminating the metadata linked lists.
pub const INVALID_CHUNK_ID: u32 = 0xf_ffff;

const OFF_MAGIC: usize = 0;
const OFF_COUNTS: usize = 4;
const OFF_DIRTY: usize = 7;
const OFF_CAPACITY_FREE: usize = 8;
const OFF_NEXT_VERSION: usize = 16;
const OFF_RING: usize = 24;
const OFF_WIP_FAST: usize = OFF_RING + 8 * ROOT_OFFSETS_SIZE as usize;
const OFF_WIP_SLOW: usize = OFF_WIP_FAST + 8;
const OFF_LAST_COMPACT_FAST: usize = OFF_WIP_SLOW + 8;
const OFF_LAST_COMPACT_SLOW: usize = OFF_LAST_COMPACT_FAST + 4;
const OFF_COMPACT_RANGE_FAST: usize = OFF_LAST_COMPACT_SLOW + 4;
const OFF_COMPACT_RANGE_SLOW: usize = OFF_COMPACT_RANGE_FAST + 4;
const OFF_SLOW_FAST_RATIO: usize = OFF_COMPACT_RANGE_SLOW + 4;
const OFF_FINALIZED: usize = OFF_SLOW_FAST_RATIO + 4 + 4;
const OFF_FREE_LIST: usize = OFF_FINALIZED + 8;
const OFF_FAST_LIST: usize = OFF_FREE_LIST + 8;
const OFF_SLOW_LIST: usize = OFF_FAST_LIST + 8;
const OFF_CHUNK_INFO: usize = OFF_SLOW_LIST + 8;

const NO_FINALIZED: u64 = u64::MAX;
const LIST_END: u32 = u32::MAX;

/// Which metadata list a chunk belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkList {
    /// Recyclable chunks with no live references.
    Free,
    /// Hot chunks taking recent writes.
    Fast,
    /// Chunks holding compacted older writes.
    Slow,
}

/// One packed chunk-info record: prev/next ids, list membership bits and an
/// insertion counter split across two 10 bit fields used to detect ABA on
/// lock-free traversal.
#[derive(Debug, Clone, Copy)]
pub struct ChunkInfo(u64);

impl ChunkInfo {
    const PREV_SHIFT: u32 = 0;
    const IN_FAST_BIT: u64 = 1 << 20;
    const IN_SLOW_BIT: u64 = 1 << 21;
    const COUNT0_SHIFT: u32 = 22;
    const NEXT_SHIFT: u32 = 32;
    const COUNT1_SHIFT: u32 = 54;
    const ID_MASK: u64 = 0xf_ffff;
    const COUNT_MASK: u64 = 0x3ff;

    /// Previous chunk in this record's list, if any.
    #[must_use]
    pub fn prev_chunk_id(self) -> Option<u32> {
        let id = ((self.0 >> Self::PREV_SHIFT) & Self::ID_MASK) as u32;
        (id != INVALID_CHUNK_ID).then_some(id)
    }

    /// Next chunk in this record's list, if any.
    #[must_use]
    pub fn next_chunk_id(self) -> Option<u32> {
        let id = ((self.0 >> Self::NEXT_SHIFT) & Self::ID_MASK) as u32;
        (id != INVALID_CHUNK_ID).then_some(id)
    }

    /// Which list the record is on.
    #[must_use]
    pub fn list(self) -> ChunkList {
        if self.0 & Self::IN_FAST_BIT != 0 {
            ChunkList::Fast
        } else if self.0 & Self::IN_SLOW_BIT != 0 {
            ChunkList::Slow
        } else {
            ChunkList::Free
        }
    }

    /// The 20 bit insertion counter, reassembled from its split fields.
    #[must_use]
    pub fn insertion_count(self) -> u32 {
        let lo = ((self.0 >> Self::COUNT0_SHIFT) & Self::COUNT_MASK) as u32;
        let hi = ((self.0 >> Self::COUNT1_SHIFT) & Self::COUNT_MASK) as u32;
        (hi << 10) | lo
    }

    fn compose(prev: u32, next: u32, list: ChunkList, insertion_count: u32) -> Self {
        let mut bits = (u64::from(prev) & Self::ID_MASK) << Self::PREV_SHIFT;
        bits |= (u64::from(next) & Self::ID_MASK) << Self::NEXT_SHIFT;
        match list {
            ChunkList::Fast => bits |= Self::IN_FAST_BIT,
            ChunkList::Slow => bits |= Self::IN_SLOW_BIT,
            ChunkList::Free => {}
        }
        bits |= (u64::from(insertion_count) & Self::COUNT_MASK) << Self::COUNT0_SHIFT;
        bits |= ((u64::from(insertion_count) >> 10) & Self::COUNT_MASK) << Self::COUNT1_SHIFT;
        Self(bits)
    }

    fn with_prev(self, prev: u32) -> Self {
        Self(
            (self.0 & !(Self::ID_MASK << Self::PREV_SHIFT))
                | ((u64::from(prev) & Self::ID_MASK) << Self::PREV_SHIFT),
        )
    }

    fn with_next(self, next: u32) -> Self {
        Self(
            (self.0 & !(Self::ID_MASK << Self::NEXT_SHIFT))
                | ((u64::from(next) & Self::ID_MASK) << Self::NEXT_SHIFT),
        )
    }
}

/// Byte length of the metadata block for a pool of `chunk_count` chunks,
/// rounded up to a disk page.
#[must_use]
pub fn metadata_len(chunk_count: u32) -> usize {
    let raw = OFF_CHUNK_INFO + 8 * chunk_count as usize;
    let page = DISK_PAGE_SIZE as usize;
    raw.div_ceil(page) * page
}

/// The memory-mapped metadata block.
#[derive(Debug)]
pub struct DbMetadata {
    map: NonNull<u8>,
    len: usize,
    read_only: bool,
    dirty_depth: Cell<u32>,
}

/// Scoped dirty marker; see the module docs.
pub struct DirtyGuard<'a> {
    parent: &'a DbMetadata,
}

impl Drop for DirtyGuard<'_> {
    fn drop(&mut self) {
        let depth = self.parent.dirty_depth.get() - 1;
        self.parent.dirty_depth.set(depth);
        if depth == 0 {
            self.parent
                .atomic_u8(OFF_DIRTY)
                .store(0, Ordering::Release);
        }
    }
}

impl DbMetadata {
    /// Map and initialize a fresh metadata block over the conventional
    /// chunk: ring reset, every chunk on the free list.
    ///
    /// # Errors
    /// Fails when the mapping cannot be established.
    pub fn create(
        cnv_fd: RawFd,
        chunk_count: u32,
        chunk_capacity: u64,
        slow_fast_ratio: f32,
    ) -> Result<Self, DbError> {
        let this = Self::map(cnv_fd, chunk_count, false)?;
        this.store_bytes(OFF_MAGIC, MAGIC);
        this.atomic_u32(OFF_COUNTS)
            .store(chunk_count & 0xf_ffff, Ordering::Release);
        this.atomic_u64(OFF_CAPACITY_FREE).store(0, Ordering::Release);
        this.atomic_u64(OFF_NEXT_VERSION).store(0, Ordering::Release);
        for i in 0..ROOT_OFFSETS_SIZE as usize {
            this.atomic_u64(OFF_RING + 8 * i)
                .store(INVALID_OFFSET.to_bits(), Ordering::Release);
        }
        this.set_start_of_wip_offset_fast(INVALID_OFFSET);
        this.set_start_of_wip_offset_slow(INVALID_OFFSET);
        this.set_last_compact_offset(ChunkList::Fast, CompactVirtualChunkOffset::from_bits(0));
        this.set_last_compact_offset(ChunkList::Slow, CompactVirtualChunkOffset::from_bits(0));
        this.set_slow_fast_ratio(slow_fast_ratio);
        this.atomic_u64(OFF_FINALIZED)
            .store(NO_FINALIZED, Ordering::Release);
        for off in [OFF_FREE_LIST, OFF_FAST_LIST, OFF_SLOW_LIST] {
            this.atomic_u32(off).store(LIST_END, Ordering::Release);
            this.atomic_u32(off + 4).store(LIST_END, Ordering::Release);
        }
        for id in 0..chunk_count {
            this.store_chunk_info(
                id,
                ChunkInfo::compose(INVALID_CHUNK_ID, INVALID_CHUNK_ID, ChunkList::Free, 0),
            );
            this.append(ChunkList::Free, id);
            this.free_capacity_add(chunk_capacity);
        }
        // A fresh block never starts dirty.
        this.atomic_u8(OFF_DIRTY).store(0, Ordering::Release);
        Ok(this)
    }

    /// Map an existing metadata block and run the structural checks.
    ///
    /// # Errors
    /// Returns [`DbError::MetadataCorrupt`] on a magic mismatch or a
    /// chunk-count disagreement.
    pub fn open(cnv_fd: RawFd, chunk_count: u32, read_only: bool) -> Result<Self, DbError> {
        let this = Self::map(cnv_fd, chunk_count, read_only)?;
        let mut magic = [0u8; 4];
        magic.copy_from_slice(this.bytes(OFF_MAGIC, 4));
        ensure(
            &magic == MAGIC,
            DbError::MetadataCorrupt {
                detail: format!("bad magic {}", to_hex(magic)),
            },
        )?;
        let count = this.atomic_u32(OFF_COUNTS).load(Ordering::Acquire) & 0xf_ffff;
        ensure(
            count == chunk_count,
            DbError::MetadataCorrupt {
                detail: format!("pool has {chunk_count} chunks, metadata records {count}"),
            },
        )?;
        Ok(this)
    }

    fn map(cnv_fd: RawFd, chunk_count: u32, read_only: bool) -> Result<Self, DbError> {
        let len = metadata_len(chunk_count);
        if !read_only {
            let ret = unsafe { libc::ftruncate(cnv_fd, len as libc::off_t) };
            if ret != 0 {
                return Err(DbError::Io(triedb_async::IoError::Failure(
                    std::io::Error::last_os_error(),
                )));
            }
        }
        let prot = if read_only {
            libc::PROT_READ
        } else {
            libc::PROT_READ | libc::PROT_WRITE
        };
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                prot,
                libc::MAP_SHARED,
                cnv_fd,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(DbError::Io(triedb_async::IoError::Failure(
                std::io::Error::last_os_error(),
            )));
        }
        Ok(Self {
            map: NonNull::new(ptr.cast::<u8>()).expect("mmap returned non-null"),
            len,
            read_only,
            dirty_depth: Cell::new(0),
        })
    }

    /// Whether the previous session died mid-mutation.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.atomic_u8(OFF_DIRTY).load(Ordering::Acquire) != 0
    }

    /// Clear the dirty byte; used once recovery has rewound.
    pub fn clear_dirty(&self) {
        self.assert_writable();
        self.atomic_u8(OFF_DIRTY).store(0, Ordering::Release);
    }

    /// Enter a dirty scope. Mutations must happen inside one.
    #[must_use]
    pub fn hold_dirty(&self) -> DirtyGuard<'_> {
        self.assert_writable();
        self.dirty_depth.set(self.dirty_depth.get() + 1);
        self.atomic_u8(OFF_DIRTY).store(1, Ordering::Release);
        DirtyGuard { parent: self }
    }

    /// Persist the block to the device.
    pub fn flush(&self) {
        if self.read_only {
            return;
        }
        let ret = unsafe {
            libc::msync(
                self.map.as_ptr().cast::<libc::c_void>(),
                self.len,
                libc::MS_SYNC,
            )
        };
        debug_assert_eq!(ret, 0, "msync failed");
    }

    // --- root-offset ring ---

    /// Root offset recorded for `version`, which callers must have
    /// window-checked.
    #[must_use]
    pub fn root_offset(&self, version: u64) -> ChunkOffset {
        let slot = (version % ROOT_OFFSETS_SIZE) as usize;
        ChunkOffset::from_bits(self.atomic_u64(OFF_RING + 8 * slot).load(Ordering::Acquire))
    }

    /// Extend the ring with the root offset of the next version.
    pub fn append_root_offset(&self, offset: ChunkOffset) {
        let _g = self.hold_dirty();
        let wp = self.atomic_u64(OFF_NEXT_VERSION).load(Ordering::Relaxed);
        let slot = (wp % ROOT_OFFSETS_SIZE) as usize;
        self.atomic_u64(OFF_RING + 8 * slot)
            .store(offset.to_bits(), Ordering::Release);
        self.atomic_u64(OFF_NEXT_VERSION)
            .store(wp + 1, Ordering::Release);
    }

    /// Overwrite the root offset of an existing version in the window.
    pub fn update_root_offset(&self, version: u64, offset: ChunkOffset) {
        let _g = self.hold_dirty();
        let slot = (version % ROOT_OFFSETS_SIZE) as usize;
        self.atomic_u64(OFF_RING + 8 * slot)
            .store(offset.to_bits(), Ordering::Release);
    }

    /// Highest version the ring has an entry for, or `None` when nothing
    /// was ever pushed.
    #[must_use]
    pub fn max_version(&self) -> Option<u64> {
        let wp = self.atomic_u64(OFF_NEXT_VERSION).load(Ordering::Acquire);
        wp.checked_sub(1)
    }

    /// Lowest version still inside the history window.
    #[must_use]
    pub fn min_version(&self) -> Option<u64> {
        let max = self.max_version()?;
        Some(max.saturating_sub(ROOT_OFFSETS_SIZE - 1))
    }

    /// Advance the ring head to `new_version` without publishing roots:
    /// gaps fill with the invalid offset, and a gap longer than the window
    /// resets the whole ring.
    pub fn fast_forward_next_version(&self, new_version: u64) {
        let _g = self.hold_dirty();
        let current = self.atomic_u64(OFF_NEXT_VERSION).load(Ordering::Relaxed);
        if new_version >= current && new_version - current >= ROOT_OFFSETS_SIZE {
            for i in 0..ROOT_OFFSETS_SIZE as usize {
                self.atomic_u64(OFF_RING + 8 * i)
                    .store(INVALID_OFFSET.to_bits(), Ordering::Release);
            }
            self.atomic_u64(OFF_NEXT_VERSION)
                .store(new_version, Ordering::Release);
            return;
        }
        let mut wp = current;
        while wp < new_version {
            let slot = (wp % ROOT_OFFSETS_SIZE) as usize;
            self.atomic_u64(OFF_RING + 8 * slot)
                .store(INVALID_OFFSET.to_bits(), Ordering::Release);
            wp += 1;
        }
        self.atomic_u64(OFF_NEXT_VERSION)
            .store(new_version, Ordering::Release);
    }

    // --- db offsets ---

    /// Fast-ring append position at the last clean point.
    #[must_use]
    pub fn start_of_wip_offset_fast(&self) -> ChunkOffset {
        ChunkOffset::from_bits(self.atomic_u64(OFF_WIP_FAST).load(Ordering::Acquire))
    }

    /// Slow-ring append position at the last clean point.
    #[must_use]
    pub fn start_of_wip_offset_slow(&self) -> ChunkOffset {
        ChunkOffset::from_bits(self.atomic_u64(OFF_WIP_SLOW).load(Ordering::Acquire))
    }

    /// Record the fast-ring append position.
    pub fn set_start_of_wip_offset_fast(&self, offset: ChunkOffset) {
        self.assert_writable();
        self.atomic_u64(OFF_WIP_FAST)
            .store(offset.to_bits(), Ordering::Release);
    }

    /// Record the slow-ring append position.
    pub fn set_start_of_wip_offset_slow(&self, offset: ChunkOffset) {
        self.assert_writable();
        self.atomic_u64(OFF_WIP_SLOW)
            .store(offset.to_bits(), Ordering::Release);
    }

    /// Highest virtual offset compaction has consumed in a ring.
    #[must_use]
    pub fn last_compact_offset(&self, list: ChunkList) -> CompactVirtualChunkOffset {
        let off = match list {
            ChunkList::Fast => OFF_LAST_COMPACT_FAST,
            ChunkList::Slow => OFF_LAST_COMPACT_SLOW,
            ChunkList::Free => unreachable!("free list has no compaction offset"),
        };
        CompactVirtualChunkOffset::from_bits(self.atomic_u32(off).load(Ordering::Acquire))
    }

    /// Record the virtual offset compaction has consumed in a ring.
    pub fn set_last_compact_offset(&self, list: ChunkList, v: CompactVirtualChunkOffset) {
        self.assert_writable();
        let off = match list {
            ChunkList::Fast => OFF_LAST_COMPACT_FAST,
            ChunkList::Slow => OFF_LAST_COMPACT_SLOW,
            ChunkList::Free => unreachable!("free list has no compaction offset"),
        };
        self.atomic_u32(off).store(v.to_bits(), Ordering::Release);
    }

    /// Width of the last compaction range in a ring.
    #[must_use]
    pub fn last_compact_offset_range(&self, list: ChunkList) -> u32 {
        let off = match list {
            ChunkList::Fast => OFF_COMPACT_RANGE_FAST,
            ChunkList::Slow => OFF_COMPACT_RANGE_SLOW,
            ChunkList::Free => unreachable!("free list has no compaction range"),
        };
        self.atomic_u32(off).load(Ordering::Acquire)
    }

    /// Record the width of the last compaction range in a ring.
    pub fn set_last_compact_offset_range(&self, list: ChunkList, range: u32) {
        self.assert_writable();
        let off = match list {
            ChunkList::Fast => OFF_COMPACT_RANGE_FAST,
            ChunkList::Slow => OFF_COMPACT_RANGE_SLOW,
            ChunkList::Free => unreachable!("free list has no compaction range"),
        };
        self.atomic_u32(off).store(range, Ordering::Release);
    }

    /// The configured slow-to-fast size ratio.
    #[must_use]
    pub fn slow_fast_ratio(&self) -> f32 {
        f32::from_bits(self.atomic_u32(OFF_SLOW_FAST_RATIO).load(Ordering::Acquire))
    }

    /// Update the slow-to-fast size ratio.
    pub fn set_slow_fast_ratio(&self, ratio: f32) {
        self.assert_writable();
        self.atomic_u32(OFF_SLOW_FAST_RATIO)
            .store(ratio.to_bits(), Ordering::Release);
    }

    /// The finalized head, if one was published.
    #[must_use]
    pub fn finalized_version(&self) -> Option<u64> {
        let v = self.atomic_u64(OFF_FINALIZED).load(Ordering::Acquire);
        (v != NO_FINALIZED).then_some(v)
    }

    /// Publish the finalized head.
    pub fn set_finalized_version(&self, version: u64) {
        let _g = self.hold_dirty();
        self.atomic_u64(OFF_FINALIZED).store(version, Ordering::Release);
    }

    // --- free capacity ---

    /// Bytes reclaimable from the free list.
    #[must_use]
    pub fn capacity_in_free_list(&self) -> u64 {
        self.atomic_u64(OFF_CAPACITY_FREE).load(Ordering::Acquire)
    }

    /// Credit reclaimed capacity.
    pub fn free_capacity_add(&self, bytes: u64) {
        let _g = self.hold_dirty();
        let cur = self.atomic_u64(OFF_CAPACITY_FREE).load(Ordering::Relaxed);
        self.atomic_u64(OFF_CAPACITY_FREE)
            .store(cur + bytes, Ordering::Release);
    }

    /// Debit capacity taken out of the free list.
    pub fn free_capacity_sub(&self, bytes: u64) {
        let _g = self.hold_dirty();
        let cur = self.atomic_u64(OFF_CAPACITY_FREE).load(Ordering::Relaxed);
        self.atomic_u64(OFF_CAPACITY_FREE)
            .store(cur.saturating_sub(bytes), Ordering::Release);
    }

    // --- chunk lists ---

    /// The chunk-info record of `id`.
    #[must_use]
    pub fn chunk_info(&self, id: u32) -> ChunkInfo {
        ChunkInfo(self.atomic_u64(self.chunk_info_off(id)).load(Ordering::Acquire))
    }

    /// First chunk of a list.
    #[must_use]
    pub fn list_begin(&self, list: ChunkList) -> Option<u32> {
        let id = self.atomic_u32(self.list_off(list)).load(Ordering::Acquire);
        (id != LIST_END).then_some(id)
    }

    /// Last chunk of a list.
    #[must_use]
    pub fn list_end(&self, list: ChunkList) -> Option<u32> {
        let id = self
            .atomic_u32(self.list_off(list) + 4)
            .load(Ordering::Acquire);
        (id != LIST_END).then_some(id)
    }

    /// Number of chunks currently on a list.
    #[must_use]
    pub fn list_len(&self, list: ChunkList) -> usize {
        let mut len = 0;
        let mut cursor = self.list_begin(list);
        while let Some(id) = cursor {
            len += 1;
            cursor = self.chunk_info(id).next_chunk_id();
        }
        len
    }

    /// Append `id` to the tail of `list`, assigning the next insertion
    /// count after the current tail's.
    pub fn append(&self, list: ChunkList, id: u32) {
        let _g = self.hold_dirty();
        match self.list_end(list) {
            None => {
                debug_assert!(self.list_begin(list).is_none());
                self.store_chunk_info(
                    id,
                    ChunkInfo::compose(INVALID_CHUNK_ID, INVALID_CHUNK_ID, list, 0),
                );
                self.set_list_begin(list, id);
                self.set_list_end(list, id);
            }
            Some(tail) => {
                let tail_info = self.chunk_info(tail);
                let count = tail_info.insertion_count().wrapping_add(1) & 0xf_ffff;
                self.store_chunk_info(
                    id,
                    ChunkInfo::compose(tail, INVALID_CHUNK_ID, list, count),
                );
                self.store_chunk_info(tail, tail_info.with_next(id));
                self.set_list_end(list, id);
            }
        }
    }

    /// Prepend `id` to the head of `list`.
    pub fn prepend(&self, list: ChunkList, id: u32) {
        let _g = self.hold_dirty();
        match self.list_begin(list) {
            None => self.append(list, id),
            Some(head) => {
                let head_info = self.chunk_info(head);
                let count = head_info.insertion_count().wrapping_sub(1) & 0xf_ffff;
                self.store_chunk_info(
                    id,
                    ChunkInfo::compose(INVALID_CHUNK_ID, head, list, count),
                );
                self.store_chunk_info(head, head_info.with_prev(id));
                self.set_list_begin(list, id);
            }
        }
    }

    /// Remove `id` from its list. Only end removals are allowed; a mid-list
    /// removal would make insertion counts lie.
    pub fn remove(&self, id: u32) {
        let _g = self.hold_dirty();
        let info = self.chunk_info(id);
        let list = info.list();
        match (info.prev_chunk_id(), info.next_chunk_id()) {
            (None, None) => {
                debug_assert_eq!(self.list_begin(list), Some(id));
                debug_assert_eq!(self.list_end(list), Some(id));
                self.set_list_begin_raw(list, LIST_END);
                self.set_list_end_raw(list, LIST_END);
            }
            (None, Some(next)) => {
                debug_assert_eq!(self.list_begin(list), Some(id));
                let next_info = self.chunk_info(next);
                self.store_chunk_info(next, next_info.with_prev(INVALID_CHUNK_ID));
                self.set_list_begin(list, next);
            }
            (Some(prev), None) => {
                debug_assert_eq!(self.list_end(list), Some(id));
                let prev_info = self.chunk_info(prev);
                self.store_chunk_info(prev, prev_info.with_next(INVALID_CHUNK_ID));
                self.set_list_end(list, prev);
            }
            (Some(_), Some(_)) => {
                unreachable!("mid-list removals are disabled; insertion counts would drift")
            }
        }
        self.store_chunk_info(
            id,
            ChunkInfo::compose(INVALID_CHUNK_ID, INVALID_CHUNK_ID, ChunkList::Free, 0),
        );
    }

    /// Pop the head of the free list.
    #[must_use]
    pub fn pop_free(&self) -> Option<u32> {
        let head = self.list_begin(ChunkList::Free)?;
        self.remove(head);
        Some(head)
    }

    // --- raw access helpers ---

    fn chunk_info_off(&self, id: u32) -> usize {
        let count = self.atomic_u32(OFF_COUNTS).load(Ordering::Relaxed) & 0xf_ffff;
        assert!(id < count, "chunk id {id} out of metadata range");
        OFF_CHUNK_INFO + 8 * id as usize
    }

    fn store_chunk_info(&self, id: u32, info: ChunkInfo) {
        self.assert_writable();
        self.atomic_u64(self.chunk_info_off(id))
            .store(info.0, Ordering::Release);
    }

    fn list_off(&self, list: ChunkList) -> usize {
        match list {
            ChunkList::Free => OFF_FREE_LIST,
            ChunkList::Fast => OFF_FAST_LIST,
            ChunkList::Slow => OFF_SLOW_LIST,
        }
    }

    fn set_list_begin(&self, list: ChunkList, id: u32) {
        self.set_list_begin_raw(list, id);
    }

    fn set_list_begin_raw(&self, list: ChunkList, id: u32) {
        self.assert_writable();
        self.atomic_u32(self.list_off(list)).store(id, Ordering::Release);
    }

    fn set_list_end(&self, list: ChunkList, id: u32) {
        self.set_list_end_raw(list, id);
    }

    fn set_list_end_raw(&self, list: ChunkList, id: u32) {
        self.assert_writable();
        self.atomic_u32(self.list_off(list) + 4)
            .store(id, Ordering::Release);
    }

    fn assert_writable(&self) {
        assert!(!self.read_only, "metadata is mapped read-only");
    }

    fn atomic_u8(&self, off: usize) -> &AtomicU8 {
        debug_assert!(off < self.len);
        unsafe { &*self.map.as_ptr().add(off).cast::<AtomicU8>() }
    }

    fn atomic_u32(&self, off: usize) -> &AtomicU32 {
        debug_assert!(off + 4 <= self.len && off % 4 == 0);
        unsafe { &*self.map.as_ptr().add(off).cast::<AtomicU32>() }
    }

    fn atomic_u64(&self, off: usize) -> &AtomicU64 {
        debug_assert!(off + 8 <= self.len && off % 8 == 0);
        unsafe { &*self.map.as_ptr().add(off).cast::<AtomicU64>() }
    }

    fn bytes(&self, off: usize, len: usize) -> &[u8] {
        debug_assert!(off + len <= self.len);
        unsafe { std::slice::from_raw_parts(self.map.as_ptr().add(off), len) }
    }

    fn store_bytes(&self, off: usize, bytes: &[u8]) {
        self.assert_writable();
        debug_assert!(off + bytes.len() <= self.len);
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.map.as_ptr().add(off), bytes.len());
        }
    }
}

impl Drop for DbMetadata {
    fn drop(&mut self) {
        self.flush();
        unsafe {
            libc::munmap(self.map.as_ptr().cast::<libc::c_void>(), self.len);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fs::OpenOptions;
    use std::os::fd::AsRawFd;

    fn scratch_metadata(chunk_count: u32) -> (tempfile::TempDir, std::fs::File, DbMetadata) {
        let dir = tempfile::tempdir().unwrap();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(dir.path().join("cnv.triedb"))
            .unwrap();
        let meta = DbMetadata::create(file.as_raw_fd(), chunk_count, 1 << 20, 3.0).unwrap();
        (dir, file, meta)
    }

    #[test]
    fn create_open_roundtrip() {
        let (_dir, file, meta) = scratch_metadata(4);
        assert!(!meta.is_dirty());
        assert_eq!(meta.capacity_in_free_list(), 4 << 20);
        assert_eq!(meta.max_version(), None);
        drop(meta);

        let reopened = DbMetadata::open(file.as_raw_fd(), 4, false).unwrap();
        assert_eq!(reopened.capacity_in_free_list(), 4 << 20);
        assert_eq!(reopened.list_len(ChunkList::Free), 4);
        assert!((reopened.slow_fast_ratio() - 3.0).abs() < f32::EPSILON);
    }

    #[test]
    fn open_rejects_wrong_magic() {
        let dir = tempfile::tempdir().unwrap();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(dir.path().join("cnv.triedb"))
            .unwrap();
        file.set_len(metadata_len(4) as u64).unwrap();
        let err = DbMetadata::open(file.as_raw_fd(), 4, false).unwrap_err();
        assert!(matches!(err, DbError::MetadataCorrupt { .. }));
    }

    #[test]
    fn ring_push_and_window() {
        let (_dir, _file, meta) = scratch_metadata(2);
        let a = ChunkOffset::new(0, 0x200);
        let b = ChunkOffset::new(0, 0x400);
        meta.append_root_offset(a);
        meta.append_root_offset(b);
        assert_eq!(meta.max_version(), Some(1));
        assert_eq!(meta.min_version(), Some(0));
        assert_eq!(meta.root_offset(0), a);
        assert_eq!(meta.root_offset(1), b);
    }

    #[test]
    fn fast_forward_pads_with_invalid() {
        let (_dir, _file, meta) = scratch_metadata(2);
        meta.append_root_offset(ChunkOffset::new(0, 0x200));
        meta.fast_forward_next_version(5);
        meta.append_root_offset(ChunkOffset::new(0, 0x600));
        assert_eq!(meta.max_version(), Some(5));
        assert!(meta.root_offset(3).is_invalid());
        assert_eq!(meta.root_offset(5), ChunkOffset::new(0, 0x600));
    }

    #[test]
    fn list_append_remove_cycle() {
        let (_dir, _file, meta) = scratch_metadata(4);
        // Drain the free list into fast; verify ordering and counters.
        let a = meta.pop_free().unwrap();
        let b = meta.pop_free().unwrap();
        meta.append(ChunkList::Fast, a);
        meta.append(ChunkList::Fast, b);
        assert_eq!(meta.list_begin(ChunkList::Fast), Some(a));
        assert_eq!(meta.list_end(ChunkList::Fast), Some(b));
        assert_eq!(meta.chunk_info(a).list(), ChunkList::Fast);
        assert_eq!(
            meta.chunk_info(b).insertion_count(),
            meta.chunk_info(a).insertion_count() + 1
        );
        assert_eq!(meta.list_len(ChunkList::Free), 2);

        meta.remove(a);
        meta.append(ChunkList::Free, a);
        assert_eq!(meta.list_begin(ChunkList::Fast), Some(b));
        assert_eq!(meta.list_len(ChunkList::Free), 3);
    }

    #[test]
    fn dirty_guard_nests() {
        let (_dir, _file, meta) = scratch_metadata(2);
        {
            let _outer = meta.hold_dirty();
            assert!(meta.is_dirty());
            {
                let _inner = meta.hold_dirty();
                assert!(meta.is_dirty());
            }
            // Still inside the outer scope.
            assert!(meta.is_dirty());
        }
        assert!(!meta.is_dirty());
    }

    #[test]
    fn finalized_version_roundtrip() {
        let (_dir, _file, meta) = scratch_metadata(2);
        assert_eq!(meta.finalized_version(), None);
        meta.set_finalized_version(41);
        assert_eq!(meta.finalized_version(), Some(41));
    }
}
