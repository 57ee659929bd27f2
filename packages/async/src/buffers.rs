//! Fixed pools of page-aligned read and write buffers.
//!
//! Buffers are allocated up front, aligned for direct I/O, and handed out as
//! [`PoolBuffer`] smart wrappers that return their allocation to the owning
//! pool on drop.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::cell::RefCell;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::rc::Rc;

use crate::offset::DISK_PAGE_SIZE;

/// Size of a pooled read buffer, enough for a maximum-size node record.
pub const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Size of a pooled write buffer; node writes accumulate into one of these
/// before a single append is submitted.
pub const WRITE_BUFFER_SIZE: usize = 256 * 1024;

#[derive(Debug)]
struct AlignedBuf {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl AlignedBuf {
    fn new(size: usize) -> Self {
        let layout = Layout::from_size_align(size, DISK_PAGE_SIZE as usize)
            .expect("buffer layout is statically valid");
        // Zeroed so that alignment padding never leaks stale bytes to disk.
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).expect("buffer pool allocation failed");
        Self { ptr, layout }
    }

    fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

#[derive(Debug)]
struct PoolInner {
    free: RefCell<Vec<AlignedBuf>>,
    buffer_size: usize,
}

/// The read and write buffer pools registered with a ring.
pub struct Buffers {
    read: Rc<PoolInner>,
    write: Rc<PoolInner>,
}

impl Buffers {
    /// Allocate `rd_count` read buffers and `wr_count` write buffers.
    #[must_use]
    pub fn new(rd_count: usize, wr_count: usize) -> Self {
        let fill = |count: usize, size: usize| {
            let bufs = (0..count).map(|_| AlignedBuf::new(size)).collect();
            Rc::new(PoolInner {
                free: RefCell::new(bufs),
                buffer_size: size,
            })
        };
        Self {
            read: fill(rd_count, READ_BUFFER_SIZE),
            write: fill(wr_count, WRITE_BUFFER_SIZE),
        }
    }

    /// Take a read buffer, or `None` if the pool is exhausted.
    #[must_use]
    pub fn get_read_buffer(&self) -> Option<PoolBuffer> {
        Self::get(&self.read)
    }

    /// Take a write buffer, or `None` if the pool is exhausted.
    #[must_use]
    pub fn get_write_buffer(&self) -> Option<PoolBuffer> {
        Self::get(&self.write)
    }

    /// Number of read buffers currently available.
    #[must_use]
    pub fn read_buffers_free(&self) -> usize {
        self.read.free.borrow().len()
    }

    /// Number of write buffers currently available.
    #[must_use]
    pub fn write_buffers_free(&self) -> usize {
        self.write.free.borrow().len()
    }

    fn get(pool: &Rc<PoolInner>) -> Option<PoolBuffer> {
        let buf = pool.free.borrow_mut().pop()?;
        Some(PoolBuffer {
            buf: Some(buf),
            len: pool.buffer_size,
            pool: Rc::clone(pool),
        })
    }
}

/// A pooled buffer; the allocation returns to its pool on drop.
#[derive(Debug)]
pub struct PoolBuffer {
    buf: Option<AlignedBuf>,
    len: usize,
    pool: Rc<PoolInner>,
}

impl PoolBuffer {
    /// Capacity of the underlying allocation.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.pool.buffer_size
    }

    /// Restrict the visible window to the first `len` bytes.
    pub fn set_len(&mut self, len: usize) {
        assert!(len <= self.capacity());
        self.len = len;
    }
}

impl Deref for PoolBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf.as_ref().expect("buffer present until drop").as_slice()[..self.len]
    }
}

impl DerefMut for PoolBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        let len = self.len;
        &mut self
            .buf
            .as_mut()
            .expect("buffer present until drop")
            .as_mut_slice()[..len]
    }
}

impl Drop for PoolBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.free.borrow_mut().push(buf);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn buffers_return_to_pool_on_drop() {
        let buffers = Buffers::new(2, 1);
        assert_eq!(buffers.read_buffers_free(), 2);
        {
            let _a = buffers.get_read_buffer().unwrap();
            let _b = buffers.get_read_buffer().unwrap();
            assert_eq!(buffers.read_buffers_free(), 0);
            assert!(buffers.get_read_buffer().is_none());
        }
        assert_eq!(buffers.read_buffers_free(), 2);
    }

    #[test]
    fn buffers_are_disk_page_aligned() {
        let buffers = Buffers::new(1, 1);
        let buf = buffers.get_write_buffer().unwrap();
        assert_eq!(buf.as_ptr() as usize % DISK_PAGE_SIZE as usize, 0);
        assert_eq!(buf.capacity(), WRITE_BUFFER_SIZE);
    }

    #[test]
    fn window_can_be_narrowed() {
        let buffers = Buffers::new(1, 1);
        let mut buf = buffers.get_read_buffer().unwrap();
        buf.set_len(512);
        assert_eq!(buf.len(), 512);
        buf[511] = 0xab;
        assert_eq!(buf[511], 0xab);
    }
}
