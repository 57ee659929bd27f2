//! Typed senders, receivers and connected operations.
//!
//! A [`Sender`] describes an operation to initiate; a [`Receiver`] is the
//! continuation run with its result. [`connect`] binds the pair into a
//! [`ConnectedOperation`], which is inert until handed to
//! [`IoEngine::initiate`](crate::IoEngine::initiate). Dropping a connected
//! operation before initiation is the only supported cancellation; after
//! initiation the completion will eventually run, exactly once.

use std::time::{Duration, Instant};

use crate::buffers::PoolBuffer;
use crate::engine::{ChunkFdMap, IoEngine};
use crate::error::IoError;
use crate::offset::ChunkOffset;
use crate::ring::Ring;

/// The operation kinds the engine tracks in-flight counters for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    /// A positioned read from a chunk.
    Read,
    /// An appending write into a chunk.
    Write,
    /// A timer expiry.
    Timeout,
    /// A cross-thread invocation drained from the message channel.
    ThreadSafe,
}

/// Initiation priority; deferred operations drain highest first, FIFO
/// within a priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum IoPriority {
    /// Ahead of all other deferred work.
    Highest = 0,
    /// The default.
    Normal = 1,
    /// Only once nothing else is waiting.
    Idle = 2,
}

impl IoPriority {
    pub(crate) const COUNT: usize = 3;
}

/// When a [`TimeoutSender`] fires.
#[derive(Debug, Clone, Copy)]
pub enum Deadline {
    /// A duration from initiation, against the monotonic clock.
    Relative(Duration),
    /// An absolute monotonic instant.
    Absolute(Instant),
}

/// Submission context handed to senders: the ring plus the registered-fd
/// table resolving chunk ids.
pub struct SubmitCtx<'a> {
    /// The submission/completion ring.
    pub ring: &'a mut Ring,
    /// Registered-file indices per chunk.
    pub fds: &'a ChunkFdMap,
}

/// An operation description producing a typed result.
pub trait Sender {
    /// What a completed operation yields.
    type Result;

    /// The in-flight accounting bucket for this operation.
    fn kind(&self) -> OpKind;

    /// Initiation priority when the operation must be deferred.
    fn priority(&self) -> IoPriority {
        IoPriority::Normal
    }

    /// Prepare the ring entry; called once the engine has capacity.
    fn submit(&mut self, ctx: &mut SubmitCtx<'_>, user_data: u64);

    /// Translate the raw completion into the typed result.
    ///
    /// # Errors
    /// Returns the mapped [`IoError`] when the ring delivered a negated
    /// errno or a short transfer.
    fn on_complete(&mut self, result: i32) -> Result<Self::Result, IoError>;
}

/// A continuation bound to a sender's result type.
pub trait Receiver {
    /// Must match the sender's `Result`.
    type Result;

    /// Deliver the result. Runs on the owning thread, inside `poll`.
    fn set_value(&mut self, engine: &mut IoEngine, result: Result<Self::Result, IoError>);
}

/// A sender bound to its receiver. Inert until initiated.
pub struct ConnectedOperation<S, R> {
    pub(crate) sender: S,
    pub(crate) receiver: R,
}

/// Bind a sender to a receiver.
pub fn connect<S, R>(sender: S, receiver: R) -> ConnectedOperation<S, R>
where
    S: Sender,
    R: Receiver<Result = S::Result>,
{
    ConnectedOperation { sender, receiver }
}

/// Object-safe face of a connected operation, used by the engine for
/// deferred queues and completion dispatch.
pub trait ErasedConnectedOperation {
    /// The sender's accounting bucket.
    fn kind(&self) -> OpKind;
    /// The sender's priority.
    fn priority(&self) -> IoPriority;
    /// Prepare the ring entry.
    fn submit(&mut self, ctx: &mut SubmitCtx<'_>, user_data: u64);
    /// Translate the completion and run the receiver.
    fn complete(self: Box<Self>, engine: &mut IoEngine, result: i32);
}

impl<S, R> ErasedConnectedOperation for ConnectedOperation<S, R>
where
    S: Sender,
    R: Receiver<Result = S::Result>,
{
    fn kind(&self) -> OpKind {
        self.sender.kind()
    }

    fn priority(&self) -> IoPriority {
        self.sender.priority()
    }

    fn submit(&mut self, ctx: &mut SubmitCtx<'_>, user_data: u64) {
        self.sender.submit(ctx, user_data);
    }

    fn complete(mut self: Box<Self>, engine: &mut IoEngine, result: i32) {
        let typed = self.sender.on_complete(result);
        self.receiver.set_value(engine, typed);
    }
}

/// Read a disk-page-aligned span of a chunk into a single pooled buffer.
pub struct ReadSingleBufferSender {
    offset: ChunkOffset,
    bytes: usize,
    buffer: Option<PoolBuffer>,
    priority: IoPriority,
}

impl ReadSingleBufferSender {
    /// Read `bytes` (a 512 byte multiple) starting at `offset` (512 byte
    /// aligned) into `buffer`.
    #[must_use]
    pub fn new(offset: ChunkOffset, bytes: usize, buffer: PoolBuffer) -> Self {
        debug_assert!(offset.offset() % crate::offset::DISK_PAGE_SIZE == 0);
        debug_assert!(bytes as u64 % crate::offset::DISK_PAGE_SIZE == 0);
        debug_assert!(bytes <= buffer.capacity());
        Self {
            offset,
            bytes,
            buffer: Some(buffer),
            priority: IoPriority::Normal,
        }
    }

    /// Override the initiation priority.
    #[must_use]
    pub fn with_priority(mut self, priority: IoPriority) -> Self {
        self.priority = priority;
        self
    }

    /// The chunk offset being read.
    #[must_use]
    pub fn offset(&self) -> ChunkOffset {
        self.offset
    }
}

impl Sender for ReadSingleBufferSender {
    type Result = PoolBuffer;

    fn kind(&self) -> OpKind {
        OpKind::Read
    }

    fn priority(&self) -> IoPriority {
        self.priority
    }

    fn submit(&mut self, ctx: &mut SubmitCtx<'_>, user_data: u64) {
        let bytes = self.bytes;
        let buffer = self
            .buffer
            .as_mut()
            .expect("read sender submitted with its buffer present");
        let fd_index = ctx.fds.seq_fd_index(self.offset.id());
        ctx.ring
            .prep_read(fd_index, &mut buffer[..bytes], self.offset.offset(), user_data);
    }

    fn on_complete(&mut self, result: i32) -> Result<PoolBuffer, IoError> {
        if result < 0 {
            return Err(IoError::from_raw_os(-result));
        }
        let mut buffer = self
            .buffer
            .take()
            .expect("read sender completes at most once");
        let got = result as usize;
        if got == 0 && self.bytes != 0 {
            return Err(IoError::ShortRead {
                wanted: self.bytes,
                got,
            });
        }
        buffer.set_len(got.min(self.bytes));
        Ok(buffer)
    }
}

/// Append a filled buffer at a reserved position within a chunk.
pub struct WriteBufferSender {
    chunk_id: u32,
    offset: u64,
    len: usize,
    buffer: Option<PoolBuffer>,
}

impl WriteBufferSender {
    /// Write the first `len` bytes of `buffer` at `offset` within
    /// `chunk_id`; the caller must have reserved the window via the pool.
    #[must_use]
    pub fn new(chunk_id: u32, offset: u64, len: usize, buffer: PoolBuffer) -> Self {
        debug_assert!(len <= buffer.capacity());
        Self {
            chunk_id,
            offset,
            len,
            buffer: Some(buffer),
        }
    }
}

impl Sender for WriteBufferSender {
    type Result = usize;

    fn kind(&self) -> OpKind {
        OpKind::Write
    }

    fn submit(&mut self, ctx: &mut SubmitCtx<'_>, user_data: u64) {
        let len = self.len;
        let buffer = self
            .buffer
            .as_ref()
            .expect("write sender submitted with its buffer present");
        let fd_index = ctx.fds.seq_fd_index(self.chunk_id);
        ctx.ring
            .prep_write(fd_index, &buffer[..len], self.offset, user_data);
    }

    fn on_complete(&mut self, result: i32) -> Result<usize, IoError> {
        // Drop the buffer back to its pool regardless of outcome.
        self.buffer = None;
        if result < 0 {
            return Err(IoError::from_raw_os(-result));
        }
        let got = result as usize;
        if got != self.len {
            return Err(IoError::ShortWrite {
                wanted: self.len,
                got,
            });
        }
        Ok(got)
    }
}

/// A timer; fires exactly once after its deadline.
pub struct TimeoutSender {
    deadline: Deadline,
}

impl TimeoutSender {
    /// Create a timeout.
    #[must_use]
    pub const fn new(deadline: Deadline) -> Self {
        Self { deadline }
    }
}

impl Sender for TimeoutSender {
    type Result = ();

    fn kind(&self) -> OpKind {
        OpKind::Timeout
    }

    fn submit(&mut self, ctx: &mut SubmitCtx<'_>, user_data: u64) {
        let deadline = match self.deadline {
            Deadline::Relative(d) => Instant::now() + d,
            Deadline::Absolute(at) => at,
        };
        ctx.ring.prep_timeout(deadline, user_data);
    }

    fn on_complete(&mut self, result: i32) -> Result<(), IoError> {
        if result < 0 {
            return Err(IoError::from_raw_os(-result));
        }
        Ok(())
    }
}

/// A cross-thread invocation; completes when the owning thread drains the
/// message channel inside `poll`.
pub struct ThreadSafeSender;

impl Sender for ThreadSafeSender {
    type Result = ();

    fn kind(&self) -> OpKind {
        OpKind::ThreadSafe
    }

    fn submit(&mut self, ctx: &mut SubmitCtx<'_>, user_data: u64) {
        ctx.ring.prep_nop(user_data);
    }

    fn on_complete(&mut self, result: i32) -> Result<(), IoError> {
        if result < 0 {
            return Err(IoError::from_raw_os(-result));
        }
        Ok(())
    }
}
