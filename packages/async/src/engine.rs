//! The single-reactor I/O engine.
//!
//! One kernel thread owns an engine; all trie reads, appends and timers run
//! through it. Foreign threads may enqueue threadsafe operations through a
//! [`ThreadSafeHandle`] but must not touch anything else.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::ThreadId;

use crate::buffers::{Buffers, PoolBuffer};
use crate::error::IoError;
use crate::offset::ChunkOffset;
use crate::ring::{Completion, Ring};
use crate::sender::{
    connect, ErasedConnectedOperation, IoPriority, OpKind, ReadSingleBufferSender, Receiver,
    SubmitCtx,
};
use crate::storage_pool::{ChunkType, StoragePool};

/// Default cap on concurrently initiated reads.
pub const CONCURRENT_READ_IO_LIMIT: usize = 512;

const RING_ENTRIES: usize = 1024;

/// Registered-file indices for the pool's chunks.
pub struct ChunkFdMap {
    cnv: usize,
    seq_base: usize,
    seq_count: u32,
}

impl ChunkFdMap {
    /// Ring fd index of the conventional chunk.
    #[must_use]
    pub fn cnv_fd_index(&self) -> usize {
        self.cnv
    }

    /// Ring fd index of a sequential chunk.
    ///
    /// # Panics
    /// Panics on an out-of-range chunk id.
    #[must_use]
    pub fn seq_fd_index(&self, chunk_id: u32) -> usize {
        assert!(chunk_id < self.seq_count, "chunk id out of range");
        self.seq_base + chunk_id as usize
    }
}

/// Point-in-time engine counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineStats {
    /// Reads initiated and not yet completed.
    pub inflight_reads: usize,
    /// Writes initiated and not yet completed.
    pub inflight_writes: usize,
    /// Timeouts initiated and not yet fired.
    pub inflight_timeouts: usize,
    /// Threadsafe operations enqueued and not yet drained.
    pub inflight_threadsafe: usize,
    /// Operations parked on the deferred lists.
    pub deferred: usize,
}

type SendableOp = Box<dyn ErasedConnectedOperation + Send>;

/// Cross-thread submission handle; cloneable and `Send`.
#[derive(Clone)]
pub struct ThreadSafeHandle {
    tx: mpsc::Sender<SendableOp>,
    inflight: Arc<AtomicUsize>,
}

impl ThreadSafeHandle {
    /// Enqueue an operation for completion on the owning thread.
    ///
    /// # Errors
    /// Fails if the engine has been dropped.
    pub fn submit(&self, op: SendableOp) -> Result<(), IoError> {
        self.inflight.fetch_add(1, Ordering::AcqRel);
        self.tx.send(op).map_err(|_| {
            self.inflight.fetch_sub(1, Ordering::AcqRel);
            IoError::Failure(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "i/o engine is gone",
            ))
        })
    }
}

/// The reactor: submission gating, deferred initiation, completion
/// dispatch and buffer pools, all owned by a single kernel thread.
pub struct IoEngine {
    ring: Ring,
    buffers: Buffers,
    fds: ChunkFdMap,
    pending: HashMap<u64, Box<dyn ErasedConnectedOperation>>,
    deferred: [VecDeque<Box<dyn ErasedConnectedOperation>>; IoPriority::COUNT],
    next_user_data: u64,
    inflight_rd: usize,
    inflight_wr: usize,
    inflight_tm: usize,
    inflight_ts: Arc<AtomicUsize>,
    ts_rx: mpsc::Receiver<SendableOp>,
    ts_tx: mpsc::Sender<SendableOp>,
    concurrent_read_io_limit: usize,
    owning_thread: ThreadId,
}

impl IoEngine {
    /// Build an engine over an opened pool, registering every chunk's
    /// descriptors with the ring.
    #[must_use]
    pub fn new(pool: &StoragePool, buffers: Buffers) -> Self {
        let mut fds = Vec::with_capacity(1 + pool.chunks(ChunkType::Seq) as usize);
        fds.push(pool.chunk(ChunkType::Cnv, 0).read_fd().0);
        for id in 0..pool.chunks(ChunkType::Seq) {
            fds.push(pool.chunk(ChunkType::Seq, id).read_fd().0);
        }
        let mut ring = Ring::new(RING_ENTRIES);
        ring.register_files(&fds);

        let (ts_tx, ts_rx) = mpsc::channel();
        Self {
            ring,
            buffers,
            fds: ChunkFdMap {
                cnv: 0,
                seq_base: 1,
                seq_count: pool.chunks(ChunkType::Seq),
            },
            pending: HashMap::new(),
            deferred: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
            next_user_data: 1,
            inflight_rd: 0,
            inflight_wr: 0,
            inflight_tm: 0,
            inflight_ts: Arc::new(AtomicUsize::new(0)),
            ts_rx,
            ts_tx,
            concurrent_read_io_limit: CONCURRENT_READ_IO_LIMIT,
            owning_thread: std::thread::current().id(),
        }
    }

    /// Override the concurrent-read cap.
    pub fn set_concurrent_read_io_limit(&mut self, limit: usize) {
        self.concurrent_read_io_limit = limit.max(1);
    }

    /// A handle foreign threads may submit threadsafe operations through.
    #[must_use]
    pub fn threadsafe_handle(&self) -> ThreadSafeHandle {
        ThreadSafeHandle {
            tx: self.ts_tx.clone(),
            inflight: Arc::clone(&self.inflight_ts),
        }
    }

    /// The engine's buffer pools.
    #[must_use]
    pub fn buffers(&self) -> &Buffers {
        &self.buffers
    }

    /// Take a read buffer, polling until one frees if the pool is empty.
    pub fn acquire_read_buffer(&mut self) -> PoolBuffer {
        loop {
            if let Some(buf) = self.buffers.get_read_buffer() {
                return buf;
            }
            assert!(
                self.io_in_flight() > 0,
                "read buffer pool exhausted with no i/o in flight"
            );
            self.poll(true, 1);
        }
    }

    /// Take a write buffer, polling until one frees if the pool is empty.
    pub fn acquire_write_buffer(&mut self) -> PoolBuffer {
        loop {
            if let Some(buf) = self.buffers.get_write_buffer() {
                return buf;
            }
            assert!(
                self.io_in_flight() > 0,
                "write buffer pool exhausted with no i/o in flight"
            );
            self.poll(true, 1);
        }
    }

    /// Operations initiated and not yet completed, all kinds.
    #[must_use]
    pub fn io_in_flight(&self) -> usize {
        self.inflight_rd
            + self.inflight_wr
            + self.inflight_tm
            + self.inflight_ts.load(Ordering::Acquire)
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            inflight_reads: self.inflight_rd,
            inflight_writes: self.inflight_wr,
            inflight_timeouts: self.inflight_tm,
            inflight_threadsafe: self.inflight_ts.load(Ordering::Acquire),
            deferred: self.deferred.iter().map(VecDeque::len).sum(),
        }
    }

    /// Initiate a connected operation: submit immediately when the ring has
    /// space and the per-kind limit allows, otherwise park it on the
    /// deferred list to be drained from `poll`.
    pub fn initiate(&mut self, op: Box<dyn ErasedConnectedOperation>) {
        debug_assert_eq!(std::thread::current().id(), self.owning_thread);
        if self.can_submit(op.kind()) {
            self.submit_now(op);
        } else {
            let priority = op.priority() as usize;
            self.deferred[priority].push_back(op);
        }
    }

    /// Convenience: initiate a single-buffer read of `bytes` at `offset`,
    /// delivering the filled buffer to `receiver`.
    pub fn read<R>(&mut self, offset: ChunkOffset, bytes: usize, receiver: R)
    where
        R: Receiver<Result = PoolBuffer> + 'static,
    {
        let buffer = self.acquire_read_buffer();
        let sender = ReadSingleBufferSender::new(offset, bytes, buffer);
        self.initiate(Box::new(connect(sender, receiver)));
    }

    /// Initiate a scatter read: one read per `(offset, bytes)` range, with
    /// `receiver` run once against the buffers in range order after the
    /// last completion. A failed range fails the whole gather.
    pub fn read_scatter<R>(&mut self, ranges: &[(ChunkOffset, usize)], mut receiver: R)
    where
        R: Receiver<Result = Vec<PoolBuffer>> + 'static,
    {
        if ranges.is_empty() {
            receiver.set_value(self, Ok(Vec::new()));
            return;
        }
        let gather = Rc::new(RefCell::new(Gather {
            slots: (0..ranges.len()).map(|_| None).collect(),
            outstanding: ranges.len(),
            receiver,
        }));
        for (index, &(offset, bytes)) in ranges.iter().enumerate() {
            self.read(
                offset,
                bytes,
                GatherPart {
                    gather: Rc::clone(&gather),
                    index,
                },
            );
        }
    }

    /// Drain the reactor. Completes up to `max_completions` operations; if
    /// `blocking`, sleeps until at least one completion arrives (returning
    /// 0 only when nothing is in flight). Deferred initiations are drained
    /// afterwards. Returns the number of completions delivered.
    pub fn poll(&mut self, blocking: bool, max_completions: usize) -> usize {
        debug_assert_eq!(std::thread::current().id(), self.owning_thread);
        let mut completed = 0;
        while completed < max_completions {
            if self.poll_one(blocking && completed == 0) {
                completed += 1;
            } else {
                break;
            }
        }
        self.drain_deferred();
        completed
    }

    /// Block until every in-flight and deferred operation has completed.
    pub fn wait_until_done(&mut self) {
        while self.io_in_flight() > 0 || self.deferred.iter().any(|q| !q.is_empty()) {
            self.poll(true, usize::MAX);
        }
    }

    fn poll_one(&mut self, blocking: bool) -> bool {
        loop {
            if let Ok(op) = self.ts_rx.try_recv() {
                self.inflight_ts.fetch_sub(1, Ordering::AcqRel);
                op.complete(self, 0);
                return true;
            }
            let completion = if blocking {
                self.ring.wait()
            } else {
                self.ring.peek()
            };
            if let Some(c) = completion {
                if self.dispatch(c) {
                    return true;
                }
                // An EAGAIN read was transparently re-initiated; keep
                // reaping.
                continue;
            }
            if blocking && self.inflight_ts.load(Ordering::Acquire) > 0 {
                match self.ts_rx.recv() {
                    Ok(op) => {
                        self.inflight_ts.fetch_sub(1, Ordering::AcqRel);
                        op.complete(self, 0);
                        return true;
                    }
                    Err(mpsc::RecvError) => return false,
                }
            }
            return false;
        }
    }

    fn dispatch(&mut self, c: Completion) -> bool {
        let op = self
            .pending
            .remove(&c.user_data)
            .expect("completion tag maps to a pending operation");
        match op.kind() {
            OpKind::Read => {
                self.inflight_rd -= 1;
                if c.result == -libc::EAGAIN {
                    tracing::trace!(user_data = c.user_data, "read returned EAGAIN, re-initiating");
                    self.initiate(op);
                    return false;
                }
            }
            OpKind::Write => self.inflight_wr -= 1,
            OpKind::Timeout => self.inflight_tm -= 1,
            OpKind::ThreadSafe => {
                self.inflight_ts.fetch_sub(1, Ordering::AcqRel);
            }
        }
        op.complete(self, c.result);
        true
    }

    fn can_submit(&self, kind: OpKind) -> bool {
        if self.ring.sq_space_left() == 0 {
            return false;
        }
        kind != OpKind::Read || self.inflight_rd < self.concurrent_read_io_limit
    }

    fn submit_now(&mut self, mut op: Box<dyn ErasedConnectedOperation>) {
        let user_data = self.next_user_data;
        self.next_user_data += 1;
        {
            let mut ctx = SubmitCtx {
                ring: &mut self.ring,
                fds: &self.fds,
            };
            op.submit(&mut ctx, user_data);
        }
        match op.kind() {
            OpKind::Read => self.inflight_rd += 1,
            OpKind::Write => self.inflight_wr += 1,
            OpKind::Timeout => self.inflight_tm += 1,
            OpKind::ThreadSafe => {
                self.inflight_ts.fetch_add(1, Ordering::AcqRel);
            }
        }
        self.pending.insert(user_data, op);
    }

    fn drain_deferred(&mut self) {
        for priority in 0..IoPriority::COUNT {
            while let Some(front) = self.deferred[priority].front() {
                if !self.can_submit(front.kind()) {
                    return;
                }
                let op = self.deferred[priority]
                    .pop_front()
                    .expect("front observed above");
                self.submit_now(op);
            }
        }
    }
}

struct Gather<R: Receiver<Result = Vec<PoolBuffer>>> {
    slots: Vec<Option<Result<PoolBuffer, IoError>>>,
    outstanding: usize,
    receiver: R,
}

struct GatherPart<R: Receiver<Result = Vec<PoolBuffer>>> {
    gather: Rc<RefCell<Gather<R>>>,
    index: usize,
}

impl<R: Receiver<Result = Vec<PoolBuffer>>> Receiver for GatherPart<R> {
    type Result = PoolBuffer;

    fn set_value(&mut self, engine: &mut IoEngine, result: Result<PoolBuffer, IoError>) {
        let mut gather = self.gather.borrow_mut();
        gather.slots[self.index] = Some(result);
        gather.outstanding -= 1;
        if gather.outstanding > 0 {
            return;
        }
        let slots = std::mem::take(&mut gather.slots);
        let mut buffers = Vec::with_capacity(slots.len());
        let mut failure = None;
        for slot in slots {
            match slot.expect("every range completed") {
                Ok(buffer) => buffers.push(buffer),
                Err(err) => failure = Some(err),
            }
        }
        match failure {
            Some(err) => gather.receiver.set_value(engine, Err(err)),
            None => gather.receiver.set_value(engine, Ok(buffers)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sender::{Deadline, Sender, TimeoutSender, WriteBufferSender};
    use crate::storage_pool::{CreationFlags, OpenMode};
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Duration;

    fn pool_and_engine() -> (tempfile::TempDir, StoragePool, IoEngine) {
        let dir = tempfile::tempdir().unwrap();
        let flags = CreationFlags {
            chunk_capacity: 1 << 20,
            chunk_count: 2,
            ..CreationFlags::default()
        };
        let pool =
            StoragePool::open(&[dir.path().to_path_buf()], OpenMode::Truncate, &flags).unwrap();
        let engine = IoEngine::new(&pool, Buffers::new(4, 4));
        (dir, pool, engine)
    }

    struct Collect<T>(Rc<RefCell<Vec<Result<T, IoError>>>>);

    impl<T> Receiver for Collect<T> {
        type Result = T;

        fn set_value(&mut self, _engine: &mut IoEngine, result: Result<T, IoError>) {
            self.0.borrow_mut().push(result);
        }
    }

    #[test]
    fn write_then_read_roundtrip() {
        let (_dir, pool, mut engine) = pool_and_engine();
        let chunk = pool.chunk(ChunkType::Seq, 0);

        let mut buf = engine.buffers().get_write_buffer().unwrap();
        buf[..4].copy_from_slice(b"node");
        buf.set_len(512);
        let (_, at) = chunk.write_fd(512);
        let writes = Rc::new(RefCell::new(Vec::new()));
        engine.initiate(Box::new(connect(
            WriteBufferSender::new(0, at, 512, buf),
            Collect(Rc::clone(&writes)),
        )));
        assert_eq!(engine.poll(true, usize::MAX), 1);
        assert_eq!(*writes.borrow()[0].as_ref().unwrap(), 512);

        let reads = Rc::new(RefCell::new(Vec::new()));
        engine.read(
            ChunkOffset::new(0, 0),
            512,
            Collect::<PoolBuffer>(Rc::clone(&reads)),
        );
        assert_eq!(engine.poll(true, usize::MAX), 1);
        let reads = reads.borrow();
        let got = reads[0].as_ref().unwrap();
        assert_eq!(&got[..4], b"node");
    }

    #[test]
    fn timeout_completes_exactly_once() {
        let (_dir, _pool, mut engine) = pool_and_engine();
        let fired = Rc::new(RefCell::new(Vec::new()));
        engine.initiate(Box::new(connect(
            TimeoutSender::new(Deadline::Relative(Duration::from_millis(1))),
            Collect(Rc::clone(&fired)),
        )));
        assert_eq!(engine.stats().inflight_timeouts, 1);
        engine.wait_until_done();
        assert_eq!(fired.borrow().len(), 1);
        assert_eq!(engine.stats().inflight_timeouts, 0);
    }

    #[test]
    fn read_limit_defers_then_drains() {
        let (_dir, pool, mut engine) = pool_and_engine();
        engine.set_concurrent_read_io_limit(1);
        let chunk = pool.chunk(ChunkType::Seq, 0);
        let (_, at) = chunk.write_fd(2048);
        assert_eq!(at, 0);
        let mut buf = engine.buffers().get_write_buffer().unwrap();
        buf.set_len(2048);
        let writes = Rc::new(RefCell::new(Vec::new()));
        engine.initiate(Box::new(connect(
            WriteBufferSender::new(0, 0, 2048, buf),
            Collect(Rc::clone(&writes)),
        )));
        engine.wait_until_done();

        let reads = Rc::new(RefCell::new(Vec::new()));
        for n in 0..3u64 {
            engine.read(
                ChunkOffset::new(0, n * 512),
                512,
                Collect::<PoolBuffer>(Rc::clone(&reads)),
            );
        }
        assert!(engine.stats().deferred > 0);
        engine.wait_until_done();
        assert_eq!(reads.borrow().len(), 3);
        assert_eq!(engine.stats().deferred, 0);
    }

    #[test]
    fn threadsafe_ops_cross_threads() {
        let (_dir, _pool, mut engine) = pool_and_engine();
        let handle = engine.threadsafe_handle();
        let flag = Arc::new(AtomicUsize::new(0));

        struct Mark(Arc<AtomicUsize>);
        impl Receiver for Mark {
            type Result = ();

            fn set_value(&mut self, _engine: &mut IoEngine, result: Result<(), IoError>) {
                assert!(result.is_ok());
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let their_flag = Arc::clone(&flag);
        let joiner = std::thread::spawn(move || {
            handle
                .submit(Box::new(connect(
                    crate::sender::ThreadSafeSender,
                    Mark(their_flag),
                )))
                .unwrap();
        });
        joiner.join().unwrap();
        engine.poll(true, usize::MAX);
        assert_eq!(flag.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn scatter_read_gathers_in_range_order() {
        let (_dir, pool, mut engine) = pool_and_engine();
        let chunk = pool.chunk(ChunkType::Seq, 0);
        let (_, at) = chunk.write_fd(2048);
        assert_eq!(at, 0);
        let mut buf = engine.buffers().get_write_buffer().unwrap();
        for page in 0u8..4 {
            buf[page as usize * 512..(page as usize + 1) * 512].fill(page);
        }
        buf.set_len(2048);
        engine.initiate(Box::new(connect(
            WriteBufferSender::new(0, 0, 2048, buf),
            Collect(Rc::new(RefCell::new(Vec::new()))),
        )));
        engine.wait_until_done();

        let results = Rc::new(RefCell::new(Vec::new()));
        engine.read_scatter(
            &[
                (ChunkOffset::new(0, 3 * 512), 512),
                (ChunkOffset::new(0, 512), 512),
            ],
            Collect::<Vec<PoolBuffer>>(Rc::clone(&results)),
        );
        engine.wait_until_done();
        let results = results.borrow();
        let buffers = results[0].as_ref().unwrap();
        assert_eq!(buffers.len(), 2);
        assert!(buffers[0].iter().all(|b| *b == 3));
        assert!(buffers[1].iter().all(|b| *b == 1));
    }

    #[test]
    fn read_sender_surfaces_short_reads() {
        let (_dir, _pool, mut engine) = pool_and_engine();
        let buffer = engine.acquire_read_buffer();
        let mut sender = ReadSingleBufferSender::new(ChunkOffset::new(1, 0), 512, buffer);
        // Chunk 1 is empty: a positioned read completes with zero bytes.
        let err = sender.on_complete(0).unwrap_err();
        assert!(matches!(err, IoError::ShortRead { wanted: 512, got: 0 }));
    }
}
