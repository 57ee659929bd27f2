//! Single-threaded asynchronous I/O engine and chunked storage pool.
//!
//! One kernel thread owns an [`IoEngine`]; trie operations submit typed
//! [`Sender`]s bound to [`Receiver`]s and are resumed when `poll` reaps
//! their completions. Storage is organised as fixed-capacity chunks handed
//! out by a [`StoragePool`].

#![allow(clippy::module_name_repetitions)]

mod buffers;
mod engine;
mod error;
mod offset;
mod ring;
mod sender;
mod storage_pool;

pub use buffers::{Buffers, PoolBuffer, READ_BUFFER_SIZE, WRITE_BUFFER_SIZE};
pub use engine::{ChunkFdMap, EngineStats, IoEngine, ThreadSafeHandle, CONCURRENT_READ_IO_LIMIT};
pub use error::IoError;
pub use offset::{
    ChunkOffset, CompactVirtualChunkOffset, CHUNK_CAPACITY, CPU_PAGE_BITS, CPU_PAGE_SIZE,
    DISK_PAGE_BITS, DISK_PAGE_SIZE, DMA_PAGE_BITS, DMA_PAGE_SIZE, INVALID_COMPACT_VIRTUAL_OFFSET,
    INVALID_OFFSET, MIN_COMPACT_VIRTUAL_OFFSET,
};
pub use ring::{Completion, Ring};
pub use sender::{
    connect, ConnectedOperation, Deadline, ErasedConnectedOperation, IoPriority, OpKind, Receiver,
    ReadSingleBufferSender, Sender, SubmitCtx, ThreadSafeSender, TimeoutSender, WriteBufferSender,
};
pub use storage_pool::{Chunk, ChunkType, CreationFlags, OpenMode, StoragePool};
