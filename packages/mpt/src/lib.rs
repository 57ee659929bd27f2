//! Versioned Merkle-Patricia trie storage engine.
//!
//! A persistent, multi-version authenticated key-value store: block-level
//! update batches build copy-on-write versions that share structure, point
//! lookups and traversals run against any version still inside the
//! 1024-entry history window, a compacting allocator recycles storage
//! through fast and slow chunk rings, and a dirty-byte-protected metadata
//! block lets the engine rewind an interrupted version on restart.

#![allow(clippy::module_name_repetitions)]

mod aux;
mod compute;
mod config;
mod db;
mod error;
mod find;
mod metadata;
mod nibbles;
mod node;
mod traverse;
mod update;
mod upsert;

pub use aux::{UpdateAux, CACHE_LEVELS};
pub use compute::{root_hash, Compute, MerkleCompute, NoopCompute};
pub use config::{OnDiskDbConfig, ReadOnlyOnDiskDbConfig};
pub use db::Db;
pub use error::{DbError, FindError, NodeError};
pub use find::{find_blocking, find_from, get_async, AsyncGet, NodeRef};
pub use metadata::{ChunkInfo, ChunkList, DbMetadata, DirtyGuard, MAGIC, ROOT_OFFSETS_SIZE};
pub use nibbles::{Nibbles, NibblesView};
pub use node::{
    calc_min_offsets, calc_min_version, calculate_node_size, make_node, make_node_from, ChildData,
    Node, DISK_SIZE_BYTES, INVALID_BLOCK, INVALID_BRANCH, MAX_DATA_LEN, MAX_DISK_SIZE,
};
pub use traverse::{preorder_traverse, LeafCollector, TraverseMachine};
pub use update::{make_erase, make_incarnation, make_update, sort_updates, Update, UpdateList};
pub use upsert::{upsert, upsert_updates, RootInfo};
