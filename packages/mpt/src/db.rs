//! The database facade.
//!
//! A [`Db`] owns one trie over one storage pool: batched versioned
//! upserts, point lookups and traversals against any version still inside
//! the history window, and the commit protocol that keeps the pool
//! crash-consistent. At most one read-write instance may hold a pool open;
//! read-only instances attach freely and observe versions through the
//! root-offset ring.

use alloy_primitives::B256;

use triedb_async::{ChunkOffset, CompactVirtualChunkOffset, INVALID_OFFSET};

use crate::aux::UpdateAux;
use crate::compute::{root_hash, Compute, MerkleCompute};
use crate::config::{OnDiskDbConfig, ReadOnlyOnDiskDbConfig};
use crate::error::{DbError, FindError};
use crate::find::{find_from, get_async, AsyncGet, NodeRef};
use crate::metadata::ROOT_OFFSETS_SIZE;
use crate::nibbles::Nibbles;
use crate::node::Node;
use crate::traverse::{preorder_traverse, TraverseMachine};
use crate::update::UpdateList;
use crate::upsert::upsert;

/// A versioned Merkle-Patricia trie database.
pub struct Db {
    aux: UpdateAux,
    compute: MerkleCompute,
    root: Option<Box<Node>>,
    root_offset: ChunkOffset,
    compaction: bool,
    // Version bookkeeping for the in-memory mode, which has no ring.
    mem_latest: Option<i64>,
}

impl Db {
    /// Open (or create) a read-write database over an on-disk pool.
    ///
    /// # Errors
    /// Propagates pool and metadata failures; corrupt metadata is fatal.
    pub fn open(config: &OnDiskDbConfig) -> Result<Self, DbError> {
        let mut aux = UpdateAux::open(config)?;
        let (root, root_offset) = Self::load_latest_root(&mut aux)?;
        tracing::info!(
            latest = ?aux.metadata().and_then(crate::metadata::DbMetadata::max_version),
            "database opened"
        );
        Ok(Self {
            aux,
            compute: MerkleCompute,
            root,
            root_offset,
            compaction: config.compaction,
            mem_latest: None,
        })
    }

    /// Attach a read-only instance to an existing pool.
    ///
    /// # Errors
    /// Propagates pool and metadata failures.
    pub fn open_read_only(config: &ReadOnlyOnDiskDbConfig) -> Result<Self, DbError> {
        let aux = UpdateAux::open_read_only(config)?;
        Ok(Self {
            aux,
            compute: MerkleCompute,
            root: None,
            root_offset: INVALID_OFFSET,
            compaction: false,
            mem_latest: None,
        })
    }

    /// A database with no storage pool behind it; only the latest version
    /// is queryable. Used by tests and tooling.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            aux: UpdateAux::in_memory(),
            compute: MerkleCompute,
            root: None,
            root_offset: INVALID_OFFSET,
            compaction: false,
            mem_latest: None,
        }
    }

    fn load_latest_root(
        aux: &mut UpdateAux,
    ) -> Result<(Option<Box<Node>>, ChunkOffset), DbError> {
        let Some(metadata) = aux.metadata() else {
            return Ok((None, INVALID_OFFSET));
        };
        let Some(latest) = metadata.max_version() else {
            return Ok((None, INVALID_OFFSET));
        };
        let offset = metadata.root_offset(latest);
        if offset.is_invalid() {
            return Ok((None, INVALID_OFFSET));
        }
        let root = aux.read_node_blocking(offset)?;
        Ok((Some(root), offset))
    }

    /// Durably install a new version from a batch of updates. Versions are
    /// strictly monotone; an upsert at an already published version is a
    /// caller bug and is rejected.
    ///
    /// # Errors
    /// [`DbError::NonMonotonicVersion`] on a stale version, otherwise read,
    /// append and commit failures. On error the previous version stays
    /// intact and visible.
    pub fn upsert(&mut self, updates: UpdateList, version: i64) -> Result<(), DbError> {
        let compaction = self.compaction;
        self.upsert_with(updates, version, true, compaction)
    }

    /// As [`Db::upsert`], choosing the destination ring and whether this
    /// upsert also performs compaction.
    ///
    /// # Errors
    /// As [`Db::upsert`].
    #[tracing::instrument(skip_all)]
    pub fn upsert_with(
        &mut self,
        mut updates: UpdateList,
        version: i64,
        write_to_fast: bool,
        compaction: bool,
    ) -> Result<(), DbError> {
        if let Some(latest) = self.get_latest_version() {
            if version <= latest {
                return Err(DbError::NonMonotonicVersion {
                    current: latest,
                    requested: version,
                });
            }
        }

        let threshold: Option<CompactVirtualChunkOffset> = if compaction {
            self.aux.compaction_target()
        } else {
            None
        };

        let root = self.root.take();
        let result = upsert(
            &mut self.aux,
            &self.compute,
            root,
            &mut updates,
            version,
            write_to_fast,
            threshold,
            None,
        );
        let info = match result {
            Ok(info) => info,
            Err(err) => {
                // The cached root was consumed; reload it from the last
                // committed state before surfacing the failure.
                let (root, offset) = Self::load_latest_root(&mut self.aux)?;
                self.root = root;
                self.root_offset = offset;
                return Err(err);
            }
        };

        let (root, offset) = match info {
            Some(info) => (Some(info.node), info.offset),
            None => (None, INVALID_OFFSET),
        };
        self.aux.commit(version, offset)?;
        self.root = root;
        self.root_offset = offset;
        self.mem_latest = Some(version);

        if let Some(threshold) = threshold {
            self.aux.release_compacted(threshold)?;
        }
        Ok(())
    }

    /// Look up `key` (a whole-byte path) at `version` and return a cursor
    /// to its node.
    ///
    /// # Errors
    /// The find outcome kinds: not found, version evicted, or a failed
    /// read.
    pub fn find(&mut self, key: &[u8], version: i64) -> Result<NodeRef<'_>, FindError> {
        let nibbles = Nibbles::unpack(key);
        if self.is_latest(version) {
            if self.root.is_some() {
                let Self { root, aux, .. } = self;
                let root = root.as_deref().unwrap();
                return find_from(aux, NodeRef::Cached(root), nibbles.view(), version);
            }
            // A writer (or in-memory) instance with no cached root holds
            // an empty latest version. Read-only instances fall through to
            // the ring.
            if !self.aux.is_read_only() {
                return Err(FindError::KeyNotFound);
            }
        }
        let root = self.load_root_for_version(version)?;
        find_from(&mut self.aux, NodeRef::Owned(root), nibbles.view(), version)
    }

    /// Convenience over [`Db::find`]: the value bytes at `key`.
    ///
    /// # Errors
    /// As [`Db::find`]; landing on a valueless interior node is
    /// `KeyNotFound`.
    pub fn get(&mut self, key: &[u8], version: i64) -> Result<Vec<u8>, FindError> {
        let node = self.find(key, version)?;
        node.value()
            .map(<[u8]>::to_vec)
            .ok_or(FindError::KeyNotFound)
    }

    /// Pre-order `machine` over the subtrie at `cursor`. Returns `false`
    /// when the walk stopped because the version was evicted beneath it.
    ///
    /// # Errors
    /// Propagates read failures.
    pub fn traverse<M: TraverseMachine>(
        &mut self,
        cursor: &NodeRef<'_>,
        machine: &mut M,
        version: i64,
    ) -> Result<bool, FindError> {
        preorder_traverse(&mut self.aux, machine, cursor.node(), version)
    }

    /// Start a lookup that resolves through the reactor instead of
    /// blocking; drive [`Db::poll`] until the handle yields. Many lookups
    /// may be in flight at once.
    pub fn get_async(&mut self, key: &[u8], version: i64) -> AsyncGet {
        if !self.aux.is_on_disk() {
            return match self.get(key, version) {
                Ok(value) => AsyncGet::resolved(value),
                Err(err) => AsyncGet::resolved_err(err),
            };
        }
        match self.root_offset_for_version(version) {
            Ok(offset) => get_async(&mut self.aux, offset, key, version),
            Err(err) => AsyncGet::resolved_err(err),
        }
    }

    fn root_offset_for_version(&self, version: i64) -> Result<ChunkOffset, FindError> {
        let metadata = self
            .aux
            .metadata()
            .ok_or(FindError::VersionNoLongerExists)?;
        let (Some(min), Some(max)) = (metadata.min_version(), metadata.max_version()) else {
            return Err(FindError::VersionNoLongerExists);
        };
        if version < 0 || (version as u64) < min || (version as u64) > max {
            return Err(FindError::VersionNoLongerExists);
        }
        let offset = metadata.root_offset(version as u64);
        if offset.is_invalid() {
            return Err(FindError::VersionNoLongerExists);
        }
        Ok(offset)
    }

    /// Load the root node of `version`, if the version is still inside the
    /// history window and was published.
    ///
    /// # Errors
    /// [`FindError::VersionNoLongerExists`] outside the window.
    pub fn load_root_for_version(&mut self, version: i64) -> Result<Box<Node>, FindError> {
        let offset = self.root_offset_for_version(version)?;
        let node = self
            .aux
            .read_node_blocking(offset)
            .map_err(|err| FindError::Io(err.to_string()))?;
        if node.version() > version {
            // The chunk behind this version has been recycled and now
            // carries newer nodes.
            return Err(FindError::VersionNoLongerExists);
        }
        Ok(node)
    }

    /// Highest published version, or `None` on an empty database.
    #[must_use]
    pub fn get_latest_version(&self) -> Option<i64> {
        match self.aux.metadata() {
            Some(metadata) => metadata.max_version().map(|v| v as i64),
            None => self.mem_latest,
        }
    }

    /// Lowest version still inside the history window.
    #[must_use]
    pub fn get_earliest_version(&self) -> Option<i64> {
        match self.aux.metadata() {
            Some(metadata) => metadata.min_version().map(|v| v as i64),
            None => self.mem_latest,
        }
    }

    /// Publish `version` as the finalized head.
    pub fn update_finalized_version(&mut self, version: i64) {
        assert!(version >= 0, "negative versions are reserved");
        if let Some(metadata) = self.aux.metadata() {
            metadata.set_finalized_version(version as u64);
        }
    }

    /// The finalized head, if one was published.
    #[must_use]
    pub fn get_finalized_version(&self) -> Option<i64> {
        self.aux
            .metadata()
            .and_then(crate::metadata::DbMetadata::finalized_version)
            .map(|v| v as i64)
    }

    /// Drain the I/O reactor; see the engine's `poll`.
    pub fn poll(&mut self, blocking: bool, max_completions: usize) -> usize {
        self.aux.poll(blocking, max_completions)
    }

    /// The Merkle root commitment of the latest version.
    #[must_use]
    pub fn root_hash(&self) -> B256 {
        root_hash(self.root.as_deref())
    }

    /// The cached root of the latest version.
    #[must_use]
    pub fn root(&self) -> Option<&Node> {
        self.root.as_deref()
    }

    /// Disk location of the latest root; invalid for an empty or
    /// in-memory database.
    #[must_use]
    pub fn root_offset(&self) -> ChunkOffset {
        self.root_offset
    }

    /// Number of versions the history window can hold.
    #[must_use]
    pub const fn history_length() -> u64 {
        ROOT_OFFSETS_SIZE
    }

    /// Mutable access to the update context, for trie-level callers.
    pub fn aux_mut(&mut self) -> &mut UpdateAux {
        &mut self.aux
    }

    /// The fragment computation this database hashes with.
    #[must_use]
    pub fn compute(&self) -> &dyn Compute {
        &self.compute
    }

    fn is_latest(&self, version: i64) -> bool {
        self.get_latest_version() == Some(version)
    }
}
