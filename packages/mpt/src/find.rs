//! Point lookups.
//!
//! A lookup walks cached nodes for free and suspends on the first child
//! that only exists on disk; the blocking driver resumes the walk when the
//! read completes. Every descent step checks the child entry's
//! `subtrie_min_version` against the queried version, which is how reads
//! detect that the storage behind an old version has been recycled.

use std::cell::RefCell;
use std::rc::Rc;

use triedb_async::{ChunkOffset, IoEngine, IoError, PoolBuffer, Receiver};

use crate::aux::{node_read_span, parse_node_page, UpdateAux};
use crate::error::FindError;
use crate::nibbles::{Nibbles, NibblesView};
use crate::node::Node;

/// A node reached by a walk: either borrowed from the cached trie or owned
/// after a disk read.
pub enum NodeRef<'a> {
    /// Borrowed from the in-memory trie under the root.
    Cached(&'a Node),
    /// Loaded from disk during this walk.
    Owned(Box<Node>),
}

impl NodeRef<'_> {
    /// The underlying node.
    #[must_use]
    pub fn node(&self) -> &Node {
        match self {
            NodeRef::Cached(node) => node,
            NodeRef::Owned(node) => node,
        }
    }

    /// The node's value blob, if it terminates a key.
    #[must_use]
    pub fn value(&self) -> Option<&[u8]> {
        self.node().opt_value()
    }
}

/// Walk `key` from `root`, driving the reactor through any disk reads, and
/// return the terminal node.
///
/// # Errors
/// - [`FindError::KeyNotFound`] when the traversal ends with no match;
/// - [`FindError::KeyMismatch`] when a node's stored path diverges from
///   the key after matching into it, contradicting the descent that led
///   there;
/// - [`FindError::VersionNoLongerExists`] when a child entry's minimum
///   subtrie version exceeds `version`, meaning the queried version's
///   storage has been recycled;
/// - [`FindError::Io`] when a read fails.
pub fn find_blocking<'a>(
    aux: &mut UpdateAux,
    root: &'a Node,
    key: NibblesView<'_>,
    version: i64,
) -> Result<NodeRef<'a>, FindError> {
    find_from(aux, NodeRef::Cached(root), key, version)
}

/// As [`find_blocking`], but starting from an arbitrary cursor. Starting
/// from an owned root (a historical version loaded off the ring) yields an
/// owned result with no borrow of the cached trie.
///
/// # Errors
/// As [`find_blocking`].
pub fn find_from<'a>(
    aux: &mut UpdateAux,
    start: NodeRef<'a>,
    key: NibblesView<'_>,
    version: i64,
) -> Result<NodeRef<'a>, FindError> {
    let mut current = start;
    let mut consumed = 0usize;

    loop {
        let node = current.node();
        let path = node.path_nibble_view();
        let remainder = key.suffix(consumed);
        let common = remainder.common_prefix_len(&path);
        if common < path.len() {
            // Diverging at the path's first nibble is an ordinary miss;
            // diverging after matching into it means the stored path
            // contradicts the query.
            if common == 0 {
                return Err(FindError::KeyNotFound);
            }
            return Err(FindError::KeyMismatch);
        }
        consumed += path.len();

        if consumed == key.len() {
            if node.has_value() {
                return Ok(current);
            }
            return Err(FindError::KeyNotFound);
        }

        let branch = key.get(consumed);
        if !node.has_branch(branch) {
            return Err(FindError::KeyNotFound);
        }
        consumed += 1;
        let index = node.to_child_index(branch);
        if node.subtrie_min_version(index) > version {
            return Err(FindError::VersionNoLongerExists);
        }

        current = match current {
            NodeRef::Cached(node) => match node.next(index) {
                Some(child) => NodeRef::Cached(child),
                None => NodeRef::Owned(read_child(aux, node, index)?),
            },
            NodeRef::Owned(mut node) => {
                if node.next(index).is_some() {
                    NodeRef::Owned(node.move_next(index).expect("checked above"))
                } else {
                    NodeRef::Owned(read_child(aux, &node, index)?)
                }
            }
        };
    }
}

fn read_child(aux: &mut UpdateAux, node: &Node, index: usize) -> Result<Box<Node>, FindError> {
    let offset = node.fnext(index);
    if offset.is_invalid() {
        // An in-memory trie keeps every child cached; a missing pointer
        // with no disk location is a vanished subtrie.
        return Err(FindError::VersionNoLongerExists);
    }
    aux.read_node_blocking(offset)
        .map_err(|err| FindError::Io(err.to_string()))
}

/// Handle to a lookup resolving through the reactor; poll the owning
/// database until [`AsyncGet::try_take`] yields.
pub struct AsyncGet {
    slot: Rc<RefCell<Option<Result<Vec<u8>, FindError>>>>,
}

impl AsyncGet {
    pub(crate) fn resolved(value: Vec<u8>) -> Self {
        Self {
            slot: Rc::new(RefCell::new(Some(Ok(value)))),
        }
    }

    pub(crate) fn resolved_err(err: FindError) -> Self {
        Self {
            slot: Rc::new(RefCell::new(Some(Err(err)))),
        }
    }

    /// Whether the lookup has resolved.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.slot.borrow().is_some()
    }

    /// Take the outcome, if the lookup has resolved.
    pub fn try_take(&self) -> Option<Result<Vec<u8>, FindError>> {
        self.slot.borrow_mut().take()
    }
}

/// Start a lookup that resolves entirely through completions: each node on
/// the walk is one read, and the continuation re-arms itself from inside
/// the reactor until the key terminates.
pub fn get_async(
    aux: &mut UpdateAux,
    root_offset: ChunkOffset,
    key: &[u8],
    version: i64,
) -> AsyncGet {
    if root_offset.is_invalid() {
        return AsyncGet::resolved_err(FindError::VersionNoLongerExists);
    }
    let slot = Rc::new(RefCell::new(None));
    let machine = GetMachine {
        key: Nibbles::unpack(key),
        consumed: 0,
        version,
        pending: root_offset,
        slot: Rc::clone(&slot),
    };
    let (aligned, bytes) = node_read_span(root_offset);
    aux.io_mut().read(aligned, bytes, machine);
    AsyncGet { slot }
}

struct GetMachine {
    key: Nibbles,
    consumed: usize,
    version: i64,
    pending: ChunkOffset,
    slot: Rc<RefCell<Option<Result<Vec<u8>, FindError>>>>,
}

enum Step {
    Done(Vec<u8>),
    Fail(FindError),
    Descend(ChunkOffset),
}

impl GetMachine {
    fn step(&mut self, node: &Node) -> Step {
        if node.version() > self.version {
            // Recycled storage carrying newer nodes.
            return Step::Fail(FindError::VersionNoLongerExists);
        }
        let path = node.path_nibble_view();
        let remainder = self.key.view().suffix(self.consumed);
        let common = remainder.common_prefix_len(&path);
        if common < path.len() {
            // Same rule as the blocking walk: first-nibble divergence is a
            // miss, divergence inside the path is a mismatch.
            if common == 0 {
                return Step::Fail(FindError::KeyNotFound);
            }
            return Step::Fail(FindError::KeyMismatch);
        }
        self.consumed += path.len();

        if self.consumed == self.key.len() {
            return match node.opt_value() {
                Some(value) => Step::Done(value.to_vec()),
                None => Step::Fail(FindError::KeyNotFound),
            };
        }

        let branch = self.key.view().get(self.consumed);
        if !node.has_branch(branch) {
            return Step::Fail(FindError::KeyNotFound);
        }
        self.consumed += 1;
        let index = node.to_child_index(branch);
        if node.subtrie_min_version(index) > self.version {
            return Step::Fail(FindError::VersionNoLongerExists);
        }
        let offset = node.fnext(index);
        if offset.is_invalid() {
            return Step::Fail(FindError::VersionNoLongerExists);
        }
        Step::Descend(offset)
    }
}

impl Receiver for GetMachine {
    type Result = PoolBuffer;

    fn set_value(&mut self, engine: &mut IoEngine, result: Result<PoolBuffer, IoError>) {
        let buffer = match result {
            Ok(buffer) => buffer,
            Err(err) => {
                *self.slot.borrow_mut() = Some(Err(FindError::Io(err.to_string())));
                return;
            }
        };
        let node = match parse_node_page(&buffer, self.pending) {
            Ok(node) => node,
            Err(err) => {
                *self.slot.borrow_mut() = Some(Err(FindError::Io(err.to_string())));
                return;
            }
        };
        match self.step(&node) {
            Step::Done(value) => *self.slot.borrow_mut() = Some(Ok(value)),
            Step::Fail(err) => *self.slot.borrow_mut() = Some(Err(err)),
            Step::Descend(offset) => {
                let machine = GetMachine {
                    key: std::mem::take(&mut self.key),
                    consumed: self.consumed,
                    version: self.version,
                    pending: offset,
                    slot: Rc::clone(&self.slot),
                };
                let (aligned, bytes) = node_read_span(offset);
                engine.read(aligned, bytes, machine);
            }
        }
    }
}
