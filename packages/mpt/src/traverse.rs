//! Client-driven pre-order traversal.
//!
//! The caller supplies a [`TraverseMachine`]; the engine pre-orders the
//! trie, prunes wherever `should_visit` declines a branch, and clones the
//! machine at each split so independent subtrees observe independent
//! machine state.

use std::cell::RefCell;
use std::rc::Rc;

use crate::aux::UpdateAux;
use crate::error::FindError;
use crate::nibbles::Nibbles;
use crate::node::{Node, INVALID_BRANCH};

/// A traversal state machine.
pub trait TraverseMachine: Clone {
    /// Entering `node` under `branch` ([`INVALID_BRANCH`] for the root).
    /// Return `false` to skip the subtree below it.
    fn down(&mut self, branch: u8, node: &Node) -> bool;

    /// Leaving `node`; runs after every visited child has completed.
    fn up(&mut self, branch: u8, node: &Node);

    /// Whether to descend `branch` of `node` at all.
    fn should_visit(&self, _node: &Node, _branch: u8) -> bool {
        true
    }
}

/// Pre-order `machine` over the subtrie rooted at `node`. Returns `false`
/// when the walk had to stop because `version` was evicted from under it.
///
/// # Errors
/// Propagates read failures.
pub fn preorder_traverse<M: TraverseMachine>(
    aux: &mut UpdateAux,
    machine: &mut M,
    node: &Node,
    version: i64,
) -> Result<bool, FindError> {
    traverse_impl(aux, machine, node, INVALID_BRANCH, version)
}

fn traverse_impl<M: TraverseMachine>(
    aux: &mut UpdateAux,
    machine: &mut M,
    node: &Node,
    branch: u8,
    version: i64,
) -> Result<bool, FindError> {
    if !machine.down(branch, node) {
        return Ok(true);
    }
    for child_branch in 0..16u8 {
        if !node.has_branch(child_branch) {
            continue;
        }
        if !machine.should_visit(node, child_branch) {
            continue;
        }
        let index = node.to_child_index(child_branch);
        if node.subtrie_min_version(index) > version {
            return Ok(false);
        }
        let mut cloned = machine.clone();
        let complete = match node.next(index) {
            Some(child) => traverse_impl(aux, &mut cloned, child, child_branch, version)?,
            None => {
                let offset = node.fnext(index);
                if offset.is_invalid() {
                    return Ok(false);
                }
                let child = aux
                    .read_node_blocking(offset)
                    .map_err(|err| FindError::Io(err.to_string()))?;
                traverse_impl(aux, &mut cloned, &child, child_branch, version)?
            }
        };
        if !complete {
            return Ok(false);
        }
    }
    machine.up(branch, node);
    Ok(true)
}

/// A machine that collects every `(key, value)` pair under the traversal
/// root, reconstructing keys from branch nibbles and node paths. Clones
/// share the sink; each clone carries its own key prefix.
#[derive(Clone)]
pub struct LeafCollector {
    prefix: Nibbles,
    sink: Rc<RefCell<Vec<(Nibbles, Vec<u8>)>>>,
}

impl LeafCollector {
    /// A collector feeding `sink`.
    #[must_use]
    pub fn new(sink: Rc<RefCell<Vec<(Nibbles, Vec<u8>)>>>) -> Self {
        Self {
            prefix: Nibbles::new(),
            sink,
        }
    }
}

impl TraverseMachine for LeafCollector {
    fn down(&mut self, branch: u8, node: &Node) -> bool {
        if branch != INVALID_BRANCH {
            self.prefix.push(branch);
        }
        self.prefix.extend_from_view(node.path_nibble_view());
        if node.has_value() {
            self.sink
                .borrow_mut()
                .push((self.prefix.clone(), node.value().to_vec()));
        }
        true
    }

    fn up(&mut self, _branch: u8, _node: &Node) {}
}
