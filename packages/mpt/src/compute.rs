//! Merkle proof fragment computation.
//!
//! Every node carries a precomputed fragment of the Merkle commitment, and
//! every parent stores its children's fragments verbatim, so proofs
//! assemble without re-reading subtries. Fragments are a keccak-256 digest
//! of a canonical node encoding: equal logical content yields bit-identical
//! fragments regardless of how the trie arrived at it.

use alloy_primitives::{keccak256, B256};
use smallvec::SmallVec;

use crate::nibbles::NibblesView;
use crate::node::{ChildData, Node, MAX_DATA_LEN};

/// The fragment computation plugged into upsert.
pub trait Compute {
    /// Fragment length for a node about to be composed from `children`,
    /// `path` and `value`.
    fn compute_len(
        &self,
        children: &[ChildData],
        mask: u16,
        path: NibblesView<'_>,
        value: Option<&[u8]>,
    ) -> usize;

    /// Fill the freshly composed `node`'s own fragment section.
    fn compute_branch(&self, node: &mut Node);

    /// The fragment a parent stores for `node`. Returns its length.
    fn compute(&self, out: &mut [u8; MAX_DATA_LEN], node: &Node) -> usize;
}

/// Keccak-256 commitments; every fragment is exactly 32 bytes.
#[derive(Debug, Default, Clone, Copy)]
pub struct MerkleCompute;

/// No commitments at all; used by plain trie tests that only exercise
/// structure.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCompute;

fn encode_prelude(out: &mut Vec<u8>, mask: u16, path: NibblesView<'_>, value: Option<&[u8]>) {
    out.extend_from_slice(&mask.to_le_bytes());
    out.push(path.len() as u8);
    // Nibbles re-packed from zero so parity of the stored path cannot
    // influence the commitment.
    let mut acc = 0u8;
    for i in 0..path.len() {
        if i % 2 == 0 {
            acc = path.get(i) << 4;
        } else {
            out.push(acc | path.get(i));
        }
    }
    if path.len() % 2 == 1 {
        out.push(acc);
    }
    match value {
        Some(value) => {
            out.push(1);
            out.extend_from_slice(&(value.len() as u32).to_le_bytes());
            out.extend_from_slice(value);
        }
        None => out.push(0),
    }
}

fn digest(encoding: &[u8]) -> B256 {
    keccak256(encoding)
}

impl Compute for MerkleCompute {
    fn compute_len(
        &self,
        _children: &[ChildData],
        _mask: u16,
        _path: NibblesView<'_>,
        _value: Option<&[u8]>,
    ) -> usize {
        MAX_DATA_LEN
    }

    fn compute_branch(&self, node: &mut Node) {
        let mut encoding = Vec::with_capacity(64 + node.value_len());
        encode_prelude(
            &mut encoding,
            node.mask(),
            node.path_nibble_view(),
            node.opt_value(),
        );
        for index in 0..node.number_of_children() {
            encoding.extend_from_slice(node.child_data_view(index));
        }
        let hash = digest(&encoding);
        node.set_node_data(hash.as_slice());
    }

    fn compute(&self, out: &mut [u8; MAX_DATA_LEN], node: &Node) -> usize {
        debug_assert_eq!(node.data_len(), MAX_DATA_LEN);
        out.copy_from_slice(node.node_data());
        MAX_DATA_LEN
    }
}

impl Compute for NoopCompute {
    fn compute_len(
        &self,
        _children: &[ChildData],
        _mask: u16,
        _path: NibblesView<'_>,
        _value: Option<&[u8]>,
    ) -> usize {
        0
    }

    fn compute_branch(&self, _node: &mut Node) {}

    fn compute(&self, _out: &mut [u8; MAX_DATA_LEN], _node: &Node) -> usize {
        0
    }
}

/// The 32 byte root commitment of a trie rooted at `node`, or the digest of
/// the empty encoding for a trie with no root.
#[must_use]
pub fn root_hash(node: Option<&Node>) -> B256 {
    match node {
        Some(node) if node.data_len() == MAX_DATA_LEN => B256::from_slice(node.node_data()),
        Some(node) => {
            let mut encoding: SmallVec<[u8; 64]> = SmallVec::new();
            encoding.extend_from_slice(&node.mask().to_le_bytes());
            digest(&encoding)
        }
        None => digest(&[]),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::node::make_node;

    fn make_leaf(path_bytes: &[u8], value: &[u8], compute: &dyn Compute) -> Box<Node> {
        let path = NibblesView::from_bytes(path_bytes);
        let data_len = compute.compute_len(&[], 0, path, Some(value));
        let mut node = make_node(0, &mut [], path, Some(value), data_len, 0);
        compute.compute_branch(&mut node);
        node
    }

    #[test]
    fn equal_leaves_hash_identically() {
        let a = make_leaf(&[0x12, 0x34], b"value", &MerkleCompute);
        let b = make_leaf(&[0x12, 0x34], b"value", &MerkleCompute);
        assert_eq!(a.node_data(), b.node_data());
        assert_eq!(a.node_data().len(), 32);
    }

    #[test]
    fn path_and_value_perturb_the_fragment() {
        let base = make_leaf(&[0x12, 0x34], b"value", &MerkleCompute);
        let other_path = make_leaf(&[0x12, 0x35], b"value", &MerkleCompute);
        let other_value = make_leaf(&[0x12, 0x34], b"velue", &MerkleCompute);
        assert_ne!(base.node_data(), other_path.node_data());
        assert_ne!(base.node_data(), other_value.node_data());
    }

    #[test]
    fn parent_fragment_covers_children() {
        let leaf_a = make_leaf(&[0x01], b"a", &MerkleCompute);
        let leaf_b = make_leaf(&[0x01], b"b", &MerkleCompute);

        let parent_of = |leaf: &Node| {
            let mut child = ChildData {
                branch: 0x4,
                len: 0,
                ..ChildData::default()
            };
            child.len = MerkleCompute.compute(&mut child.data, leaf) as u8;
            let mut children = [child];
            let mask = 1 << 0x4;
            let data_len =
                MerkleCompute.compute_len(&children, mask, NibblesView::empty(), None);
            let mut node = make_node(mask, &mut children, NibblesView::empty(), None, data_len, 0);
            MerkleCompute.compute_branch(&mut node);
            node
        };

        let pa = parent_of(&leaf_a);
        let pb = parent_of(&leaf_b);
        assert_ne!(pa.node_data(), pb.node_data());
    }

    #[test]
    fn noop_compute_writes_nothing() {
        let leaf = make_leaf(&[0x12], b"v", &NoopCompute);
        assert_eq!(leaf.data_len(), 0);
        assert_eq!(leaf.node_data(), b"");
    }
}
