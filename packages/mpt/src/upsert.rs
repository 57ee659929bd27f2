//! Copy-on-write batch upsert.
//!
//! A sorted batch of updates at a single version is applied recursively:
//! updates group by branch nibble, untouched siblings are reused verbatim
//! (offset, fragment and min-offset bookkeeping copied bit for bit), new
//! nodes serialize into the background write stream the moment they are
//! composed, and interior nodes that end up with a single child and no
//! value collapse into the child by path concatenation. Subtrees whose
//! min-offset bookkeeping falls inside the current compaction range are
//! rewritten into the slow ring on the way past, even when no update
//! touches them.

use triedb_async::{ChunkOffset, CompactVirtualChunkOffset};

use crate::aux::{UpdateAux, CACHE_LEVELS};
use crate::compute::Compute;
use crate::error::DbError;
use crate::nibbles::{Nibbles, NibblesView};
use crate::node::{
    calc_min_offsets, calc_min_version, make_node, make_node_from, ChildData, Node,
};
use crate::update::{sort_updates, Update, UpdateList};

/// A freshly installed root.
pub struct RootInfo {
    /// The cached root node.
    pub node: Box<Node>,
    /// Its disk location; invalid for in-memory tries.
    pub offset: ChunkOffset,
}

pub(crate) struct UpsertCtx<'a> {
    pub aux: &'a mut UpdateAux,
    pub compute: &'a dyn Compute,
    pub version: i64,
    pub write_to_fast: bool,
    pub compact_threshold_fast: Option<CompactVirtualChunkOffset>,
    pub compact_threshold_slow: Option<CompactVirtualChunkOffset>,
}

/// One update with its progress through the key, so nested update frames
/// (whose keys are relative to their parent's) walk the same recursion.
#[derive(Clone, Copy)]
struct Ref<'a> {
    upd: &'a Update,
    off: usize,
}

impl<'a> Ref<'a> {
    fn remainder(&self) -> NibblesView<'a> {
        self.upd.key.view().suffix(self.off)
    }
}

enum OldSource {
    Mem(Box<Node>),
    Disk(ChunkOffset),
}

/// Apply a sorted batch at `version` over `root`, returning the new root,
/// or `None` when the batch empties the trie.
///
/// # Errors
/// Propagates read and append failures; the old root stays valid.
pub fn upsert(
    aux: &mut UpdateAux,
    compute: &dyn Compute,
    root: Option<Box<Node>>,
    updates: &mut UpdateList,
    version: i64,
    write_to_fast: bool,
    compact_threshold_fast: Option<CompactVirtualChunkOffset>,
    compact_threshold_slow: Option<CompactVirtualChunkOffset>,
) -> Result<Option<RootInfo>, DbError> {
    sort_updates(updates);
    let mut ctx = UpsertCtx {
        aux,
        compute,
        version,
        write_to_fast,
        compact_threshold_fast,
        compact_threshold_slow,
    };
    let refs: Vec<Ref<'_>> = updates.iter().map(|upd| Ref { upd, off: 0 }).collect();
    let old = root.map(OldSource::Mem);
    let result = apply(&mut ctx, old, refs, 0, false)?;
    Ok(result.map(|mut cd| RootInfo {
        node: cd.ptr.take().expect("the root is always cached"),
        offset: cd.offset,
    }))
}

/// Convenience used by structural tests: build, sort and apply a batch
/// without compaction.
///
/// # Errors
/// As [`upsert`].
pub fn upsert_updates(
    aux: &mut UpdateAux,
    compute: &dyn Compute,
    root: Option<Box<Node>>,
    updates: impl IntoIterator<Item = Update>,
    version: i64,
) -> Result<Option<RootInfo>, DbError> {
    let mut updates: UpdateList = updates.into_iter().collect();
    upsert(
        aux,
        compute,
        root,
        &mut updates,
        version,
        true,
        None,
        None,
    )
}

fn apply(
    ctx: &mut UpsertCtx<'_>,
    old: Option<OldSource>,
    refs: Vec<Ref<'_>>,
    depth: usize,
    compact: bool,
) -> Result<Option<ChildData>, DbError> {
    let node = match old {
        None => return build_fresh(ctx, refs, depth),
        Some(OldSource::Mem(node)) => node,
        Some(OldSource::Disk(offset)) => ctx.aux.read_node_blocking(offset)?,
    };

    let path = node.path_nibble_view().to_owned_nibbles();
    let mut split = path.len();
    for r in &refs {
        split = split.min(path.view().common_prefix_len(&r.remainder()));
    }
    if split < path.len() {
        split_node(ctx, node, &path, refs, split, depth)
    } else {
        descend(ctx, node, &path, refs, depth, compact)
    }
}

/// Per-node grouping of refs once `cut` further nibbles are consumed:
/// the terminal update (if any) plus per-branch continuation groups.
struct Grouped<'a> {
    terminal_value: Option<Option<Vec<u8>>>,
    incarnation: bool,
    groups: [Vec<Ref<'a>>; 16],
}

fn group_refs<'a>(refs: Vec<Ref<'a>>, cut: usize) -> Grouped<'a> {
    let mut grouped = Grouped {
        terminal_value: None,
        incarnation: false,
        groups: std::array::from_fn(|_| Vec::new()),
    };
    for r in refs {
        let rem = r.remainder();
        debug_assert!(rem.len() >= cut);
        if rem.len() == cut {
            assert!(
                grouped.terminal_value.is_none(),
                "two updates terminate at the same node"
            );
            grouped.terminal_value = Some(r.upd.value.clone());
            grouped.incarnation = r.upd.incarnation;
            for child in &r.upd.next {
                assert!(!child.key.is_empty(), "nested update with an empty key");
                let nibble = child.key.view().get(0);
                grouped.groups[nibble as usize].push(Ref { upd: child, off: 1 });
            }
        } else {
            let nibble = rem.get(cut);
            grouped.groups[nibble as usize].push(Ref {
                upd: r.upd,
                off: r.off + cut + 1,
            });
        }
    }
    grouped
}

fn build_fresh(
    ctx: &mut UpsertCtx<'_>,
    refs: Vec<Ref<'_>>,
    depth: usize,
) -> Result<Option<ChildData>, DbError> {
    // Deletions against nothing are no-ops, as is an incarnation with no
    // pre-existing subtrie.
    let refs: Vec<Ref<'_>> = refs
        .into_iter()
        .filter(|r| r.upd.value.is_some() || !r.upd.next.is_empty())
        .collect();
    let Some(first) = refs.first() else {
        return Ok(None);
    };

    let mut cut = first.remainder().len();
    for r in &refs {
        cut = cut.min(first.remainder().common_prefix_len(&r.remainder()));
    }
    let path = first.remainder().prefix(cut).to_owned_nibbles();
    let grouped = group_refs(refs, cut);
    let value = grouped.terminal_value.unwrap_or(None);
    let mut children: Vec<ChildData> = Vec::new();
    let mut groups = grouped.groups;
    for branch in 0..16u8 {
        let group = std::mem::take(&mut groups[branch as usize]);
        if group.is_empty() {
            continue;
        }
        if let Some(mut cd) = apply(ctx, None, group, depth + 1, false)? {
            cd.branch = branch;
            children.push(cd);
        }
    }
    compose_from_children(ctx, &path, value, children, depth, false)
}

fn descend(
    ctx: &mut UpsertCtx<'_>,
    mut node: Box<Node>,
    path: &Nibbles,
    refs: Vec<Ref<'_>>,
    depth: usize,
    compact: bool,
) -> Result<Option<ChildData>, DbError> {
    let grouped = group_refs(refs, path.len());
    let value = match &grouped.terminal_value {
        Some(new_value) => new_value.clone(),
        None => node.opt_value().map(<[u8]>::to_vec),
    };
    let drop_old_children = grouped.incarnation;

    let mut children: Vec<ChildData> = Vec::new();
    let mut groups = grouped.groups;
    for branch in 0..16u8 {
        let group = std::mem::take(&mut groups[branch as usize]);
        let old_has = node.has_branch(branch) && !drop_old_children;
        if old_has {
            let index = node.to_child_index(branch);
            if group.is_empty() {
                if child_in_compact_range(ctx, &node, index) {
                    // Still-live but old; migrate it forward.
                    let source = child_source(&mut node, index);
                    if let Some(mut cd) = apply(ctx, Some(source), Vec::new(), depth + 1, true)? {
                        cd.branch = branch;
                        children.push(cd);
                    }
                } else {
                    children.push(reuse_child(&mut node, branch));
                }
            } else {
                let source = child_source(&mut node, index);
                if let Some(mut cd) = apply(ctx, Some(source), group, depth + 1, false)? {
                    cd.branch = branch;
                    children.push(cd);
                }
            }
        } else if !group.is_empty() {
            if let Some(mut cd) = apply(ctx, None, group, depth + 1, false)? {
                cd.branch = branch;
                children.push(cd);
            }
        }
    }

    compose_from_children(ctx, path, value, children, depth, compact)
}

fn split_node(
    ctx: &mut UpsertCtx<'_>,
    mut node: Box<Node>,
    path: &Nibbles,
    refs: Vec<Ref<'_>>,
    split: usize,
    depth: usize,
) -> Result<Option<ChildData>, DbError> {
    let old_branch = path.view().get(split);
    let old_value = node.opt_value().map(<[u8]>::to_vec);
    let suffix = path.view().suffix(split + 1).to_owned_nibbles();
    let shortened = make_node_from(&mut node, suffix.view(), old_value.as_deref(), ctx.version);
    drop(node);
    let mut shortened = Some(shortened);

    let grouped = group_refs(refs, split);
    let value = grouped.terminal_value.unwrap_or(None);
    let incarnation = grouped.incarnation;

    let mut children: Vec<ChildData> = Vec::new();
    let mut groups = grouped.groups;
    for branch in 0..16u8 {
        let group = std::mem::take(&mut groups[branch as usize]);
        if branch == old_branch && !incarnation {
            let old = shortened.take().expect("the old branch is visited once");
            let result = if group.is_empty() {
                // The path-shortened old node needs no further descent,
                // only a rewrite at this version.
                finalize_node(ctx, old, depth + 1, false)
            } else {
                apply(ctx, Some(OldSource::Mem(old)), group, depth + 1, false)
            };
            if let Some(mut cd) = result? {
                cd.branch = branch;
                children.push(cd);
            }
        } else if !group.is_empty() {
            if let Some(mut cd) = apply(ctx, None, group, depth + 1, false)? {
                cd.branch = branch;
                children.push(cd);
            }
        }
    }

    let new_path = path.view().prefix(split).to_owned_nibbles();
    compose_from_children(ctx, &new_path, value, children, depth, false)
}

fn child_source(node: &mut Node, index: usize) -> OldSource {
    match node.move_next(index) {
        Some(child) => OldSource::Mem(child),
        None => OldSource::Disk(node.fnext(index)),
    }
}

fn reuse_child(node: &mut Node, branch: u8) -> ChildData {
    ChildData::copy_old_child(node, branch)
}

fn child_in_compact_range(ctx: &UpsertCtx<'_>, node: &Node, index: usize) -> bool {
    let fast = node.min_offset_fast(index);
    let slow = node.min_offset_slow(index);
    ctx.compact_threshold_fast
        .is_some_and(|threshold| !fast.is_invalid() && fast <= threshold)
        || ctx
            .compact_threshold_slow
            .is_some_and(|threshold| !slow.is_invalid() && slow <= threshold)
}

fn compose_from_children(
    ctx: &mut UpsertCtx<'_>,
    path: &Nibbles,
    value: Option<Vec<u8>>,
    mut children: Vec<ChildData>,
    depth: usize,
    to_slow: bool,
) -> Result<Option<ChildData>, DbError> {
    match (children.len(), &value) {
        (0, None) => Ok(None),
        (1, None) => {
            // One child and no value cannot rest; collapse by path
            // concatenation.
            let mut child = children.pop().expect("one child present");
            let mut child_node = match child.ptr.take() {
                Some(node) => node,
                None => ctx.aux.read_node_blocking(child.offset)?,
            };
            let child_value = child_node.opt_value().map(<[u8]>::to_vec);
            let child_path = child_node.path_nibble_view().to_owned_nibbles();
            let joined = Nibbles::concat(path.view(), child.branch, child_path.view());
            let rewritten = make_node_from(
                &mut child_node,
                joined.view(),
                child_value.as_deref(),
                ctx.version,
            );
            finalize_node(ctx, rewritten, depth, to_slow)
        }
        _ => {
            let mut mask: u16 = 0;
            for child in &children {
                mask |= 1 << child.branch;
            }
            let data_size =
                ctx.compute
                    .compute_len(&children, mask, path.view(), value.as_deref());
            let node = make_node(
                mask,
                &mut children,
                path.view(),
                value.as_deref(),
                data_size,
                ctx.version,
            );
            finalize_node(ctx, node, depth, to_slow)
        }
    }
}

fn finalize_node(
    ctx: &mut UpsertCtx<'_>,
    mut node: Box<Node>,
    depth: usize,
    to_slow: bool,
) -> Result<Option<ChildData>, DbError> {
    ctx.compute.compute_branch(&mut node);
    let to_fast = ctx.write_to_fast && !to_slow;
    let (offset, virtual_offset) = ctx.aux.write_node(&node, to_fast)?;

    let (mut min_fast, mut min_slow) = calc_min_offsets(&node);
    if !virtual_offset.is_invalid() {
        if to_fast {
            min_fast = min_fast.min(virtual_offset);
        } else {
            min_slow = min_slow.min(virtual_offset);
        }
    }
    let subtrie_min_version = calc_min_version(&node);

    let mut cd = ChildData {
        offset,
        min_offset_fast: min_fast,
        min_offset_slow: min_slow,
        subtrie_min_version,
        ..ChildData::default()
    };
    cd.len = ctx.compute.compute(&mut cd.data, &node) as u8;
    cd.cache_node = !ctx.aux.is_on_disk() || depth < CACHE_LEVELS;
    // Children one level past the cache window are released now that this
    // node's record is buffered; the node itself always travels up in
    // memory, since the parent may still need it for a collapse before its
    // bytes are readable.
    if ctx.aux.is_on_disk() && depth + 1 >= CACHE_LEVELS {
        for index in 0..node.number_of_children() {
            node.set_next(index, None);
        }
    }
    cd.ptr = Some(node);
    Ok(Some(cd))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::compute::{MerkleCompute, NoopCompute};
    use crate::error::FindError;
    use crate::find::find_blocking;
    use crate::update::{make_erase, make_update};

    fn noop_upsert(
        aux: &mut UpdateAux,
        root: Option<Box<Node>>,
        updates: impl IntoIterator<Item = Update>,
        version: i64,
    ) -> Option<RootInfo> {
        upsert_updates(aux, &NoopCompute, root, updates, version).unwrap()
    }

    fn value_at(aux: &mut UpdateAux, root: &Node, key: &[u8], version: i64) -> Vec<u8> {
        find_blocking(aux, root, Nibbles::unpack(key).view(), version)
            .unwrap()
            .value()
            .expect("terminal node has a value")
            .to_vec()
    }

    #[test]
    fn leaf_nodes_persist() {
        let mut aux = UpdateAux::in_memory();
        let root = noop_upsert(
            &mut aux,
            None,
            [
                make_update(&[0x11], Vec::new()),
                make_update(&[0x11, 0x11], Vec::new()),
                make_update(&[0x11, 0x22], Vec::new()),
            ],
            0,
        )
        .unwrap();
        assert_eq!(root.node.mask(), 0b110);

        let root = noop_upsert(
            &mut aux,
            Some(root.node),
            [make_erase(&[0x11, 0x11])],
            1,
        )
        .unwrap();
        assert_eq!(root.node.mask(), 0b100);
    }

    #[test]
    fn var_length_keys_build_the_expected_shape() {
        let kv: Vec<(Vec<u8>, Vec<u8>)> = vec![
            (vec![0x01, 0x11, 0x11, 0x11], vec![0xde, 0xad]),
            (vec![0x11, 0x11, 0x11, 0x11], vec![0xbe, 0xef]),
            (
                vec![0x11, 0x11, 0x11, 0x11, 0xaa, 0xaa],
                vec![0xde, 0xaf, 0xbe, 0xef],
            ),
            (vec![0x11, 0x11, 0x11, 0x11, 0xaa, 0xcd], vec![0xab, 0xcd]),
        ];
        let mut aux = UpdateAux::in_memory();
        let root = noop_upsert(
            &mut aux,
            None,
            kv.iter()
                .map(|(k, v)| make_update(k, v.clone()))
                .collect::<Vec<_>>(),
            0,
        )
        .unwrap();

        for (k, v) in &kv {
            assert_eq!(&value_at(&mut aux, &root.node, k, 0), v);
        }

        let node = &root.node;
        assert_eq!(node.mask(), 0b11);
        assert_eq!(node.value_len(), 0);
        assert_eq!(node.path_nibbles_len(), 0);

        let node0 = node.next(0).unwrap();
        assert_eq!(node0.mask(), 0);
        assert_eq!(
            node0.path_nibble_view(),
            NibblesView::new(1, 8, &kv[0].0)
        );
        assert_eq!(node0.value(), kv[0].1.as_slice());

        let node1 = node.next(1).unwrap();
        assert_eq!(node1.mask(), 1 << 0xa);
        assert_eq!(
            node1.path_nibble_view(),
            NibblesView::new(1, 8, &kv[1].0)
        );
        assert_eq!(node1.value(), kv[1].1.as_slice());

        let node1aa = node1.next(0).unwrap();
        assert_eq!(node1aa.mask(), (1 << 0xa) | (1 << 0xc));
        assert_eq!(
            node1aa.path_nibble_view(),
            NibblesView::new(9, 10, &kv[3].0)
        );
        assert_eq!(node1aa.path_bytes(), 1);
        assert_eq!(node1aa.value_len(), 0);

        let node1aaaa = node1aa.next(0).unwrap();
        let node1aacd = node1aa.next(1).unwrap();
        assert_eq!(node1aaaa.mask(), 0);
        assert_eq!(
            node1aaaa.path_nibble_view(),
            NibblesView::new(11, 12, &kv[2].0)
        );
        assert_eq!(node1aaaa.value(), kv[2].1.as_slice());
        assert_eq!(node1aacd.mask(), 0);
        assert_eq!(node1aacd.value(), kv[3].1.as_slice());
    }

    #[test]
    fn overwrite_keeps_siblings_shared() {
        let mut aux = UpdateAux::in_memory();
        let root = noop_upsert(
            &mut aux,
            None,
            [
                make_update(&[0x12, 0x34], b"a".as_slice()),
                make_update(&[0x12, 0x44], b"b".as_slice()),
            ],
            0,
        )
        .unwrap();
        let root = noop_upsert(
            &mut aux,
            Some(root.node),
            [make_update(&[0x12, 0x34], b"a2".as_slice())],
            1,
        )
        .unwrap();
        assert_eq!(value_at(&mut aux, &root.node, &[0x12, 0x34], 1), b"a2");
        assert_eq!(value_at(&mut aux, &root.node, &[0x12, 0x44], 1), b"b");
        // The untouched sibling keeps its original version.
        let idx = root.node.to_child_index(0x4);
        assert_eq!(root.node.subtrie_min_version(idx), 0);
        assert_eq!(calc_min_version(&root.node), 0);
    }

    #[test]
    fn delete_collapses_one_child_interiors() {
        let mut aux = UpdateAux::in_memory();
        let keys: [&[u8]; 3] = [&[0x12, 0x34], &[0x12, 0x38], &[0x56, 0x78]];
        let root = noop_upsert(
            &mut aux,
            None,
            keys.iter().map(|k| make_update(k, b"v".as_slice())),
            0,
        )
        .unwrap();

        // Deleting one of the two keys under 0x123 must collapse the
        // interior node into its surviving child.
        let root = noop_upsert(&mut aux, Some(root.node), [make_erase(&[0x12, 0x38])], 1)
            .unwrap();
        assert_eq!(value_at(&mut aux, &root.node, &[0x12, 0x34], 1), b"v");
        assert_eq!(value_at(&mut aux, &root.node, &[0x56, 0x78], 1), b"v");

        fn assert_no_single_child_interiors(node: &Node) {
            assert!(
                node.number_of_children() != 1 || node.has_value(),
                "one-child interior without a value survived a delete"
            );
            for i in 0..node.number_of_children() {
                if let Some(child) = node.next(i) {
                    assert_no_single_child_interiors(child);
                }
            }
        }
        assert_no_single_child_interiors(&root.node);
    }

    #[test]
    fn delete_last_key_empties_the_trie() {
        let mut aux = UpdateAux::in_memory();
        let root = noop_upsert(&mut aux, None, [make_update(&[0xab], b"x".as_slice())], 0)
            .unwrap();
        let gone = noop_upsert(&mut aux, Some(root.node), [make_erase(&[0xab])], 1);
        assert!(gone.is_none());
    }

    #[test]
    fn incarnation_discards_the_old_subtrie() {
        let mut aux = UpdateAux::in_memory();
        let root = noop_upsert(
            &mut aux,
            None,
            [
                make_update(&[0x12, 0x34], b"old-a".as_slice()),
                make_update(&[0x12, 0x56], b"old-b".as_slice()),
            ],
            0,
        )
        .unwrap();

        let incarnated = Update {
            key: Nibbles::unpack(&[0x12]),
            value: Some(b"account".to_vec()),
            incarnation: true,
            next: vec![make_update(&[0x99], b"fresh".as_slice())],
        };
        let root = noop_upsert(&mut aux, Some(root.node), [incarnated], 1).unwrap();

        assert_eq!(value_at(&mut aux, &root.node, &[0x12], 1), b"account");
        assert_eq!(value_at(&mut aux, &root.node, &[0x12, 0x99], 1), b"fresh");
        let old = find_blocking(
            &mut aux,
            &root.node,
            Nibbles::unpack(&[0x12, 0x34]).view(),
            1,
        );
        assert!(old.is_err());
    }

    #[test]
    fn incarnated_subtrie_turns_old_keys_into_mismatches() {
        let mut aux = UpdateAux::in_memory();
        let account = Update {
            key: Nibbles::unpack(&[0x11, 0x11]),
            value: Some(b"acct".to_vec()),
            incarnation: false,
            next: vec![make_update(&[0xaa, 0xaa], b"old".as_slice())],
        };
        let root = noop_upsert(&mut aux, None, [account], 0).unwrap();
        assert_eq!(
            value_at(&mut aux, &root.node, &[0x11, 0x11, 0xaa, 0xaa], 0),
            b"old"
        );

        // Re-create the account with a different slot; the surviving leaf's
        // path now contradicts the old slot's key partway through.
        let reborn = Update {
            key: Nibbles::unpack(&[0x11, 0x11]),
            value: Some(b"acct2".to_vec()),
            incarnation: true,
            next: vec![make_update(&[0xaa, 0xcd], b"new".as_slice())],
        };
        let root = noop_upsert(&mut aux, Some(root.node), [reborn], 1).unwrap();

        let old_slot = find_blocking(
            &mut aux,
            &root.node,
            Nibbles::unpack(&[0x11, 0x11, 0xaa, 0xaa]).view(),
            1,
        );
        assert!(matches!(old_slot, Err(FindError::KeyMismatch)));

        // Diverging at a path's first nibble stays an ordinary miss.
        let stranger = find_blocking(
            &mut aux,
            &root.node,
            Nibbles::unpack(&[0x99, 0x99, 0x00, 0x00]).view(),
            1,
        );
        assert!(matches!(stranger, Err(FindError::KeyNotFound)));
    }

    #[test]
    fn incarnation_with_no_subtrie_is_a_noop() {
        let mut aux = UpdateAux::in_memory();
        let incarnated = Update {
            key: Nibbles::unpack(&[0x12]),
            value: Some(b"v".to_vec()),
            incarnation: true,
            next: Vec::new(),
        };
        let root = noop_upsert(&mut aux, None, [incarnated], 0).unwrap();
        assert_eq!(value_at(&mut aux, &root.node, &[0x12], 0), b"v");
    }

    #[test]
    fn same_content_same_merkle_root_across_orders() {
        let kv: [(&[u8], &[u8]); 3] = [
            (&[0x12, 0x34], b"a"),
            (&[0x12, 0x44], b"b"),
            (&[0x99, 0x00], b"c"),
        ];
        // One batch, sorted one way.
        let mut aux = UpdateAux::in_memory();
        let root_a = upsert_updates(
            &mut aux,
            &MerkleCompute,
            None,
            kv.iter().map(|(k, v)| make_update(k, v.to_vec())),
            0,
        )
        .unwrap()
        .unwrap();

        // Two batches arriving in a different order.
        let mut aux = UpdateAux::in_memory();
        let root_b = upsert_updates(
            &mut aux,
            &MerkleCompute,
            None,
            [make_update(kv[2].0, kv[2].1.to_vec())],
            0,
        )
        .unwrap();
        let root_b = upsert_updates(
            &mut aux,
            &MerkleCompute,
            root_b.map(|r| r.node),
            [
                make_update(kv[1].0, kv[1].1.to_vec()),
                make_update(kv[0].0, kv[0].1.to_vec()),
            ],
            1,
        )
        .unwrap()
        .unwrap();

        assert_eq!(root_a.node.node_data(), root_b.node.node_data());
    }

    #[test]
    fn on_disk_roundtrip_after_dropping_the_cache() {
        use crate::config::OnDiskDbConfig;
        let dir = tempfile::tempdir().unwrap();
        let config = OnDiskDbConfig {
            truncate: true,
            chunk_capacity: 1 << 20,
            chunk_count: 4,
            compaction: false,
            ..OnDiskDbConfig::new(vec![dir.path().to_path_buf()])
        };
        let mut aux = UpdateAux::open(&config).unwrap();
        let root = upsert_updates(
            &mut aux,
            &MerkleCompute,
            None,
            [
                make_update(&[0x01, 0x11, 0x11, 0x11], vec![0xde, 0xad]),
                make_update(&[0x11, 0x11, 0x11, 0x11], vec![0xbe, 0xef]),
            ],
            0,
        )
        .unwrap()
        .unwrap();
        aux.flush().unwrap();

        // Reload the root from disk so every walk goes through reads.
        let reloaded = aux.read_node_blocking(root.offset).unwrap();
        assert!(reloaded.next(0).is_none());
        assert_eq!(
            value_at(&mut aux, &reloaded, &[0x01, 0x11, 0x11, 0x11], 0),
            vec![0xde, 0xad]
        );
        assert_eq!(
            value_at(&mut aux, &reloaded, &[0x11, 0x11, 0x11, 0x11], 0),
            vec![0xbe, 0xef]
        );
    }
}
