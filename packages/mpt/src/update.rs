//! Block-level state mutations fed to `upsert`.

use crate::nibbles::Nibbles;

/// One mutation at a single version.
///
/// A `value` of `None` with an empty `next` list is a deletion. When
/// `incarnation` is set, the pre-existing subtrie at `key` is discarded
/// before the nested updates in `next` are applied; if no subtrie exists the
/// flag is silently a no-op.
#[derive(Debug, Clone)]
pub struct Update {
    /// Key nibbles, relative to the enclosing update frame.
    pub key: Nibbles,
    /// New value, or `None` to delete.
    pub value: Option<Vec<u8>>,
    /// Discard the existing subtrie at `key` before applying `next`.
    pub incarnation: bool,
    /// Nested updates keyed relative to `key`.
    pub next: Vec<Update>,
}

/// An ordered batch of updates applied at one version.
pub type UpdateList = Vec<Update>;

/// An insertion or overwrite of `key` with `value`.
#[must_use]
pub fn make_update(key: &[u8], value: impl Into<Vec<u8>>) -> Update {
    Update {
        key: Nibbles::unpack(key),
        value: Some(value.into()),
        incarnation: false,
        next: Vec::new(),
    }
}

/// A deletion of `key`.
#[must_use]
pub fn make_erase(key: &[u8]) -> Update {
    Update {
        key: Nibbles::unpack(key),
        value: None,
        incarnation: false,
        next: Vec::new(),
    }
}

/// An update that discards whatever subtrie exists at `key` and installs
/// `value` plus the nested `next` updates in its place.
#[must_use]
pub fn make_incarnation(key: &[u8], value: impl Into<Vec<u8>>, next: UpdateList) -> Update {
    Update {
        key: Nibbles::unpack(key),
        value: Some(value.into()),
        incarnation: true,
        next,
    }
}

/// Sort a batch and assert it carries no duplicate keys.
pub fn sort_updates(updates: &mut UpdateList) {
    updates.sort_by(|a, b| cmp_keys(a, b));
    for pair in updates.windows(2) {
        assert!(
            pair[0].key != pair[1].key,
            "duplicate update key {:?}",
            pair[0].key
        );
    }
}

fn cmp_keys(a: &Update, b: &Update) -> std::cmp::Ordering {
    let (ka, kb) = (a.key.view(), b.key.view());
    let max = ka.len().min(kb.len());
    for i in 0..max {
        match ka.get(i).cmp(&kb.get(i)) {
            std::cmp::Ordering::Equal => {}
            other => return other,
        }
    }
    ka.len().cmp(&kb.len())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sort_orders_by_nibble_sequence() {
        let mut batch = vec![
            make_update(&[0x20], b"c".as_slice()),
            make_update(&[0x01, 0x10], b"b".as_slice()),
            make_update(&[0x01], b"a".as_slice()),
        ];
        sort_updates(&mut batch);
        let keys: Vec<_> = batch.iter().map(|u| u.key.clone()).collect();
        assert_eq!(keys[0], Nibbles::unpack(&[0x01]));
        assert_eq!(keys[1], Nibbles::unpack(&[0x01, 0x10]));
        assert_eq!(keys[2], Nibbles::unpack(&[0x20]));
    }

    #[test]
    #[should_panic(expected = "duplicate update key")]
    fn duplicate_keys_are_rejected() {
        let mut batch = vec![
            make_update(&[0x01], b"a".as_slice()),
            make_erase(&[0x01]),
        ];
        sort_updates(&mut batch);
    }

    #[test]
    fn erase_has_no_value() {
        let erase = make_erase(&[0xab]);
        assert!(erase.value.is_none());
        assert!(erase.next.is_empty());
        assert!(!erase.incarnation);
    }
}
