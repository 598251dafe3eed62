//! # TLS keys
//!
//! Keys are plain 64-bit identifiers shared by every context. The key space
//! is split in three ranges:
//!
//! | Range | Kind | Issued by |
//! |---|---|---|
//! | `0..KEY_DYNAMIC_START` | reserved | agreed upon out-of-band |
//! | `KEY_DYNAMIC_START..KEY_TAG_START` | dynamic | [`TlsDatabase::alloc_key`] |
//! | `KEY_TAG_START..` | tag | derived by callers from their own identifiers |
//!
//! Dynamic keys are only valid once issued; reserved and tag keys are always
//! valid.
//!
//! [`TlsDatabase::alloc_key`]: crate::TlsDatabase::alloc_key

use core::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use static_assertions::const_assert;

/// First key handed out by the dynamic key counter.
pub const KEY_DYNAMIC_START: u64 = 16;

/// First tag key. Tag keys never collide with dynamic keys.
pub const KEY_TAG_START: u64 = 1 << 63;

const_assert!(KEY_DYNAMIC_START < KEY_TAG_START);

/// Identifier of a TLS entry, shared by all contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct TlsKey(u64);

impl TlsKey {
    /// Wraps a raw key value without checking which range it falls in.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw key value.
    pub const fn to_raw(self) -> u64 {
        self.0
    }

    /// The `index`-th reserved key, or `None` past the reserved range.
    pub const fn reserved(index: u64) -> Option<Self> {
        if index < KEY_DYNAMIC_START {
            Some(Self(index))
        } else {
            None
        }
    }

    /// A tag key derived from `tag`. The top bit of `tag` is ignored.
    pub const fn tag(tag: u64) -> Self {
        Self(KEY_TAG_START | tag)
    }

    /// Whether this is a reserved key.
    pub const fn is_reserved(self) -> bool {
        self.0 < KEY_DYNAMIC_START
    }

    /// Whether this is a tag key.
    pub const fn is_tag(self) -> bool {
        self.0 >= KEY_TAG_START
    }

    /// Whether this key lies in the dynamic range.
    pub const fn is_dynamic(self) -> bool {
        !self.is_reserved() && !self.is_tag()
    }
}

impl fmt::Display for TlsKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Monotonic source of dynamic keys.
#[derive(Debug)]
pub(crate) struct KeyCounter {
    next: AtomicU64,
}

impl KeyCounter {
    pub(crate) const fn new() -> Self {
        Self {
            next: AtomicU64::new(KEY_DYNAMIC_START),
        }
    }

    /// Issues the next dynamic key.
    pub(crate) fn issue(&self) -> TlsKey {
        TlsKey(self.next.fetch_add(1, Ordering::AcqRel))
    }

    /// Whether `key` is reserved, a tag, or a dynamic key issued so far.
    pub(crate) fn accepts(&self, key: TlsKey) -> bool {
        !key.is_dynamic() || key.0 < self.next.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeSet, sync::Arc, thread, vec::Vec};

    use super::{KEY_DYNAMIC_START, KeyCounter, TlsKey};

    #[test]
    fn test_ranges_do_not_overlap() {
        let reserved = TlsKey::reserved(3).unwrap();
        assert!(reserved.is_reserved() && !reserved.is_dynamic() && !reserved.is_tag());
        assert!(TlsKey::reserved(KEY_DYNAMIC_START).is_none());

        let tag = TlsKey::tag(0xdead);
        assert!(tag.is_tag() && !tag.is_dynamic() && !tag.is_reserved());

        assert!(TlsKey::from_raw(KEY_DYNAMIC_START).is_dynamic());
    }

    #[test]
    fn test_only_issued_dynamic_keys_are_accepted() {
        let keys = KeyCounter::new();
        assert!(keys.accepts(TlsKey::reserved(0).unwrap()));
        assert!(keys.accepts(TlsKey::tag(1)));
        assert!(!keys.accepts(TlsKey::from_raw(KEY_DYNAMIC_START)));

        let first = keys.issue();
        assert_eq!(first.to_raw(), KEY_DYNAMIC_START);
        assert!(keys.accepts(first));
        assert!(!keys.accepts(TlsKey::from_raw(KEY_DYNAMIC_START + 1)));
    }

    #[test]
    fn test_concurrent_issue_never_repeats() {
        let keys = Arc::new(KeyCounter::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let keys = Arc::clone(&keys);
                thread::spawn(move || (0..500).map(|_| keys.issue()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = BTreeSet::new();
        for handle in handles {
            for key in handle.join().unwrap() {
                assert!(seen.insert(key), "key {key} issued twice");
            }
        }
        assert_eq!(seen.len(), 2_000);
    }
}
