//! Ordered registry behind a spin lock.

use core::ptr::NonNull;

use ctx_tls_sync::Mutex;
use intrusive_collections::{Bound, RBTree, UnsafeRef};

use super::{ContextRegistry, StackGrowth};
use crate::{
    context::{ContextAdapter, ContextKey, ContextMap},
    error::{Result, TlsError},
};

/// An intrusive red-black tree of contexts protected by a [`Mutex`].
///
/// Each [`ContextMap`] carries its own tree link, so registering and
/// unregistering never allocate. The lock is only held across single tree
/// operations, and the lock itself never sleeps, so a dedicated instance may
/// be used from interrupt handlers on hosts that allow spinning there.
pub(crate) struct LockedRegistry {
    tree: Mutex<RBTree<ContextAdapter>>,
}

// SAFETY: the tree only links contexts owned by the database, and every
// access to the links goes through the lock.
unsafe impl Send for LockedRegistry {}
unsafe impl Sync for LockedRegistry {}

impl LockedRegistry {
    pub(crate) fn new() -> Self {
        Self {
            tree: Mutex::new(RBTree::new(ContextAdapter::new())),
        }
    }
}

impl Default for LockedRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn to_ptr(ctx: UnsafeRef<ContextMap>) -> NonNull<ContextMap> {
    // SAFETY: every linked context came from a `NonNull` in `insert`.
    unsafe { NonNull::new_unchecked(UnsafeRef::into_raw(ctx)) }
}

impl ContextRegistry<ContextMap> for LockedRegistry {
    fn get(&self, key: ContextKey) -> Option<NonNull<ContextMap>> {
        self.tree.lock().find(&key).clone_pointer().map(to_ptr)
    }

    /// Links `ctx`, which must be unlinked and identified by `key`.
    fn insert(&self, key: ContextKey, ctx: NonNull<ContextMap>) -> Result<()> {
        // SAFETY: the database hands in live contexts that stay in place
        // until removed.
        let ctx = unsafe { UnsafeRef::from_raw(ctx.as_ptr()) };
        debug_assert_eq!(ctx.key(), key);

        let mut tree = self.tree.lock();
        if !tree.find(&key).is_null() {
            return Err(TlsError::ContextExists(key.to_raw()));
        }
        tree.insert(ctx);
        Ok(())
    }

    fn remove(&self, key: ContextKey) -> Option<NonNull<ContextMap>> {
        self.tree.lock().find_mut(&key).remove().map(to_ptr)
    }

    fn find_nearest(&self, probe: u64, growth: StackGrowth) -> Option<(ContextKey, NonNull<ContextMap>)> {
        let tree = self.tree.lock();
        let probe = ContextKey::from_raw(probe);
        let nearest = match growth {
            StackGrowth::Downward => tree.lower_bound(Bound::Included(&probe)),
            StackGrowth::Upward => tree.upper_bound(Bound::Included(&probe)),
        };
        nearest
            .clone_pointer()
            .map(|ctx| (ctx.key(), to_ptr(ctx)))
    }

    fn drain(&self, f: &mut dyn FnMut(ContextKey, NonNull<ContextMap>)) {
        // Callbacks run without the lock held, on contexts already unlinked.
        let drained = core::mem::replace(&mut *self.tree.lock(), RBTree::new(ContextAdapter::new()));
        for ctx in drained {
            f(ctx.key(), to_ptr(ctx));
        }
    }

    fn len(&self) -> usize {
        self.tree.lock().iter().count()
    }
}
