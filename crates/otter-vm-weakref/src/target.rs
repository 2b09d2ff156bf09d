//! Weak reference target capability
//!
//! A type becomes weakly referenceable by embedding a [`WeakTargetSlot`],
//! implementing [`WeakRefTarget`], and severing the slot from
//! [`RefCounted::on_last_release`] so that no promotion can reach the object
//! once its destructor starts:
//!
//! ```
//! use otter_vm_weakref::{RefCount, RefCounted, SharedPtr, WeakRefTarget, WeakTargetSlot};
//!
//! struct Node {
//!     ref_count: RefCount,
//!     weak: WeakTargetSlot<Node>,
//!     value: i32,
//! }
//!
//! unsafe impl RefCounted for Node {
//!     fn ref_count(&self) -> &RefCount {
//!         &self.ref_count
//!     }
//!
//!     fn on_last_release(&self) {
//!         self.weak.sever();
//!     }
//! }
//!
//! unsafe impl WeakRefTarget for Node {
//!     fn weak_target_slot(&self) -> &WeakTargetSlot<Self> {
//!         &self.weak
//!     }
//! }
//!
//! let node = SharedPtr::new(Node {
//!     ref_count: RefCount::new(),
//!     weak: WeakTargetSlot::new(),
//!     value: 7,
//! });
//! let weak = node.create_weak_ref();
//! assert_eq!(weak.get_target().map(|n| n.value), Some(7));
//!
//! drop(node);
//! assert!(weak.get_target().is_none());
//! ```

use crate::lock_domain::LockDomain;
use crate::refcount::{RefCounted, SharedPtr};
use crate::weak_ref::{WeakRef, WeakRefImpl};
use std::cell::UnsafeCell;

/// Per-object state of a weak reference target: the lazily created cell.
pub struct WeakTargetSlot<T: 'static> {
    cell: UnsafeCell<Option<SharedPtr<WeakRefImpl<T>>>>,
}

// SAFETY: `cell` is only accessed under `T`'s lock domain, or through `&mut`
// in `drop`, after the target has been severed.
unsafe impl<T: Send + Sync + 'static> Send for WeakTargetSlot<T> {}
unsafe impl<T: Send + Sync + 'static> Sync for WeakTargetSlot<T> {}

impl<T: 'static> WeakTargetSlot<T> {
    /// An empty slot
    pub const fn new() -> Self {
        Self {
            cell: UnsafeCell::new(None),
        }
    }

    /// Clear the cell's pointer to the target, if a cell was ever created.
    ///
    /// Call this from [`RefCounted::on_last_release`]. Every later promotion
    /// through any handle to this target returns `None`. Idempotent.
    pub fn sever(&self) {
        LockDomain::of::<T>().call_with_lock(|| {
            // SAFETY: see the `Sync` impl.
            if let Some(cell) = unsafe { &*self.cell.get() } {
                cell.clear_target_locked();
            }
        });
    }

    /// True if a weak reference was ever created for this target.
    pub fn has_weak_refs(&self) -> bool {
        // SAFETY: see the `Sync` impl.
        LockDomain::of::<T>().call_with_lock(|| unsafe { (*self.cell.get()).is_some() })
    }
}

impl<T: 'static> Default for WeakTargetSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> Drop for WeakTargetSlot<T> {
    fn drop(&mut self) {
        // Normally severed already; dropping the cached reference is all
        // that is left to do.
        if let Some(cell) = self.cell.get_mut() {
            let severed = cell.is_severed();
            debug_assert!(severed, "weak target destroyed without severing its slot");
            if !severed {
                cell.on_target_deleted();
            }
        }
    }
}

impl<T: 'static> std::fmt::Debug for WeakTargetSlot<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeakTargetSlot")
            .field("has_weak_refs", &self.has_weak_refs())
            .finish()
    }
}

/// Reference-counted objects that can hand out [`WeakRef`]s.
///
/// # Safety
/// `weak_target_slot` must return a slot stored inside `self`, so that it is
/// dropped together with the object, and the type's
/// [`RefCounted::on_last_release`] must call [`WeakTargetSlot::sever`] on it.
/// Otherwise a promotion can observe the object while its destructor runs.
pub unsafe trait WeakRefTarget: RefCounted + Sized + 'static {
    /// The slot embedded in this object
    fn weak_target_slot(&self) -> &WeakTargetSlot<Self>;

    /// Create a weak handle to `this`.
    ///
    /// All handles to one object share a single cell, created on the first
    /// call. Taking the owning pointer guarantees the target sits at a stable
    /// heap address.
    fn create_weak_ref(this: &SharedPtr<Self>) -> WeakRef<Self> {
        let slot = this.weak_target_slot();
        let domain = LockDomain::of::<Self>();
        domain.call_with_lock(|| {
            // SAFETY: see the `Sync` impl of `WeakTargetSlot`.
            let cached = unsafe { &mut *slot.cell.get() };
            let cell = cached.get_or_insert_with(|| {
                SharedPtr::new(WeakRefImpl::new(domain, SharedPtr::as_ptr(this)))
            });
            WeakRef::new(cell.clone())
        })
    }
}

impl<T: WeakRefTarget> SharedPtr<T> {
    /// Create a weak handle to this object. See [`WeakRefTarget::create_weak_ref`].
    pub fn create_weak_ref(&self) -> WeakRef<T> {
        T::create_weak_ref(self)
    }
}
