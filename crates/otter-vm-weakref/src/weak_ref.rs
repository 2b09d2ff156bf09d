//! Weak reference cells and handles.
//!
//! A `WeakRefImpl` is the control block shared by every weak handle to one
//! target. It holds a raw pointer that does NOT keep the target alive; the
//! target severs it from [`RefCounted::on_last_release`], before its
//! destructor runs.
//!
//! The cell type itself is internal; only [`WeakRef`] is exposed:
//!
//! ```compile_fail
//! use otter_vm_weakref::weak_ref::WeakRefImpl;
//! ```

use crate::lock_domain::LockDomain;
use crate::refcount::{AddRefScope, RefCount, RefCounted, SharedPtr};
use std::cell::Cell;
use std::ptr::NonNull;

/// Control block holding the (possibly cleared) pointer to a weak target.
pub(crate) struct WeakRefImpl<T: 'static> {
    ref_count: RefCount,
    /// `T`'s lock domain, looked up once when the cell is created.
    domain: &'static LockDomain,
    /// Raw pointer to the target (NOT counted, hence weak). Null once severed.
    target: Cell<*const T>,
}

// SAFETY: `target` is only read or written while holding `domain`'s lock.
unsafe impl<T: Send + Sync + 'static> Send for WeakRefImpl<T> {}
unsafe impl<T: Send + Sync + 'static> Sync for WeakRefImpl<T> {}

// SAFETY: `ref_count` is a plain field of the cell.
unsafe impl<T: 'static> RefCounted for WeakRefImpl<T> {
    fn ref_count(&self) -> &RefCount {
        &self.ref_count
    }
}

impl<T: 'static> WeakRefImpl<T> {
    /// Must be called under `domain`'s lock, which must be `T`'s.
    pub(crate) fn new(domain: &'static LockDomain, target: *const T) -> Self {
        domain.record_cell_created();

        #[cfg(feature = "weak_logging")]
        tracing::trace!(target: "otter::weak", type_name = domain.type_name(), "Weak cell created");

        Self {
            ref_count: RefCount::new(),
            domain,
            target: Cell::new(target),
        }
    }

    /// Clear the target pointer. Called once, from the target's last release.
    pub(crate) fn on_target_deleted(&self) {
        self.domain.call_with_lock(|| self.clear_target_locked());
    }

    /// [`Self::on_target_deleted`] for callers already holding the lock.
    pub(crate) fn clear_target_locked(&self) {
        if self.target.get().is_null() {
            return;
        }
        self.target.set(std::ptr::null());
        self.domain.record_target_severed();

        #[cfg(feature = "weak_logging")]
        tracing::trace!(target: "otter::weak", type_name = self.domain.type_name(), "Weak cell severed");
    }

    /// True once the target has been destroyed. Never reverts.
    pub(crate) fn is_severed(&self) -> bool {
        self.domain.call_with_lock(|| self.target.get().is_null())
    }
}

impl<T: RefCounted + 'static> WeakRefImpl<T> {
    /// Promote to a strong reference if the target still has another owner.
    ///
    /// The count is incremented first and the incremented value inspected,
    /// never the other way round: a value of 1 after the increment means the
    /// last real owner has already let go and the target is dying, so the
    /// reservation is rolled back.
    pub(crate) fn get_target(&self) -> Option<SharedPtr<T>> {
        let domain = self.domain;
        let promoted = domain.call_with_lock(|| {
            let Some(target) = NonNull::new(self.target.get().cast_mut()) else {
                domain.record_promotion(false);
                return None;
            };

            // SAFETY: a non-null pointer has not been severed yet. Severing
            // happens under this lock in `on_last_release`, before the target's
            // destructor runs, so the target is still intact and only shared.
            let scope = AddRefScope::new(unsafe { target.as_ref() }.ref_count());
            let promoted = if scope.ref_count_value() > 1 {
                scope.retain();
                // SAFETY: the retained reservation is the reference handed over.
                Some(unsafe { SharedPtr::from_raw(target) })
            } else {
                None
            };
            domain.record_promotion(promoted.is_some());
            promoted
        });

        #[cfg(feature = "weak_logging")]
        tracing::trace!(
            target: "otter::weak",
            type_name = domain.type_name(),
            promoted = promoted.is_some(),
            "Weak promotion"
        );

        promoted
    }
}

impl<T: 'static> Drop for WeakRefImpl<T> {
    fn drop(&mut self) {
        self.domain.record_cell_released();
    }
}

impl<T: 'static> std::fmt::Debug for WeakRefImpl<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeakRefImpl")
            .field("severed", &self.is_severed())
            .finish()
    }
}

/// Weak handle to a [`WeakRefTarget`](crate::WeakRefTarget).
///
/// Cloning shares the underlying cell. Obtain one with
/// [`SharedPtr::create_weak_ref`].
pub struct WeakRef<T: 'static> {
    cell: SharedPtr<WeakRefImpl<T>>,
}

impl<T: 'static> WeakRef<T> {
    pub(crate) fn new(cell: SharedPtr<WeakRefImpl<T>>) -> Self {
        Self { cell }
    }

    /// True if both handles share one cell, i.e. refer to the same target.
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        SharedPtr::ptr_eq(&this.cell, &other.cell)
    }

    /// True once the target has been destroyed.
    pub fn is_severed(&self) -> bool {
        self.cell.is_severed()
    }

    /// Number of live handles to this cell, including the target's cached one.
    pub fn cell_ref_count(&self) -> usize {
        SharedPtr::strong_count(&self.cell)
    }
}

impl<T: RefCounted + 'static> WeakRef<T> {
    /// Try to obtain a strong reference to the target.
    pub fn get_target(&self) -> Option<SharedPtr<T>> {
        self.cell.get_target()
    }
}

impl<T: 'static> Clone for WeakRef<T> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
        }
    }
}

impl<T: 'static> std::fmt::Debug for WeakRef<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeakRef")
            .field("severed", &self.is_severed())
            .finish()
    }
}
