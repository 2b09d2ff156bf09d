//! Intrusive reference counting
//!
//! Objects embed a [`RefCount`] and are owned through [`SharedPtr`]. Because
//! the count lives inside the object, a raw pointer to the object is enough to
//! reserve a new reference with [`AddRefScope`].

use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering, fence};

/// Counts above this abort the process (same limit as `std::sync::Arc`).
const MAX_REFCOUNT: usize = isize::MAX as usize;

/// Reference count embedded in a [`RefCounted`] object
pub struct RefCount {
    count: AtomicUsize,
}

impl RefCount {
    /// Create a count with no owners. [`SharedPtr::new`] takes the first reference.
    pub const fn new() -> Self {
        Self {
            count: AtomicUsize::new(0),
        }
    }

    /// Increment and return the new value.
    pub(crate) fn add_ref(&self) -> usize {
        let old = self.count.fetch_add(1, Ordering::Relaxed);
        if old >= MAX_REFCOUNT {
            std::process::abort();
        }
        old + 1
    }

    /// Decrement and return the new value. Never destroys anything by itself.
    pub(crate) fn release(&self) -> usize {
        let old = self.count.fetch_sub(1, Ordering::Release);
        debug_assert!(old > 0, "RefCount released below zero");
        old - 1
    }

    /// Current value. Diagnostic only: the count may change right after the read.
    pub fn value(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }
}

impl Default for RefCount {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RefCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RefCount").field(&self.value()).finish()
    }
}

/// Objects that carry their own [`RefCount`].
///
/// # Safety
/// `ref_count` must return the same counter, embedded in `self`, on every call.
/// The counter must not be touched by anything other than [`SharedPtr`] and
/// [`AddRefScope`].
pub unsafe trait RefCounted {
    /// The embedded reference count
    fn ref_count(&self) -> &RefCount;

    /// Called by the last [`SharedPtr`] once the count has reached zero,
    /// before the object's destructor runs and while it is still fully
    /// intact. Weak reference targets sever their cell here.
    fn on_last_release(&self) {}
}

/// Speculative reference held for the lifetime of the scope.
///
/// Construction increments the count and records the resulting value.
/// Dropping the scope rolls the increment back with a plain decrement, so a
/// reservation taken on an object whose last owner is already gone can never
/// trigger a second destruction.
pub struct AddRefScope<'a> {
    count: &'a RefCount,
    value: usize,
}

impl<'a> AddRefScope<'a> {
    /// Reserve a reference on `count`.
    pub fn new(count: &'a RefCount) -> Self {
        let value = count.add_ref();
        Self { count, value }
    }

    /// The count right after this scope's increment.
    pub fn ref_count_value(&self) -> usize {
        self.value
    }

    /// Keep the reservation instead of rolling it back. The caller becomes
    /// responsible for the extra reference.
    pub fn retain(self) {
        std::mem::forget(self);
    }
}

impl Drop for AddRefScope<'_> {
    fn drop(&mut self) {
        self.count.release();
    }
}

/// Owning pointer to a heap-allocated [`RefCounted`] object
pub struct SharedPtr<T: RefCounted> {
    ptr: NonNull<T>,
    _marker: PhantomData<T>,
}

// SAFETY: the count is atomic and the pointee is only exposed through `&T`,
// so sharing across threads is sound whenever `T` itself is `Send + Sync`.
unsafe impl<T: RefCounted + Send + Sync> Send for SharedPtr<T> {}
unsafe impl<T: RefCounted + Send + Sync> Sync for SharedPtr<T> {}

impl<T: RefCounted> SharedPtr<T> {
    /// Move `value` to the heap and take the first reference.
    pub fn new(value: T) -> Self {
        let boxed = Box::new(value);
        let count = boxed.ref_count().add_ref();
        debug_assert_eq!(count, 1, "SharedPtr::new on an already owned object");
        Self {
            ptr: NonNull::from(Box::leak(boxed)),
            _marker: PhantomData,
        }
    }

    /// Wrap a pointer whose reference has already been counted.
    ///
    /// # Safety
    /// `ptr` must come from [`SharedPtr::as_ptr`] of a live `SharedPtr<T>`, and
    /// the caller must hand over exactly one reference that it already added
    /// (e.g. via [`AddRefScope::retain`]).
    pub unsafe fn from_raw(ptr: NonNull<T>) -> Self {
        Self {
            ptr,
            _marker: PhantomData,
        }
    }

    /// Raw pointer to the object. Stable for the object's whole lifetime.
    pub fn as_ptr(this: &Self) -> *const T {
        this.ptr.as_ptr()
    }

    /// True if both pointers refer to the same allocation.
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        this.ptr == other.ptr
    }

    /// Current number of strong references.
    pub fn strong_count(this: &Self) -> usize {
        this.ref_count().value()
    }
}

impl<T: RefCounted> Clone for SharedPtr<T> {
    fn clone(&self) -> Self {
        self.ref_count().add_ref();
        Self {
            ptr: self.ptr,
            _marker: PhantomData,
        }
    }
}

impl<T: RefCounted> Drop for SharedPtr<T> {
    fn drop(&mut self) {
        if self.ref_count().release() != 0 {
            return;
        }
        fence(Ordering::Acquire);
        self.on_last_release();
        // SAFETY: the count reached zero, so this was the last owner of the
        // allocation created by `SharedPtr::new`.
        unsafe { drop(Box::from_raw(self.ptr.as_ptr())) };
    }
}

impl<T: RefCounted> Deref for SharedPtr<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: we hold a reference, so the object is alive.
        unsafe { self.ptr.as_ref() }
    }
}

impl<T: RefCounted + fmt::Debug> fmt::Debug for SharedPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct Counted {
        ref_count: RefCount,
        drops: Arc<AtomicUsize>,
        last_releases: AtomicUsize,
    }

    unsafe impl RefCounted for Counted {
        fn ref_count(&self) -> &RefCount {
            &self.ref_count
        }

        fn on_last_release(&self) {
            assert_eq!(self.ref_count.value(), 0);
            assert_eq!(self.drops.load(Ordering::SeqCst), 0);
            self.last_releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl Drop for Counted {
        fn drop(&mut self) {
            assert_eq!(*self.last_releases.get_mut(), 1);
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counted() -> (SharedPtr<Counted>, Arc<AtomicUsize>) {
        let drops = Arc::new(AtomicUsize::new(0));
        let ptr = SharedPtr::new(Counted {
            ref_count: RefCount::new(),
            drops: drops.clone(),
            last_releases: AtomicUsize::new(0),
        });
        (ptr, drops)
    }

    #[test]
    fn test_clone_and_drop() {
        let (a, drops) = counted();
        assert_eq!(SharedPtr::strong_count(&a), 1);

        let b = a.clone();
        assert_eq!(SharedPtr::strong_count(&a), 2);
        assert!(SharedPtr::ptr_eq(&a, &b));

        drop(a);
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        assert_eq!(SharedPtr::strong_count(&b), 1);

        drop(b);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_add_ref_scope_rolls_back() {
        let (a, drops) = counted();
        {
            let scope = AddRefScope::new(a.ref_count());
            assert_eq!(scope.ref_count_value(), 2);
            assert_eq!(SharedPtr::strong_count(&a), 2);
        }
        assert_eq!(SharedPtr::strong_count(&a), 1);
        drop(a);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_add_ref_scope_retain() {
        let (a, drops) = counted();
        let scope = AddRefScope::new(a.ref_count());
        scope.retain();

        let nn = NonNull::new(SharedPtr::as_ptr(&a) as *mut Counted).unwrap();
        let b = unsafe { SharedPtr::from_raw(nn) };
        assert_eq!(SharedPtr::strong_count(&a), 2);

        drop(a);
        drop(b);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_release_does_not_destroy() {
        let count = RefCount::new();
        assert_eq!(count.add_ref(), 1);
        assert_eq!(count.release(), 0);
        assert_eq!(count.add_ref(), 1);
        assert_eq!(count.value(), 1);
    }
}
