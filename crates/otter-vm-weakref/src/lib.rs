//! # Otter VM Weak References
//!
//! Thread-safe weak references over intrusively reference-counted objects.
//!
//! ## Design
//!
//! - **Intrusive counts**: objects embed a [`RefCount`] and are owned by [`SharedPtr`]
//! - **One cell per target**: every [`WeakRef`] to an object shares one lazily created cell
//! - **Per-type lock domain**: cell creation, promotion and severing for one type are
//!   serialized by a single process-lifetime mutex
//! - **Reserve then check**: promotion increments the target's count first and only
//!   keeps the reference if another owner was already holding the target

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod lock_domain;
pub mod refcount;
pub mod target;
pub mod weak_ref;

pub use lock_domain::{LockDomain, WeakRefStats, call_with_lock, weak_ref_stats};
pub use refcount::{AddRefScope, RefCount, RefCounted, SharedPtr};
pub use target::{WeakRefTarget, WeakTargetSlot};
pub use weak_ref::WeakRef;
