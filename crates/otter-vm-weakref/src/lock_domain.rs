//! Per-type lock domains
//!
//! Every weak-referenceable type gets one process-wide mutex that serializes
//! cell creation, promotion and severing for objects of that type. Types never
//! contend with each other.
//!
//! Domains are allocated on first use and leaked (`Box::leak`). Objects can
//! still be dying on other threads while the process shuts down, so the lock
//! must outlive any static teardown.
//!
//! Lookups go through a per-thread cache first, so steady-state operations
//! never touch the global registry lock.

use crossbeam_utils::CachePadded;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::any::TypeId;
use std::cell::RefCell;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};

/// Lock and counters shared by every weak reference to objects of one type
pub struct LockDomain {
    lock: Mutex<()>,
    type_name: &'static str,
    cells_created: AtomicU64,
    cells_released: AtomicU64,
    promotions: AtomicU64,
    failed_promotions: AtomicU64,
    targets_severed: AtomicU64,
}

/// Snapshot of a lock domain's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WeakRefStats {
    /// Weak cells allocated (one per target that was ever weakly referenced)
    pub cells_created: u64,
    /// Weak cells freed after their last handle and target went away
    pub cells_released: u64,
    /// `get_target` calls that returned a strong reference
    pub promotions: u64,
    /// `get_target` calls that returned `None`
    pub failed_promotions: u64,
    /// Cells cleared by their target's destruction
    pub targets_severed: u64,
}

impl WeakRefStats {
    /// Cells currently allocated
    pub fn live_cells(&self) -> u64 {
        // Releases happen outside the lock, so a snapshot taken mid-churn can
        // be slightly stale.
        self.cells_created.saturating_sub(self.cells_released)
    }
}

type DomainMap = FxHashMap<TypeId, &'static CachePadded<LockDomain>>;

static LOCK_DOMAINS: OnceLock<RwLock<DomainMap>> = OnceLock::new();

fn domains() -> &'static RwLock<DomainMap> {
    LOCK_DOMAINS.get_or_init(|| RwLock::new(FxHashMap::default()))
}

thread_local! {
    /// Domains this thread has already resolved.
    static DOMAIN_CACHE: RefCell<FxHashMap<TypeId, &'static LockDomain>> =
        RefCell::new(FxHashMap::default());
}

impl LockDomain {
    fn new(type_name: &'static str) -> Self {
        Self {
            lock: Mutex::new(()),
            type_name,
            cells_created: AtomicU64::new(0),
            cells_released: AtomicU64::new(0),
            promotions: AtomicU64::new(0),
            failed_promotions: AtomicU64::new(0),
            targets_severed: AtomicU64::new(0),
        }
    }

    /// The domain for `T`, allocating it on first use.
    pub fn of<T: 'static>() -> &'static LockDomain {
        let key = TypeId::of::<T>();

        // `try_with` fails during thread-local teardown; targets dropped from
        // other thread-local destructors fall back to the registry.
        if let Ok(Some(domain)) = DOMAIN_CACHE.try_with(|cache| cache.borrow().get(&key).copied()) {
            return domain;
        }

        let domain = Self::register::<T>(key);
        let _ = DOMAIN_CACHE.try_with(|cache| cache.borrow_mut().insert(key, domain));
        domain
    }

    fn register<T: 'static>(key: TypeId) -> &'static LockDomain {
        if let Some(&domain) = domains().read().get(&key) {
            return domain;
        }

        // Another thread may have inserted between the two lock acquisitions;
        // `entry` keeps whichever domain got there first.
        let mut map = domains().write();
        let domain: &'static CachePadded<LockDomain> = *map.entry(key).or_insert_with(|| {
            let type_name = std::any::type_name::<T>();

            #[cfg(feature = "weak_logging")]
            tracing::debug!(target: "otter::weak", type_name, "Allocated weak lock domain");

            Box::leak(Box::new(CachePadded::new(LockDomain::new(type_name))))
        });
        domain
    }

    /// Run `operation` while holding this domain's lock.
    ///
    /// The guard is released on every exit path, including unwinding. The lock
    /// is not reentrant: `operation` must not call back into the same domain.
    pub fn call_with_lock<R>(&self, operation: impl FnOnce() -> R) -> R {
        let _guard = self.lock.lock();
        operation()
    }

    /// Name of the type this domain serves
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> WeakRefStats {
        // Released first: a release is always preceded by its creation, so
        // this order never reads more releases than creations.
        let cells_released = self.cells_released.load(Ordering::Acquire);
        WeakRefStats {
            cells_created: self.cells_created.load(Ordering::Acquire),
            cells_released,
            promotions: self.promotions.load(Ordering::Relaxed),
            failed_promotions: self.failed_promotions.load(Ordering::Relaxed),
            targets_severed: self.targets_severed.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_cell_created(&self) {
        self.cells_created.fetch_add(1, Ordering::Release);
    }

    pub(crate) fn record_cell_released(&self) {
        self.cells_released.fetch_add(1, Ordering::Release);
    }

    pub(crate) fn record_promotion(&self, succeeded: bool) {
        if succeeded {
            self.promotions.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_promotions.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_target_severed(&self) {
        self.targets_severed.fetch_add(1, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for LockDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockDomain")
            .field("type_name", &self.type_name)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Run `operation` under `T`'s lock domain.
pub fn call_with_lock<T: 'static, R>(operation: impl FnOnce() -> R) -> R {
    LockDomain::of::<T>().call_with_lock(operation)
}

/// Counters for weak references to objects of type `T`.
pub fn weak_ref_stats<T: 'static>() -> WeakRefStats {
    LockDomain::of::<T>().stats()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_same_type_same_domain() {
        struct Marker;
        let a = LockDomain::of::<Marker>();
        let b = LockDomain::of::<Marker>();
        assert!(std::ptr::eq(a, b));
        assert!(a.type_name().ends_with("Marker"));
    }

    #[test]
    fn test_distinct_types_distinct_domains() {
        struct First;
        struct Second;
        assert!(!std::ptr::eq(
            LockDomain::of::<First>(),
            LockDomain::of::<Second>()
        ));
    }

    #[test]
    fn test_returns_operation_result() {
        struct Marker;
        assert_eq!(call_with_lock::<Marker, _>(|| 40 + 2), 42);
    }

    #[test]
    fn test_lock_released_after_panic() {
        struct Marker;
        let result = std::panic::catch_unwind(|| {
            call_with_lock::<Marker, ()>(|| panic!("operation failed"));
        });
        assert!(result.is_err());

        // Would deadlock if the guard had leaked.
        assert_eq!(call_with_lock::<Marker, _>(|| 7), 7);
    }

    #[test]
    fn test_serializes_threads() {
        struct Marker;
        const THREADS: usize = 8;
        const ITERATIONS: usize = 1000;

        let counter = AtomicUsize::new(0);
        std::thread::scope(|s| {
            for _ in 0..THREADS {
                s.spawn(|| {
                    for _ in 0..ITERATIONS {
                        call_with_lock::<Marker, _>(|| {
                            // Split read-modify-write: only correct under mutual exclusion.
                            let current = counter.load(Ordering::Relaxed);
                            std::thread::yield_now();
                            counter.store(current + 1, Ordering::Relaxed);
                        });
                    }
                });
            }
        });

        assert_eq!(counter.load(Ordering::Relaxed), THREADS * ITERATIONS);
    }

    #[test]
    fn test_concurrent_first_use() {
        struct Marker;
        let domains: Vec<usize> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| s.spawn(|| LockDomain::of::<Marker>() as *const LockDomain as usize))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert!(domains.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn test_cached_domain_matches_registry() {
        struct Marker;
        let first = LockDomain::of::<Marker>();
        // Second lookup is served by this thread's cache.
        assert!(std::ptr::eq(first, LockDomain::of::<Marker>()));

        let key = TypeId::of::<Marker>();
        let registered: &'static LockDomain = domains().read()[&key];
        assert!(std::ptr::eq(first, registered));

        let other = std::thread::spawn(|| LockDomain::of::<Marker>() as *const LockDomain as usize)
            .join()
            .unwrap();
        assert_eq!(other, first as *const LockDomain as usize);
    }

    #[test]
    fn test_live_cells_never_underflows() {
        let stale = WeakRefStats {
            cells_created: 3,
            cells_released: 4,
            ..WeakRefStats::default()
        };
        assert_eq!(stale.live_cells(), 0);

        let stats = WeakRefStats {
            cells_created: 5,
            cells_released: 2,
            ..WeakRefStats::default()
        };
        assert_eq!(stats.live_cells(), 3);
    }
}
