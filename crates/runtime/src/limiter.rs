//! Per-worker instruction budgets
//!
//! Every worker (the main caller or a coroutine worker) that executes
//! bytecode owns a budget record: an instruction counter, its cap, and the
//! intermediate-string size cap. The interpreter charges one instruction
//! before every fetch; accounting-aware builtins charge more.
//!
//! # Design
//!
//! A global fixed-size slot registry, CAS-claimed per worker key. The hot
//! path (one `charge` per instruction) goes through a thread-local cached
//! slot index, so it is a couple of atomic loads and one store — no locks,
//! no contention. The check precedes the addition, so the counter can
//! neither overflow nor drift past its cap.
//!
//! Worker keys are process-unique `u64`s allocated up front, not OS thread
//! ids: a coroutine worker gets its key before its backing thread exists,
//! which is what lets the host install a budget ahead of the first resume.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};

/// Maximum number of concurrently budgeted workers.
const MAX_WORKERS: usize = 64;

/// Identity of a budgeted worker.
pub type WorkerKey = u64;

struct Slot {
    /// Owning worker key (0 = slot is free).
    key: AtomicU64,
    current: AtomicU64,
    max: AtomicU64,
    max_string: AtomicU64,
}

impl Slot {
    const fn new() -> Slot {
        Slot {
            key: AtomicU64::new(0),
            current: AtomicU64::new(0),
            max: AtomicU64::new(0),
            max_string: AtomicU64::new(0),
        }
    }
}

static SLOTS: [Slot; MAX_WORKERS] = [const { Slot::new() }; MAX_WORKERS];
static NEXT_KEY: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// The worker whose budget the current OS thread charges against:
    /// `(key, cached slot index + 1)`; all zeros when outside execution.
    static ACTIVE: Cell<(WorkerKey, usize)> = const { Cell::new((0, 0)) };
}

/// A budget record snapshot, for host introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limit {
    pub current: u64,
    pub max: u64,
    pub max_string_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallError {
    /// A budget was already installed for this worker; install is
    /// first-call-only.
    AlreadyInstalled,
    /// All registry slots are claimed.
    RegistryFull,
}

impl std::fmt::Display for InstallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstallError::AlreadyInstalled => write!(f, "instruction limit already installed"),
            InstallError::RegistryFull => {
                write!(f, "instruction limit registry is full ({MAX_WORKERS} workers)")
            }
        }
    }
}

impl std::error::Error for InstallError {}

/// Allocates a fresh worker identity. Never returns 0.
pub fn allocate_key() -> WorkerKey {
    NEXT_KEY.fetch_add(1, Ordering::Relaxed)
}

fn find_slot(key: WorkerKey) -> Option<usize> {
    SLOTS
        .iter()
        .position(|s| s.key.load(Ordering::Acquire) == key)
}

/// Registers a budget for a worker. Fails if one is already installed.
pub fn install(
    key: WorkerKey,
    max_instructions: u64,
    max_string_size: usize,
) -> Result<(), InstallError> {
    if find_slot(key).is_some() {
        return Err(InstallError::AlreadyInstalled);
    }
    for slot in &SLOTS {
        if slot
            .key
            .compare_exchange(0, key, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            slot.current.store(0, Ordering::Relaxed);
            slot.max.store(max_instructions, Ordering::Relaxed);
            slot.max_string.store(max_string_size as u64, Ordering::Relaxed);
            return Ok(());
        }
    }
    Err(InstallError::RegistryFull)
}

/// Zeroes the counter, preserving the caps. The host calls this between
/// scheduled ticks. Returns false if no budget is installed.
pub fn reset(key: WorkerKey) -> bool {
    match find_slot(key) {
        Some(i) => {
            SLOTS[i].current.store(0, Ordering::Relaxed);
            true
        }
        None => false,
    }
}

/// Frees the worker's slot (worker death or host teardown).
pub fn remove(key: WorkerKey) -> bool {
    match find_slot(key) {
        Some(i) => {
            SLOTS[i].key.store(0, Ordering::Release);
            true
        }
        None => false,
    }
}

/// Snapshot of a worker's budget record.
pub fn lookup(key: WorkerKey) -> Option<Limit> {
    find_slot(key).map(|i| Limit {
        current: SLOTS[i].current.load(Ordering::Relaxed),
        max: SLOTS[i].max.load(Ordering::Relaxed),
        max_string_size: SLOTS[i].max_string.load(Ordering::Relaxed) as usize,
    })
}

/// Scoped binding of the current OS thread to a worker's budget. The
/// interpreter charges against whatever binding is active.
pub struct ActiveGuard {
    previous: (WorkerKey, usize),
}

/// Binds the current thread to `key` for the duration of the guard.
/// Nested bindings restore the outer one on drop.
pub fn enter(key: WorkerKey) -> ActiveGuard {
    let slot = find_slot(key).map_or(0, |i| i + 1);
    let previous = ACTIVE.with(|a| a.replace((key, slot)));
    ActiveGuard { previous }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let previous = self.previous;
        ACTIVE.with(|a| a.set(previous));
    }
}

/// The worker identity the current thread charges against, if bound.
/// Script-created coroutines inherit this so their work draws on the
/// creator's budget.
pub fn active_key() -> Option<WorkerKey> {
    let (key, _) = ACTIVE.with(Cell::get);
    if key == 0 { None } else { Some(key) }
}

/// The active binding's slot index, re-resolving (and re-caching) when
/// the cached index went stale because the budget was reinstalled into a
/// different slot.
fn active_slot() -> Option<usize> {
    let (key, slot) = ACTIVE.with(Cell::get);
    if key == 0 {
        return None;
    }
    if slot != 0 && SLOTS[slot - 1].key.load(Ordering::Acquire) == key {
        return Some(slot - 1);
    }
    let found = find_slot(key);
    ACTIVE.with(|a| a.set((key, found.map_or(0, |i| i + 1))));
    found
}

/// Whether the current thread has an installed budget.
pub fn has_active_limit() -> bool {
    active_slot().is_some()
}

/// The active worker's budget snapshot, if any.
pub fn active_limit() -> Option<Limit> {
    let s = &SLOTS[active_slot()?];
    Some(Limit {
        current: s.current.load(Ordering::Relaxed),
        max: s.max.load(Ordering::Relaxed),
        max_string_size: s.max_string.load(Ordering::Relaxed) as usize,
    })
}

/// The active worker's intermediate-string cap, if a budget is installed.
pub fn active_string_cap() -> Option<usize> {
    active_limit().map(|l| l.max_string_size)
}

/// Charges `n` instructions against the active budget.
///
/// `Ok(())` when within budget or when no budget is installed (the
/// unlimited main-thread case; the interpreter separately refuses to run
/// a coroutine worker without a budget). `Err(max)` when the charge would
/// push the counter past its cap; the counter is left untouched, so a
/// worker observed after the failure reads exactly its cap.
pub fn charge(n: u64) -> Result<(), u64> {
    let Some(index) = active_slot() else {
        return Ok(());
    };
    let s = &SLOTS[index];
    let max = s.max.load(Ordering::Relaxed);
    let current = s.current.load(Ordering::Relaxed);
    if current.saturating_add(n) > max {
        return Err(max);
    }
    s.current.store(current + n, Ordering::Relaxed);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn install_reset_round_trip() {
        let key = allocate_key();
        install(key, 100, 64).unwrap();
        assert_eq!(
            lookup(key),
            Some(Limit {
                current: 0,
                max: 100,
                max_string_size: 64
            })
        );
        let _guard = enter(key);
        charge(30).unwrap();
        assert_eq!(lookup(key).unwrap().current, 30);
        assert!(reset(key));
        assert_eq!(lookup(key).unwrap().current, 0);
        assert_eq!(lookup(key).unwrap().max, 100);
        remove(key);
    }

    #[test]
    #[serial]
    fn install_is_first_call_only() {
        let key = allocate_key();
        install(key, 10, 10).unwrap();
        assert_eq!(install(key, 20, 20), Err(InstallError::AlreadyInstalled));
        remove(key);
    }

    #[test]
    #[serial]
    fn boundary_at_max() {
        let key = allocate_key();
        install(key, 50, 10).unwrap();
        let _guard = enter(key);
        for _ in 0..50 {
            charge(1).unwrap();
        }
        // Counter sits exactly at the cap; the next charge fails without
        // moving it.
        assert_eq!(lookup(key).unwrap().current, 50);
        assert_eq!(charge(1), Err(50));
        assert_eq!(lookup(key).unwrap().current, 50);
        remove(key);
    }

    #[test]
    #[serial]
    fn counter_is_monotonic_between_resets() {
        let key = allocate_key();
        install(key, 1000, 10).unwrap();
        let _guard = enter(key);
        let mut last = 0;
        for _ in 0..10 {
            charge(7).unwrap();
            let now = lookup(key).unwrap().current;
            assert!(now >= last);
            last = now;
        }
        remove(key);
    }

    #[test]
    #[serial]
    fn unbound_thread_is_unlimited() {
        assert!(!has_active_limit());
        assert_eq!(charge(1_000_000), Ok(()));
    }

    #[test]
    #[serial]
    fn reinstall_rebinds_a_stale_cached_slot() {
        let key = allocate_key();
        let squatter = allocate_key();
        install(key, 5, 1).unwrap();
        let _guard = enter(key);
        charge(5).unwrap();
        assert_eq!(charge(1), Err(5));
        // Re-budget: remove, let another worker claim the freed slot,
        // reinstall into a different one. Charges must follow the key,
        // not the stale cached index.
        assert!(remove(key));
        install(squatter, 1, 1).unwrap();
        install(key, 100, 1).unwrap();
        charge(50).unwrap();
        assert_eq!(lookup(key).unwrap().current, 50);
        assert_eq!(lookup(squatter).unwrap().current, 0);
        remove(key);
        remove(squatter);
    }

    #[test]
    #[serial]
    fn nested_bindings_restore() {
        let a = allocate_key();
        let b = allocate_key();
        install(a, 10, 1).unwrap();
        install(b, 20, 2).unwrap();
        let _ga = enter(a);
        assert_eq!(active_limit().unwrap().max, 10);
        {
            let _gb = enter(b);
            assert_eq!(active_limit().unwrap().max, 20);
            assert_eq!(active_string_cap(), Some(2));
        }
        assert_eq!(active_limit().unwrap().max, 10);
        remove(a);
        remove(b);
    }
}
