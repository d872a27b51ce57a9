//! Telemetry of the memory manager: aggregate counters, and the pressure state.
//!
//! All counters are independent relaxed atomics; the pressure state is a handful of atomics plus the callback, whose
//! lock is never held while invoking it.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use std::{sync::Arc, time::Duration};

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::{AllocError, KindCounters, MemoryStats, ObjectKind};
use crate::internals::atomic::AtomicF64;

/// Which per-kind counter an allocation contributes to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum KindSlot {
    Object,
    String,
    Array,
    HashMap,
    Large,
}

impl KindSlot {
    /// Returns the slot of an allocation of `kind`, served by the large-object allocator or not.
    pub(crate) fn of(kind: ObjectKind, large: bool) -> Self {
        if large {
            return KindSlot::Large;
        }

        match kind {
            ObjectKind::String => KindSlot::String,
            ObjectKind::Array => KindSlot::Array,
            ObjectKind::HashMap => KindSlot::HashMap,
            ObjectKind::Generic | ObjectKind::Instance | ObjectKind::Function => KindSlot::Object,
        }
    }
}

/// Aggregate allocation counters.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    total_allocations: AtomicU64,
    total_bytes: AtomicU64,
    current_bytes: AtomicU64,
    peak_bytes: AtomicU64,
    local: AtomicU64,
    remote: AtomicU64,
    failed: AtomicU64,
    security_rejections: AtomicU64,
    allocation_nanos: AtomicU64,
    compactions: AtomicU64,
    compaction_nanos: AtomicU64,
    kinds: [AtomicU64; 5],
}

impl Counters {
    /// Records a successful allocation.
    pub(crate) fn record_allocation(&self, size: usize, slot: KindSlot, local: bool, nanos: u64) {
        let size = size as u64;

        self.total_allocations.fetch_add(1, Ordering::Relaxed);
        self.total_bytes.fetch_add(size, Ordering::Relaxed);

        let current = self.current_bytes.fetch_add(size, Ordering::Relaxed) + size;
        self.peak_bytes.fetch_max(current, Ordering::Relaxed);

        let locality = if local { &self.local } else { &self.remote };
        locality.fetch_add(1, Ordering::Relaxed);

        self.allocation_nanos.fetch_add(nanos, Ordering::Relaxed);
        self.kinds[slot as usize].fetch_add(1, Ordering::Relaxed);
    }

    /// Records a denied allocation.
    pub(crate) fn record_failure(&self, error: &AllocError) {
        self.failed.fetch_add(1, Ordering::Relaxed);

        if let AllocError::Rejected(_) = error {
            self.security_rejections.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records the release of `size` bytes.
    pub(crate) fn record_free(&self, size: usize) {
        let size = size as u64;

        //  Never underflows, even if the caller frees with a larger size than allocated.
        let _ = self.current_bytes.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
            Some(current.saturating_sub(size))
        });
    }

    /// Records the release of all arena memory, worth `size` bytes.
    pub(crate) fn record_bulk_free(&self, size: u64) {
        let _ = self.current_bytes.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
            Some(current.saturating_sub(size))
        });
    }

    /// Records a compaction pass.
    pub(crate) fn record_compaction(&self, nanos: u64) {
        self.compactions.fetch_add(1, Ordering::Relaxed);
        self.compaction_nanos.fetch_add(nanos, Ordering::Relaxed);
    }

    /// Returns the number of bytes currently in use.
    pub(crate) fn current_bytes(&self) -> u64 { self.current_bytes.load(Ordering::Relaxed) }

    /// Fills the counters part of `stats`.
    pub(crate) fn snapshot(&self, stats: &mut MemoryStats) {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);

        stats.total_allocations = load(&self.total_allocations);
        stats.total_bytes_allocated = load(&self.total_bytes);
        stats.current_memory_usage = load(&self.current_bytes);
        stats.peak_memory_usage = load(&self.peak_bytes);
        stats.numa_local_allocations = load(&self.local);
        stats.numa_remote_allocations = load(&self.remote);
        stats.failed_allocations = load(&self.failed);
        stats.security_rejections = load(&self.security_rejections);
        stats.allocation_time = Duration::from_nanos(load(&self.allocation_nanos));
        stats.compactions = load(&self.compactions);
        stats.compaction_time = Duration::from_nanos(load(&self.compaction_nanos));

        stats.kinds = KindCounters {
            object: load(&self.kinds[KindSlot::Object as usize]),
            string: load(&self.kinds[KindSlot::String as usize]),
            array: load(&self.kinds[KindSlot::Array as usize]),
            hash_map: load(&self.kinds[KindSlot::HashMap as usize]),
            large: load(&self.kinds[KindSlot::Large as usize]),
        };
    }
}

/// Callback invoked when the memory usage crosses the pressure threshold.
pub(crate) type PressureCallback = Arc<dyn Fn() + Send + Sync>;

/// Pressure state.
pub(crate) struct Pressure {
    threshold: u64,
    check_interval: u64,
    gc_step: u64,
    gc_pressure: AtomicF64,
    bytes_since_last_gc: AtomicU64,
    under_pressure: AtomicBool,
    //  Nanoseconds since the origin of the manager; `NEVER` until the first check.
    last_check: AtomicU64,
    callback: Mutex<Option<PressureCallback>>,
}

impl Pressure {
    /// Creates an instance.
    ///
    /// The advisory GC pressure is raised each time more than `gc_step` bytes were allocated since the last raise.
    pub(crate) fn new(threshold: usize, check_interval: Duration, gc_step: usize) -> Self {
        Self {
            threshold: threshold as u64,
            check_interval: u64::try_from(check_interval.as_nanos()).unwrap_or(u64::MAX),
            gc_step: gc_step as u64,
            gc_pressure: AtomicF64::default(),
            bytes_since_last_gc: AtomicU64::new(0),
            under_pressure: AtomicBool::new(false),
            last_check: AtomicU64::new(NEVER),
            callback: Mutex::new(None),
        }
    }

    /// Returns whether the memory usage was above the threshold, as of the last check.
    pub(crate) fn is_under_pressure(&self) -> bool { self.under_pressure.load(Ordering::Acquire) }

    /// Returns the advisory GC pressure, in `[0, 1]`.
    pub(crate) fn gc_pressure(&self) -> f64 { self.gc_pressure.load() }

    /// Raises the advisory GC pressure to its maximum.
    pub(crate) fn saturate(&self) { self.gc_pressure.store(1.0); }

    /// Accounts `size` freshly allocated bytes towards the GC pressure.
    pub(crate) fn record_allocation(&self, size: usize) {
        let size = size as u64;
        let since = self.bytes_since_last_gc.fetch_add(size, Ordering::Relaxed) + size;

        if since <= self.gc_step {
            return;
        }

        //  Only the thread which restarts the counter raises the pressure.
        if self.bytes_since_last_gc.compare_exchange(since, 0, Ordering::Relaxed, Ordering::Relaxed).is_ok() {
            let pressure = self.gc_pressure.add_clamped(GC_PRESSURE_STEP, 0.0, 1.0);
            debug!("{} bytes allocated since the last raise, GC pressure now {:.1}", since, pressure);
        }
    }

    /// Resets the GC pressure, after a collection.
    pub(crate) fn gc_completed(&self) {
        self.bytes_since_last_gc.store(0, Ordering::Relaxed);
        self.gc_pressure.store(0.0);
    }

    /// Registers the callback, replacing any previous one.
    pub(crate) fn set_callback(&self, callback: Option<PressureCallback>) { *self.callback.lock() = callback; }

    /// Evaluates the pressure, unless the last evaluation is more recent than the check interval.
    ///
    /// `now` is the number of nanoseconds elapsed since the origin of the manager.
    ///
    /// On a transition from not under pressure to under pressure, the callback is invoked on the calling thread.
    pub(crate) fn check(&self, current: u64, now: u64) -> bool {
        let last = self.last_check.load(Ordering::Acquire);

        if last != NEVER && now.saturating_sub(last) < self.check_interval {
            return self.is_under_pressure();
        }

        //  Another thread is evaluating concurrently.
        if self.last_check.compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire).is_err() {
            return self.is_under_pressure();
        }

        let pressured = current > self.threshold;
        let previous = self.under_pressure.swap(pressured, Ordering::AcqRel);

        match (previous, pressured) {
            (false, true) => {
                warn!("memory usage of {} bytes exceeds the pressure threshold of {} bytes", current, self.threshold);

                let callback = self.callback.lock().clone();

                if let Some(callback) = callback {
                    callback();
                }
            },
            (true, false) => {
                info!("memory usage of {} bytes is back below the pressure threshold of {} bytes", current, self.threshold);
            },
            _ => (),
        }

        pressured
    }
}

//
//  Implementation
//

const NEVER: u64 = u64::MAX;

const GC_PRESSURE_STEP: f64 = 0.1;
