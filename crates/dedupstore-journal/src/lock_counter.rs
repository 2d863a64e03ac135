//! Reference counting on journal blocks.
//!
//! Each on-disk journal block slot carries three kinds of references:
//! per-entry locks held on behalf of the journal itself (a count set when
//! the block is initialized and drained as entry effects become durable),
//! and per-zone counts for the logical and physical zone types. A slot can
//! be reaped only when all three are gone.
//!
//! Per-zone counts may be touched from any zone, so everything here is
//! atomic. The journal thread only ever reads the aggregates. When a slot
//! becomes unlocked along some dimension, a notification is posted for the
//! journal thread; notifications coalesce so at most one is outstanding per
//! slot until the journal acknowledges it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use dedupstore_core::error::CoreError;
use dedupstore_core::read_only::ReadOnlyNotifier;
use dedupstore_core::types::{ZoneId, ZoneType};

/// Reference counts for every slot of the journal's on-disk ring.
pub struct LockCounter {
    locks: usize,
    logical_zones: usize,
    physical_zones: usize,
    /// Per-entry lock totals, written only by the journal thread.
    journal_counters: Vec<AtomicU32>,
    /// Releases applied against `journal_counters`; any zone may release.
    journal_decrement_counts: Vec<AtomicU32>,
    logical_counters: Vec<AtomicU32>,
    physical_counters: Vec<AtomicU32>,
    /// Number of logical zones holding references, per slot.
    logical_zone_counts: Vec<AtomicU32>,
    /// Number of physical zones holding references, per slot.
    physical_zone_counts: Vec<AtomicU32>,
    /// True while an unlock notification is outstanding for the slot.
    notification_states: Vec<AtomicBool>,
    notifications: Mutex<VecDeque<usize>>,
    notifier: Arc<ReadOnlyNotifier>,
}

fn make_atomics(count: usize) -> Vec<AtomicU32> {
    (0..count).map(|_| AtomicU32::new(0)).collect()
}

impl LockCounter {
    /// Creates a counter covering `locks` ring slots.
    pub fn new(
        locks: usize,
        logical_zones: usize,
        physical_zones: usize,
        notifier: Arc<ReadOnlyNotifier>,
    ) -> Self {
        Self {
            locks,
            logical_zones,
            physical_zones,
            journal_counters: make_atomics(locks),
            journal_decrement_counts: make_atomics(locks),
            logical_counters: make_atomics(locks * logical_zones),
            physical_counters: make_atomics(locks * physical_zones),
            logical_zone_counts: make_atomics(locks),
            physical_zone_counts: make_atomics(locks),
            notification_states: (0..locks).map(|_| AtomicBool::new(false)).collect(),
            notifications: Mutex::new(VecDeque::new()),
            notifier,
        }
    }

    /// The number of ring slots covered.
    pub fn locks(&self) -> usize {
        self.locks
    }

    fn counter_index(&self, lock_number: usize, zone_type: ZoneType, zone: ZoneId) -> usize {
        let zones = match zone_type {
            ZoneType::Logical => self.logical_zones,
            ZoneType::Physical => self.physical_zones,
        };
        debug_assert!((zone as usize) < zones);
        lock_number * zones + zone as usize
    }

    fn counters(&self, zone_type: ZoneType) -> &[AtomicU32] {
        match zone_type {
            ZoneType::Logical => &self.logical_counters,
            ZoneType::Physical => &self.physical_counters,
        }
    }

    fn zone_counts(&self, zone_type: ZoneType) -> &[AtomicU32] {
        match zone_type {
            ZoneType::Logical => &self.logical_zone_counts,
            ZoneType::Physical => &self.physical_zone_counts,
        }
    }

    /// Sets the per-entry lock count for a freshly activated block slot.
    /// Journal thread only.
    pub fn initialize_lock_count(&self, lock_number: usize, count: u32) {
        self.journal_counters[lock_number].store(count, Ordering::Release);
        self.journal_decrement_counts[lock_number].store(0, Ordering::Release);
    }

    fn is_journal_zone_locked(&self, lock_number: usize) -> bool {
        let total = self.journal_counters[lock_number].load(Ordering::Acquire);
        let released = self.journal_decrement_counts[lock_number].load(Ordering::Acquire);
        total != released
    }

    /// Returns true while the slot is still referenced along the queried
    /// zone type. Per-entry locks pin the slot for both types.
    pub fn is_locked(&self, lock_number: usize, zone_type: ZoneType) -> bool {
        self.is_journal_zone_locked(lock_number)
            || self.zone_counts(zone_type)[lock_number].load(Ordering::Acquire) > 0
    }

    /// Adds a reference from `zone` to the slot. Callable from any zone.
    pub fn acquire_lock_count_reference(
        &self,
        lock_number: usize,
        zone_type: ZoneType,
        zone: ZoneId,
    ) {
        let index = self.counter_index(lock_number, zone_type, zone);
        let previous = self.counters(zone_type)[index].fetch_add(1, Ordering::AcqRel);
        if previous == 0 {
            self.zone_counts(zone_type)[lock_number].fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Drops a reference from `zone`. When the zone's count reaches zero the
    /// aggregate drops, and when the slot becomes unlocked a notification is
    /// posted for the journal thread.
    pub fn release_lock_count_reference(
        &self,
        lock_number: usize,
        zone_type: ZoneType,
        zone: ZoneId,
    ) {
        let index = self.counter_index(lock_number, zone_type, zone);
        let result = self.counters(zone_type)[index]
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1));
        match result {
            Ok(1) => {
                // This zone's last reference.
                self.zone_counts(zone_type)[lock_number].fetch_sub(1, Ordering::AcqRel);
                self.attempt_notification(lock_number);
            }
            Ok(_) => {}
            Err(_) => {
                tracing::error!(lock_number, ?zone_type, zone, "lock count underflow");
                self.notifier.enter_read_only_mode(CoreError::CounterUnderflow {
                    counter: "lock count reference",
                });
            }
        }
    }

    fn release_journal_reference(&self, lock_number: usize) {
        let released = self.journal_decrement_counts[lock_number].fetch_add(1, Ordering::AcqRel) + 1;
        let total = self.journal_counters[lock_number].load(Ordering::Acquire);
        if released > total {
            tracing::error!(lock_number, released, total, "per-entry lock underflow");
            self.notifier.enter_read_only_mode(CoreError::CounterUnderflow {
                counter: "journal per-entry lock",
            });
            return;
        }
        if released == total {
            self.attempt_notification(lock_number);
        }
    }

    /// Releases one per-entry lock from the journal thread.
    pub fn release_journal_zone_reference(&self, lock_number: usize) {
        self.release_journal_reference(lock_number);
    }

    /// Releases one per-entry lock from another zone. The release and the
    /// notification path are identical to the journal-thread variant; the
    /// entry point exists so call sites name where the release came from.
    pub fn release_journal_zone_reference_from_other_zone(&self, lock_number: usize) {
        self.release_journal_reference(lock_number);
    }

    /// Posts an unlock notification for the slot unless one is already
    /// outstanding.
    fn attempt_notification(&self, lock_number: usize) {
        if self.notification_states[lock_number]
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            tracing::debug!(lock_number, "journal unlock notification posted");
            self.notifications.lock().push_back(lock_number);
        }
    }

    /// Acknowledges the outstanding notification for the slot, allowing
    /// later releases to post a new one. Journal thread, first thing in the
    /// reap callback.
    pub fn acknowledge_unlock(&self, lock_number: usize) {
        self.notification_states[lock_number].store(false, Ordering::Release);
    }

    /// Removes the oldest posted notification. Drained by the journal
    /// driver, which re-enters the journal's reap callback per slot.
    pub fn poll_notification(&self) -> Option<usize> {
        self.notifications.lock().pop_front()
    }
}
