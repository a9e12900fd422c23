//! Per-client thread records and their hazard-slot storage.

use core::alloc::Layout;
use core::ptr;
use std::cell::Cell;

use crate::alloc::AllocHooks;
use crate::error::Error;
use crate::retired::{Retired, RetiredSet};
use crate::sync::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

const NO_SLOT: usize = usize::MAX;

/// One hazard slot. The atomic pointer is the published hazard; the
/// free-list link is owner-local bookkeeping and never read cross-thread.
pub(crate) struct HazardSlot {
    hazard: AtomicPtr<u8>,
    next_free: Cell<usize>,
}

impl HazardSlot {
    fn new(next_free: usize) -> HazardSlot {
        HazardSlot {
            hazard: AtomicPtr::new(ptr::null_mut()),
            next_free: Cell::new(next_free),
        }
    }

    #[inline]
    pub(crate) fn publish(&self, ptr: *mut u8) {
        self.hazard.store(ptr, Ordering::Release);
    }

    #[inline]
    pub(crate) fn retract(&self) {
        self.hazard.store(ptr::null_mut(), Ordering::Release);
    }

    #[inline]
    pub(crate) fn load(&self, order: Ordering) -> *mut u8 {
        self.hazard.load(order)
    }
}

/// Fixed-capacity hazard-slot array with an owner-local free list.
pub(crate) struct HazardStorage {
    slots: *mut HazardSlot,
    capacity: usize,
    free_head: Cell<usize>,
    alloc_guard_count: AtomicUsize,
    free_guard_count: AtomicUsize,
}

impl HazardStorage {
    unsafe fn new(slots: *mut HazardSlot, capacity: usize) -> HazardStorage {
        HazardStorage {
            slots,
            capacity,
            free_head: Cell::new(if capacity == 0 { NO_SLOT } else { 0 }),
            alloc_guard_count: AtomicUsize::new(0),
            free_guard_count: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub(crate) fn slot(&self, index: usize) -> &HazardSlot {
        debug_assert!(index < self.capacity);
        unsafe { &*self.slots.add(index) }
    }

    /// All slots, for the scan-side guard collection pass. Readers may only
    /// touch the atomic hazard pointer of each slot.
    #[inline]
    pub(crate) fn iter(&self) -> impl Iterator<Item = &HazardSlot> {
        let slots = unsafe { std::slice::from_raw_parts(self.slots, self.capacity) };
        slots.iter()
    }

    /// Hands out a free slot index, owner only.
    pub(crate) fn try_alloc(&self) -> Option<usize> {
        let head = self.free_head.get();
        if head == NO_SLOT {
            return None;
        }
        self.free_head.set(self.slot(head).next_free.get());
        self.alloc_guard_count.fetch_add(1, Ordering::Relaxed);
        Some(head)
    }

    /// Returns a slot to the free list, owner only. Clears the hazard.
    pub(crate) fn free(&self, index: usize) {
        let slot = self.slot(index);
        slot.retract();
        slot.next_free.set(self.free_head.get());
        self.free_head.set(index);
        self.free_guard_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Retracts every hazard and rebuilds the free list. Run on the release
    /// path so a recycled record always starts from a clean slate.
    pub(crate) fn clear(&self) {
        for index in 0..self.capacity {
            let slot = self.slot(index);
            slot.retract();
            slot.next_free
                .set(if index + 1 < self.capacity { index + 1 } else { NO_SLOT });
        }
        self.free_head.set(if self.capacity == 0 { NO_SLOT } else { 0 });
    }

    pub(crate) fn guard_counters(&self) -> (usize, usize) {
        (
            self.alloc_guard_count.load(Ordering::Relaxed),
            self.free_guard_count.load(Ordering::Relaxed),
        )
    }
}

/// Per-client record: hazard slots, retired buffer, registry link and the
/// ownership hand-off state. Lives in one contiguous allocation:
///
/// ```text
/// +-------------------+
/// | ThreadRecord      |
/// +-------------------+
/// | HazardSlot[]      |
/// +-------------------+
/// | Retired[]         |
/// +-------------------+
/// ```
pub(crate) struct ThreadRecord {
    pub(crate) hazards: HazardStorage,
    pub(crate) retired: RetiredSet,
    /// Link to the previously published head. Written once before the
    /// record becomes reachable, immutable afterwards.
    pub(crate) next: *mut ThreadRecord,
    /// Points to the record itself while OWNED, null while FREE. The only
    /// cross-thread hand-off point for everything non-atomic in here.
    pub(crate) owner: AtomicPtr<ThreadRecord>,
    /// Hint that the retired buffer is empty so help-scan can skip the
    /// record without claiming it. Never authoritative on its own.
    pub(crate) drained: AtomicBool,
    pub(crate) retire_count: AtomicUsize,
    pub(crate) free_count: AtomicUsize,
    pub(crate) scan_count: AtomicUsize,
    pub(crate) help_scan_count: AtomicUsize,
}

// The non-atomic interior (slot free list, retired length) is only touched
// by the thread that currently holds the ownership CAS; every other thread
// restricts itself to the atomics. See the registry protocol in collector.rs.
unsafe impl Send for ThreadRecord {}
unsafe impl Sync for ThreadRecord {}

impl ThreadRecord {
    fn layout(guard_count: usize, retired_capacity: usize) -> Result<(Layout, usize, usize), Error> {
        let header = Layout::new::<ThreadRecord>();
        let slots = Layout::array::<HazardSlot>(guard_count).map_err(|_| Error::AllocFailed(usize::MAX))?;
        let entries = Layout::array::<Retired>(retired_capacity).map_err(|_| Error::AllocFailed(usize::MAX))?;
        let (layout, slots_offset) = header.extend(slots).map_err(|_| Error::AllocFailed(usize::MAX))?;
        let (layout, retired_offset) = layout.extend(entries).map_err(|_| Error::AllocFailed(usize::MAX))?;
        Ok((layout.pad_to_align(), slots_offset, retired_offset))
    }

    /// Allocates and initializes a record block. The new record starts out
    /// OWNED by the caller.
    pub(crate) fn create(
        guard_count: usize,
        retired_capacity: usize,
        hooks: AllocHooks,
    ) -> Result<*mut ThreadRecord, Error> {
        let (layout, slots_offset, retired_offset) = Self::layout(guard_count, retired_capacity)?;
        unsafe {
            let block = (hooks.alloc)(layout);
            if block.is_null() {
                return Err(Error::AllocFailed(layout.size()));
            }
            let record = block as *mut ThreadRecord;
            let slots = block.add(slots_offset) as *mut HazardSlot;
            let entries = block.add(retired_offset) as *mut Retired;

            for index in 0..guard_count {
                let next_free = if index + 1 < guard_count { index + 1 } else { NO_SLOT };
                ptr::write(slots.add(index), HazardSlot::new(next_free));
            }

            ptr::write(
                record,
                ThreadRecord {
                    hazards: HazardStorage::new(slots, guard_count),
                    retired: RetiredSet::new(entries, retired_capacity),
                    next: ptr::null_mut(),
                    owner: AtomicPtr::new(record),
                    drained: AtomicBool::new(false),
                    retire_count: AtomicUsize::new(0),
                    free_count: AtomicUsize::new(0),
                    scan_count: AtomicUsize::new(0),
                    help_scan_count: AtomicUsize::new(0),
                },
            );
            Ok(record)
        }
    }

    /// Tears a record block down and releases its memory. The retired
    /// buffer must already be empty.
    pub(crate) unsafe fn destroy(record: *mut ThreadRecord, hooks: AllocHooks) {
        debug_assert_eq!((*record).retired.len(), 0);

        let guard_count = (*record).hazards.capacity();
        let retired_capacity = (*record).retired.capacity();
        let (layout, slots_offset, _) = match Self::layout(guard_count, retired_capacity) {
            Ok(layout) => layout,
            Err(_) => return,
        };

        let block = record as *mut u8;
        let slots = block.add(slots_offset) as *mut HazardSlot;
        for index in 0..guard_count {
            ptr::drop_in_place(slots.add(index));
        }
        ptr::drop_in_place(record);
        (hooks.free)(block, layout);
    }

    #[inline]
    pub(crate) fn is_owned(&self) -> bool {
        !self.owner.load(Ordering::Relaxed).is_null()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::alloc;

    fn create(guards: usize, retired: usize) -> *mut ThreadRecord {
        ThreadRecord::create(guards, retired, alloc::current_hooks()).unwrap()
    }

    unsafe fn destroy(record: *mut ThreadRecord) {
        ThreadRecord::destroy(record, alloc::current_hooks());
    }

    #[test]
    fn new_record_is_owned_by_itself() {
        let record = create(4, 8);
        unsafe {
            assert_eq!((*record).owner.load(Ordering::Relaxed), record);
            assert!(!(*record).drained.load(Ordering::Relaxed));
            assert_eq!((*record).retired.len(), 0);
            destroy(record);
        }
    }

    #[test]
    fn slot_alloc_recycles_through_free_list() {
        let record = create(2, 4);
        let hazards = unsafe { &(*record).hazards };

        let first = hazards.try_alloc().unwrap();
        let second = hazards.try_alloc().unwrap();
        assert_ne!(first, second);
        assert!(hazards.try_alloc().is_none());

        hazards.free(second);
        assert_eq!(hazards.try_alloc(), Some(second));

        let (allocated, freed) = hazards.guard_counters();
        assert_eq!(allocated, 3);
        assert_eq!(freed, 1);

        hazards.free(first);
        hazards.free(second);
        unsafe { destroy(record) };
    }

    #[test]
    fn clear_retracts_hazards_and_restores_capacity() {
        let record = create(3, 4);
        let hazards = unsafe { &(*record).hazards };

        let slot = hazards.try_alloc().unwrap();
        hazards.slot(slot).publish(0x40 as *mut u8);
        let _ = hazards.try_alloc().unwrap();

        hazards.clear();
        for hazard in hazards.iter() {
            assert!(hazard.load(Ordering::Acquire).is_null());
        }
        for _ in 0..3 {
            assert!(hazards.try_alloc().is_some());
        }
        assert!(hazards.try_alloc().is_none());

        unsafe { destroy(record) };
    }
}
