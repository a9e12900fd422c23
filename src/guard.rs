//! RAII hazard slots.

use core::marker::PhantomData;

use crate::collector::Collector;
use crate::error::Error;
use crate::record::ThreadRecord;
use crate::sync::{AtomicPtr, Ordering};

/// One hazard slot of the calling context's record, held for the lifetime
/// of this value. Publishing an address through the guard keeps every
/// reclamation scan in the process from disposing it.
///
/// Dropping the guard retracts the published address and returns the slot
/// to the record's free list.
pub struct Guard<'a> {
    collector: &'a Collector,
    record: &'a ThreadRecord,
    slot: usize,
    // Slot bookkeeping is owner-local; the guard must stay on the thread
    // that claimed the record.
    _not_send: PhantomData<*mut ()>,
}

impl<'a> Guard<'a> {
    pub(crate) fn acquire(collector: &'a Collector, record: &'a ThreadRecord) -> Result<Guard<'a>, Error> {
        let slot = record
            .hazards
            .try_alloc()
            .ok_or_else(|| Error::GuardsExhausted(record.hazards.capacity()))?;
        Ok(Guard {
            collector,
            record,
            slot,
            _not_send: PhantomData,
        })
    }

    /// Publishes `ptr` in this slot. The store is followed by the
    /// collector's light barrier, so a scan that starts afterwards is
    /// guaranteed to observe it; the caller must still re-validate that
    /// `ptr` is reachable after publishing (see [`Guard::protect`]).
    #[inline]
    pub fn set<T>(&self, ptr: *mut T) {
        self.record.hazards.slot(self.slot).publish(ptr as *mut u8);
        self.collector.membar().light();
    }

    /// Retracts whatever this slot currently publishes.
    #[inline]
    pub fn clear(&self) {
        self.record.hazards.slot(self.slot).retract();
    }

    /// The currently published address, null when unused.
    #[inline]
    pub fn get(&self) -> *mut u8 {
        self.record.hazards.slot(self.slot).load(Ordering::Acquire)
    }

    /// Publish-and-validate loop: loads from `src`, publishes the value,
    /// and retries until the location still holds it after the publish.
    /// The returned pointer is safe to dereference until the guard is
    /// cleared, dropped or overwritten.
    pub fn protect<T>(&self, src: &AtomicPtr<T>) -> *mut T {
        let mut target = src.load(Ordering::Relaxed);
        loop {
            self.set(target);
            let current = src.load(Ordering::Acquire);
            if current == target {
                return target;
            }
            target = current;
        }
    }
}

impl Drop for Guard<'_> {
    fn drop(&mut self) {
        // free() retracts the hazard before relinking the slot.
        self.record.hazards.free(self.slot);
    }
}
