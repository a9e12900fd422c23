//! The record registry and reclamation driver.
//!
//! A [`Collector`] owns a lock-free, append-only list of thread records.
//! Records are claimed with a compare-and-swap on their `owner` field,
//! recycled on release and only ever deallocated when the collector itself
//! is dropped, so a list traversal never races record destruction.

use core::ptr;

use crossbeam_utils::CachePadded;
use log::{debug, trace};

use crate::alloc::{self, AllocHooks};
use crate::error::Error;
use crate::guard::Guard;
use crate::membar::MemBar;
use crate::record::ThreadRecord;
use crate::retired::{dispose_boxed, DisposeFn, Retired};
use crate::scan::{classic_scan, inplace_scan};
use crate::sync::{AtomicPtr, Ordering};

const DEFAULT_GUARDS_PER_RECORD: usize = 8;
const DEFAULT_MAX_THREADS: usize = 100;

/// Which reclamation algorithm a scan dispatches to. Chosen once at
/// construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanStrategy {
    /// Snapshot every published hazard into a sorted scratch list.
    Classic,
    /// Allocation-free variant that marks retired entries in place.
    InPlace,
}

impl Default for ScanStrategy {
    fn default() -> ScanStrategy {
        ScanStrategy::Classic
    }
}

/// Collector construction parameters. A zero means "use the default"
/// (8 hazard slots per record, 100 records). The retired capacity is raised
/// to twice `guard_count * max_threads` whenever the requested value is
/// smaller, so one full sweep of all published hazards always fits.
#[derive(Clone, Copy, Debug, Default)]
pub struct Config {
    pub guard_count: usize,
    pub max_threads: usize,
    pub max_retired: usize,
    pub strategy: ScanStrategy,
}

/// Aggregated per-record diagnostic counters. Values are racy snapshots;
/// they are maintained with relaxed operations and only meant for
/// observability.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stat {
    pub thread_rec_count: usize,
    pub guard_allocated: usize,
    pub guard_freed: usize,
    pub retired_count: usize,
    pub free_count: usize,
    pub scan_count: usize,
    pub help_scan_count: usize,
}

fn effective_retired_capacity(requested: usize, guard_count: usize, max_threads: usize) -> usize {
    let min_size = guard_count * max_threads;
    if requested < min_size {
        min_size * 2
    } else {
        requested
    }
}

/// The hazard-pointer registry and reclamation engine.
pub struct Collector {
    head: CachePadded<AtomicPtr<ThreadRecord>>,
    guard_count: usize,
    max_threads: usize,
    max_retired: usize,
    strategy: ScanStrategy,
    membar: MemBar,
    hooks: AllocHooks,
}

impl Collector {
    pub fn new(config: Config) -> Collector {
        let guard_count = if config.guard_count == 0 {
            DEFAULT_GUARDS_PER_RECORD
        } else {
            config.guard_count
        };
        let max_threads = if config.max_threads == 0 {
            DEFAULT_MAX_THREADS
        } else {
            config.max_threads
        };
        let max_retired = effective_retired_capacity(config.max_retired, guard_count, max_threads);
        let membar = MemBar::select();
        debug!(
            "collector: {} hazard slots/record, {} retired entries/record, {:?} scan, {:?} barrier",
            guard_count, max_retired, config.strategy, membar
        );
        Collector {
            head: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
            guard_count,
            max_threads,
            max_retired,
            strategy: config.strategy,
            membar,
            hooks: alloc::current_hooks(),
        }
    }

    /// Claims a record for the calling context. Dropping the handle runs
    /// the full release path (guard retraction, scan, help-scan).
    pub fn register(&self) -> Result<LocalHandle<'_>, Error> {
        let record = self.allocate()?;
        Ok(LocalHandle {
            collector: self,
            record,
        })
    }

    pub fn guard_count(&self) -> usize {
        self.guard_count
    }

    pub fn max_retired(&self) -> usize {
        self.max_retired
    }

    pub fn strategy(&self) -> ScanStrategy {
        self.strategy
    }

    #[inline]
    pub(crate) fn head(&self) -> &AtomicPtr<ThreadRecord> {
        &self.head
    }

    #[inline]
    pub(crate) fn membar(&self) -> MemBar {
        self.membar
    }

    /// Scratch-list sizing for the classic scan.
    #[inline]
    pub(crate) fn hazard_estimate(&self) -> usize {
        self.guard_count * self.max_threads
    }

    /// Returns a ready-to-use record: first a claim walk over the list
    /// (CAS `owner` from null to the record), then a fresh arena block
    /// prepended with a CAS loop on `head`. Prepending is safe against
    /// concurrent traversals because list nodes are never unlinked.
    pub(crate) fn allocate(&self) -> Result<*mut ThreadRecord, Error> {
        let mut node = self.head.load(Ordering::Acquire);
        while let Some(record) = unsafe { node.as_ref() } {
            if record
                .owner
                .compare_exchange(ptr::null_mut(), node, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                record.drained.store(false, Ordering::Release);
                return Ok(node);
            }
            node = record.next;
        }

        let record = ThreadRecord::create(self.guard_count, self.max_retired, self.hooks)?;
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            unsafe { (*record).next = head };
            match self
                .head
                .compare_exchange_weak(head, record, Ordering::Release, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(current) => head = current,
            }
        }
        trace!("collector: published a fresh thread record");
        Ok(record)
    }

    /// Releases an owned record back to the pool. The final store of
    /// `owner` is the hand-off point: it happens after the guard
    /// retraction and the scans, so a claimant never sees a half-released
    /// record.
    pub(crate) unsafe fn release(&self, record: *mut ThreadRecord, help: bool) {
        let rec = &*record;
        debug_assert_eq!(rec.owner.load(Ordering::Relaxed), record);

        rec.hazards.clear();
        self.scan(rec);
        if help {
            self.help_scan(rec);
        }
        rec.owner.store(ptr::null_mut(), Ordering::Release);
    }

    /// Force-releases every currently owned record. Teardown only; must
    /// not race ordinary API calls.
    pub(crate) fn detach_all(&self) {
        let mut node = self.head.load(Ordering::Acquire);
        while let Some(record) = unsafe { node.as_ref() } {
            let record_ptr = node;
            node = record.next;
            if record.is_owned() {
                unsafe { self.release(record_ptr, false) };
            }
        }
    }

    /// Runs the configured reclamation algorithm over `record`'s retired
    /// buffer.
    pub(crate) fn scan(&self, record: &ThreadRecord) {
        match self.strategy {
            ScanStrategy::Classic => classic_scan(self, record),
            ScanStrategy::InPlace => inplace_scan(self, record),
        }
    }

    /// Absorbs retired work abandoned in released-but-undrained records.
    /// Claims each donor through the same ownership CAS as `allocate`, so
    /// a record is drained by exactly one helper.
    pub(crate) fn help_scan(&self, record: &ThreadRecord) {
        debug_assert!(record.is_owned());
        record.help_scan_count.fetch_add(1, Ordering::Relaxed);

        let mut node = self.head.load(Ordering::Acquire);
        while let Some(donor) = unsafe { node.as_ref() } {
            let donor_ptr = node;
            node = donor.next;

            if ptr::eq(donor, record) {
                continue;
            }
            if donor.drained.load(Ordering::Acquire) {
                continue;
            }
            if donor
                .owner
                .compare_exchange(ptr::null_mut(), donor_ptr, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                // Owned by its thread, or another helper got here first.
                continue;
            }

            // Sole owner of the donor now; move its pending entries into
            // our own buffer, scanning whenever it fills up.
            let pending = unsafe { donor.retired.entries_mut() };
            let absorbed = pending.len();
            for &entry in pending.iter() {
                if record.retired.is_full() {
                    self.scan(record);
                }
                let pushed = record.retired.try_push(entry);
                debug_assert!(pushed, "retired capacity below the guards-in-flight bound");
            }
            donor.retired.truncate(0);
            donor.drained.store(true, Ordering::Release);
            donor.owner.store(ptr::null_mut(), Ordering::Release);

            if absorbed > 0 {
                trace!("help-scan absorbed {} retired entries", absorbed);
            }
            self.scan(record);
        }
    }

    /// Appends to `record`'s retired buffer, scanning (and as a last
    /// resort help-scanning) to make room when it is full.
    pub(crate) fn retire_on(&self, record: &ThreadRecord, entry: Retired) -> Result<(), Error> {
        if !record.retired.try_push(entry) {
            self.scan(record);
            if !record.retired.try_push(entry) {
                self.help_scan(record);
                if !record.retired.try_push(entry) {
                    return Err(Error::RetiredOverflow);
                }
            }
        }
        record.retire_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Sums the diagnostic counters over every record in the registry.
    pub fn statistics(&self) -> Stat {
        let mut stat = Stat::default();
        let mut node = self.head.load(Ordering::Acquire);
        while let Some(record) = unsafe { node.as_ref() } {
            stat.thread_rec_count += 1;
            let (allocated, freed) = record.hazards.guard_counters();
            stat.guard_allocated += allocated;
            stat.guard_freed += freed;
            stat.retired_count += record.retire_count.load(Ordering::Relaxed);
            stat.free_count += record.free_count.load(Ordering::Relaxed);
            stat.scan_count += record.scan_count.load(Ordering::Relaxed);
            stat.help_scan_count += record.help_scan_count.load(Ordering::Relaxed);
            node = record.next;
        }
        stat
    }
}

impl Drop for Collector {
    /// Teardown walk: dispose whatever is still pending in each record,
    /// then release the record blocks through the allocator the collector
    /// was constructed with. Exclusive access is the caller's contract.
    fn drop(&mut self) {
        debug!("collector teardown: {:?}", self.statistics());

        let mut node = self.head.load(Ordering::Relaxed);
        self.head.store(ptr::null_mut(), Ordering::Relaxed);

        let mut disposed = 0usize;
        while !node.is_null() {
            unsafe {
                let record = &*node;
                let next = record.next;

                let owner = record.owner.load(Ordering::Relaxed);
                debug_assert!(
                    owner.is_null() || owner == node,
                    "record owned by a foreign record at teardown"
                );

                let pending = record.retired.entries_mut();
                disposed += pending.len();
                for &entry in pending.iter() {
                    entry.dispose();
                }
                record.retired.truncate(0);

                ThreadRecord::destroy(node, self.hooks);
                node = next;
            }
        }
        if disposed > 0 {
            debug!("collector teardown disposed {} leftover retired entries", disposed);
        }
    }
}

/// An owned registration in a [`Collector`]. One record is claimed for the
/// lifetime of the handle; dropping it releases the record for reuse.
///
/// The handle is deliberately neither `Send` nor `Sync`: everything
/// non-atomic in the underlying record is single-owner state.
pub struct LocalHandle<'c> {
    collector: &'c Collector,
    record: *mut ThreadRecord,
}

impl<'c> LocalHandle<'c> {
    #[inline]
    fn record(&self) -> &ThreadRecord {
        unsafe { &*self.record }
    }

    pub fn collector(&self) -> &'c Collector {
        self.collector
    }

    /// Acquires one hazard slot of this record.
    pub fn hazard(&self) -> Result<Guard<'_>, Error> {
        Guard::acquire(self.collector, self.record())
    }

    /// Hands a heap value over to the reclamation engine. The value is
    /// dropped once no guard anywhere publishes its address.
    ///
    /// On [`Error::RetiredOverflow`] the value is leaked rather than
    /// dropped early; overflow means the caller broke the capacity
    /// contract and early disposal could be a use-after-free.
    pub fn retire<T: 'static>(&self, garbage: Box<T>) -> Result<(), Error> {
        unsafe { self.retire_with(Box::into_raw(garbage) as *mut u8, dispose_boxed::<T>) }
    }

    /// Defers `dispose(addr)` until no guard publishes `addr`.
    ///
    /// # Safety
    ///
    /// `addr` must be at least 2-byte aligned, must not be retired again
    /// before it is disposed, and must stay valid until the disposer runs.
    pub unsafe fn retire_with(&self, addr: *mut u8, dispose: DisposeFn) -> Result<(), Error> {
        self.collector.retire_on(self.record(), Retired::new(addr, dispose))
    }

    /// Explicit reclamation pass over this record's retired buffer.
    pub fn scan(&self) {
        self.collector.scan(self.record());
    }

    /// Reclamation pass that also absorbs work abandoned in released
    /// records.
    pub fn force_scan(&self) {
        self.collector.scan(self.record());
        self.collector.help_scan(self.record());
    }
}

impl Drop for LocalHandle<'_> {
    fn drop(&mut self) {
        unsafe { self.collector.release(self.record, true) };
    }
}
