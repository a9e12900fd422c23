//! The process-wide collector and the per-thread attachment surface.
//!
//! The singleton is guarded by an atomic initialization pointer, so two
//! threads racing the first [`construct`] cannot double-initialize; the
//! loser drops its instance and reports that it did not win. Everything
//! else on this surface requires external discipline exactly like the
//! instance API: [`destruct`] must not race any other call.
//!
//! Threads attach lazily: the first guard, retire or scan on an unattached
//! thread claims a record. A thread-local holder releases the record when
//! the thread exits, provided the collector it belongs to is still the
//! current one. Threads that may outlive the collector should call
//! [`detach`] explicitly (or be swept by `destruct(true)`).

use core::ptr;
use std::cell::Cell;

use crate::alloc::{self, AllocFn, FreeFn};
use crate::collector::{Collector, Config, Stat};
use crate::error::Error;
use crate::guard::Guard;
use crate::record::ThreadRecord;
use crate::retired::{dispose_boxed, DisposeFn, Retired};
use crate::sync::{lazy_static, thread_local, AtomicPtr, Ordering};

lazy_static! {
    static ref INSTANCE: AtomicPtr<Collector> = AtomicPtr::new(ptr::null_mut());
}

struct ThreadEntry {
    collector: Cell<*const Collector>,
    record: Cell<*mut ThreadRecord>,
}

impl ThreadEntry {
    fn new() -> ThreadEntry {
        ThreadEntry {
            collector: Cell::new(ptr::null()),
            record: Cell::new(ptr::null_mut()),
        }
    }
}

impl Drop for ThreadEntry {
    fn drop(&mut self) {
        let record = self.record.get();
        if record.is_null() {
            return;
        }
        // Only release into the collector this record was claimed from; if
        // the registry was already torn down the record memory is gone with
        // it and there is nothing left to hand back.
        let collector = self.collector.get();
        if !collector.is_null() && INSTANCE.load(Ordering::Acquire) as *const Collector == collector {
            unsafe { (*collector).release(record, true) };
        }
    }
}

thread_local! {
    static ENTRY: ThreadEntry = ThreadEntry::new();
}

/// Initializes the process-wide collector. Returns whether this call
/// performed the initialization; once constructed, later calls are no-ops
/// until [`destruct`].
pub fn construct(config: Config) -> bool {
    let fresh = Box::into_raw(Box::new(Collector::new(config)));
    match INSTANCE.compare_exchange(ptr::null_mut(), fresh, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => true,
        Err(_) => {
            unsafe { drop(Box::from_raw(fresh)) };
            false
        }
    }
}

/// Tears the process-wide collector down, disposing everything still
/// retired. With `detach_all`, records still owned by live threads are
/// force-released first.
///
/// Must not run concurrently with any other call on this surface; that is
/// the caller's contract, not a runtime check.
pub fn destruct(detach_all: bool) {
    let instance = INSTANCE.swap(ptr::null_mut(), Ordering::AcqRel);
    if instance.is_null() {
        return;
    }
    unsafe {
        if detach_all {
            (*instance).detach_all();
        }
        drop(Box::from_raw(instance));
    }
}

pub(crate) fn is_constructed() -> bool {
    !INSTANCE.load(Ordering::Acquire).is_null()
}

/// The process-wide collector, for direct [`Collector::register`] use.
pub fn default_collector() -> Result<&'static Collector, Error> {
    let instance = INSTANCE.load(Ordering::Acquire);
    if instance.is_null() {
        Err(Error::NotConstructed)
    } else {
        Ok(unsafe { &*instance })
    }
}

/// Replaces the raw allocator used for record blocks. Rejected once the
/// collector is constructed.
pub fn set_allocator(alloc_fn: AllocFn, free_fn: FreeFn) -> Result<(), Error> {
    if is_constructed() {
        return Err(Error::AllocatorLocked);
    }
    alloc::install(alloc_fn, free_fn);
    Ok(())
}

fn with_attached<R>(f: impl FnOnce(&'static Collector, &'static ThreadRecord) -> R) -> Result<R, Error> {
    let collector = default_collector()?;
    ENTRY.with(|entry| {
        if entry.record.get().is_null() || entry.collector.get() != collector as *const Collector {
            let record = collector.allocate()?;
            entry.collector.set(collector);
            entry.record.set(record);
        }
        let record = unsafe { &*entry.record.get() };
        Ok(f(collector, record))
    })
}

/// Claims a record for the calling thread. Idempotent while the thread
/// stays attached to the current collector.
pub fn attach() -> Result<(), Error> {
    with_attached(|_, _| ())
}

/// Releases the calling thread's record, if any. The record's guards are
/// retracted, its retired buffer is scanned and a help-scan sweeps other
/// abandoned records before the hand-off.
pub fn detach() {
    ENTRY.with(|entry| {
        let record = entry.record.get();
        if record.is_null() {
            return;
        }
        entry.record.set(ptr::null_mut());
        let collector = entry.collector.get();
        entry.collector.set(ptr::null());
        if !collector.is_null() && INSTANCE.load(Ordering::Acquire) as *const Collector == collector {
            unsafe { (*collector).release(record, true) };
        }
    });
}

/// Acquires one hazard slot on the calling thread's record, attaching the
/// thread first if needed.
pub fn hazard() -> Result<Guard<'static>, Error> {
    with_attached(Guard::acquire).and_then(|guard| guard)
}

/// Hands a heap value to the process-wide collector; it is dropped once no
/// guard publishes its address. See [`crate::LocalHandle::retire`] for the
/// overflow behavior.
pub fn retire<T: 'static>(garbage: Box<T>) -> Result<(), Error> {
    let addr = Box::into_raw(garbage) as *mut u8;
    unsafe { retire_with(addr, dispose_boxed::<T>) }
}

/// Defers `dispose(addr)` until no guard publishes `addr`.
///
/// # Safety
///
/// Same contract as [`crate::LocalHandle::retire_with`].
pub unsafe fn retire_with(addr: *mut u8, dispose: DisposeFn) -> Result<(), Error> {
    with_attached(|collector, record| collector.retire_on(record, Retired::new(addr, dispose)))
        .and_then(|result| result)
}

/// Explicit reclamation pass over the calling thread's retired buffer.
pub fn scan() -> Result<(), Error> {
    with_attached(|collector, record| collector.scan(record))
}

/// Reclamation pass that additionally absorbs retired work abandoned in
/// released records.
pub fn force_scan() -> Result<(), Error> {
    with_attached(|collector, record| {
        collector.scan(record);
        collector.help_scan(record);
    })
}

/// Snapshot of the aggregate diagnostic counters.
pub fn statistics() -> Result<Stat, Error> {
    Ok(default_collector()?.statistics())
}
