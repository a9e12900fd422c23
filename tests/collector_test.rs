#![cfg(loom)]

use loom::lazy_static;
use loom::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use loom::sync::Arc;
use loom::thread;

use hazard_smr::{Collector, Config, ScanStrategy};

lazy_static! {
    static ref DISPOSED: AtomicUsize = AtomicUsize::new(0);
}

unsafe fn count_dispose(addr: *mut u8) {
    DISPOSED.fetch_add(1, Ordering::Relaxed);
    drop(Box::from_raw(addr as *mut u64));
}

fn small_config() -> Config {
    Config {
        guard_count: 1,
        max_threads: 2,
        max_retired: 4,
        strategy: ScanStrategy::Classic,
    }
}

// A reader protecting the shared node races a writer that swaps it out,
// retires it and scans. Whatever the interleaving, the old node is
// disposed exactly once and never while the reader can still see it.
#[test]
fn guarded_node_is_never_lost_or_double_freed() {
    loom::model(|| {
        let collector = Arc::new(Collector::new(small_config()));
        let shared = Arc::new(AtomicPtr::new(Box::into_raw(Box::new(1u64))));

        let reader_collector = collector.clone();
        let reader_shared = shared.clone();
        let reader = thread::spawn(move || {
            let local = reader_collector.register().unwrap();
            let guard = local.hazard().unwrap();
            let node = guard.protect(&reader_shared);
            let value = unsafe { *node };
            assert!(value == 1 || value == 2);
        });

        let writer_collector = collector.clone();
        let writer_shared = shared.clone();
        let writer = thread::spawn(move || {
            let local = writer_collector.register().unwrap();
            let previous = writer_shared.swap(Box::into_raw(Box::new(2u64)), Ordering::AcqRel);
            unsafe { local.retire_with(previous as *mut u8, count_dispose).unwrap() };
            local.scan();
        });

        reader.join().unwrap();
        writer.join().unwrap();

        // Drain whatever was still guarded when the writer released.
        let local = collector.register().unwrap();
        local.force_scan();
        drop(local);
        assert_eq!(DISPOSED.load(Ordering::Relaxed), 1);

        drop(unsafe { Box::from_raw(shared.load(Ordering::Acquire)) });
    });
}

// Two threads register and release; a later claim must recycle one of the
// FREE records instead of growing the list.
#[test]
fn records_are_recycled_through_the_ownership_cas() {
    loom::model(|| {
        let collector = Arc::new(Collector::new(small_config()));

        let first_collector = collector.clone();
        let first = thread::spawn(move || {
            drop(first_collector.register().unwrap());
        });
        let second_collector = collector.clone();
        let second = thread::spawn(move || {
            drop(second_collector.register().unwrap());
        });
        first.join().unwrap();
        second.join().unwrap();

        let records = collector.statistics().thread_rec_count;
        assert!(records >= 1 && records <= 2);

        let local = collector.register().unwrap();
        drop(local);
        assert_eq!(collector.statistics().thread_rec_count, records);
    });
}
