#![cfg(not(loom))]

use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed};
use std::sync::atomic::{AtomicPtr, AtomicUsize};
use std::sync::Mutex;
use std::thread;

use lazy_static::lazy_static;
use rand::prelude::*;

use hazard_smr::{Collector, Config, Error, ScanStrategy};

const STRESS_THREADS: usize = 8;
const STRESS_RETIRES: usize = 5000;

lazy_static! {
    static ref COLLECTOR: Collector = Collector::new(Config::default());
}

static STRESS_DROPS: AtomicUsize = AtomicUsize::new(0);

struct TestNode {
    foo: usize,
    bar: usize,
}

impl Drop for TestNode {
    fn drop(&mut self) {
        STRESS_DROPS.fetch_add(1, Relaxed);
    }
}

fn node_producer(i: usize) -> Box<TestNode> {
    if i % 2 == 0 {
        Box::new(TestNode { foo: i, bar: i + 1 })
    } else {
        Box::new(TestNode { foo: 0, bar: 0 })
    }
}

#[test]
fn count_drop() {
    let mut handle_array = Vec::new();

    for _i in 0..STRESS_THREADS {
        let handle = thread::spawn(move || {
            let local = COLLECTOR.register().unwrap();
            for j in 0..STRESS_RETIRES {
                local.retire(node_producer(j)).unwrap();
            }
        });
        handle_array.push(handle);
    }
    for handle in handle_array {
        handle.join().unwrap();
    }

    // Entries that were still guarded when their thread released stay
    // behind in FREE records; one force-scan drains them all.
    let local = COLLECTOR.register().unwrap();
    local.force_scan();
    drop(local);

    assert_eq!(STRESS_DROPS.load(Relaxed), STRESS_THREADS * STRESS_RETIRES);
}

static CHURN_DROPS: AtomicUsize = AtomicUsize::new(0);

struct Counter(AtomicUsize);

impl Drop for Counter {
    fn drop(&mut self) {
        CHURN_DROPS.fetch_add(1, Relaxed);
    }
}

/// Readers protect the shared pointer while writers swap it out and retire
/// the previous value; every retired node must be dropped exactly once by
/// the time the collector is gone.
#[test]
fn guarded_churn() {
    static RETIRED: AtomicUsize = AtomicUsize::new(0);

    let collector = Collector::new(Config {
        guard_count: 1,
        max_threads: STRESS_THREADS,
        max_retired: 64,
        strategy: ScanStrategy::InPlace,
    });
    let shared = AtomicPtr::new(Box::into_raw(Box::new(Counter(AtomicUsize::new(0)))));

    thread::scope(|scope| {
        for _ in 0..STRESS_THREADS {
            scope.spawn(|| {
                let mut rng = rand::thread_rng();
                let local = collector.register().unwrap();
                let guard = local.hazard().unwrap();

                for round in 0..500usize {
                    let current = guard.protect(&shared);
                    let observed = unsafe { (*current).0.fetch_add(1, Relaxed) };
                    assert!(observed < usize::MAX, "freed node observed through a guard");

                    if rng.gen_ratio(1, 4) {
                        let fresh = Box::into_raw(Box::new(Counter(AtomicUsize::new(round))));
                        let previous = shared.swap(fresh, AcqRel);
                        guard.clear();
                        unsafe { local.retire(Box::from_raw(previous)).unwrap() };
                        RETIRED.fetch_add(1, Relaxed);
                    } else {
                        guard.clear();
                    }
                }
            });
        }
    });

    let remaining = shared.load(Acquire);
    drop(unsafe { Box::from_raw(remaining) });
    let retired = RETIRED.load(Relaxed);
    drop(collector);

    // retired nodes + the final node left in the structure
    assert_eq!(CHURN_DROPS.load(Relaxed), retired + 1);
}

#[test]
fn hazard_slots_are_a_hard_limit() {
    let collector = Collector::new(Config {
        guard_count: 2,
        max_threads: 2,
        max_retired: 0,
        strategy: ScanStrategy::Classic,
    });
    let local = collector.register().unwrap();

    let first = local.hazard().unwrap();
    let _second = local.hazard().unwrap();
    assert_eq!(local.hazard().err().unwrap(), Error::GuardsExhausted(2));

    // Dropping a guard returns its slot.
    drop(first);
    assert!(local.hazard().is_ok());
}

lazy_static! {
    static ref DIFF_LOG: Mutex<Vec<usize>> = Mutex::new(Vec::new());
}

unsafe fn diff_dispose(addr: *mut u8) {
    DIFF_LOG.lock().unwrap().push(addr as usize);
    drop(Box::from_raw(addr as *mut u64));
}

fn run_strategy(strategy: ScanStrategy, guarded: &[usize], total: usize) -> Vec<usize> {
    let collector = Collector::new(Config {
        guard_count: 4,
        max_threads: 2,
        max_retired: 32,
        strategy,
    });
    let reader = collector.register().unwrap();
    let writer = collector.register().unwrap();

    let addrs: Vec<*mut u8> = (0..total)
        .map(|value| Box::into_raw(Box::new(value as u64)) as *mut u8)
        .collect();

    let guards: Vec<_> = guarded
        .iter()
        .map(|&index| {
            let guard = reader.hazard().unwrap();
            guard.set(addrs[index]);
            guard
        })
        .collect();

    for &addr in &addrs {
        unsafe { writer.retire_with(addr, diff_dispose).unwrap() };
    }

    DIFF_LOG.lock().unwrap().clear();
    writer.scan();
    let disposed_addrs = std::mem::take(&mut *DIFF_LOG.lock().unwrap());

    let mut disposed: Vec<usize> = disposed_addrs
        .into_iter()
        .map(|addr| addrs.iter().position(|&a| a as usize == addr).unwrap())
        .collect();
    disposed.sort_unstable();

    drop(guards);
    writer.scan();
    disposed
}

/// Classic and in-place scans must make identical disposal decisions for
/// identical guard/retired snapshots.
#[test]
fn scan_strategies_are_equivalent() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    const TOTAL: usize = 12;

    for _ in 0..50 {
        let guard_count = rng.gen_range(0..=4);
        let mut indices: Vec<usize> = (0..TOTAL).collect();
        indices.shuffle(&mut rng);
        let guarded: Vec<usize> = indices[..guard_count].to_vec();

        let mut expected: Vec<usize> = (0..TOTAL).filter(|i| !guarded.contains(i)).collect();
        expected.sort_unstable();

        let classic = run_strategy(ScanStrategy::Classic, &guarded, TOTAL);
        let inplace = run_strategy(ScanStrategy::InPlace, &guarded, TOTAL);

        assert_eq!(classic, expected);
        assert_eq!(classic, inplace);
    }
}
