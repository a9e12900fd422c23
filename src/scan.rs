//! The two reclamation algorithms.
//!
//! Both take the calling thread's record (the retired buffer to compact)
//! and walk the registry list for published hazards. They must reach the
//! same disposal decisions for the same snapshot; the in-place variant only
//! removes the scratch allocation by borrowing the low bit of each retired
//! address.
//!
//! Records observed FREE are skipped while collecting hazards: a guard
//! published by a record that is concurrently becoming OWNED necessarily
//! postdates this scan and cannot protect an address that was retired
//! before the scan began.

use crate::collector::Collector;
use crate::record::ThreadRecord;
use crate::sync::Ordering;

/// Snapshot-and-sort scan: collect every published hazard into a scratch
/// list, sort it, then binary-search each retired address.
pub(crate) fn classic_scan(collector: &Collector, record: &ThreadRecord) {
    record.scan_count.fetch_add(1, Ordering::Relaxed);
    collector.membar().heavy();

    let mut hazards: Vec<usize> = Vec::with_capacity(collector.hazard_estimate());
    let mut node = collector.head().load(Ordering::Acquire);
    while let Some(current) = unsafe { node.as_ref() } {
        if current.is_owned() {
            for slot in current.hazards.iter() {
                let hazard = slot.load(Ordering::Acquire);
                if !hazard.is_null() {
                    hazards.push(hazard as usize);
                }
            }
        }
        node = current.next;
    }
    hazards.sort_unstable();

    // Compares and disposes through `address()`, which masks the scratch
    // bit, so this also serves as the in-place algorithm's fallback when it
    // encounters a stale mark. Survivors are stored unmarked.
    let entries = unsafe { record.retired.entries_mut() };
    let mut survivors = 0;
    let mut freed = 0;
    for index in 0..entries.len() {
        let mut entry = entries[index];
        if hazards.binary_search(&entry.address()).is_ok() {
            entry.clear_mark();
            entries[survivors] = entry;
            survivors += 1;
        } else {
            unsafe { entry.dispose() };
            freed += 1;
        }
    }
    record.retired.truncate(survivors);
    record.free_count.fetch_add(freed, Ordering::Relaxed);
}

/// Allocation-free scan: sort the retired buffer in place, then mark every
/// entry some hazard still points at by setting the low bit of its address.
///
/// A pre-set mark means a stale state (reentrancy or an invariant breach);
/// correctness comes first, so the classic algorithm takes over.
pub(crate) fn inplace_scan(collector: &Collector, record: &ThreadRecord) {
    {
        let entries = unsafe { record.retired.entries_mut() };
        if entries.is_empty() {
            return;
        }
        if entries.iter().any(|entry| entry.is_marked()) {
            classic_scan(collector, record);
            return;
        }
    }

    record.scan_count.fetch_add(1, Ordering::Relaxed);
    collector.membar().heavy();

    let entries = unsafe { record.retired.entries_mut() };
    entries.sort_unstable_by_key(|entry| entry.address());

    // Adjacent equal addresses mean the same pointer was retired twice
    // before being freed.
    debug_assert!(
        entries.windows(2).all(|pair| pair[0].address() < pair[1].address()),
        "duplicate address in retired buffer"
    );

    let mut node = collector.head().load(Ordering::Acquire);
    while let Some(current) = unsafe { node.as_ref() } {
        if current.is_owned() {
            for slot in current.hazards.iter() {
                let hazard = slot.load(Ordering::Relaxed) as usize;
                if hazard == 0 {
                    continue;
                }
                if let Ok(found) = entries.binary_search_by_key(&hazard, |entry| entry.address()) {
                    entries[found].mark();
                }
            }
        }
        node = current.next;
    }

    let mut survivors = 0;
    let mut freed = 0;
    for index in 0..entries.len() {
        let mut entry = entries[index];
        if entry.is_marked() {
            entry.clear_mark();
            entries[survivors] = entry;
            survivors += 1;
        } else {
            unsafe { entry.dispose() };
            freed += 1;
        }
    }
    record.retired.truncate(survivors);
    record.free_count.fetch_add(freed, Ordering::Relaxed);
}
