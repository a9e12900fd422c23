//! Raw allocator indirection.
//!
//! All thread-record blocks go through a swappable pair of allocation
//! functions so that embedders can route registry memory into their own
//! allocator. The pair can only be replaced before the global collector is
//! constructed; a `Collector` snapshots the installed pair at construction
//! time and keeps using it for its whole lifetime, teardown included.

use core::alloc::Layout;
use std::ptr;

use crate::sync::{lazy_static, AtomicPtr, Ordering};

/// Allocates a block for the given layout, returning null on failure.
pub type AllocFn = unsafe fn(Layout) -> *mut u8;

/// Releases a block previously obtained from the paired [`AllocFn`].
pub type FreeFn = unsafe fn(*mut u8, Layout);

#[derive(Clone, Copy)]
pub(crate) struct AllocHooks {
    pub(crate) alloc: AllocFn,
    pub(crate) free: FreeFn,
}

unsafe fn default_alloc(layout: Layout) -> *mut u8 {
    std::alloc::alloc(layout)
}

unsafe fn default_free(ptr: *mut u8, layout: Layout) {
    std::alloc::dealloc(ptr, layout)
}

const DEFAULT_HOOKS: AllocHooks = AllocHooks {
    alloc: default_alloc,
    free: default_free,
};

lazy_static! {
    static ref INSTALLED: AtomicPtr<AllocHooks> = AtomicPtr::new(ptr::null_mut());
}

/// The hook pair in effect right now.
pub(crate) fn current_hooks() -> AllocHooks {
    let installed = INSTALLED.load(Ordering::Acquire);
    if installed.is_null() {
        DEFAULT_HOOKS
    } else {
        unsafe { *installed }
    }
}

/// Replaces the hook pair. The caller (the `set_allocator` front end) is
/// responsible for rejecting installs once the global collector exists.
pub(crate) fn install(alloc: AllocFn, free: FreeFn) {
    let fresh = Box::into_raw(Box::new(AllocHooks { alloc, free }));
    let previous = INSTALLED.swap(fresh, Ordering::AcqRel);
    if !previous.is_null() {
        unsafe { drop(Box::from_raw(previous)) };
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn default_hooks_round_trip() {
        let layout = Layout::from_size_align(64, 8).unwrap();
        let hooks = current_hooks();
        unsafe {
            let block = (hooks.alloc)(layout);
            assert!(!block.is_null());
            block.write_bytes(0xa5, layout.size());
            (hooks.free)(block, layout);
        }
    }
}
