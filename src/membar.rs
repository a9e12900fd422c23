//! Memory-barrier strategies for the hazard publish/scan protocol.
//!
//! Publishing a hazard pointer and collecting published hazards form a
//! Dekker-style pattern: the publishing side must make its store visible
//! before it re-reads the structure, and the scanning side must see every
//! store that preceded its guard collection. The two strategies trade where
//! the cost lands:
//!
//! * [`MemBar::Rendezvous`] puts a sequentially consistent read-modify-write
//!   on a process-wide shared variable on *both* sides. Portable.
//! * [`MemBar::Asymmetric`] makes the publish side free of any hardware
//!   fence and instead issues one `membarrier(2)` system call per scan,
//!   which forces a barrier on every running thread of the process. Only
//!   selected when the kernel advertises the expedited command.

use crate::sync::{lazy_static, AtomicUsize, Ordering};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MemBar {
    /// Shared-variable rendezvous, usable on every target.
    Rendezvous,
    /// Linux `membarrier(MEMBARRIER_CMD_PRIVATE_EXPEDITED)` on the scan
    /// side, nothing but a compiler fence on the publish side.
    Asymmetric,
}

const UNPROBED: usize = 0;
const UNAVAILABLE: usize = 1;
const AVAILABLE: usize = 2;

lazy_static! {
    static ref RENDEZVOUS: AtomicUsize = AtomicUsize::new(0);
    static ref MEMBARRIER_STATE: AtomicUsize = AtomicUsize::new(UNPROBED);
}

impl MemBar {
    /// Picks the strategy for a new collector, probing the kernel once.
    pub(crate) fn select() -> MemBar {
        if asymmetric_available() {
            MemBar::Asymmetric
        } else {
            MemBar::Rendezvous
        }
    }

    /// Barrier on the hazard-publish side. Called after every guard store.
    #[inline]
    pub(crate) fn light(self) {
        match self {
            MemBar::Rendezvous => {
                RENDEZVOUS.fetch_add(1, Ordering::SeqCst);
            }
            MemBar::Asymmetric => {
                #[cfg(not(loom))]
                std::sync::atomic::compiler_fence(Ordering::SeqCst);
            }
        }
    }

    /// Barrier on the scanning side. Called once per scan, before the guard
    /// collection pass.
    #[inline]
    pub(crate) fn heavy(self) {
        match self {
            MemBar::Rendezvous => {
                RENDEZVOUS.fetch_add(1, Ordering::SeqCst);
            }
            MemBar::Asymmetric => heavy_membarrier(),
        }
    }
}

/// Whether the expedited membarrier command can be used. The probe runs at
/// most a handful of times (concurrent first calls may each probe) and the
/// verdict is cached process-wide; registration is idempotent so a repeated
/// probe is harmless.
pub(crate) fn asymmetric_available() -> bool {
    match MEMBARRIER_STATE.load(Ordering::Acquire) {
        AVAILABLE => true,
        UNAVAILABLE => false,
        _ => {
            let available = probe_membarrier();
            let state = if available { AVAILABLE } else { UNAVAILABLE };
            MEMBARRIER_STATE.store(state, Ordering::Release);
            available
        }
    }
}

#[cfg(all(target_os = "linux", not(loom)))]
mod sys {
    pub(super) const MEMBARRIER_CMD_QUERY: libc::c_int = 0;
    // linux 4.14+
    pub(super) const MEMBARRIER_CMD_PRIVATE_EXPEDITED: libc::c_int = 1 << 3;
    pub(super) const MEMBARRIER_CMD_REGISTER_PRIVATE_EXPEDITED: libc::c_int = 1 << 4;

    pub(super) fn membarrier(cmd: libc::c_int) -> libc::c_long {
        unsafe { libc::syscall(libc::SYS_membarrier, cmd, 0) }
    }
}

#[cfg(all(target_os = "linux", not(loom)))]
fn probe_membarrier() -> bool {
    let commands = sys::membarrier(sys::MEMBARRIER_CMD_QUERY);
    if commands == -1 || commands & libc::c_long::from(sys::MEMBARRIER_CMD_PRIVATE_EXPEDITED) == 0 {
        return false;
    }
    sys::membarrier(sys::MEMBARRIER_CMD_REGISTER_PRIVATE_EXPEDITED) == 0
}

#[cfg(not(all(target_os = "linux", not(loom))))]
fn probe_membarrier() -> bool {
    false
}

#[cfg(all(target_os = "linux", not(loom)))]
fn heavy_membarrier() {
    debug_assert_eq!(MEMBARRIER_STATE.load(Ordering::Relaxed), AVAILABLE);
    sys::membarrier(sys::MEMBARRIER_CMD_PRIVATE_EXPEDITED);
}

#[cfg(not(all(target_os = "linux", not(loom))))]
fn heavy_membarrier() {
    unreachable!("asymmetric membar selected without a successful capability probe")
}
