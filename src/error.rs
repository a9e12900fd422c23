use thiserror::Error;

/// Errors surfaced by the reclamation engine.
///
/// Steady-state operation never errors; every variant here is either a
/// broken caller contract or a failed resource acquisition.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The retired buffer is full and neither a scan nor a help-scan could
    /// reclaim space. Every pending entry is still protected by some guard,
    /// which means the caller retired far more than the configured capacity
    /// can absorb.
    #[error("retired buffer is full and no entry could be reclaimed")]
    RetiredOverflow,

    /// The raw allocator returned null for a thread-record block.
    #[error("allocation of a {0} byte thread record failed")]
    AllocFailed(usize),

    /// Every hazard slot of the calling thread's record is already handed
    /// out as a live `Guard`.
    #[error("all {0} hazard slots of this record are in use")]
    GuardsExhausted(usize),

    /// `set_allocator` was called after the global collector was already
    /// constructed.
    #[error("the raw allocator can only be replaced before construct()")]
    AllocatorLocked,

    /// A global operation ran before `construct` or after `destruct`.
    #[error("the global collector is not constructed")]
    NotConstructed,
}
