//! Hazard-pointer based safe memory reclamation for lock-free data
//! structures.
//!
//! Threads claim a record in a process-wide registry, publish the
//! addresses they are dereferencing as hazard pointers and retire the
//! nodes they unlink. Retired memory is only disposed once a reclamation
//! scan proves that no record anywhere still publishes its address, so
//! readers never need a lock and writers never need to wait.
//!
//! Two surfaces are provided: an owned [`Collector`] with RAII
//! [`LocalHandle`] registrations, and the [`construct`]/[`destruct`]
//! singleton with per-thread attachment that lock-free containers usually
//! build against.

pub mod alloc;
pub mod collector;
pub mod default;
pub mod error;
pub mod guard;
mod membar;
mod record;
mod retired;
mod scan;
mod sync;

pub use self::alloc::{AllocFn, FreeFn};
pub use self::collector::{Collector, Config, LocalHandle, ScanStrategy, Stat};
pub use self::default::{
    attach, construct, default_collector, destruct, detach, force_scan, hazard, retire,
    retire_with, scan, set_allocator, statistics,
};
pub use self::error::Error;
pub use self::guard::Guard;
pub use self::retired::DisposeFn;
