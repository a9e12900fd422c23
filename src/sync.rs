#[cfg(loom)]
pub(crate) use {
    loom::lazy_static,
    loom::sync::atomic::AtomicBool,
    loom::sync::atomic::AtomicPtr,
    loom::sync::atomic::AtomicUsize,
    loom::sync::atomic::Ordering,
    loom::thread_local,
};

#[cfg(not(loom))]
pub(crate) use {
    lazy_static::lazy_static,
    std::sync::atomic::AtomicBool,
    std::sync::atomic::AtomicPtr,
    std::sync::atomic::AtomicUsize,
    std::sync::atomic::Ordering,
    std::thread_local,
};
