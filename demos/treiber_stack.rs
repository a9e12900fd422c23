//! Treiber's lock-free stack on top of the global hazard-pointer
//! collector. Run with `cargo run --example treiber_stack`.

use std::mem::ManuallyDrop;
use std::ptr;
use std::sync::atomic::AtomicPtr;
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};
use std::thread;

use rand::Rng;

use hazard_smr::Config;

struct Node<T> {
    data: ManuallyDrop<T>,
    next: *mut Node<T>,
}

unsafe fn dispose_node<T>(addr: *mut u8) {
    drop(Box::from_raw(addr as *mut Node<T>));
}

struct TreiberStack<T> {
    head: AtomicPtr<Node<T>>,
}

impl<T> TreiberStack<T> {
    fn new() -> TreiberStack<T> {
        TreiberStack {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    fn push(&self, value: T) {
        let node = Box::into_raw(Box::new(Node {
            data: ManuallyDrop::new(value),
            next: ptr::null_mut(),
        }));
        let mut head = self.head.load(Relaxed);
        loop {
            unsafe { (*node).next = head };
            match self.head.compare_exchange(head, node, Release, Relaxed) {
                Ok(_) => break,
                Err(current) => head = current,
            }
        }
    }

    fn pop(&self) -> Option<T> {
        let guard = hazard_smr::hazard().expect("collector constructed");
        loop {
            let head = guard.protect(&self.head);
            if head.is_null() {
                return None;
            }
            let next = unsafe { (*head).next };
            if self
                .head
                .compare_exchange(head, next, Release, Relaxed)
                .is_ok()
            {
                unsafe {
                    let value = ManuallyDrop::take(&mut (*head).data);
                    hazard_smr::retire_with(head as *mut u8, dispose_node::<T>)
                        .expect("retired capacity");
                    return Some(value);
                }
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.head.load(Acquire).is_null()
    }
}

impl<T> Drop for TreiberStack<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

fn main() {
    hazard_smr::construct(Config::default());

    {
        let stack = TreiberStack::new();
        thread::scope(|scope| {
            for worker in 0..16usize {
                let stack = &stack;
                scope.spawn(move || {
                    hazard_smr::attach().unwrap();
                    let mut rng = rand::thread_rng();
                    let mut popped = 0usize;
                    for round in 0..10_000usize {
                        if rng.gen() {
                            stack.push(worker * 10_000 + round);
                        } else if stack.pop().is_some() {
                            popped += 1;
                        }
                    }
                    hazard_smr::detach();
                    println!("worker {:>2} popped {} values", worker, popped);
                });
            }
        });
        assert!(stack.pop().is_some() || stack.is_empty());
    }

    let stat = hazard_smr::statistics().unwrap();
    println!("{:?}", stat);
    hazard_smr::destruct(true);
}
