//! Mutual exclusion for a single-hart kernel.
//!
//! There is never more than one context executing kernel code at a time, so
//! correctness only requires that a critical section isn't interrupted by a
//! trap that mutates the same state. `Spinlock` therefore degrades to
//! disable/restore of interrupts rather than a real spin; the acquire/release
//! shape (and `holding()`) is kept so the locking discipline at call sites
//! doesn't have to change if this kernel ever grows a second hart.

use crate::riscv::{intr_get, intr_off, intr_on};

/// Nesting depth of `push_off`, and whether interrupts were enabled before
/// the first one. Process-wide: with a single hart there is exactly one of
/// these, unlike xv6's per-CPU `noff`/`intena`.
struct InterruptDepth {
    depth: u32,
    was_enabled: bool,
}

static mut DEPTH: InterruptDepth = InterruptDepth {
    depth: 0,
    was_enabled: false,
};

/// Disable interrupts, remembering whether they were enabled so a matching
/// `pop_off` can restore them. Nestable: it takes as many `pop_off`s as
/// `push_off`s to actually re-enable interrupts.
pub fn push_off() {
    let was_enabled = intr_get();
    intr_off();
    unsafe {
        if DEPTH.depth == 0 {
            DEPTH.was_enabled = was_enabled;
        }
        DEPTH.depth += 1;
    }
}

pub fn pop_off() {
    if intr_get() {
        panic!("pop_off: interruptible");
    }
    unsafe {
        if DEPTH.depth == 0 {
            panic!("pop_off: not held");
        }
        DEPTH.depth -= 1;
        if DEPTH.depth == 0 && DEPTH.was_enabled {
            intr_on();
        }
    }
}

#[derive(Copy, Clone)]
pub struct Spinlock {
    locked: bool,
    name: &'static str,
}

impl Spinlock {
    pub const fn new(name: &'static str) -> Self {
        Spinlock {
            locked: false,
            name,
        }
    }

    /// Acquire the lock. On a single hart this can only spin if the kernel
    /// itself double-acquires, which is a bug, so that case panics instead
    /// of deadlocking silently.
    pub fn acquire(&mut self) {
        push_off();
        if self.locked {
            panic!("acquire: {} already held", self.name);
        }
        self.locked = true;
    }

    pub fn release(&mut self) {
        if !self.locked {
            panic!("release: {} not held", self.name);
        }
        self.locked = false;
        pop_off();
    }

    pub fn holding(&self) -> bool {
        self.locked
    }
}
