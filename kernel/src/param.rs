//! Compile-time configuration for the kernel core.
//!
//! These are the knobs a real deployment would tune; here they are fixed
//! constants sized for a single QEMU `virt` hart.

/// Upper bound on live tasks. Exceeding it fails `new_task`, it does not panic.
pub const MAX_TASKS: usize = 64;

/// Highest order the buddy allocator will hand out: `2^15` pages is 128 MiB,
/// which is exactly the window `init` partitions.
pub const MAX_ORDER: usize = 15;

/// Debug name length budget, matching `Task::name`'s `[u8; 32]` (31 bytes + NUL).
pub const TASK_NAME_MAX: usize = 31;

/// One guard-free kernel stack page per task (see `memlayout::KSTACK`).
pub const KSTACK_PAGES: usize = 1;

/// Default user stack size handed to a freshly loaded image, in pages.
pub const USER_STACK_PAGES: usize = 4;
