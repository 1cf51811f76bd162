//! Cooperative, preemptible single-hart scheduling.
//!
//! The runqueue holds pids, not tasks: a task's storage lives in the arena
//! (`task.rs`) indefinitely, so queuing its pid is enough and sidesteps any
//! lifetime tangle between "queued" and "being freed".

use crate::list::List;
use crate::param::KSTACK_PAGES;
use crate::riscv::{intr_on, PGSIZE};
use crate::spinlock::Spinlock;
use crate::task::{self, Context, Task, TaskState};
use crate::KSTACK;

struct SchedulerState {
    lock: Spinlock,
    runqueue: List<u32>,
    all_tasks: List<u32>,
    current: Option<u32>,
    scheduler_context: Context,
    /// A kernel stack freed by the previously-running task, staged here
    /// because it can't free its own stack while still running on it.
    /// Reclaimed the next time the scheduler runs, before the stack is
    /// reused by a new task. Two slots (not one) because a task can exit
    /// while another task's exit is still pending reclamation.
    retiring_stacks: [Option<usize>; 2],
    next_kstack_slot: usize,
}

unsafe impl Sync for SchedulerState {}

static mut STATE: SchedulerState = SchedulerState {
    lock: Spinlock::new("scheduler"),
    runqueue: List::new(),
    all_tasks: List::new(),
    current: None,
    scheduler_context: Context {
        ra: 0,
        sp: 0,
        s0: 0,
        s1: 0,
        s2: 0,
        s3: 0,
        s4: 0,
        s5: 0,
        s6: 0,
        s7: 0,
        s8: 0,
        s9: 0,
        s10: 0,
        s11: 0,
    },
    retiring_stacks: [None, None],
    next_kstack_slot: 0,
};

extern "C" {
    fn swtch(old: *mut Context, new: *const Context);
}

pub fn init_scheduler() {
    // Nothing to seed: runqueue and all_tasks start empty, current starts
    // None. Kept as an explicit entry point so main's boot sequence reads
    // the same way the teacher's did (an `xinit()` per subsystem).
}

pub fn current_pid() -> Option<u32> {
    unsafe { STATE.current }
}

fn reserve_kstack_slot() -> usize {
    unsafe {
        let slot = STATE.next_kstack_slot;
        STATE.next_kstack_slot += 1;
        KSTACK!(slot)
    }
}

/// Allocate a kernel stack page at the next slot and map it into the
/// kernel page table, returning its base virtual address. Callers add
/// `KSTACK_PAGES * PGSIZE` themselves wherever they need the top-of-stack
/// address a stack pointer should start at.
pub fn new_kernel_stack() -> usize {
    let va = reserve_kstack_slot();
    let pa = crate::buddy::alloc_page().expect("new_kernel_stack: out of memory");
    crate::vm::map_page(unsafe { crate::vm::KERNEL_PAGETABLE }, va, pa, crate::riscv::PTE_R | crate::riscv::PTE_W);
    va
}

pub fn register_task(pid: u32) {
    unsafe {
        STATE.lock.acquire();
        STATE.all_tasks.push_tail(pid);
        STATE.runqueue.push_tail(pid);
        STATE.lock.release();
    }
}

pub fn unregister_task(pid: u32) {
    unsafe {
        STATE.lock.acquire();
        STATE.all_tasks.remove_by_data(&pid);
        STATE.lock.release();
    }
}

/// Reclaim any kernel stack staged by a task that exited on the previous
/// turn. Must run with the scheduler lock held and no task running.
unsafe fn reclaim_retiring_stacks() {
    for slot in STATE.retiring_stacks.iter_mut() {
        if let Some(kstack_top) = slot.take() {
            let kstack_base = kstack_top - KSTACK_PAGES * PGSIZE;
            if let Some(pte) = crate::vm::walk(crate::vm::KERNEL_PAGETABLE, kstack_base, false) {
                let pa = pte.phys_addr();
                crate::buddy::free_page(pa);
            }
        }
    }
}

/// Stage a task's kernel stack for reclamation on a later scheduler turn,
/// since the task exiting can't free the stack it's still running on.
fn stage_stack_for_reclamation(kstack_top: usize) {
    unsafe {
        for slot in STATE.retiring_stacks.iter_mut() {
            if slot.is_none() {
                *slot = Some(kstack_top);
                return;
            }
        }
        panic!("stage_stack_for_reclamation: both slots occupied");
    }
}

/// The scheduler's main loop: picks the next runnable task, switches into
/// it, and returns here when that task yields, sleeps, or exits. Never
/// returns. Runs with its own context, entered once from boot on a stack
/// that isn't any task's.
pub fn scheduler() -> ! {
    loop {
        intr_on();
        unsafe {
            STATE.lock.acquire();
            reclaim_retiring_stacks();
            let next = STATE.runqueue.pop_head();
            STATE.lock.release();

            if let Some(pid) = next {
                let ctx_ptr = task::with_task(pid, |t| {
                    t.state = TaskState::Running;
                    &mut t.context as *mut Context
                });
                if let Some(ctx_ptr) = ctx_ptr {
                    STATE.current = Some(pid);
                    swtch(&mut STATE.scheduler_context as *mut Context, ctx_ptr);
                    STATE.current = None;
                }
            }
        }
    }
}

/// Switch from the currently running task back into the scheduler. Caller
/// must have already updated the task's state (Runnable to re-queue,
/// Sleeping to leave it off the runqueue, Zombie to retire it).
fn switch_to_scheduler() {
    let pid = unsafe { STATE.current }.expect("switch_to_scheduler: no current task");
    let ctx_ptr = task::with_task(pid, |t| &mut t.context as *mut Context)
        .expect("switch_to_scheduler: current task missing from arena");
    unsafe {
        swtch(ctx_ptr, &STATE.scheduler_context as *const Context);
    }
}

/// Give up the CPU for one scheduling round without blocking.
pub fn yield_() {
    let pid = match current_pid() {
        Some(pid) => pid,
        None => return,
    };
    unsafe {
        STATE.lock.acquire();
    }
    task::with_task(pid, |t| t.state = TaskState::Runnable);
    unsafe {
        STATE.runqueue.push_tail(pid);
        STATE.lock.release();
    }
    switch_to_scheduler();
}

/// Block the current task on `chan` until `wake(chan)` is called.
pub fn sleep(chan: usize) {
    let pid = match current_pid() {
        Some(pid) => pid,
        None => return,
    };
    task::with_task(pid, |t| {
        t.state = TaskState::Sleeping;
        t.chan = chan;
    });
    switch_to_scheduler();
}

/// Requeue every task sleeping on `chan`.
pub fn wake(chan: usize) {
    unsafe {
        STATE.lock.acquire();
        let mut woken = alloc::vec::Vec::new();
        STATE.all_tasks.for_each(|&pid| {
            let matched = task::with_task(pid, |t| {
                if t.state == TaskState::Sleeping && t.chan == chan {
                    t.state = TaskState::Runnable;
                    t.chan = 0;
                    true
                } else {
                    false
                }
            })
            .unwrap_or(false);
            if matched {
                woken.push(pid);
            }
        });
        for pid in woken {
            STATE.runqueue.push_tail(pid);
        }
        STATE.lock.release();
    }
}

/// Retire the current task: mark it a zombie, reparent its children to
/// `init_pid`, wake anyone waiting on it, stage its kernel stack for
/// reclamation, and switch away for the last time. Never returns.
pub fn exit_current(exit_code: i32, init_pid: u32) -> ! {
    let pid = current_pid().expect("exit_current: no current task");

    unsafe {
        STATE.lock.acquire();
        STATE.all_tasks.for_each(|&other_pid| {
            task::with_task(other_pid, |t| {
                if t.parent_pid == Some(pid) {
                    t.parent_pid = Some(init_pid);
                }
            });
        });
        STATE.lock.release();
    }

    let kstack_top = task::with_task(pid, |t| {
        t.exit_code = exit_code;
        t.state = TaskState::Zombie;
        t.kstack + KSTACK_PAGES * PGSIZE
    })
    .unwrap_or(0);

    if let Some(parent_pid) = task::with_task(pid, |t| t.parent_pid).flatten() {
        wake(parent_pid as usize);
    }

    if kstack_top != 0 {
        stage_stack_for_reclamation(kstack_top);
    }

    switch_to_scheduler();
    unreachable!("exit_current: zombie task rescheduled");
}

/// Block until a direct child exits, then reap it and return its pid and
/// exit code. Returns `None` if the task has no children at all.
pub fn wait_any(parent_pid: u32) -> Option<(u32, i32)> {
    loop {
        let mut found_child = false;
        let mut reaped = None;
        unsafe {
            STATE.lock.acquire();
            STATE.all_tasks.for_each(|&pid| {
                let info = task::with_task(pid, |t| {
                    if t.parent_pid == Some(parent_pid) {
                        Some((t.state, t.exit_code))
                    } else {
                        None
                    }
                })
                .flatten();
                if let Some((state, code)) = info {
                    found_child = true;
                    if state == TaskState::Zombie && reaped.is_none() {
                        reaped = Some((pid, code));
                    }
                }
            });
            STATE.lock.release();
        }
        if !found_child {
            return None;
        }
        if let Some((pid, code)) = reaped {
            unregister_task(pid);
            task::free_task(pid);
            return Some((pid, code));
        }
        sleep(parent_pid as usize);
    }
}

/// Block until the specific child `target_pid` exits, then reap it.
pub fn wait_for(parent_pid: u32, target_pid: u32) -> Option<i32> {
    loop {
        let info = task::with_task(target_pid, |t| (t.parent_pid, t.state, t.exit_code));
        match info {
            Some((Some(p), _, _)) if p != parent_pid => return None,
            Some((_, TaskState::Zombie, code)) => {
                unregister_task(target_pid);
                task::free_task(target_pid);
                return Some(code);
            }
            Some(_) => sleep(parent_pid as usize),
            None => return None,
        }
    }
}
