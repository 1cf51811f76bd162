//! One handler per syscall id. Each takes the calling task's pid and
//! returns the value to place in `a0`, except `sys_exec`, which manages
//! `a0..a2` itself on success.

use alloc::vec::Vec;

use crate::memlayout::{VIRT_TEST, VIRT_TEST_PASS};
use crate::riscv::PGSIZE;
use crate::scheduler;
use crate::syscall::syscall::arg;
use crate::syscall::INIT_PID;
use crate::task::{self, Signal, TaskState};

pub(super) fn sys_fork(pid: u32) -> i64 {
    let kstack = scheduler::new_kernel_stack();
    match task::fork_task(pid, kstack, crate::vm::trampoline_pa()) {
        Some(child_pid) => {
            scheduler::register_task(child_pid);
            child_pid as i64
        }
        None => -1,
    }
}

/// Read a NUL-terminated string out of `page` starting at `*cursor`,
/// advancing `*cursor` past the terminator. `None` if the string runs off
/// the end of the page without a terminator.
fn read_cstr(page: &[u8], cursor: &mut usize) -> Option<Vec<u8>> {
    let start = *cursor;
    let mut end = start;
    while end < page.len() {
        if page[end] == 0 {
            *cursor = end + 1;
            return Some(page[start..end].to_vec());
        }
        end += 1;
    }
    None
}

/// Parse `path`, then `argv_size` argv strings, then `envp_size` envp
/// strings, all NUL-terminated and packed sequentially starting at offset 0
/// of the caller's shared-memory page, per the syscall ABI. `argv` is
/// returned with `path` as `argv[0]`. This kernel has no notion of a
/// process environment, so envp strings are parsed (to keep the layout in
/// sync) and discarded rather than threaded through to the new image.
pub(super) fn sys_exec(pid: u32) {
    let argv_size = arg(pid, 3) as usize;
    let envp_size = arg(pid, 4) as usize;

    let result = (|| -> Result<(usize, usize), ()> {
        let shared_pa = task::shared_memory_pa(pid).ok_or(())?;
        let page = unsafe { core::slice::from_raw_parts(shared_pa as *const u8, PGSIZE) };

        let mut cursor = 0usize;
        let path = read_cstr(page, &mut cursor).ok_or(())?;
        let mut argv = Vec::with_capacity(argv_size + 1);
        argv.push(path.clone());
        for _ in 0..argv_size {
            argv.push(read_cstr(page, &mut cursor).ok_or(())?);
        }
        for _ in 0..envp_size {
            read_cstr(page, &mut cursor).ok_or(())?;
        }

        let path_str = core::str::from_utf8(&path).map_err(|_| ())?;
        crate::exec::exec(pid, path_str, &argv)
    })();

    match result {
        Ok((argc, argv_va)) => {
            task::with_task(pid, |t| {
                let tf = t.trapframe();
                tf.a0 = argc as u64;
                tf.a1 = argv_va as u64;
                tf.a2 = 0; // no envp support; see module doc
            });
        }
        Err(()) => {
            task::with_task(pid, |t| t.trapframe().a0 = (-1i64) as u64);
        }
    }
}

fn write_status(pid: u32, status_ptr: u64, status: i32) {
    if status_ptr == 0 {
        return;
    }
    if let Some(shared_pa) = task::shared_memory_pa(pid) {
        unsafe {
            (shared_pa as *mut u64).write(status as i64 as u64);
        }
    }
}

pub(super) fn sys_wait(pid: u32) -> i64 {
    let status_ptr = arg(pid, 0);
    match scheduler::wait_any(pid) {
        Some((child_pid, status)) => {
            write_status(pid, status_ptr, status);
            child_pid as i64
        }
        None => -1,
    }
}

pub(super) fn sys_wait_pid(pid: u32) -> i64 {
    let target_pid = arg(pid, 0) as u32;
    let status_ptr = arg(pid, 1);
    match scheduler::wait_for(pid, target_pid) {
        Some(status) => {
            write_status(pid, status_ptr, status);
            target_pid as i64
        }
        None => -1,
    }
}

fn is_ancestor(ancestor: u32, target: u32) -> bool {
    let mut cursor = target;
    loop {
        match task::with_task(cursor, |t| t.parent_pid).flatten() {
            Some(parent) if parent == ancestor => return true,
            Some(parent) => cursor = parent,
            None => return false,
        }
    }
}

fn is_alive(pid: u32) -> bool {
    task::with_task(pid, |t| t.state != TaskState::Zombie).unwrap_or(false)
}

/// Deliver a signal to a descendant. The source this was distilled from
/// guarded with `is_ancestor(...) == 0 || is_alive(target)`, which forbids
/// signaling any live descendant -- almost certainly inverted. Corrected
/// here to require both: sender is an ancestor, and the target is alive.
pub(super) fn sys_send_signal(pid: u32) -> i64 {
    let target = arg(pid, 0) as u32;
    let sig = arg(pid, 1) as i64;

    if !is_ancestor(pid, target) || !is_alive(target) {
        return -1;
    }

    let signal = match sig {
        0 => Signal::Nothing,
        2 => Signal::Interrupt,
        9 => Signal::Kill,
        _ => return -1,
    };

    task::with_task(target, |t| t.pending_signal = signal);
    sig
}

pub(super) fn sys_yield(pid: u32) -> i64 {
    let _ = pid;
    scheduler::yield_();
    0
}

pub(super) fn sys_power_off(pid: u32) -> i64 {
    if pid != INIT_PID {
        return -1;
    }
    unsafe {
        (VIRT_TEST as *mut u32).write_volatile(VIRT_TEST_PASS);
    }
    loop {
        core::hint::spin_loop();
    }
}

pub(super) fn sys_put_char(pid: u32) -> i64 {
    crate::uart::put_char(arg(pid, 0) as u8);
    0
}

pub(super) fn sys_get_char(_pid: u32) -> i64 {
    crate::uart::get_char() as i64
}
