//! Argument fetch helpers and the id -> handler dispatch.

use crate::scheduler;
use crate::syscall::sysproc;
use crate::syscall::{
    INIT_PID, SYS_EXEC, SYS_EXIT, SYS_FORK, SYS_GET_CHAR, SYS_POWER_OFF, SYS_PUT_CHAR, SYS_SEND_SIGNAL,
    SYS_WAIT, SYS_WAIT_PID, SYS_YIELD,
};
use crate::task;

pub(super) fn arg(pid: u32, n: u8) -> u64 {
    task::with_task(pid, |t| {
        let tf = t.trapframe();
        match n {
            0 => tf.a0,
            1 => tf.a1,
            2 => tf.a2,
            3 => tf.a3,
            4 => tf.a4,
            5 => tf.a5,
            6 => tf.a6,
            7 => tf.a7,
            _ => panic!("arg: index out of range"),
        }
    })
    .unwrap_or(0)
}

pub(super) fn set_return(pid: u32, value: i64) {
    task::with_task(pid, |t| t.trapframe().a0 = value as u64);
}

/// Terminate the current task with `exit_code`, reparenting its children to
/// init. Called both from `sys_exit` and from the trap dispatcher for
/// faults and delivered kill signals.
pub fn terminate_current(exit_code: i32) -> ! {
    scheduler::exit_current(exit_code, INIT_PID)
}

/// Route one ecall-from-U trap to its handler, writing the result to `a0`.
/// `exec` is the one exception: on success it populates `a0..a2` itself
/// (argc/argv_va/envp_va), so dispatch must not clobber that afterward.
pub fn dispatch(pid: u32) {
    let num = arg(pid, 7);

    if num == SYS_EXIT {
        terminate_current(arg(pid, 0) as i32);
    }

    if num == SYS_EXEC {
        sysproc::sys_exec(pid);
        return;
    }

    let result = match num {
        SYS_FORK => sysproc::sys_fork(pid),
        SYS_WAIT => sysproc::sys_wait(pid),
        SYS_WAIT_PID => sysproc::sys_wait_pid(pid),
        SYS_SEND_SIGNAL => sysproc::sys_send_signal(pid),
        SYS_YIELD => sysproc::sys_yield(pid),
        SYS_POWER_OFF => sysproc::sys_power_off(pid),
        SYS_PUT_CHAR => sysproc::sys_put_char(pid),
        SYS_GET_CHAR => sysproc::sys_get_char(pid),
        other => {
            log::warn!("pid {}: unknown syscall {}", pid, other);
            -1
        }
    };
    set_return(pid, result);
}
