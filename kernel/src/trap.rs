//! Trap dispatch: classify `scause`, route to the syscall gateway, the
//! stack-growth fault path, or diagnostic termination, and the plumbing to
//! get back into user mode afterward.

use crate::memlayout::{TRAMPOLINE, TRAPFRAME};
use crate::riscv::{
    intr_off, intr_on, r_satp, r_scause, r_sepc, r_sip, r_sstatus, r_stval, r_tp, w_sepc, w_sip,
    w_sscratch, w_sstatus, w_stvec, PGSIZE, SIP_SSIP, SSTATUS_SPIE, SSTATUS_SPP,
};
use crate::scheduler;
use crate::spinlock::Spinlock;
use crate::syscall;
use crate::task::Signal;
use crate::MAKE_SATP;

static mut TICKS_LOCK: Spinlock = Spinlock::new("time");
static mut TICKS: u64 = 0;

extern "C" {
    static kernelvec: u8;
    static trampoline_start: u8;
    static uservec: u8;
    static userret: u8;
}

// scause: interrupt flag is the top bit; the remaining bits are the cause code.
const SCAUSE_INTERRUPT: u64 = 1 << 63;

const INTR_S_SOFTWARE: u64 = 1;
const INTR_S_EXTERNAL: u64 = 9;

const EXC_ECALL_FROM_U: u64 = 8;
const EXC_INSTR_PAGE_FAULT: u64 = 12;
const EXC_LOAD_PAGE_FAULT: u64 = 13;
const EXC_STORE_PAGE_FAULT: u64 = 15;

pub fn trapinit() {}

/// Take traps and interrupts through `kernelvec` while executing kernel
/// code.
pub fn trapinithart() {
    w_stvec((unsafe { &kernelvec } as *const u8) as usize);
}

fn trampoline_addr() -> usize {
    (unsafe { &trampoline_start } as *const u8) as usize
}

enum Outcome {
    Resume,
    Terminate(i32),
}

/// Handle a trap, interrupt, or syscall taken from user mode. Called from
/// `uservec` in trampoline.S with the trapframe already populated and the
/// kernel page table and kernel stack already installed.
#[no_mangle]
extern "C" fn user_trap() {
    assert_eq!(
        r_sstatus() & SSTATUS_SPP as u64,
        0,
        "user_trap: not from user mode"
    );

    w_stvec((unsafe { &kernelvec } as *const u8) as usize);

    let pid = scheduler::current_pid().expect("user_trap: no current task");
    let scause = r_scause();

    let outcome = if scause == SCAUSE_INTERRUPT | INTR_S_EXTERNAL {
        crate::plic::handle_external_interrupt();
        Outcome::Resume
    } else if scause == SCAUSE_INTERRUPT | INTR_S_SOFTWARE {
        // The CLINT timer only ever reaches us this way: machine mode can't
        // deliver its timer interrupt straight to supervisor mode, so
        // `timervec` converts it into a pending SSIP here.
        w_sip(r_sip() & !SIP_SSIP);
        handle_timer_interrupt();
        Outcome::Resume
    } else if scause == EXC_ECALL_FROM_U {
        crate::task::with_task(pid, |t| t.trapframe().epc += 4);
        intr_on();
        syscall::dispatch(pid);
        Outcome::Resume
    } else if matches!(
        scause,
        EXC_INSTR_PAGE_FAULT | EXC_LOAD_PAGE_FAULT | EXC_STORE_PAGE_FAULT
    ) {
        let fault_va = r_stval() as usize;
        if crate::task::grow_stack(pid, fault_va) {
            Outcome::Resume
        } else {
            log::warn!("pid {}: unhandled page fault at {:#x}", pid, fault_va);
            Outcome::Terminate(-1)
        }
    } else {
        log::warn!(
            "pid {}: unexpected scause {:#x} stval {:#x} epc {:#x}",
            pid,
            scause,
            r_stval(),
            r_sepc()
        );
        Outcome::Terminate(-1)
    };

    let pending_status = crate::task::with_task(pid, |t| match t.pending_signal {
        Signal::Kill => Some(9),
        Signal::Interrupt => Some(2),
        Signal::Nothing => None,
    })
    .flatten();

    match outcome {
        Outcome::Terminate(code) => syscall::terminate_current(code),
        Outcome::Resume => {
            if let Some(status) = pending_status {
                syscall::terminate_current(status);
            }
        }
    }

    user_trap_return();
}

fn handle_timer_interrupt() {
    unsafe {
        TICKS_LOCK.acquire();
        TICKS += 1;
        TICKS_LOCK.release();
    }
    scheduler::wake(unsafe { &TICKS as *const u64 as usize });
    scheduler::yield_();
}

/// Traps taken while already in supervisor mode (kernel code, or a task's
/// own trap handler re-entered). Timer interrupts yield; anything else is
/// a kernel bug.
#[no_mangle]
extern "C" fn kernel_trap() {
    let sepc = r_sepc();
    let sstatus = r_sstatus();
    let scause = r_scause();

    assert_ne!(sstatus & SSTATUS_SPP as u64, 0, "kernel_trap: not from supervisor mode");
    assert!(!intr_get_would_be_on(), "kernel_trap: interrupts enabled");

    if scause == SCAUSE_INTERRUPT | INTR_S_EXTERNAL {
        crate::plic::handle_external_interrupt();
    } else if scause == SCAUSE_INTERRUPT | INTR_S_SOFTWARE {
        w_sip(r_sip() & !SIP_SSIP);
        unsafe {
            TICKS_LOCK.acquire();
            TICKS += 1;
            TICKS_LOCK.release();
        }
        scheduler::wake(unsafe { &TICKS as *const u64 as usize });
        if scheduler::current_pid().is_some() {
            scheduler::yield_();
        }
    } else {
        panic!(
            "kernel_trap: unexpected scause {:#x} stval {:#x} sepc {:#x}",
            scause,
            r_stval(),
            sepc
        );
    }

    w_sepc(sepc);
    w_sstatus(sstatus);
}

fn intr_get_would_be_on() -> bool {
    crate::riscv::intr_get()
}

/// Set the trapframe up to resume in user mode and jump to `userret` in
/// the trampoline page, which is mapped at the same address in every page
/// table so the jump survives the satp switch it performs.
pub fn user_trap_return() {
    let pid = scheduler::current_pid().expect("user_trap_return: no current task");
    intr_off();

    let uservec_addr = (unsafe { &uservec } as *const u8) as usize;
    let userret_addr = (unsafe { &userret } as *const u8) as usize;
    let base = trampoline_addr();
    w_stvec(TRAMPOLINE + uservec_addr - base);

    let (pagetable, kstack) = crate::task::with_task(pid, |t| {
        let tf = t.trapframe();
        tf.kernel_satp = r_satp() as u64;
        tf.kernel_sp = (t.kstack + crate::param::KSTACK_PAGES * PGSIZE) as u64;
        tf.kernel_trap = user_trap as u64;
        tf.kernel_hartid = r_tp();
        (t.pagetable, t.kstack)
    })
    .expect("user_trap_return: task missing");
    let _ = kstack;

    let mut status = r_sstatus();
    status &= !(SSTATUS_SPP as u64);
    status |= SSTATUS_SPIE as u64;
    w_sstatus(status);

    let epc = crate::task::with_task(pid, |t| t.trapframe().epc).unwrap_or(0);
    w_sepc(epc as usize);

    w_sscratch(TRAPFRAME);

    let satp = MAKE_SATP!(pagetable);
    let trampoline_userret = TRAMPOLINE + userret_addr - base;

    unsafe {
        let func = *(trampoline_userret as *const extern "C" fn(usize));
        func(satp);
    }
}
