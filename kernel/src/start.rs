//! Machine-mode boot: runs once, on the one hart this kernel supports,
//! before anything else in the crate. Out of scope for what the core
//! itself specifies -- this is the "early machine-mode boot sequence"
//! contract `main.rs`'s `kmain` assumes has already been discharged by
//! the time it's entered in supervisor mode.

use core::arch::asm;

use kernel::memlayout::CLINT_MTIME;
use kernel::riscv::*;
use kernel::CLINT_MTIMECMP;

// Defined in the `kernel` binary crate, not this library -- `start` only
// ever needs its address, to park it in `mepc` for `mret` to jump to.
extern "C" {
    fn kmain();
}

/// Scratch words `timervec` (machine-mode trap handler) uses to save
/// `a1`-`a3` and to find the CLINT registers without touching any other
/// register bank. `[3]` holds `CLINT_MTIMECMP(0)`'s address, `[4]` the
/// tick interval.
static mut TIMER_SCRATCH: [u64; 5] = [0; 5];

const BOOT_STACK_SIZE: usize = 4096 * 4;

#[repr(C, align(16))]
struct BootStack([u8; BOOT_STACK_SIZE]);
#[no_mangle]
static stack0: BootStack = BootStack([0; BOOT_STACK_SIZE]);

#[no_mangle]
extern "C" fn start() {
    // set M Previous Privilege mode to Supervisor, for mret.
    let mut x = r_mstatus();
    x &= !MSTATUS_MPP_MASK;
    x |= MSTATUS_MPP_S;
    w_mstatus(x);

    // set M Exception Program Counter to main, for mret.
    // requires gcc -mcmodel=medany
    w_mepc(kmain as usize);

    // disable paging for now.
    w_satp(0);

    // delegate all interrupts and exceptions to supervisor mode.
    w_medeleg(0xffff);
    w_mideleg(0xffff);
    w_sie(r_sie() | SIE_SEIE | SIE_STIE | SIE_SSIE);

    // configure Physical Memory Protection to give supervisor mode
    // access to all of physical memory.
    w_pmpaddr0(0x3ffffffffffff);
    w_pmpcfg0(0xf);

    // ask for clock interrupts.
    timerinit();

    // keep each CPU's hartid in its tp register, for cpuid().
    let id = r_mhartid();
    w_tp(id);

    // switch to supervisor mode and jump to main().
    unsafe { asm!("mret") }
}

extern "C" {
    fn timervec();
}

fn timerinit() {
    let id = r_mhartid();

    // ask the CLINT for a timer interrupt.
    let interval: u64 = 1000000; // cycles; about 1/10th second in qemu.
    unsafe {
        (CLINT_MTIMECMP!(id) as *mut u64)
            .write_volatile((CLINT_MTIME as *const u64).read_volatile() + interval)
    }

    // scratch[0..2]: space for timervec to save a1-a3.
    // scratch[3]: address of the CLINT mtimecmp register.
    // scratch[4]: desired interval (in cycles) between timer interrupts.
    unsafe {
        TIMER_SCRATCH[3] = CLINT_MTIMECMP!(id);
        TIMER_SCRATCH[4] = interval;
        w_mscratch(&TIMER_SCRATCH as *const u64 as usize);
    }

    // set the machine-mode trap handler.
    w_mtvec(timervec as usize);

    // enable machine-mode interrupts.
    w_mstatus(r_mstatus() | MSTATUS_MIE);

    // enable machine-mode timer interrupts.
    w_mie(r_mie() | MIE_MTIE);
}
