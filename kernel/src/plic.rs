//! The RISC-V Platform-Level Interrupt Controller: claim/complete for the
//! two external interrupt sources this kernel cares about (UART, virtio
//! disk), single-hart so hart 0's enable/priority registers are the only
//! ones ever touched.

use crate::memlayout::{PLIC, UART0_IRQ, VIRTIO0_IRQ};
use crate::{PLIC_SCLAIM, PLIC_SENABLE, PLIC_SPRIORITY};

const HART0: usize = 0;

pub fn plicinit() {
    unsafe {
        ((PLIC + UART0_IRQ * 4) as *mut u32).write_volatile(1);
        ((PLIC + VIRTIO0_IRQ * 4) as *mut u32).write_volatile(1);
    }
}

pub fn plicinithart() {
    unsafe {
        (PLIC_SENABLE!(HART0) as *mut u32).write_volatile((1 << UART0_IRQ) | (1 << VIRTIO0_IRQ));
        (PLIC_SPRIORITY!(HART0) as *mut u32).write_volatile(0);
    }
}

fn plic_claim() -> u32 {
    unsafe { (PLIC_SCLAIM!(HART0) as *const u32).read_volatile() }
}

fn plic_complete(irq: u32) {
    unsafe {
        (PLIC_SCLAIM!(HART0) as *mut u32).write_volatile(irq);
    }
}

/// Claim whichever device raised the pending external interrupt, service
/// it, and tell the PLIC it's handled.
pub fn handle_external_interrupt() {
    let irq = plic_claim();
    if irq == UART0_IRQ as u32 {
        crate::uart::handle_interrupt();
    } else if irq == VIRTIO0_IRQ as u32 {
        // No block device in this kernel; nothing to service.
    } else if irq != 0 {
        log::warn!("plic: unexpected irq {}", irq);
    }
    if irq != 0 {
        plic_complete(irq);
    }
}
