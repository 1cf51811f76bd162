//! exec(): replace the calling task's address space with a named image.
//!
//! The new address space -- ELF segments, stack, argv -- is built inside a
//! fresh page table first. Only once every step has succeeded does
//! `task::commit_exec` swap it into the live task, so a failure partway
//! through (bad header, out of memory) leaves the task's current, working
//! image untouched.

use alloc::vec::Vec;

use crate::elf;
use crate::images;
use crate::list::List;
use crate::memlayout::{MIN_STACK_ADDR, SHARED_MEMORY, TRAMPOLINE, TRAPFRAME};
use crate::param::{TASK_NAME_MAX, USER_STACK_PAGES};
use crate::riscv::{PGSIZE, PTE_R, PTE_W, PTE_X};
use crate::task::{self, MemorySection};
use crate::vm;

/// `argv[0]` is conventionally `path` itself; callers pass the full
/// argument vector, already copied out of user memory by the syscall
/// layer, including it. On success, returns `(argc, argv_va)` for the
/// caller to place in the new image's `a0`/`a1`.
pub fn exec(pid: u32, path: &str, argv: &[Vec<u8>]) -> Result<(usize, usize), ()> {
    let image = images::resolve(path).ok_or(())?;
    let header = elf::parse_header(&image).ok_or(())?;

    let trapframe_pa = task::with_task(pid, |t| t.trapframe).ok_or(())?;

    let pagetable = vm::create_void_pagetable().ok_or(())?;
    let mut sections = List::new();

    vm::map_page(pagetable, TRAMPOLINE, vm::trampoline_pa(), PTE_R | PTE_X);
    vm::map_page(pagetable, TRAPFRAME, trapframe_pa, PTE_R | PTE_W);

    if load_segments(pagetable, &image, header, &mut sections).is_err() {
        teardown(pagetable, &sections);
        return Err(());
    }
    let stack_permission = stack_permission_of(&image, header);

    let stack_size = USER_STACK_PAGES * PGSIZE;
    let stack_start = SHARED_MEMORY - stack_size;
    if stack_start < MIN_STACK_ADDR {
        teardown(pagetable, &sections);
        return Err(());
    }
    let mapped = match vm::map_zero_pages(pagetable, stack_start, stack_size, stack_permission) {
        Ok(mapped) => mapped,
        Err(()) => {
            teardown(pagetable, &sections);
            return Err(());
        }
    };
    sections.push_tail(MemorySection {
        start_va: mapped,
        size: stack_size,
    });

    let sp = match write_argv(pagetable, stack_start, stack_size, argv) {
        Ok(sp) => sp,
        Err(()) => {
            teardown(pagetable, &sections);
            return Err(());
        }
    };

    let mut name = [0u8; TASK_NAME_MAX + 1];
    crate::string::safestrcpy(&mut name, path.as_bytes());

    task::commit_exec(pid, pagetable, sections, header.entry as usize, sp, name, stack_permission);
    Ok((argv.len(), sp))
}

/// Base stack permission is R|W; a `PT_GNU_STACK` header asking for an
/// executable stack adds X. Absence of the header (as on a plain,
/// non-GNU-toolchain image) leaves the stack non-executable.
fn stack_permission_of(image: &[u8], header: &elf::ElfHeader) -> usize {
    let mut perm = PTE_R | PTE_W;
    for ph in elf::program_headers(image, header) {
        if ph.hdr_type == elf::ELF_PROG_GNU_STACK && ph.flags & elf::ELF_PROG_FLAG_EXEC != 0 {
            perm |= PTE_X;
        }
    }
    perm
}

fn load_segments(
    pagetable: usize,
    image: &[u8],
    header: &elf::ElfHeader,
    sections: &mut List<MemorySection>,
) -> Result<(), ()> {
    for ph in elf::program_headers(image, header) {
        if ph.hdr_type != elf::ELF_PROG_LOAD {
            continue;
        }
        let mut perm = PTE_R;
        if ph.flags & elf::ELF_PROG_FLAG_WRITE != 0 {
            perm |= PTE_W;
        }
        if ph.flags & elf::ELF_PROG_FLAG_EXEC != 0 {
            perm |= PTE_X;
        }
        if ph.off as usize + ph.filesz as usize > image.len() {
            return Err(());
        }
        let src = unsafe { image.as_ptr().add(ph.off as usize) };
        vm::map_section_for_user(
            pagetable,
            ph.vaddr as usize,
            src,
            ph.filesz as usize,
            ph.memsz as usize,
            perm,
            sections,
        )?;
    }
    Ok(())
}

/// Lay `argv` out at the top of the stack, highest address first, 16-byte
/// aligned per the riscv calling convention, then push the pointer array
/// itself. Returns the resulting stack pointer.
fn write_argv(pagetable: usize, stack_start: usize, stack_size: usize, argv: &[Vec<u8>]) -> Result<usize, ()> {
    let stack_top = stack_start + stack_size;
    let mut sp = stack_top;
    let mut pointers = Vec::with_capacity(argv.len() + 1);

    for arg in argv {
        sp -= arg.len() + 1;
        sp &= !0xf;
        if sp < stack_start {
            return Err(());
        }
        write_user_bytes(pagetable, sp, arg)?;
        write_user_bytes(pagetable, sp + arg.len(), &[0u8])?;
        pointers.push(sp as u64);
    }
    pointers.push(0);

    sp -= pointers.len() * 8;
    sp &= !0xf;
    if sp < stack_start {
        return Err(());
    }
    let bytes: Vec<u8> = pointers.iter().flat_map(|p| p.to_le_bytes()).collect();
    write_user_bytes(pagetable, sp, &bytes)?;

    Ok(sp)
}

fn write_user_bytes(pagetable: usize, va: usize, bytes: &[u8]) -> Result<(), ()> {
    let pa = vm::phys_of(pagetable, va).ok_or(())?;
    unsafe {
        core::ptr::copy_nonoverlapping(bytes.as_ptr(), pa as *mut u8, bytes.len());
    }
    Ok(())
}

fn teardown(pagetable: usize, sections: &List<MemorySection>) {
    sections.for_each(|s| vm::free_memory(pagetable, s.start_va, s.size));
    vm::free_pagetable(pagetable);
}
