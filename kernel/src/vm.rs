//! Sv39 virtual memory: page-table walk, map/unmap, section copy, teardown.

use crate::buddy::{alloc_page, free_page};
use crate::memlayout::{KERNBASE, PHYSTOP, PLIC, PLIC_SIZE, TRAMPOLINE, UART0, VIRTIO0, VIRT_TEST};
use crate::riscv::{sfence_vma, w_satp, MAXVA, PageTable, Pte, PGSIZE, PTE_R, PTE_U, PTE_V, PTE_W, PTE_X};
use crate::task::MemorySection;
use crate::{list::List, MAKE_SATP, PA2PTE, PGROUNDDOWN, PGROUNDUP, PX};

extern "C" {
    static trampoline_start: u8;
    static etext: u8;
}

fn trampoline_phys() -> usize {
    (unsafe { &trampoline_start } as *const u8) as usize
}

/// The kernel text's own copy of the trampoline page, mapped at the same
/// physical address in every task's page table (and the kernel's).
pub fn trampoline_pa() -> usize {
    trampoline_phys()
}

/// Create an empty, zeroed page table.
pub fn create_void_pagetable() -> Option<usize> {
    alloc_page()
}

fn pagetable_ref<'a>(root: usize) -> &'a mut PageTable {
    unsafe { &mut *(root as *mut PageTable) }
}

/// Return a mutable reference to the leaf PTE for `va`, descending levels
/// 2 -> 1 -> 0. When a level is missing and `alloc` is set, a fresh zeroed
/// child table is allocated and installed; otherwise `None` is returned.
pub fn walk<'a>(root: usize, va: usize, alloc: bool) -> Option<&'a mut Pte> {
    assert!(va < MAXVA, "walk: va out of range");
    let mut table = pagetable_ref(root);
    for level in (1..=2).rev() {
        let pte = &mut table.0[PX!(level, va)];
        if pte.is_valid() {
            table = pagetable_ref(pte.phys_addr());
        } else {
            if !alloc {
                return None;
            }
            let child = create_void_pagetable()?;
            *pte = Pte(PA2PTE!(child) | PTE_V);
            table = pagetable_ref(child);
        }
    }
    Some(&mut table.0[PX!(0, va)])
}

pub fn phys_of(root: usize, va: usize) -> Option<usize> {
    let pte = walk(root, PGROUNDDOWN!(va), false)?;
    if !pte.is_leaf() {
        return None;
    }
    Some(pte.phys_addr() | (va & (PGSIZE - 1)))
}

/// Install a single leaf mapping. Fatal if the leaf is already valid: a
/// double-map is an invariant violation, not a recoverable error.
pub fn map_page(root: usize, va: usize, pa: usize, perm: usize) {
    let pte = walk(root, va, true).expect("map_page: walk failed to allocate");
    assert!(!pte.is_valid(), "map_page: remap of {:#x}", va);
    *pte = Pte(PA2PTE!(pa) | perm | PTE_V);
}

/// Like `map_page` but reports allocation failure instead of panicking, used
/// by paths that need to unwind on OOM rather than abort the kernel.
fn try_map_page(root: usize, va: usize, pa: usize, perm: usize) -> bool {
    match walk(root, va, true) {
        Some(pte) if !pte.is_valid() => {
            *pte = Pte(PA2PTE!(pa) | perm | PTE_V);
            true
        }
        _ => false,
    }
}

/// Clear a leaf mapping. Does not free the backing frame. The leaf must
/// exist and must not be an interior entry.
pub fn unmap_page(root: usize, va: usize) {
    let pte = walk(root, va, false).expect("unmap_page: not mapped");
    assert!(pte.is_leaf(), "unmap_page: not a leaf");
    *pte = Pte(0);
}

/// Map one page per VA page covering `[va, va + mem_size)`, copying up to
/// `src_size` bytes from `src` (the remainder, if `mem_size > src_size`,
/// stays zero — this is exactly ELF `PT_LOAD`'s `p_filesz <= p_memsz`
/// contract). Registers the mapped range as a section owned by `sections`.
/// Any failure midway unwinds every page mapped so far.
pub fn map_section_for_user(
    root: usize,
    va: usize,
    src: *const u8,
    src_size: usize,
    mem_size: usize,
    perm: usize,
    sections: &mut List<MemorySection>,
) -> Result<(), ()> {
    let start = PGROUNDDOWN!(va);
    let end = PGROUNDUP!(va + mem_size);
    let mut mapped = alloc::vec::Vec::new();
    let mut offset = 0usize;
    let mut a = start;
    while a < end {
        let pa = match alloc_page() {
            Some(pa) => pa,
            None => return unwind_mapped(root, mapped),
        };
        if offset < src_size {
            let take = core::cmp::min(PGSIZE, src_size - offset);
            unsafe {
                core::ptr::copy_nonoverlapping(src.add(offset), pa as *mut u8, take);
            }
        }
        if !try_map_page(root, a, pa, perm | PTE_U) {
            free_page(pa);
            return unwind_mapped(root, mapped);
        }
        mapped.push(a);
        a += PGSIZE;
        offset += PGSIZE;
    }
    sections.push_tail(MemorySection {
        start_va: start,
        size: end - start,
    });
    Ok(())
}

fn unwind_mapped(root: usize, mapped: alloc::vec::Vec<usize>) -> Result<(), ()> {
    for va in mapped {
        if let Some(pte) = walk(root, va, false) {
            let pa = pte.phys_addr();
            *pte = Pte(0);
            free_page(pa);
        }
    }
    Err(())
}

/// Map `size` bytes of fresh, zeroed pages at `start` (used for a user
/// stack, which has no file-backed prefix to copy).
pub fn map_zero_pages(root: usize, start: usize, size: usize, perm: usize) -> Result<usize, ()> {
    let aligned_start = PGROUNDDOWN!(start);
    let end = PGROUNDUP!(start + size);
    let mut mapped = alloc::vec::Vec::new();
    let mut a = aligned_start;
    while a < end {
        let pa = match alloc_page() {
            Some(pa) => pa,
            None => {
                unwind_mapped(root, mapped).ok();
                return Err(());
            }
        };
        if !try_map_page(root, a, pa, perm | PTE_U) {
            free_page(pa);
            unwind_mapped(root, mapped).ok();
            return Err(());
        }
        mapped.push(a);
        a += PGSIZE;
    }
    Ok(aligned_start)
}

/// Free the backing frames of `[va, va + size)` and unmap each page.
pub fn free_memory(root: usize, va: usize, size: usize) {
    let start = PGROUNDDOWN!(va);
    let end = PGROUNDUP!(va + size);
    let mut a = start;
    while a < end {
        if let Some(pte) = walk(root, a, false) {
            if pte.is_leaf() {
                let pa = pte.phys_addr();
                *pte = Pte(0);
                free_page(pa);
            }
        }
        a += PGSIZE;
    }
}

/// Copy every section of `src_sections` into fresh frames mapped into
/// `dst` at the same VAs and permissions. On any failure, every mapping
/// and frame installed in `dst` so far is unwound.
pub fn copy_all_memory_with_pagetable(
    src_root: usize,
    src_sections: &List<MemorySection>,
    dst_root: usize,
    dst_sections: &mut List<MemorySection>,
) -> Result<(), ()> {
    let mut copied: alloc::vec::Vec<usize> = alloc::vec::Vec::new();
    let mut failed = false;
    src_sections.for_each(|section| {
        if failed {
            return;
        }
        let mut a = section.start_va;
        let end = section.start_va + section.size;
        while a < end {
            let src_pte = match walk(src_root, a, false) {
                Some(pte) if pte.is_leaf() => pte,
                _ => {
                    failed = true;
                    return;
                }
            };
            let perm = src_pte.flags() & (PTE_R | PTE_W | PTE_X | PTE_U);
            let src_pa = src_pte.phys_addr();
            let dst_pa = match alloc_page() {
                Some(pa) => pa,
                None => {
                    failed = true;
                    return;
                }
            };
            unsafe {
                core::ptr::copy_nonoverlapping(src_pa as *const u8, dst_pa as *mut u8, PGSIZE);
            }
            if !try_map_page(dst_root, a, dst_pa, perm) {
                free_page(dst_pa);
                failed = true;
                return;
            }
            copied.push(a);
            a += PGSIZE;
        }
        if !failed {
            dst_sections.push_tail(MemorySection {
                start_va: section.start_va,
                size: section.size,
            });
        }
    });
    if failed {
        return unwind_mapped(dst_root, copied);
    }
    Ok(())
}

/// Recursively free a page table's interior levels (2 and 1), plus the
/// root. Leaf frames are the caller's responsibility (via `free_memory`).
pub fn free_pagetable(root: usize) {
    free_pagetable_level(root, 2);
}

fn free_pagetable_level(table_pa: usize, level: u8) {
    let table = pagetable_ref(table_pa);
    if level > 0 {
        for pte in table.0.iter() {
            if pte.is_valid() && !pte.is_leaf() {
                free_pagetable_level(pte.phys_addr(), level - 1);
            }
        }
    }
    free_page(table_pa);
}

/// The kernel's own page table: identity-mapped MMIO + kernel text/data,
/// plus the shared trampoline page at its fixed high VA.
pub static mut KERNEL_PAGETABLE: usize = 0;

fn kvmmap(root: usize, va: usize, pa: usize, size: usize, perm: usize) {
    let mut a = PGROUNDDOWN!(va);
    let last = PGROUNDDOWN!(va + size - 1);
    let mut pa = pa;
    loop {
        map_page(root, a, pa, perm);
        if a == last {
            break;
        }
        a += PGSIZE;
        pa += PGSIZE;
    }
}

pub fn kvminit() {
    let root = create_void_pagetable().expect("kvminit: out of memory");
    kvmmap(root, UART0, UART0, PGSIZE, PTE_R | PTE_W);
    kvmmap(root, VIRTIO0, VIRTIO0, PGSIZE, PTE_R | PTE_W);
    kvmmap(root, VIRT_TEST, VIRT_TEST, PGSIZE, PTE_R | PTE_W);
    kvmmap(root, PLIC, PLIC, PLIC_SIZE, PTE_R | PTE_W);

    let etext_addr = (unsafe { &etext } as *const u8) as usize;
    kvmmap(root, KERNBASE, KERNBASE, etext_addr - KERNBASE, PTE_R | PTE_X);
    kvmmap(root, etext_addr, etext_addr, PHYSTOP - etext_addr, PTE_R | PTE_W);

    let trampoline_pa = trampoline_phys();
    kvmmap(root, TRAMPOLINE, trampoline_pa, PGSIZE, PTE_R | PTE_X);

    unsafe {
        KERNEL_PAGETABLE = root;
    }
}

/// Switch satp to the kernel page table and flush the TLB.
pub fn kvminithart() {
    sfence_vma();
    let root = unsafe { KERNEL_PAGETABLE };
    w_satp(MAKE_SATP!(root));
    sfence_vma();
}

// `PGROUNDUP!`/`PGROUNDDOWN!`/`PX!` are exercised in `riscv.rs`, where
// they're defined -- this module is hardware-only and not part of the
// host test build.
