//! The task model: a fixed arena of tasks addressed by pid, each owning a
//! user page table, a trap frame, a kernel context, and the list of memory
//! sections mapped into its address space.
//!
//! Tasks reference each other (parent, waiter) by pid rather than by
//! pointer or arena index, so a task that exits and is later reclaimed
//! can't leave a dangling reference behind in a sibling's state.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::elf;
use crate::list::List;
use crate::memlayout::{MIN_STACK_ADDR, SHARED_MEMORY, TRAMPOLINE, TRAPFRAME};
use crate::param::{MAX_TASKS, TASK_NAME_MAX};
use crate::riscv::{PGSIZE, PTE_R, PTE_U, PTE_W, PTE_X};
use crate::spinlock::Spinlock;
use crate::vm::{
    copy_all_memory_with_pagetable, create_void_pagetable, free_memory, free_pagetable, map_page,
    map_section_for_user, map_zero_pages, phys_of,
};

/// Saved callee-saved registers for a cooperative kernel-to-kernel switch.
/// Laid out to match `switch.S`'s store/load order exactly.
#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct Context {
    pub ra: u64,
    pub sp: u64,
    pub s0: u64,
    pub s1: u64,
    pub s2: u64,
    pub s3: u64,
    pub s4: u64,
    pub s5: u64,
    pub s6: u64,
    pub s7: u64,
    pub s8: u64,
    pub s9: u64,
    pub s10: u64,
    pub s11: u64,
}

/// Per-task data for the trampoline: sits in its own page just below the
/// trampoline page in the task's page table, not specially mapped in the
/// kernel page table. `uservec` in trampoline.S saves user registers here
/// on entry and initializes kernel_sp/kernel_hartid/kernel_satp/kernel_trap
/// before jumping to `user_trap`. `user_trap_return` and `userret` in
/// trampoline.S do the reverse.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct Trapframe {
    pub kernel_satp: u64,
    pub kernel_sp: u64,
    pub kernel_trap: u64,
    pub epc: u64,
    pub kernel_hartid: u64,
    pub ra: u64,
    pub sp: u64,
    pub gp: u64,
    pub tp: u64,
    pub t0: u64,
    pub t1: u64,
    pub t2: u64,
    pub s0: u64,
    pub s1: u64,
    pub a0: u64,
    pub a1: u64,
    pub a2: u64,
    pub a3: u64,
    pub a4: u64,
    pub a5: u64,
    pub a6: u64,
    pub a7: u64,
    pub s2: u64,
    pub s3: u64,
    pub s4: u64,
    pub s5: u64,
    pub s6: u64,
    pub s7: u64,
    pub s8: u64,
    pub s9: u64,
    pub s10: u64,
    pub s11: u64,
    pub t3: u64,
    pub t4: u64,
    pub t5: u64,
    pub t6: u64,
}

impl Default for Trapframe {
    fn default() -> Self {
        unsafe { core::mem::zeroed() }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct MemorySection {
    pub start_va: usize,
    pub size: usize,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum TaskState {
    Unused,
    Runnable,
    Running,
    Sleeping,
    Zombie,
}

/// The three signal values the syscall gateway and trap dispatcher know
/// about. `Nothing` is the at-rest value most tasks sit in forever.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Signal {
    Nothing,
    Interrupt,
    Kill,
}

pub struct Task {
    pub pid: u32,
    pub parent_pid: Option<u32>,
    pub state: TaskState,
    pub pending_signal: Signal,
    pub exit_code: i32,
    /// Opaque wake channel; 0 means "not sleeping". Matches xv6's
    /// any-address-as-a-channel convention (commonly `&task as *const _`).
    pub chan: usize,
    pub kstack: usize,
    pub pagetable: usize,
    pub trapframe: usize,
    /// Physical address of the syscall argument-marshaling page mapped at
    /// `SHARED_MEMORY`. Persists across `exec` the same way the trapframe
    /// does, rather than living in `sections`.
    pub shared_memory: usize,
    pub context: Context,
    pub sections: List<MemorySection>,
    pub stack_top: usize,
    /// R/W/X permission the stack's zero-filled pages are mapped with
    /// (never includes `PTE_U`; `map_zero_pages` adds that itself). Starts
    /// at `PTE_R | PTE_W` and gains `PTE_X` if the ELF carried a
    /// `PT_GNU_STACK` header asking for an executable stack.
    pub stack_permission: usize,
    pub name: [u8; TASK_NAME_MAX + 1],
}

impl Task {
    const fn empty() -> Self {
        Task {
            pid: 0,
            parent_pid: None,
            state: TaskState::Unused,
            pending_signal: Signal::Nothing,
            exit_code: 0,
            chan: 0,
            kstack: 0,
            pagetable: 0,
            trapframe: 0,
            shared_memory: 0,
            context: Context {
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
            sections: List::new(),
            stack_top: 0,
            stack_permission: PTE_R | PTE_W,
            name: [0; TASK_NAME_MAX + 1],
        }
    }

    pub fn trapframe(&self) -> &mut Trapframe {
        unsafe { &mut *(self.trapframe as *mut Trapframe) }
    }

    pub fn set_name(&mut self, name: &[u8]) {
        crate::string::safestrcpy(&mut self.name, name);
    }
}

pub struct Arena {
    lock: Spinlock,
    tasks: [Task; MAX_TASKS],
}

unsafe impl Sync for Arena {}

pub static mut ARENA: Arena = Arena {
    lock: Spinlock::new("tasks"),
    tasks: [const { Task::empty() }; MAX_TASKS],
};

/// A freshly created task's very first scheduling (`scheduler::scheduler`'s
/// `swtch` into its brand new context) lands here rather than returning into
/// whatever last ran on this stack: `context.ra` is set to this function's
/// address by `new_task`. It hands straight to `user_trap_return`, which
/// `sret`s into user mode at the entry point `load_image`/`fork_task` wrote
/// into the trapframe.
fn forkret() {
    crate::trap::user_trap_return();
}

static NEXT_PID: AtomicU32 = AtomicU32::new(1);

fn alloc_pid() -> u32 {
    NEXT_PID.fetch_add(1, Ordering::Relaxed)
}

pub fn with_task<R>(pid: u32, f: impl FnOnce(&mut Task) -> R) -> Option<R> {
    unsafe {
        ARENA.lock.acquire();
        let result = ARENA
            .tasks
            .iter_mut()
            .find(|t| t.state != TaskState::Unused && t.pid == pid)
            .map(f);
        ARENA.lock.release();
        result
    }
}

pub fn for_each_task(mut f: impl FnMut(&mut Task)) {
    unsafe {
        ARENA.lock.acquire();
        for t in ARENA.tasks.iter_mut() {
            if t.state != TaskState::Unused {
                f(t);
            }
        }
        ARENA.lock.release();
    }
}

/// Allocate a free arena slot, give it a fresh pid, a trapframe page, an
/// empty user page table mapping the trampoline and trapframe, and a
/// kernel stack. Returns the new pid, or `None` if the arena is full or a
/// page allocation failed along the way.
pub fn new_task(kstack: usize, trampoline_pa: usize) -> Option<u32> {
    unsafe {
        ARENA.lock.acquire();
        let slot = ARENA.tasks.iter_mut().find(|t| t.state == TaskState::Unused);
        let Some(task) = slot else {
            ARENA.lock.release();
            return None;
        };

        let trapframe_pa = match crate::buddy::alloc_page() {
            Some(pa) => pa,
            None => {
                ARENA.lock.release();
                return None;
            }
        };
        let Some(pagetable) = create_void_pagetable() else {
            crate::buddy::free_page(trapframe_pa);
            ARENA.lock.release();
            return None;
        };
        let Some(shared_memory_pa) = crate::buddy::alloc_page() else {
            free_pagetable(pagetable);
            crate::buddy::free_page(trapframe_pa);
            ARENA.lock.release();
            return None;
        };
        map_page(pagetable, TRAMPOLINE, trampoline_pa, PTE_R | PTE_X);
        map_page(pagetable, TRAPFRAME, trapframe_pa, PTE_R | PTE_W);
        map_page(pagetable, SHARED_MEMORY, shared_memory_pa, PTE_R | PTE_W | PTE_U);

        task.pid = alloc_pid();
        task.parent_pid = None;
        task.pending_signal = Signal::Nothing;
        task.exit_code = 0;
        task.chan = 0;
        task.kstack = kstack;
        task.pagetable = pagetable;
        task.trapframe = trapframe_pa;
        task.shared_memory = shared_memory_pa;
        task.sections = List::new();
        task.stack_top = 0;
        task.stack_permission = PTE_R | PTE_W;
        task.name = [0; TASK_NAME_MAX + 1];
        task.context = Context {
            ra: forkret as u64,
            sp: (kstack + PGSIZE) as u64,
            ..Default::default()
        };
        task.state = TaskState::Runnable;
        let pid = task.pid;
        ARENA.lock.release();
        Some(pid)
    }
}

/// Tear down a task's address space and return its slot to the arena.
pub fn free_task(pid: u32) {
    unsafe {
        ARENA.lock.acquire();
        if let Some(task) = ARENA.tasks.iter_mut().find(|t| t.pid == pid && t.state != TaskState::Unused) {
            task.sections.for_each(|section| {
                free_memory(task.pagetable, section.start_va, section.size);
            });
            if task.pagetable != 0 {
                // trampoline/trapframe leaves unmapped here: they don't own
                // backing frames the way a section does (trampoline is
                // shared, trapframe is freed explicitly below).
                free_pagetable(task.pagetable);
            }
            if task.trapframe != 0 {
                crate::buddy::free_page(task.trapframe);
            }
            if task.shared_memory != 0 {
                crate::buddy::free_page(task.shared_memory);
            }
            *task = Task::empty();
        }
        ARENA.lock.release();
    }
}

/// Load an ELF image's `PT_LOAD` segments into a fresh task address space
/// and append a zero-filled stack just below `SHARED_MEMORY`. Sets the
/// trapframe's `epc`/`sp` and the task's `stack_top` on success.
pub fn load_image(pid: u32, image: &[u8], stack_pages: usize) -> Result<(), ()> {
    let header = elf::parse_header(image).ok_or(())?;
    with_task(pid, |task| {
        task.stack_permission = PTE_R | PTE_W;
        for ph in elf::program_headers(image, header) {
            if ph.hdr_type == elf::ELF_PROG_GNU_STACK {
                if ph.flags & elf::ELF_PROG_FLAG_EXEC != 0 {
                    task.stack_permission |= PTE_X;
                }
                continue;
            }
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
            let src = unsafe { image.as_ptr().add(ph.off as usize) };
            map_section_for_user(
                task.pagetable,
                ph.vaddr as usize,
                src,
                ph.filesz as usize,
                ph.memsz as usize,
                perm,
                &mut task.sections,
            )?;
        }
        let stack_size = stack_pages * PGSIZE;
        let stack_start = SHARED_MEMORY - stack_size;
        if stack_start < MIN_STACK_ADDR {
            return Err(());
        }
        let mapped = map_zero_pages(task.pagetable, stack_start, stack_size, task.stack_permission)?;
        task.sections.push_tail(MemorySection {
            start_va: mapped,
            size: stack_size,
        });
        task.stack_top = SHARED_MEMORY;
        task.trapframe().epc = header.entry;
        task.trapframe().sp = SHARED_MEMORY as u64;
        Ok(())
    })
    .unwrap_or(Err(()))
}

/// Extend a task's stack downward by one page to cover a fault at `va`,
/// provided it wouldn't cross `MIN_STACK_ADDR`.
pub fn grow_stack(pid: u32, va: usize) -> bool {
    with_task(pid, |task| {
        if task.stack_top == 0 {
            return false;
        }
        let new_bottom = crate::PGROUNDDOWN!(va);
        if new_bottom < MIN_STACK_ADDR {
            return false;
        }
        match map_zero_pages(task.pagetable, new_bottom, PGSIZE, task.stack_permission) {
            Ok(mapped) => {
                task.sections.push_tail(MemorySection {
                    start_va: mapped,
                    size: PGSIZE,
                });
                true
            }
            Err(()) => false,
        }
    })
    .unwrap_or(false)
}

/// Duplicate an existing task's address space, trapframe, and name into a
/// freshly allocated one. Returns the child's pid.
///
/// Both tasks are touched under a single critical section (rather than two
/// nested `with_task` calls) because `Spinlock` isn't reentrant.
pub fn fork_task(parent_pid: u32, kstack: usize, trampoline_pa: usize) -> Option<u32> {
    let child_pid = new_task(kstack, trampoline_pa)?;
    let ok = unsafe {
        ARENA.lock.acquire();
        let parent_idx = ARENA
            .tasks
            .iter()
            .position(|t| t.pid == parent_pid && t.state != TaskState::Unused);
        let child_idx = ARENA.tasks.iter().position(|t| t.pid == child_pid);
        let result = match (parent_idx, child_idx) {
            (Some(pi), Some(ci)) if pi != ci => {
                let (parent, child) = if pi < ci {
                    let (left, right) = ARENA.tasks.split_at_mut(ci);
                    (&mut left[pi], &mut right[0])
                } else {
                    let (left, right) = ARENA.tasks.split_at_mut(pi);
                    (&mut right[0], &mut left[ci])
                };
                child.parent_pid = Some(parent_pid);
                child.name = parent.name;
                let copy_result = copy_all_memory_with_pagetable(
                    parent.pagetable,
                    &parent.sections,
                    child.pagetable,
                    &mut child.sections,
                );
                if copy_result.is_ok() {
                    *child.trapframe() = *parent.trapframe();
                    child.trapframe().a0 = 0; // fork returns 0 in the child
                    child.stack_top = parent.stack_top;
                    child.stack_permission = parent.stack_permission;
                    unsafe {
                        core::ptr::copy_nonoverlapping(
                            parent.shared_memory as *const u8,
                            child.shared_memory as *mut u8,
                            PGSIZE,
                        );
                    }
                    true
                } else {
                    false
                }
            }
            _ => false,
        };
        ARENA.lock.release();
        result
    };

    if ok {
        Some(child_pid)
    } else {
        free_task(child_pid);
        None
    }
}

pub fn phys_addr_of(pid: u32, va: usize) -> Option<usize> {
    with_task(pid, |task| phys_of(task.pagetable, va)).flatten()
}

/// Physical address of a task's shared-memory page, for the syscall
/// gateway to read/write directly (it's physically mapped 1:1 in the
/// kernel's own page table).
pub fn shared_memory_pa(pid: u32) -> Option<usize> {
    with_task(pid, |task| task.shared_memory).filter(|pa| *pa != 0)
}

/// Swap a task's address space for a newly built one, freeing the old
/// sections and page table (the trampoline/trapframe frames are shared
/// across both, so only interior page-table pages are reclaimed). Used by
/// `exec` once the replacement image is fully built and nothing can fail.
pub fn commit_exec(
    pid: u32,
    pagetable: usize,
    sections: List<MemorySection>,
    entry: usize,
    sp: usize,
    name: [u8; TASK_NAME_MAX + 1],
    stack_permission: usize,
) {
    with_task(pid, |task| {
        map_page(pagetable, SHARED_MEMORY, task.shared_memory, PTE_R | PTE_W | PTE_U);

        task.sections.for_each(|section| {
            free_memory(task.pagetable, section.start_va, section.size);
        });
        free_pagetable(task.pagetable);

        task.pagetable = pagetable;
        task.sections = sections;
        task.stack_top = SHARED_MEMORY;
        task.stack_permission = stack_permission;
        task.name = name;
        task.trapframe().epc = entry as u64;
        task.trapframe().sp = sp as u64;
    });
}
