//! User processes
//!
//! A process is an address space plus a 16-slot endpoint table, owned by
//! one thread. The process table is the singleton owner of process
//! records; threads point back at their process by index. Descriptor 0
//! is opened to the console endpoint when the process manager starts.

use alloc::boxed::Box;
use alloc::vec::Vec;

use spin::Mutex;

use crate::drivers::console;
use crate::elf;
use crate::error::{KernelError, Result};
use crate::io::IoRef;
use crate::memory::frame_allocator;
use crate::memory::paging::{self, PteFlags};
use crate::memory::{PAGE_SIZE, USER_END_VMA};
use crate::task::thread;
use crate::time;
use crate::trap::{trap_frame_jump, TrapFrame};
use crate::{fs, task};

pub const PROCESS_IOMAX: usize = 16;
const MAX_PROCESSES: usize = 16;

const SSTATUS_SPIE: u64 = 1 << 5;
const SSTATUS_SPP: u64 = 1 << 8;

pub struct Process {
    pub idx: usize,
    pub tid: task::Tid,
    pub mtag: paging::MemTag,
    pub iotab: [Option<IoRef>; PROCESS_IOMAX],
}

static PROCESSES: Mutex<[Option<Box<Process>>; MAX_PROCESSES]> =
    Mutex::new([const { None }; MAX_PROCESSES]);

/// Install the main process around the boot thread, wire descriptor 0 to
/// the console, and arm the preemption tick.
pub fn init() {
    let mtag = paging::active_space();
    let mut iotab = [const { None }; PROCESS_IOMAX];
    iotab[0] = Some(console::open_console());

    {
        let mut table = PROCESSES.lock();
        assert!(table[0].is_none(), "process manager already initialized");
        table[0] = Some(Box::new(Process {
            idx: 0,
            tid: task::MAIN_TID,
            mtag,
            iotab,
        }));
    }
    thread::set_thread_process(task::MAIN_TID, 0, mtag);

    time::start_preemption();
    log::info!("Process manager initialized ({} slots)", MAX_PROCESSES);
}

/// Run `f` on the calling thread's process.
pub fn with_current<R>(f: impl FnOnce(&mut Process) -> R) -> Result<R> {
    let idx = thread::current_process().ok_or(KernelError::InvalidArgument)?;
    let mut table = PROCESSES.lock();
    let proc = table[idx].as_mut().ok_or(KernelError::InvalidArgument)?;
    Ok(f(proc))
}

/// Clone out an endpoint reference for a blocking operation; the table
/// lock is not held while the I/O runs.
pub fn descriptor(fd: usize) -> Result<IoRef> {
    if fd >= PROCESS_IOMAX {
        return Err(KernelError::BadFileDescriptor);
    }
    with_current(|proc| proc.iotab[fd].clone())?.ok_or(KernelError::BadFileDescriptor)
}

/// Replace the current process image with `exe`.
///
/// Builds the argument stack from `args` first (they may point into the
/// old image), then resets the address space, maps the new stack at the
/// top of user memory, loads the ELF image, and enters user mode.
pub fn exec(exe: IoRef, args: &[&str]) -> Result<()> {
    let stack = frame_allocator::alloc_page().ok_or(KernelError::NoMemory)?;
    unsafe { core::ptr::write_bytes(stack, 0, PAGE_SIZE) };

    let stack_used = match build_stack(stack, args) {
        Ok(n) => n,
        Err(e) => {
            frame_allocator::free_page(stack);
            return Err(e);
        }
    };

    paging::reset_active_space();
    paging::map_page(USER_END_VMA - PAGE_SIZE, stack as usize, PteFlags::RWU)?;

    let entry = elf::load(&exe)?;

    let mut tfr = TrapFrame::zeroed();
    tfr.sepc = entry as u64;
    tfr.a0 = args.len() as u64;
    tfr.a1 = (USER_END_VMA - stack_used) as u64;
    tfr.sp = (USER_END_VMA - stack_used) as u64;
    tfr.sstatus = (crate::arch::read_sstatus() | SSTATUS_SPIE) & !SSTATUS_SPP;

    trap_frame_jump(&tfr, thread::current_stack_top());
}

/// Lay out argv and its strings at the top of the new stack page.
///
/// Returns the number of stack bytes used (16-byte aligned). Pointers
/// written into the page are user virtual addresses: the stack page maps
/// at the highest page of user memory.
fn build_stack(stack: *mut u8, args: &[&str]) -> Result<usize> {
    let argc = args.len();
    if argc + 1 > PAGE_SIZE / core::mem::size_of::<usize>() {
        return Err(KernelError::NoMemory);
    }

    let mut used = (argc + 1) * core::mem::size_of::<usize>();
    for arg in args {
        let needed = arg.len() + 1;
        if PAGE_SIZE - used < needed {
            return Err(KernelError::NoMemory);
        }
        used += needed;
    }
    used = (used + 15) & !15;

    let stack_base_vma = USER_END_VMA - PAGE_SIZE;
    let argv_offset = PAGE_SIZE - used;
    let argv = unsafe { stack.add(argv_offset) as *mut usize };
    let mut string_offset = argv_offset + (argc + 1) * core::mem::size_of::<usize>();

    for (i, arg) in args.iter().enumerate() {
        unsafe {
            argv.add(i).write(stack_base_vma + string_offset);
            core::ptr::copy_nonoverlapping(
                arg.as_ptr(),
                stack.add(string_offset),
                arg.len(),
            );
            stack.add(string_offset + arg.len()).write(0);
        }
        string_offset += arg.len() + 1;
    }
    unsafe { argv.add(argc).write(0) };

    Ok(used)
}

/// Fork the current process: clone the address space, share the endpoint
/// table by reference, and start a thread that resumes the copied trap
/// frame with a0 = 0. Returns the child's thread id.
pub fn fork(tfr: &TrapFrame) -> Result<task::Tid> {
    let idx = {
        let table = PROCESSES.lock();
        match table.iter().position(|p| p.is_none()) {
            Some(i) => i,
            None => return Err(KernelError::InvalidArgument),
        }
    };

    let iotab = with_current(|proc| proc.iotab.clone())?;
    let mtag = paging::clone_active_space()?;

    let mut child_tfr = Box::new(tfr.clone());
    child_tfr.a0 = 0;
    let tfr_ptr = Box::into_raw(child_tfr);

    let tid = match task::spawn("forked", fork_child, tfr_ptr as u64, 0) {
        Ok(tid) => tid,
        Err(e) => {
            drop(unsafe { Box::from_raw(tfr_ptr) });
            // The cloned space never ran; tear it down from here.
            paging::destroy_space(mtag);
            return Err(e);
        }
    };

    thread::set_thread_process(tid, idx, mtag);
    PROCESSES.lock()[idx] = Some(Box::new(Process {
        idx,
        tid,
        mtag,
        iotab,
    }));
    Ok(tid)
}

/// First code of a forked thread: return to user mode through the copied
/// trap frame. The scheduler has already switched to the child's space.
fn fork_child(tfr_ptr: u64, _unused: u64) {
    let tfr = unsafe { Box::from_raw(tfr_ptr as *mut TrapFrame) };
    trap_frame_jump(&tfr, thread::current_stack_top());
}

/// Terminate the calling process: flush the filesystem, discard the
/// address space, close every descriptor, release the slot, and exit the
/// thread. The main process exiting is fatal.
pub fn exit() -> ! {
    let idx = thread::current_process().expect("process exit without a process");
    let _ = fs::fs_flush();

    let proc = PROCESSES.lock()[idx].take().expect("process slot empty on exit");
    if proc.tid == task::MAIN_TID {
        panic!("main process exited");
    }

    paging::discard_active_space();

    // Dropping the table closes each endpoint as its last reference goes.
    let endpoints: Vec<IoRef> = proc.iotab.into_iter().flatten().collect();
    drop(endpoints);

    task::exit();
}
