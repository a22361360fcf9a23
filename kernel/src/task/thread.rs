//! Thread records and lifecycle
//!
//! A fixed-size table of boxed thread records, indexed by thread id. The
//! table owns the records; the ready queue, wait lists, and parent links
//! all refer to threads by id so no ownership cycles form. Slot 0 is the
//! main (boot) thread.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;

use super::condvar::Condition;
use super::context::Context;
use super::lock::LockInner;
use super::scheduler;
use crate::arch;
use crate::error::{KernelError, Result};
use crate::memory::frame_allocator;
use crate::memory::paging::MemTag;
use crate::memory::PAGE_SIZE;

/// Compile-time thread-table capacity.
pub const MAX_THREADS: usize = 64;
pub const MAIN_TID: Tid = 0;

pub type Tid = usize;

/// Thread lifecycle states. Transitions:
/// uninitialized -> ready; ready <-> running (scheduler); running ->
/// waiting (condition wait); waiting -> ready (broadcast); running ->
/// exited (exit).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Uninitialized,
    Waiting,
    Running,
    Ready,
    Exited,
}

type EntryFn = fn(u64, u64);

pub struct Thread {
    pub id: Tid,
    pub name: &'static str,
    pub state: ThreadState,
    pub context: Context,
    /// Base of the owned stack page; the main thread runs on the boot
    /// stack and owns none.
    pub stack: Option<*mut u8>,
    /// Top of the kernel stack; user-mode entry stages the trap frame
    /// just below it.
    pub stack_top: usize,
    pub parent: Tid,
    /// Index into the process table for a thread that belongs to one.
    pub process: Option<usize>,
    /// Address space to activate when this thread is dispatched.
    pub space: Option<MemTag>,
    /// Broadcast by exiting children; `join` waits here.
    pub child_exit: Arc<Condition>,
    /// Locks currently held; drained when the thread exits.
    pub held_locks: Vec<Arc<LockInner>>,
    /// Startup arguments consumed by the first dispatch.
    entry: Option<(EntryFn, u64, u64)>,
}

// Records are only touched under the table mutex.
unsafe impl Send for Thread {}

pub(super) struct ThreadTable {
    pub slots: [Option<Box<Thread>>; MAX_THREADS],
}

pub(super) static THREADS: Mutex<ThreadTable> = Mutex::new(ThreadTable {
    slots: [const { None }; MAX_THREADS],
});

static CURRENT: AtomicUsize = AtomicUsize::new(MAIN_TID);

/// Id of the running thread.
pub fn current_tid() -> Tid {
    CURRENT.load(Ordering::Relaxed)
}

pub(super) fn set_current(tid: Tid) {
    CURRENT.store(tid, Ordering::Relaxed);
}

/// Install the main thread record and spawn the idle thread. Must run
/// before anything can block.
pub fn init(main_stack_top: usize) {
    {
        let mut table = THREADS.lock();
        assert!(table.slots[MAIN_TID].is_none(), "threads already initialized");
        table.slots[MAIN_TID] = Some(Box::new(Thread {
            id: MAIN_TID,
            name: "main",
            state: ThreadState::Running,
            context: Context::zeroed(),
            stack: None,
            stack_top: main_stack_top,
            parent: MAIN_TID,
            process: None,
            space: None,
            child_exit: Arc::new(Condition::new("main.child_exit")),
            held_locks: Vec::new(),
            entry: None,
        }));
    }
    set_current(MAIN_TID);

    spawn("idle", scheduler::idle_loop, 0, 0).expect("cannot spawn idle thread");
    log::info!("Thread manager initialized ({} slots)", MAX_THREADS);
}

/// Create a thread running `entry(a0, a1)`, place it on the ready list,
/// and return its id.
pub fn spawn(name: &'static str, entry: EntryFn, a0: u64, a1: u64) -> Result<Tid> {
    let stack = frame_allocator::alloc_page().ok_or(KernelError::NoMemory)?;
    // The top of the page is the trap-frame slot; execution starts below
    // it, 16-byte aligned per the RISC-V ABI.
    let stack_top = (stack as usize + PAGE_SIZE) & !0xf;
    let initial_sp = stack_top - crate::trap::TRAP_FRAME_RESERVE;

    let tid = arch::without_interrupts(|| {
        let mut table = THREADS.lock();
        let tid = match (1..MAX_THREADS).find(|&i| table.slots[i].is_none()) {
            Some(t) => t,
            None => return Err(KernelError::TooManyThreads),
        };

        let mut context = Context::zeroed();
        context.sp = initial_sp;
        context.ra = thread_startup as usize;

        let mut thread = Box::new(Thread {
            id: tid,
            name,
            state: ThreadState::Uninitialized,
            context,
            stack: Some(stack),
            stack_top,
            parent: current_tid(),
            process: None,
            space: None,
            child_exit: Arc::new(Condition::new("child_exit")),
            held_locks: Vec::new(),
            entry: Some((entry, a0, a1)),
        });
        // Context and stack are in place; the record becomes runnable.
        thread.state = ThreadState::Ready;
        table.slots[tid] = Some(thread);
        Ok(tid)
    });

    let tid = match tid {
        Ok(t) => t,
        Err(e) => {
            frame_allocator::free_page(stack);
            return Err(e);
        }
    };

    scheduler::enqueue_ready(tid);
    log::debug!("Spawned thread <{}:{}>", name, tid);
    Ok(tid)
}

/// First code a spawned thread runs. Entered by the context switch with
/// interrupts enabled; runs the entry function, then exits.
extern "C" fn thread_startup() -> ! {
    scheduler::cleanup_previous();

    let (entry, a0, a1) = arch::without_interrupts(|| {
        let mut table = THREADS.lock();
        let thread = table.slots[current_tid()]
            .as_mut()
            .expect("startup without a record");
        thread.entry.take().expect("startup without an entry")
    });

    entry(a0, a1);
    exit();
}

/// Terminate the running thread. The main thread exiting halts the
/// machine; anyone else signals the parent and never returns.
pub fn exit() -> ! {
    let tid = current_tid();
    if tid == MAIN_TID {
        log::info!("Main thread exited; halting");
        arch::shutdown(false);
    }

    // Interrupts stay off from the state change until the final
    // suspend: once the parent can observe the exited state it may
    // reclaim the record, so this thread must not be preempted while
    // still running on its own stack.
    arch::disable_interrupts();
    let parent_cond = {
        let mut table = THREADS.lock();
        let parent = {
            let thread = table.slots[tid].as_mut().expect("exit without a record");
            thread.state = ThreadState::Exited;
            thread.parent
        };
        table.slots[parent]
            .as_ref()
            .map(|p| p.child_exit.clone())
    };

    if let Some(cond) = parent_cond {
        cond.broadcast();
    }
    scheduler::suspend_running();
    unreachable!("exited thread resumed");
}

/// Wait for a child to exit and reclaim it.
///
/// `tid > 0` waits for that specific thread; `tid == 0` waits for any
/// child of the caller. Returns the reclaimed id.
pub fn join(tid: Tid) -> Result<Tid> {
    let me = current_tid();
    let my_cond = arch::without_interrupts(|| {
        THREADS.lock().slots[me]
            .as_ref()
            .map(|t| t.child_exit.clone())
    })
    .expect("caller has no record");

    // Each predicate check shares an interrupts-off window with the
    // park, so a child-exit broadcast cannot slip between them.
    if tid != 0 {
        if tid >= MAX_THREADS {
            return Err(KernelError::InvalidArgument);
        }
        loop {
            let pie = arch::disable_interrupts();
            let done = {
                let table = THREADS.lock();
                match table.slots[tid].as_ref() {
                    None => Err(KernelError::InvalidArgument),
                    Some(t) => Ok(t.state == ThreadState::Exited),
                }
            };
            let done = match done {
                Ok(d) => d,
                Err(e) => {
                    arch::restore_interrupts(pie);
                    return Err(e);
                }
            };
            if done {
                arch::restore_interrupts(pie);
                reclaim(tid);
                return Ok(tid);
            }
            my_cond.wait();
            arch::restore_interrupts(pie);
        }
    }

    enum Scan {
        Exited(Tid),
        Alive,
        NoChildren,
    }
    loop {
        let pie = arch::disable_interrupts();
        let scan = {
            let table = THREADS.lock();
            let mut found = Scan::NoChildren;
            for i in 1..MAX_THREADS {
                if let Some(t) = table.slots[i].as_ref() {
                    if t.parent == me && i != me {
                        if t.state == ThreadState::Exited {
                            found = Scan::Exited(i);
                            break;
                        }
                        found = Scan::Alive;
                    }
                }
            }
            found
        };
        match scan {
            Scan::Exited(child) => {
                arch::restore_interrupts(pie);
                reclaim(child);
                return Ok(child);
            }
            Scan::Alive => {
                my_cond.wait();
                arch::restore_interrupts(pie);
            }
            Scan::NoChildren => {
                arch::restore_interrupts(pie);
                return Err(KernelError::InvalidArgument);
            }
        }
    }
}

/// Release an exited thread's slot, reparenting its children to its own
/// parent. Stack and lock cleanup normally happens right after the final
/// switch away from the thread; redoing it here covers a reclaim that
/// wins that race.
fn reclaim(tid: Tid) {
    let leftover_locks = arch::without_interrupts(|| {
        let mut table = THREADS.lock();
        let thread = table.slots[tid].take().expect("reclaim of empty slot");
        assert_eq!(thread.state, ThreadState::Exited, "reclaim of a live thread");
        if let Some(stack) = thread.stack {
            frame_allocator::free_page(stack);
        }
        let parent = thread.parent;
        for slot in table.slots.iter_mut().flatten() {
            if slot.parent == tid {
                slot.parent = parent;
            }
        }
        thread.held_locks
    });
    for lock in leftover_locks {
        lock.force_release(tid);
    }
}

/// State of a thread, if the slot is live.
pub fn thread_state(tid: Tid) -> Option<ThreadState> {
    arch::without_interrupts(|| THREADS.lock().slots.get(tid)?.as_ref().map(|t| t.state))
}

pub fn thread_name(tid: Tid) -> Option<&'static str> {
    arch::without_interrupts(|| THREADS.lock().slots.get(tid)?.as_ref().map(|t| t.name))
}

/// Bind a thread to a process and its address space.
pub fn set_thread_process(tid: Tid, process: usize, space: MemTag) {
    arch::without_interrupts(|| {
        let mut table = THREADS.lock();
        if let Some(t) = table.slots[tid].as_mut() {
            t.process = Some(process);
            t.space = Some(space);
        }
    });
}

/// Kernel stack top of the running thread.
pub fn current_stack_top() -> usize {
    arch::without_interrupts(|| {
        THREADS.lock().slots[current_tid()]
            .as_ref()
            .map(|t| t.stack_top)
            .expect("running thread has no record")
    })
}

/// Process index of the running thread, if it has one.
pub fn current_process() -> Option<usize> {
    arch::without_interrupts(|| {
        THREADS.lock().slots[current_tid()].as_ref().and_then(|t| t.process)
    })
}
