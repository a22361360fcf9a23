//! Ready queue and the context-switch site
//!
//! Strict FIFO ready queue of thread ids. `suspend_running` is the only
//! place a context switch happens: condition waits, yields, and exits all
//! funnel through it. The timer ISR never switches directly; it sets a
//! `need_resched` flag that the trap return path turns into a yield.

use alloc::collections::VecDeque;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use spin::Mutex;

use super::context::Context;
use super::thread::{self, ThreadState, Tid, THREADS};
use crate::arch;
use crate::memory::frame_allocator;
use crate::memory::paging;

static READY: Mutex<VecDeque<Tid>> = Mutex::new(VecDeque::new());

/// Set from the timer ISR when the preemption interval elapses; consumed
/// on the interrupt return path.
static NEED_RESCHED: AtomicBool = AtomicBool::new(false);

/// Thread that ran before the most recent switch; the resumed thread
/// cleans up after it if it exited.
static PREVIOUS: AtomicUsize = AtomicUsize::new(usize::MAX);

/// Append a thread to the tail of the ready queue.
///
/// The caller must have already marked the thread ready.
pub(super) fn enqueue_ready(tid: Tid) {
    arch::without_interrupts(|| READY.lock().push_back(tid));
}

/// Mark a thread ready and enqueue it. Used by condition broadcast.
pub(super) fn make_ready(tid: Tid) {
    let mut table = THREADS.lock();
    if let Some(t) = table.slots[tid].as_mut() {
        t.state = ThreadState::Ready;
    }
    drop(table);
    READY.lock().push_back(tid);
}

pub(super) fn ready_is_empty() -> bool {
    arch::without_interrupts(|| READY.lock().is_empty())
}

pub fn set_need_resched() {
    NEED_RESCHED.store(true, Ordering::Relaxed);
}

pub fn take_need_resched() -> bool {
    NEED_RESCHED.swap(false, Ordering::Relaxed)
}

/// Voluntarily give up the CPU.
pub fn yield_now() {
    suspend_running();
}

/// Suspend the running thread and dispatch the head of the ready queue.
///
/// If the current thread is still running it is marked ready and
/// requeued at the tail. Returns when the current thread is next
/// dispatched. The switch itself happens with interrupts enabled.
pub fn suspend_running() {
    arch::disable_interrupts();

    let current = thread::current_tid();
    let (old_ctx, new_ctx, next_space) = {
        let mut table = THREADS.lock();

        if let Some(t) = table.slots[current].as_mut() {
            if t.state == ThreadState::Running {
                t.state = ThreadState::Ready;
                READY.lock().push_back(current);
            }
        }

        let next = READY
            .lock()
            .pop_front()
            .expect("ready queue empty: idle thread missing");

        let next_space = {
            let t = table.slots[next].as_mut().expect("ready thread vanished");
            t.state = ThreadState::Running;
            t.space
        };

        let old_ctx = table.slots[current]
            .as_mut()
            .map(|t| &mut t.context as *mut Context)
            .expect("running thread has no record");
        let new_ctx = table.slots[next]
            .as_ref()
            .map(|t| &t.context as *const Context)
            .unwrap();

        thread::set_current(next);
        PREVIOUS.store(current, Ordering::Relaxed);
        (old_ctx, new_ctx, next_space)
    };

    // A thread that belongs to a process runs in that process's address
    // space; kernel threads keep whatever space is active.
    if let Some(space) = next_space {
        if space != paging::active_space() {
            paging::switch_space(space);
        }
    }

    if old_ctx != new_ctx as *mut Context {
        arch::enable_interrupts();
        unsafe { arch::context_switch(old_ctx, new_ctx) };
        // Resumed: tear down the thread we switched away from if it
        // exited while we were off-CPU.
        cleanup_previous();
    } else {
        arch::enable_interrupts();
    }
}

/// Free the stack and force-release the locks of the previously running
/// thread if it exited. Runs in the resumed thread, off the dead stack.
pub(super) fn cleanup_previous() {
    let prev = PREVIOUS.swap(usize::MAX, Ordering::Relaxed);
    if prev == usize::MAX {
        return;
    }

    let cleanup = arch::without_interrupts(|| {
        let mut table = THREADS.lock();
        match table.slots[prev].as_mut() {
            Some(t) if t.state == ThreadState::Exited => {
                let stack = t.stack.take();
                let locks = core::mem::take(&mut t.held_locks);
                Some((stack, locks))
            }
            _ => None,
        }
    });

    if let Some((stack, locks)) = cleanup {
        for lock in locks {
            lock.force_release(prev);
        }
        if let Some(stack) = stack {
            frame_allocator::free_page(stack);
        }
    }
}

/// Body of the idle thread: yield while work exists, sleep on `wfi` when
/// none does. The ready-list check and the wfi must be covered by the
/// same interrupts-off window or an ISR could mark a thread ready in
/// between and the hart would sleep on a runnable system.
pub(super) fn idle_loop(_a0: u64, _a1: u64) {
    loop {
        while !ready_is_empty() {
            yield_now();
        }

        arch::disable_interrupts();
        if READY.lock().is_empty() {
            arch::wait_for_interrupt();
        }
        arch::enable_interrupts();
    }
}
