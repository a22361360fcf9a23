//! Condition variables
//!
//! A named FIFO wait list of thread ids. `wait` parks the caller;
//! `broadcast` moves every waiter to the ready queue in insertion order.
//! Both run their list manipulation with interrupts disabled because ISRs
//! broadcast conditions (device completion, timer wakeups).

use alloc::collections::VecDeque;

use spin::Mutex;

use super::scheduler;
use super::thread::{self, ThreadState, Tid, THREADS};
use crate::arch;

pub struct Condition {
    name: &'static str,
    waiters: Mutex<VecDeque<Tid>>,
}

impl Condition {
    pub const fn new(name: &'static str) -> Condition {
        Condition {
            name,
            waiters: Mutex::new(VecDeque::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Park the calling thread on this condition.
    ///
    /// The caller re-checks its predicate after returning; a broadcast
    /// wakes every waiter regardless of why.
    pub fn wait(&self) {
        arch::without_interrupts(|| {
            let me = thread::current_tid();
            let mut table = THREADS.lock();
            let t = table.slots[me].as_mut().expect("wait without a record");
            assert_eq!(t.state, ThreadState::Running, "wait from a non-running thread");
            t.state = ThreadState::Waiting;
            drop(table);
            self.waiters.lock().push_back(me);
        });
        scheduler::suspend_running();
    }

    /// Wake every waiter, in the order they arrived.
    pub fn broadcast(&self) {
        arch::without_interrupts(|| {
            let mut waiters = self.waiters.lock();
            while let Some(tid) = waiters.pop_front() {
                scheduler::make_ready(tid);
            }
        });
    }
}
