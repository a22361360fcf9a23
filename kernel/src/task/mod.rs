//! Threads and scheduling
//!
//! One CPU multiplexed into cooperating preemptible threads. The thread
//! table is the single owner of every thread record; everything else
//! (ready queue, wait lists, parent links) refers to threads by id.

pub mod condvar;
pub mod context;
pub mod lock;
pub mod scheduler;
pub mod thread;

pub use condvar::Condition;
pub use lock::Lock;
pub use thread::{
    current_tid, exit, join, spawn, ThreadState, Tid, MAIN_TID, MAX_THREADS,
};
pub use scheduler::yield_now;
