//! Reentrant sleeping locks
//!
//! A lock records its owning thread and a recursion depth; contention
//! parks the caller on the lock's released-condition. Every acquired lock
//! is linked into the owner's held-lock list so an exiting thread's locks
//! can be force-released.

use alloc::sync::Arc;

use spin::Mutex;

use super::condvar::Condition;
use super::thread::{self, Tid, THREADS};
use crate::arch;

struct LockState {
    owner: Option<Tid>,
    depth: usize,
}

pub struct LockInner {
    state: Mutex<LockState>,
    released: Condition,
}

/// A reentrant lock handle. Clones share the same lock.
#[derive(Clone)]
pub struct Lock {
    inner: Arc<LockInner>,
}

impl Lock {
    pub fn new() -> Lock {
        Lock {
            inner: Arc::new(LockInner {
                state: Mutex::new(LockState {
                    owner: None,
                    depth: 0,
                }),
                released: Condition::new("lock.released"),
            }),
        }
    }

    /// Take the lock, sleeping while another thread owns it. Re-acquiring
    /// a lock the caller already owns bumps the depth.
    ///
    /// The ownership check and the park share one interrupts-off window,
    /// so a release cannot slip between them and strand the waiter.
    pub fn acquire(&self) {
        let me = thread::current_tid();
        loop {
            let pie = arch::disable_interrupts();
            let acquired = {
                let mut state = self.inner.state.lock();
                match state.owner {
                    Some(owner) if owner == me => {
                        state.depth += 1;
                        true
                    }
                    Some(_) => false,
                    None => {
                        state.owner = Some(me);
                        drop(state);
                        link_held(me, &self.inner);
                        true
                    }
                }
            };
            if acquired {
                arch::restore_interrupts(pie);
                return;
            }
            self.inner.released.wait();
            arch::restore_interrupts(pie);
        }
    }

    /// Undo one `acquire`. Depth drops first; the final release clears
    /// the owner, unlinks the lock from the holder's list, and wakes
    /// contenders.
    pub fn release(&self) {
        let me = thread::current_tid();
        let fully_released = arch::without_interrupts(|| {
            let mut state = self.inner.state.lock();
            assert_eq!(state.owner, Some(me), "release of a lock not held");
            if state.depth > 0 {
                state.depth -= 1;
                false
            } else {
                state.owner = None;
                drop(state);
                unlink_held(me, &self.inner);
                true
            }
        });
        if fully_released {
            self.inner.released.broadcast();
        }
    }

    /// Run `f` with the lock held.
    pub fn with<R>(&self, f: impl FnOnce() -> R) -> R {
        self.acquire();
        let result = f();
        self.release();
        result
    }
}

impl Default for Lock {
    fn default() -> Self {
        Lock::new()
    }
}

impl LockInner {
    /// Drop ownership regardless of depth. Used when the owner exits
    /// while still holding the lock; the held-lock list entry has already
    /// been detached by the exit path.
    pub(super) fn force_release(&self, owner: Tid) {
        let released = arch::without_interrupts(|| {
            let mut state = self.state.lock();
            if state.owner == Some(owner) {
                state.owner = None;
                state.depth = 0;
                true
            } else {
                false
            }
        });
        if released {
            self.released.broadcast();
        }
    }
}

fn link_held(tid: Tid, lock: &Arc<LockInner>) {
    let mut table = THREADS.lock();
    if let Some(t) = table.slots[tid].as_mut() {
        t.held_locks.push(lock.clone());
    }
}

fn unlink_held(tid: Tid, lock: &Arc<LockInner>) {
    let mut table = THREADS.lock();
    if let Some(t) = table.slots[tid].as_mut() {
        if let Some(pos) = t
            .held_locks
            .iter()
            .position(|held| Arc::ptr_eq(held, lock))
        {
            t.held_locks.remove(pos);
        }
    }
}
