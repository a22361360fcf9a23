//! Alarms, the sleep list, and the timer ISR
//!
//! One process-wide sleep list ordered by ascending wake tick. An alarm
//! advances its wake time relative to its previous wake (not "now"), so a
//! periodic sleeper does not drift. The timer compare register always
//! holds the earliest pending deadline: the head of the sleep list or the
//! preemption pulse, whichever comes first.
//!
//! Preemption is not an alarm. The ISR keeps a dedicated deadline,
//! re-arms it every `PREEMPT_INTERVAL_MS`, and raises `need_resched`; the
//! trap return path turns that into a yield. Nothing ever waits on it.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use super::{ms_to_ticks, PREEMPT_INTERVAL_MS};
use crate::arch;
use crate::task::scheduler;
use crate::task::Condition;

/// Sorted pending wakeups: (wake tick, condition to broadcast).
pub(crate) struct SleepList {
    entries: Vec<(u64, Arc<Condition>)>,
}

impl SleepList {
    pub(crate) const fn new() -> SleepList {
        SleepList {
            entries: Vec::new(),
        }
    }

    /// Insert keeping ascending wake order; ties keep arrival order.
    pub(crate) fn insert(&mut self, twake: u64, cond: Arc<Condition>) {
        let pos = self
            .entries
            .iter()
            .position(|(t, _)| *t > twake)
            .unwrap_or(self.entries.len());
        self.entries.insert(pos, (twake, cond));
    }

    /// Remove and return every entry due at or before `now`.
    pub(crate) fn pop_due(&mut self, now: u64) -> Vec<(u64, Arc<Condition>)> {
        let split = self
            .entries
            .iter()
            .position(|(t, _)| *t > now)
            .unwrap_or(self.entries.len());
        self.entries.drain(..split).collect()
    }

    pub(crate) fn head_deadline(&self) -> Option<u64> {
        self.entries.first().map(|(t, _)| *t)
    }
}

static SLEEP: Mutex<SleepList> = Mutex::new(SleepList::new());

/// Next preemption pulse, or `u64::MAX` before the process manager arms
/// it.
static PREEMPT_DEADLINE: AtomicU64 = AtomicU64::new(u64::MAX);

/// A wakeup bound to one condition. Wake times accumulate: each sleep is
/// relative to the previous wake time, saturating at the maximum.
pub struct Alarm {
    twake: u64,
    cond: Arc<Condition>,
}

impl Alarm {
    pub fn new(name: &'static str) -> Alarm {
        Alarm {
            twake: arch::read_time(),
            cond: Arc::new(Condition::new(name)),
        }
    }

    /// Re-baseline the alarm so the next sleep is relative to now.
    pub fn reset(&mut self) {
        self.twake = arch::read_time();
    }

    /// Sleep until `ticks` past the previous wake time.
    pub fn sleep(&mut self, ticks: u64) {
        let now = arch::read_time();
        self.twake = self.twake.saturating_add(ticks);

        // Deadline already passed; don't arm anything.
        if self.twake < now {
            return;
        }

        // Interrupts stay off from list insert until the wait is parked,
        // otherwise the ISR could broadcast before we are on the wait
        // list and the wakeup would be lost.
        let pie = arch::disable_interrupts();
        {
            let mut sleep = SLEEP.lock();
            sleep.insert(self.twake, self.cond.clone());
            arch::set_timer(earliest_deadline(sleep.head_deadline()));
        }
        arch::enable_timer_interrupt();
        self.cond.wait();
        arch::restore_interrupts(pie);
    }

    pub fn sleep_ms(&mut self, ms: u64) {
        self.sleep(ms_to_ticks(ms));
    }

    pub fn sleep_us(&mut self, us: u64) {
        self.sleep(super::us_to_ticks(us));
    }
}

fn earliest_deadline(head: Option<u64>) -> u64 {
    let preempt = PREEMPT_DEADLINE.load(Ordering::Relaxed);
    head.unwrap_or(u64::MAX).min(preempt)
}

/// Arm the periodic preemption pulse. Called once at process-manager
/// startup.
pub fn start_preemption() {
    let deadline = arch::read_time() + ms_to_ticks(PREEMPT_INTERVAL_MS);
    PREEMPT_DEADLINE.store(deadline, Ordering::Relaxed);
    arch::set_timer(deadline.min(
        arch::without_interrupts(|| SLEEP.lock().head_deadline()).unwrap_or(u64::MAX),
    ));
    arch::enable_timer_interrupt();
    log::info!("Preemption tick armed ({} ms)", PREEMPT_INTERVAL_MS);
}

/// Timer ISR. Broadcasts every due alarm, advances the preemption pulse,
/// and reprograms the compare register to the next deadline (or disables
/// the source when nothing is pending).
pub fn handle_timer_interrupt() {
    let now = arch::read_time();

    let due = SLEEP.lock().pop_due(now);
    for (_, cond) in due {
        cond.broadcast();
    }

    let preempt = PREEMPT_DEADLINE.load(Ordering::Relaxed);
    if preempt != u64::MAX && now >= preempt {
        PREEMPT_DEADLINE.store(now + ms_to_ticks(PREEMPT_INTERVAL_MS), Ordering::Relaxed);
        scheduler::set_need_resched();
    }

    let next = earliest_deadline(SLEEP.lock().head_deadline());
    if next == u64::MAX {
        arch::disable_timer_interrupt();
    } else {
        arch::set_timer(next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cond() -> Arc<Condition> {
        Arc::new(Condition::new("test"))
    }

    #[test]
    fn test_insert_keeps_ascending_order() {
        let mut list = SleepList::new();
        list.insert(30, cond());
        list.insert(10, cond());
        list.insert(20, cond());
        assert_eq!(list.head_deadline(), Some(10));

        let due = list.pop_due(25);
        let times: Vec<u64> = due.iter().map(|(t, _)| *t).collect();
        assert_eq!(times, [10, 20]);
        assert_eq!(list.head_deadline(), Some(30));
    }

    #[test]
    fn test_pop_due_takes_nothing_early() {
        let mut list = SleepList::new();
        list.insert(100, cond());
        assert!(list.pop_due(99).is_empty());
        assert_eq!(list.pop_due(100).len(), 1);
        assert_eq!(list.head_deadline(), None);
    }

    #[test]
    fn test_ties_keep_arrival_order() {
        let mut list = SleepList::new();
        let a = cond();
        let b = cond();
        list.insert(50, a.clone());
        list.insert(50, b.clone());
        let due = list.pop_due(50);
        assert_eq!(due.len(), 2);
        assert!(Arc::ptr_eq(&due[0].1, &a));
        assert!(Arc::ptr_eq(&due[1].1, &b));
    }
}
