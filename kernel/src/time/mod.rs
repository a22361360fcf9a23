//! Time keeping
//!
//! The machine timer ticks at `TIMER_FREQ`; alarms convert relative
//! sleeps into absolute wake ticks on a single sorted sleep list. The
//! same interrupt drives the 20 ms preemption pulse.

pub mod timer;

pub use timer::{Alarm, handle_timer_interrupt, start_preemption};

/// Ticks per second of the machine timer (QEMU virt CLINT).
pub const TIMER_FREQ: u64 = 10_000_000;

/// Preemption interval.
pub const PREEMPT_INTERVAL_MS: u64 = 20;

pub const fn ms_to_ticks(ms: u64) -> u64 {
    ms * (TIMER_FREQ / 1_000)
}

pub const fn us_to_ticks(us: u64) -> u64 {
    us * (TIMER_FREQ / 1_000_000)
}

/// Sleep the calling thread for at least `us` microseconds.
pub fn sleep_us(us: u64) {
    let mut alarm = Alarm::new("sleep");
    alarm.sleep(us_to_ticks(us));
}

pub fn sleep_ms(ms: u64) {
    sleep_us(ms * 1_000);
}

pub fn sleep_sec(sec: u64) {
    sleep_ms(sec * 1_000);
}
