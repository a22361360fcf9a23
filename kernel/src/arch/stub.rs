//! Inert CPU stubs for non-riscv64 builds
//!
//! Lets the allocator, cache, filesystem, and I/O layers compile and run
//! their unit tests on the host. Nothing here is reachable in a kernel
//! build.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::task::context::Context;

static INTERRUPTS_ENABLED: AtomicBool = AtomicBool::new(true);
static FAKE_TIME: AtomicU64 = AtomicU64::new(0);
static FAKE_SATP: AtomicU64 = AtomicU64::new(0);

pub fn disable_interrupts() -> bool {
    INTERRUPTS_ENABLED.swap(false, Ordering::SeqCst)
}

pub fn restore_interrupts(was_enabled: bool) {
    INTERRUPTS_ENABLED.store(was_enabled, Ordering::SeqCst);
}

pub fn enable_interrupts() {
    INTERRUPTS_ENABLED.store(true, Ordering::SeqCst);
}

pub fn wait_for_interrupt() {}

pub fn enable_supervisor_user_access() {}

pub fn read_time() -> u64 {
    // Monotonic so sorted-insert logic behaves sensibly under test.
    FAKE_TIME.fetch_add(1, Ordering::SeqCst)
}

pub fn read_sstatus() -> u64 {
    0
}

pub fn enable_timer_interrupt() {}

pub fn disable_timer_interrupt() {}

pub fn enable_external_interrupts() {}

pub fn set_timer(_deadline: u64) {}

pub fn read_satp() -> u64 {
    FAKE_SATP.load(Ordering::SeqCst)
}

pub fn swap_satp(bits: u64) -> u64 {
    FAKE_SATP.swap(bits, Ordering::SeqCst)
}

pub fn sfence_vma() {}

pub fn shutdown(failure: bool) -> ! {
    panic!("shutdown(failure={})", failure);
}

/// # Safety
/// Never called on the host; present only to satisfy the shared API.
pub unsafe fn context_switch(_old: *mut Context, _new: *const Context) {
    unreachable!("context switch on a non-riscv64 build");
}
