//! riscv64 CPU access
//!
//! CSR-level plumbing for a single S-mode hart: sstatus interrupt bits,
//! the sie timer/external enables, satp, sfence.vma, rdtime, the SBI
//! timer call, and the context-switch assembly.

use core::arch::{asm, global_asm};

use riscv::register::{sie, sstatus, time};

use crate::task::context::Context;

/// Disable S-mode interrupts; returns whether they were enabled before.
#[inline]
pub fn disable_interrupts() -> bool {
    let was_enabled = sstatus::read().sie();
    unsafe { sstatus::clear_sie() };
    was_enabled
}

/// Restore the interrupt-enable state captured by [`disable_interrupts`].
#[inline]
pub fn restore_interrupts(was_enabled: bool) {
    if was_enabled {
        unsafe { sstatus::set_sie() };
    } else {
        unsafe { sstatus::clear_sie() };
    }
}

/// Enable S-mode interrupts unconditionally.
#[inline]
pub fn enable_interrupts() {
    unsafe { sstatus::set_sie() };
}

/// Wait for an interrupt. Pairs with an interrupts-disabled ready-list
/// check in the idle loop; wfi wakes on pending interrupts even when
/// sstatus.SIE is clear.
#[inline]
pub fn wait_for_interrupt() {
    unsafe { riscv::asm::wfi() };
}

/// Allow S-mode loads/stores to user pages (sstatus.SUM).
#[inline]
pub fn enable_supervisor_user_access() {
    unsafe { sstatus::set_sum() };
}

/// Current value of the `time` CSR in timer ticks.
#[inline]
pub fn read_time() -> u64 {
    time::read64()
}

/// Raw sstatus bits; exec seeds the user-mode sstatus from them.
#[inline]
pub fn read_sstatus() -> u64 {
    sstatus::read().bits() as u64
}

/// Enable the supervisor timer interrupt source.
#[inline]
pub fn enable_timer_interrupt() {
    unsafe { sie::set_stimer() };
}

/// Disable the supervisor timer interrupt source.
#[inline]
pub fn disable_timer_interrupt() {
    unsafe { sie::clear_stimer() };
}

/// Enable the supervisor external interrupt source (PLIC).
#[inline]
pub fn enable_external_interrupts() {
    unsafe { sie::set_sext() };
}

/// Program the next timer interrupt via the SBI TIME extension.
#[inline]
pub fn set_timer(deadline: u64) {
    // SBI v0.2 TIME extension, function 0 (set_timer).
    const SBI_EXT_TIME: usize = 0x54494D45;
    unsafe {
        asm!(
            "ecall",
            in("a7") SBI_EXT_TIME,
            in("a6") 0usize,
            in("a0") deadline,
            lateout("a0") _,
            lateout("a1") _,
        );
    }
}

/// Read the active address-space tag (raw satp).
#[inline]
pub fn read_satp() -> u64 {
    let bits: u64;
    unsafe { asm!("csrr {}, satp", out(reg) bits) };
    bits
}

/// Swap the active address-space tag; returns the previous one.
///
/// The caller issues the paging barrier.
#[inline]
pub fn swap_satp(bits: u64) -> u64 {
    let prev: u64;
    unsafe { asm!("csrrw {}, satp, {}", out(reg) prev, in(reg) bits) };
    prev
}

/// Full TLB shootdown for this hart.
#[inline]
pub fn sfence_vma() {
    unsafe { riscv::asm::sfence_vma_all() };
}

/// Power down via the SBI system reset extension.
pub fn shutdown(failure: bool) -> ! {
    const SBI_EXT_SRST: usize = 0x53525354;
    let reason: usize = if failure { 1 } else { 0 };
    unsafe {
        asm!(
            "ecall",
            in("a7") SBI_EXT_SRST,
            in("a6") 0usize,
            in("a0") 0usize, // shutdown
            in("a1") reason,
            options(noreturn),
        );
    }
}

global_asm!(
    r#"
    .section .text
    .global _context_switch
    .type _context_switch, @function
    .align 2
// _context_switch(old: *mut Context, new: *const Context)
//
// Saves the callee-saved state of the outgoing thread into *old and
// resumes the incoming thread from *new. Returns (to the incoming
// thread's saved ra) when the outgoing thread is next dispatched.
_context_switch:
    sd   ra, 0(a0)
    sd   sp, 8(a0)
    sd   s0, 16(a0)
    sd   s1, 24(a0)
    sd   s2, 32(a0)
    sd   s3, 40(a0)
    sd   s4, 48(a0)
    sd   s5, 56(a0)
    sd   s6, 64(a0)
    sd   s7, 72(a0)
    sd   s8, 80(a0)
    sd   s9, 88(a0)
    sd   s10, 96(a0)
    sd   s11, 104(a0)

    ld   ra, 0(a1)
    ld   sp, 8(a1)
    ld   s0, 16(a1)
    ld   s1, 24(a1)
    ld   s2, 32(a1)
    ld   s3, 40(a1)
    ld   s4, 48(a1)
    ld   s5, 56(a1)
    ld   s6, 64(a1)
    ld   s7, 72(a1)
    ld   s8, 80(a1)
    ld   s9, 88(a1)
    ld   s10, 96(a1)
    ld   s11, 104(a1)
    ret
"#
);

extern "C" {
    fn _context_switch(old: *mut Context, new: *const Context);
}

/// Switch from the context saved at `old` to the one at `new`.
///
/// # Safety
/// Both pointers must refer to live, correctly initialized [`Context`]
/// records; `new` must describe a resumable thread stack.
#[inline]
pub unsafe fn context_switch(old: *mut Context, new: *const Context) {
    _context_switch(old, new);
}
