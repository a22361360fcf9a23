//! Architecture seam
//!
//! Everything the rest of the kernel needs from the CPU goes through this
//! module: interrupt masking, the timer, address-space CSRs, and the
//! context-switch primitive. On riscv64 these hit real CSRs; on other
//! targets an inert stub keeps the pure-logic subsystems compiling so they
//! can be unit-tested on the host.

#[cfg(target_arch = "riscv64")]
mod riscv64;
#[cfg(target_arch = "riscv64")]
pub use riscv64::*;

#[cfg(not(target_arch = "riscv64"))]
mod stub;
#[cfg(not(target_arch = "riscv64"))]
pub use stub::*;

/// Run `f` with interrupts disabled, restoring the previous state after.
pub fn without_interrupts<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let prev = disable_interrupts();
    let result = f();
    restore_interrupts(prev);
    result
}
