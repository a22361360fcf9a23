//! Trap handling
//!
//! Two vectors: S-mode traps save a light frame on the interrupted stack
//! and dispatch interrupts; U-mode traps save the full register file into
//! the trap frame parked at the top of the thread's kernel stack and
//! dispatch syscalls, faults, and interrupts. Both run the deferred
//! preemption check on the way out: if the timer pulse raised
//! `need_resched`, the handler yields before returning to the trapped
//! code.

use crate::memory::paging;
use crate::task::scheduler;
use crate::time;
use crate::{plic, process, syscall};

/// Full register file captured on a U-mode trap; layout is fixed by the
/// entry assembly (x1..x31, then sepc, then sstatus).
#[derive(Debug, Clone)]
#[repr(C)]
pub struct TrapFrame {
    pub ra: u64,
    pub sp: u64,
    pub gp: u64,
    pub tp: u64,
    pub t0: u64,
    pub t1: u64,
    pub t2: u64,
    pub s0: u64,
    pub s1: u64,
    pub a0: u64,
    pub a1: u64,
    pub a2: u64,
    pub a3: u64,
    pub a4: u64,
    pub a5: u64,
    pub a6: u64,
    pub a7: u64,
    pub s2: u64,
    pub s3: u64,
    pub s4: u64,
    pub s5: u64,
    pub s6: u64,
    pub s7: u64,
    pub s8: u64,
    pub s9: u64,
    pub s10: u64,
    pub s11: u64,
    pub t3: u64,
    pub t4: u64,
    pub t5: u64,
    pub t6: u64,
    pub sepc: u64,
    pub sstatus: u64,
}

impl TrapFrame {
    pub const fn zeroed() -> TrapFrame {
        // Safety: all-zero is a valid TrapFrame (plain integers).
        unsafe { core::mem::zeroed() }
    }
}

/// Bytes the entry assembly reserves for a [`TrapFrame`].
pub const TRAP_FRAME_BYTES: usize = core::mem::size_of::<TrapFrame>();

/// Reserved slot at the top of every kernel stack for the staged trap
/// frame, 16-byte aligned. Thread stack pointers start below it, so the
/// slot never overlaps live stack frames.
pub const TRAP_FRAME_RESERVE: usize = (TRAP_FRAME_BYTES + 15) & !15;

// scause values.
const INTERRUPT_BIT: u64 = 1 << 63;
const IRQ_S_TIMER: u64 = 5;
const IRQ_S_EXTERNAL: u64 = 9;
const EXC_ECALL_U: u64 = 8;
const EXC_INST_PAGE_FAULT: u64 = 12;
const EXC_LOAD_PAGE_FAULT: u64 = 13;
const EXC_STORE_PAGE_FAULT: u64 = 15;

fn handle_interrupt(code: u64) {
    match code {
        IRQ_S_TIMER => time::handle_timer_interrupt(),
        IRQ_S_EXTERNAL => plic::handle_external_interrupt(),
        other => panic!("unexpected interrupt {}", other),
    }
}

/// Traps taken while in S-mode. Only interrupts are survivable; an
/// exception in kernel code is a kernel bug.
#[no_mangle]
extern "C" fn kernel_trap_handler(scause: u64, sepc: u64, stval: u64) {
    if scause & INTERRUPT_BIT != 0 {
        handle_interrupt(scause & !INTERRUPT_BIT);
        if scheduler::take_need_resched() {
            scheduler::yield_now();
        }
    } else {
        panic!(
            "kernel trap: scause={} sepc={:#x} stval={:#x}",
            scause, sepc, stval
        );
    }
}

/// Traps taken from U-mode. Returning resumes the process through the
/// restored frame; faults that cannot be repaired terminate it instead.
#[no_mangle]
extern "C" fn user_trap_handler(tfr: &mut TrapFrame, scause: u64, stval: u64) {
    if scause & INTERRUPT_BIT != 0 {
        handle_interrupt(scause & !INTERRUPT_BIT);
    } else {
        match scause {
            EXC_ECALL_U => {
                tfr.sepc += 4;
                tfr.a0 = syscall::dispatch(tfr) as u64;
            }
            EXC_LOAD_PAGE_FAULT | EXC_STORE_PAGE_FAULT | EXC_INST_PAGE_FAULT => {
                if paging::handle_user_page_fault(stval as usize).is_err() {
                    log::warn!(
                        "unrecoverable page fault at {:#x} (sepc={:#x}); killing process",
                        stval,
                        tfr.sepc
                    );
                    process::exit();
                }
                // Mapped: the faulting instruction retries on sret.
            }
            other => {
                log::warn!(
                    "fatal user exception scause={} sepc={:#x} stval={:#x}",
                    other,
                    tfr.sepc,
                    stval
                );
                process::exit();
            }
        }
    }

    if scheduler::take_need_resched() {
        scheduler::yield_now();
    }
}

#[cfg(target_arch = "riscv64")]
mod entry {
    use core::arch::global_asm;

    use super::TrapFrame;

    global_asm!(
        r#"
        .section .text
        .align 2

// S-mode trap vector: light frame on the interrupted stack.
        .global _kernel_trap_vector
_kernel_trap_vector:
        addi sp, sp, -144
        sd   ra, 0(sp)
        sd   t0, 8(sp)
        sd   t1, 16(sp)
        sd   t2, 24(sp)
        sd   a0, 32(sp)
        sd   a1, 40(sp)
        sd   a2, 48(sp)
        sd   a3, 56(sp)
        sd   a4, 64(sp)
        sd   a5, 72(sp)
        sd   a6, 80(sp)
        sd   a7, 88(sp)
        sd   t3, 96(sp)
        sd   t4, 104(sp)
        sd   t5, 112(sp)
        sd   t6, 120(sp)
        csrr t0, sepc
        sd   t0, 128(sp)
        csrr t0, sstatus
        sd   t0, 136(sp)

        csrr a0, scause
        csrr a1, sepc
        csrr a2, stval
        call kernel_trap_handler

        ld   t0, 136(sp)
        csrw sstatus, t0
        ld   t0, 128(sp)
        csrw sepc, t0
        ld   ra, 0(sp)
        ld   t0, 8(sp)
        ld   t1, 16(sp)
        ld   t2, 24(sp)
        ld   a0, 32(sp)
        ld   a1, 40(sp)
        ld   a2, 48(sp)
        ld   a3, 56(sp)
        ld   a4, 64(sp)
        ld   a5, 72(sp)
        ld   a6, 80(sp)
        ld   a7, 88(sp)
        ld   t3, 96(sp)
        ld   t4, 104(sp)
        ld   t5, 112(sp)
        ld   t6, 120(sp)
        addi sp, sp, 144
        sret

// U-mode trap vector. sscratch holds the address of the thread's trap
// frame, which sits at the top of its kernel stack; kernel execution
// continues on the stack space below the frame.
        .global _user_trap_vector
_user_trap_vector:
        csrrw sp, sscratch, sp      // sp = &frame, sscratch = user sp
        sd   x1, 0(sp)
        sd   x3, 16(sp)
        sd   x4, 24(sp)
        sd   x5, 32(sp)
        sd   x6, 40(sp)
        sd   x7, 48(sp)
        sd   x8, 56(sp)
        sd   x9, 64(sp)
        sd   x10, 72(sp)
        sd   x11, 80(sp)
        sd   x12, 88(sp)
        sd   x13, 96(sp)
        sd   x14, 104(sp)
        sd   x15, 112(sp)
        sd   x16, 120(sp)
        sd   x17, 128(sp)
        sd   x18, 136(sp)
        sd   x19, 144(sp)
        sd   x20, 152(sp)
        sd   x21, 160(sp)
        sd   x22, 168(sp)
        sd   x23, 176(sp)
        sd   x24, 184(sp)
        sd   x25, 192(sp)
        sd   x26, 200(sp)
        sd   x27, 208(sp)
        sd   x28, 216(sp)
        sd   x29, 224(sp)
        sd   x30, 232(sp)
        sd   x31, 240(sp)
        csrr t0, sscratch           // saved user sp
        sd   t0, 8(sp)
        csrr t0, sepc
        sd   t0, 248(sp)
        csrr t0, sstatus
        sd   t0, 256(sp)

        // Nested S-mode traps use the kernel vector while we are here.
        la   t0, _kernel_trap_vector
        csrw stvec, t0

        mv   a0, sp
        csrr a1, scause
        csrr a2, stval
        call user_trap_handler

        .global _trap_frame_return
_trap_frame_return:
        // sp = &frame on entry (user_trap_handler preserved it).
        la   t0, _user_trap_vector
        csrw stvec, t0
        csrw sscratch, sp
        ld   t0, 256(sp)
        csrw sstatus, t0
        ld   t0, 248(sp)
        csrw sepc, t0
        ld   x1, 0(sp)
        ld   x3, 16(sp)
        ld   x4, 24(sp)
        ld   x5, 32(sp)
        ld   x6, 40(sp)
        ld   x7, 48(sp)
        ld   x8, 56(sp)
        ld   x9, 64(sp)
        ld   x10, 72(sp)
        ld   x11, 80(sp)
        ld   x12, 88(sp)
        ld   x13, 96(sp)
        ld   x14, 104(sp)
        ld   x15, 112(sp)
        ld   x16, 120(sp)
        ld   x17, 128(sp)
        ld   x18, 136(sp)
        ld   x19, 144(sp)
        ld   x20, 152(sp)
        ld   x21, 160(sp)
        ld   x22, 168(sp)
        ld   x23, 176(sp)
        ld   x24, 184(sp)
        ld   x25, 192(sp)
        ld   x26, 200(sp)
        ld   x27, 208(sp)
        ld   x28, 216(sp)
        ld   x29, 224(sp)
        ld   x30, 232(sp)
        ld   x31, 240(sp)
        ld   sp, 8(sp)
        sret

// _trap_frame_jump(frame: *const TrapFrame): enter U-mode through an
// already-populated frame. The frame must sit at the top of the current
// thread's kernel stack.
        .global _trap_frame_jump
_trap_frame_jump:
        mv   sp, a0
        j    _trap_frame_return
"#
    );

    extern "C" {
        pub fn _trap_frame_jump(frame: *const TrapFrame) -> !;
        pub fn _kernel_trap_vector();
    }
}

/// Install the S-mode trap vector.
#[cfg(target_arch = "riscv64")]
pub fn init() {
    unsafe {
        riscv::register::stvec::write(
            entry::_kernel_trap_vector as usize,
            riscv::register::stvec::TrapMode::Direct,
        );
    }
    log::info!("Trap vector installed");
}

#[cfg(not(target_arch = "riscv64"))]
pub fn init() {}

/// Enter user mode through `frame`, staging it into the reserved slot at
/// the top of the running thread's kernel stack. Never returns to the
/// caller; the thread re-enters the kernel only via the user trap
/// vector.
#[cfg(target_arch = "riscv64")]
pub fn trap_frame_jump(frame: &TrapFrame, kernel_stack_top: usize) -> ! {
    let staged = kernel_stack_top - TRAP_FRAME_RESERVE;
    unsafe {
        core::ptr::write(staged as *mut TrapFrame, frame.clone());
        entry::_trap_frame_jump(staged as *const TrapFrame)
    }
}

#[cfg(not(target_arch = "riscv64"))]
pub fn trap_frame_jump(_frame: &TrapFrame, _kernel_stack_top: usize) -> ! {
    unreachable!("user mode entry on a non-riscv64 build");
}
