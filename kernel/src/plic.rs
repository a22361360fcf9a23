//! Platform-level interrupt controller
//!
//! Thin shim over the PLIC on the virt machine: per-source priority and
//! enable for the S-mode context of hart 0, plus claim/complete dispatch
//! into registered handlers. Handlers run in ISR context with interrupts
//! disabled; they get the aux value they registered with.

use spin::Mutex;

const PLIC_BASE: usize = 0x0c00_0000;
/// S-mode context of hart 0.
const CONTEXT: usize = 1;

const MAX_SOURCES: usize = 64;
const DEFAULT_PRIORITY: u32 = 1;

type Handler = fn(usize);

static HANDLERS: Mutex<[Option<(Handler, usize)>; MAX_SOURCES]> =
    Mutex::new([None; MAX_SOURCES]);

#[cfg(target_arch = "riscv64")]
fn mmio_write(offset: usize, value: u32) {
    unsafe { core::ptr::write_volatile((PLIC_BASE + offset) as *mut u32, value) }
}

#[cfg(target_arch = "riscv64")]
fn mmio_read(offset: usize) -> u32 {
    unsafe { core::ptr::read_volatile((PLIC_BASE + offset) as *const u32) }
}

#[cfg(not(target_arch = "riscv64"))]
fn mmio_write(_offset: usize, _value: u32) {}

#[cfg(not(target_arch = "riscv64"))]
fn mmio_read(_offset: usize) -> u32 {
    0
}

fn priority_offset(irq: u32) -> usize {
    4 * irq as usize
}

fn enable_offset(irq: u32) -> usize {
    0x2000 + 0x80 * CONTEXT + 4 * (irq as usize / 32)
}

fn threshold_offset() -> usize {
    0x20_0000 + 0x1000 * CONTEXT
}

fn claim_offset() -> usize {
    threshold_offset() + 4
}

/// Accept all priorities for our context and unmask external interrupts.
pub fn init() {
    mmio_write(threshold_offset(), 0);
    crate::arch::enable_external_interrupts();
    log::info!("PLIC initialized (context {})", CONTEXT);
}

/// Route interrupt source `irq` to `handler(aux)`.
///
/// The handler table is read from the external-interrupt ISR, so
/// mutation happens with interrupts masked.
pub fn enable_source(irq: u32, handler: Handler, aux: usize) {
    assert!((irq as usize) < MAX_SOURCES);
    crate::arch::without_interrupts(|| {
        HANDLERS.lock()[irq as usize] = Some((handler, aux));
    });

    mmio_write(priority_offset(irq), DEFAULT_PRIORITY);
    let enable = mmio_read(enable_offset(irq));
    mmio_write(enable_offset(irq), enable | (1 << (irq % 32)));
}

/// Mask a source and drop its handler.
pub fn disable_source(irq: u32) {
    assert!((irq as usize) < MAX_SOURCES);
    let enable = mmio_read(enable_offset(irq));
    mmio_write(enable_offset(irq), enable & !(1 << (irq % 32)));
    crate::arch::without_interrupts(|| {
        HANDLERS.lock()[irq as usize] = None;
    });
}

/// Claim-and-complete loop for one external interrupt trap.
pub fn handle_external_interrupt() {
    loop {
        let irq = mmio_read(claim_offset());
        if irq == 0 {
            break;
        }
        let handler = HANDLERS.lock()[irq as usize];
        match handler {
            Some((f, aux)) => f(aux),
            None => log::warn!("spurious external interrupt {}", irq),
        }
        mmio_write(claim_offset(), irq);
    }
}
