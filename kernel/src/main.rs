//! Kernel binary entry
//!
//! OpenSBI drops us here in S-mode with the hart id in a0 and the device
//! tree in a1. The boot shim sets up a stack and calls `kmain`, which
//! brings the subsystems up in dependency order and hands control to the
//! init program.

#![cfg_attr(target_arch = "riscv64", no_std)]
#![cfg_attr(target_arch = "riscv64", no_main)]

#[cfg(target_arch = "riscv64")]
mod boot {
    use core::arch::global_asm;
    use core::ptr::addr_of;

    use kernel::{drivers, fs, logger, memory, plic, process, serial, task, time, trap};

    global_asm!(
        r#"
        .section .text.boot
        .global _start
_start:
        // The top 272 bytes of the boot stack are the main thread's
        // trap-frame slot; execution starts below it.
        la   sp, _boot_stack_top
        addi sp, sp, -272
        mv   tp, zero
        call kmain
1:      wfi
        j    1b
"#
    );

    extern "C" {
        static _boot_stack_top: u8;
    }

    #[no_mangle]
    extern "C" fn kmain(hartid: usize, _dtb: usize) -> ! {
        serial::init();
        logger::init();
        log::info!("Oxbow starting on hart {}", hartid);

        memory::init();
        trap::init();
        task::thread::init(unsafe { addr_of!(_boot_stack_top) as usize });
        plic::init();
        process::init();
        drivers::init();
        kernel::arch::enable_interrupts();

        #[cfg(feature = "testing")]
        kernel::selftest::run();

        match drivers::open_device("vioblk", 0) {
            Ok(disk) => match fs::mount_root(disk) {
                Ok(()) => run_init(),
                Err(e) => log::error!("root volume mount failed: {}", e),
            },
            Err(e) => log::warn!("no block device ({}); running diskless", e),
        }

        log::info!("Nothing to run; idling");
        loop {
            time::sleep_sec(1);
        }
    }

    /// Exec the on-disk init program in the main process. Only returns
    /// if it cannot be started.
    fn run_init() {
        match fs::fs_open("init") {
            Ok(exe) => {
                log::info!("Launching init");
                if let Err(e) = process::exec(exe, &["init"]) {
                    log::error!("exec of init failed: {}", e);
                }
            }
            Err(e) => log::warn!("no init program ({})", e),
        }
    }
}

#[cfg(not(target_arch = "riscv64"))]
fn main() {
    // The kernel only boots on riscv64; on the host this binary exists
    // solely so `cargo build` has nothing surprising to say. The library
    // crate carries the testable subsystems.
    eprintln!("oxbow is a riscv64 kernel image; build with the riscv64 target");
}
