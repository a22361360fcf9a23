//! Memory management
//!
//! Three layers, initialized in order at boot: the physical page pool
//! (`frame_allocator`), the kernel heap (`heap`), and the Sv39 page-table
//! manager (`paging`). RAM starts at 0x8000_0000 on the virt machine;
//! the first megapage belongs to the SBI firmware, the kernel image sits
//! in the second with the heap carved from the space after it, and
//! everything above that belongs to the page pool.

pub mod frame_allocator;
pub mod heap;
pub mod paging;

pub const PAGE_SIZE: usize = 4096;
pub const PAGE_ORDER: usize = 12;

/// 2 MiB, one level-1 leaf.
pub const MEGA_SIZE: usize = 512 * PAGE_SIZE;
/// 1 GiB, one level-2 leaf.
pub const GIGA_SIZE: usize = 512 * MEGA_SIZE;

pub const RAM_START: usize = 0x8000_0000;
pub const RAM_SIZE: usize = 128 * 1024 * 1024;
pub const RAM_END: usize = RAM_START + RAM_SIZE;

/// Where the SBI firmware loads us: one megapage above the RAM base,
/// which stays reserved for the firmware itself.
pub const KERNEL_BASE: usize = RAM_START + MEGA_SIZE;

/// User virtual range; faults inside it are resolved by demand paging.
pub const USER_START_VMA: usize = 0xC000_0000;
pub const USER_END_VMA: usize = 0x1_0000_0000;

/// Heap window carved after the kernel image.
#[cfg(target_arch = "riscv64")]
const HEAP_MIN_SIZE: usize = 1024 * 1024;

pub const fn round_up(n: usize, k: usize) -> usize {
    (n + k - 1) / k * k
}

pub const fn round_down(n: usize, k: usize) -> usize {
    n / k * k
}

#[cfg(target_arch = "riscv64")]
extern "C" {
    static _kimg_start: u8;
    static _kimg_text_start: u8;
    static _kimg_text_end: u8;
    static _kimg_rodata_start: u8;
    static _kimg_rodata_end: u8;
    static _kimg_data_start: u8;
    static _kimg_end: u8;
}

/// Bring up paging, the heap, and the page pool.
///
/// The identity mapping installed here is global: MMIO as RW gigapages,
/// the kernel image with per-section permissions, and the rest of RAM as
/// RW megapages. It survives address-space resets.
#[cfg(target_arch = "riscv64")]
pub fn init() {
    use core::ptr::addr_of;

    let kimg_start = unsafe { addr_of!(_kimg_start) as usize };
    let kimg_end = unsafe { addr_of!(_kimg_end) as usize };
    let text_start = unsafe { addr_of!(_kimg_text_start) as usize };
    let text_end = unsafe { addr_of!(_kimg_text_end) as usize };
    let rodata_start = unsafe { addr_of!(_kimg_rodata_start) as usize };
    let rodata_end = unsafe { addr_of!(_kimg_rodata_end) as usize };
    let data_start = unsafe { addr_of!(_kimg_data_start) as usize };

    assert_eq!(kimg_start, KERNEL_BASE);
    // The image plus heap must fit in the kernel megapage, which is the
    // only finely-mapped region.
    assert!(kimg_end - kimg_start <= MEGA_SIZE);

    paging::init_kernel_space(
        text_start,
        text_end,
        rodata_start,
        rodata_end,
        data_start,
    );

    let heap_start = round_up(kimg_end, 16);
    let mut heap_end = round_up(heap_start, PAGE_SIZE);
    if heap_end - heap_start < HEAP_MIN_SIZE {
        heap_end += round_up(HEAP_MIN_SIZE - (heap_end - heap_start), PAGE_SIZE);
    }
    assert!(
        heap_end <= KERNEL_BASE + MEGA_SIZE,
        "image plus heap overflow the kernel megapage"
    );
    heap::init(heap_start, heap_end - heap_start);

    frame_allocator::init(heap_end, RAM_END);

    // Supervisor access to user pages stays on; exec and the syscall
    // layer copy user memory directly.
    crate::arch::enable_supervisor_user_access();

    log::info!(
        "Memory initialized: image [{:#x}, {:#x}), heap [{:#x}, {:#x}), pool {} pages",
        kimg_start,
        kimg_end,
        heap_start,
        heap_end,
        frame_allocator::free_page_count()
    );
}
