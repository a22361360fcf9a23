//! Kernel heap
//!
//! Backs `alloc` with a linked-list allocator over the window between the
//! kernel image and the page pool. Host test builds use the host
//! allocator instead.

#[cfg(target_arch = "riscv64")]
use linked_list_allocator::LockedHeap;

#[cfg(target_arch = "riscv64")]
#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

#[cfg(target_arch = "riscv64")]
pub fn init(start: usize, size: usize) {
    unsafe {
        ALLOCATOR.lock().init(start as *mut u8, size);
    }
    log::info!("Heap allocator: [{:#x}, {:#x})", start, start + size);
}

#[cfg(not(target_arch = "riscv64"))]
pub fn init(_start: usize, _size: usize) {}
