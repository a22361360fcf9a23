//! VirtIO block device
//!
//! One request in flight at a time: the queue holds a single ring entry,
//! an indirect descriptor pointing at a three-descriptor chain of request
//! header, one 512-byte data buffer, and a one-byte status. The request
//! path publishes the chain, notifies the device, and sleeps on the
//! completion condition until the ISR reports the used ring caught up.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::ptr::{addr_of, addr_of_mut, read_volatile};
use core::sync::atomic::{fence, Ordering};

use spin::Mutex;

use super::{
    feature, feature_mask, MmioTransport, VirtqAvail, VirtqDesc, VirtqUsed,
    VIRTQ_DESC_F_INDIRECT, VIRTQ_DESC_F_NEXT, VIRTQ_DESC_F_WRITE,
};
use crate::drivers::register_device;
use crate::error::{KernelError, Result};
use crate::io::{Control, Io, IoRef, IoRefCount};
use crate::plic;
use crate::task::{Condition, Lock};

pub const SECTOR_SIZE: u64 = 512;

const VIRTIO_BLK_T_IN: u32 = 0;
const VIRTIO_BLK_T_OUT: u32 = 1;

const VIRTIO_BLK_S_IOERR: u8 = 1;
const VIRTIO_BLK_S_UNSUPP: u8 = 2;

// Block device config space offsets.
const CFG_CAPACITY: usize = 0; // u64, in 512-byte sectors
const CFG_BLK_SIZE: usize = 20; // u32, present with VIRTIO_BLK_F_BLK_SIZE

const VIRTIO_BLK_F_BLK_SIZE: u64 = 6;
const VIRTIO_BLK_F_TOPOLOGY: u64 = 10;

#[repr(C)]
struct RequestHeader {
    type_: u32,
    reserved: u32,
    sector: u64,
}

/// DMA-visible request state. Boxed so its address is stable; the device
/// reads and writes it by physical address (identity-mapped here).
#[repr(C, align(4096))]
struct Ring {
    /// desc[0] is the indirect descriptor published in the avail ring;
    /// desc[1..4] form the header/data/status chain it points at.
    desc: [VirtqDesc; 4],
    avail: VirtqAvail,
    used: VirtqUsed,
    header: RequestHeader,
    data: [u8; SECTOR_SIZE as usize],
    status: u8,
    last_used: u16,
}

pub struct VirtioBlock {
    refs: IoRefCount,
    transport: MmioTransport,
    irq: u32,
    block_size: u32,
    /// Device end in bytes (capacity sectors x 512).
    end: u64,
    ring: Box<UnsafeCell<Ring>>,
    completion: Condition,
    /// Serializes the single-in-flight request path.
    request_lock: Lock,
    /// Whether the virtqueue is currently live.
    opened: Mutex<bool>,
}

// The ring cell is only touched while holding request_lock; the ISR does
// not touch it at all.
unsafe impl Sync for VirtioBlock {}
unsafe impl Send for VirtioBlock {}

/// Attached block devices, indexed by the aux value handed to the ISR.
static DEVICES: Mutex<Vec<Arc<VirtioBlock>>> = Mutex::new(Vec::new());

/// Bring up a discovered block device and register it as `vioblk`.
pub fn attach(transport: MmioTransport, irq: u32) {
    transport.reset();
    transport.add_status(super::status::ACKNOWLEDGE);
    transport.add_status(super::status::DRIVER);

    let needed = feature_mask(&[
        feature::VIRTIO_F_RING_RESET,
        feature::VIRTIO_F_INDIRECT_DESC,
    ]);
    let wanted = feature_mask(&[VIRTIO_BLK_F_BLK_SIZE, VIRTIO_BLK_F_TOPOLOGY]);

    let enabled = match transport.negotiate_features(needed, wanted) {
        Ok(enabled) => enabled,
        Err(()) => {
            log::warn!("vioblk: feature negotiation failed, skipping device");
            return;
        }
    };

    let block_size = if enabled & (1 << VIRTIO_BLK_F_BLK_SIZE) != 0 {
        transport.config_read_u32(CFG_BLK_SIZE)
    } else {
        SECTOR_SIZE as u32
    };
    assert!(block_size.is_power_of_two(), "device block size not a power of two");

    let capacity_sectors = transport.config_read_u64(CFG_CAPACITY);

    let mut ring = Box::new(UnsafeCell::new(Ring {
        desc: [VirtqDesc::default(); 4],
        avail: VirtqAvail {
            flags: 0,
            idx: 0,
            ring: [0],
            used_event: 0,
        },
        used: VirtqUsed {
            flags: 0,
            idx: 0,
            ring: [Default::default()],
            avail_event: 0,
        },
        header: RequestHeader {
            type_: 0,
            reserved: 0,
            sector: 0,
        },
        data: [0; SECTOR_SIZE as usize],
        status: 0xff,
        last_used: 0,
    }));

    // Wire the indirect chain: desc[0] points at desc[1..4].
    {
        let r = ring.get_mut();
        let chain_base = addr_of!(r.desc[1]) as u64;
        r.desc[0] = VirtqDesc {
            addr: chain_base,
            len: 3 * core::mem::size_of::<VirtqDesc>() as u32,
            flags: VIRTQ_DESC_F_INDIRECT,
            next: 0,
        };
        r.desc[1] = VirtqDesc {
            addr: addr_of!(r.header) as u64,
            len: core::mem::size_of::<RequestHeader>() as u32,
            flags: VIRTQ_DESC_F_NEXT,
            next: 1,
        };
        r.desc[2] = VirtqDesc {
            addr: addr_of!(r.data) as u64,
            len: SECTOR_SIZE as u32,
            flags: VIRTQ_DESC_F_NEXT | VIRTQ_DESC_F_WRITE,
            next: 2,
        };
        r.desc[3] = VirtqDesc {
            addr: addr_of!(r.status) as u64,
            len: 1,
            flags: VIRTQ_DESC_F_WRITE,
            next: 0,
        };

        transport.setup_queue(
            0,
            1,
            addr_of!(r.desc) as u64,
            addr_of!(r.avail) as u64,
            addr_of!(r.used) as u64,
        );
    }

    transport.add_status(super::status::DRIVER_OK);
    fence(Ordering::SeqCst);

    let device = Arc::new(VirtioBlock {
        refs: IoRefCount::new(),
        transport,
        irq,
        block_size,
        end: capacity_sectors * SECTOR_SIZE,
        ring,
        completion: Condition::new("vioblk.completion"),
        request_lock: Lock::new(),
        opened: Mutex::new(false),
    });

    // The device table is read from the ISR; writers mask interrupts.
    let index = crate::arch::without_interrupts(|| {
        let mut devices = DEVICES.lock();
        devices.push(device.clone());
        devices.len() - 1
    });

    let open_device = device.clone();
    register_device(
        "vioblk",
        Box::new(move || Ok(open_device.clone().open())),
    );

    log::info!(
        "vioblk{}: {} sectors ({} MiB), block size {}",
        index,
        capacity_sectors,
        capacity_sectors * SECTOR_SIZE / (1024 * 1024),
        block_size,
    );
}

/// ISR trampoline: `aux` indexes the attached-device table. Runs with
/// interrupts disabled.
fn vioblk_isr(aux: usize) {
    let device = DEVICES.lock().get(aux).cloned();
    if let Some(device) = device {
        device.isr();
    }
}

impl VirtioBlock {
    /// Enable the virtqueue and interrupt source (first open only) and
    /// hand out a counted endpoint reference.
    pub fn open(self: Arc<VirtioBlock>) -> IoRef {
        {
            let mut opened = self.opened.lock();
            if !*opened {
                self.transport.enable_queue(0);
                let index = crate::arch::without_interrupts(|| {
                    DEVICES
                        .lock()
                        .iter()
                        .position(|d| Arc::ptr_eq(d, &self))
                        .expect("open of an unattached device")
                });
                plic::enable_source(self.irq, vioblk_isr, index);
                *opened = true;
            }
        }
        IoRef::new(self)
    }

    fn isr(&self) {
        self.transport.interrupt_ack(self.transport.interrupt_status());
        self.completion.broadcast();
        fence(Ordering::SeqCst);
    }

    /// Move whole blocks between `buf` and the device, blocking on the
    /// completion condition for each one. Returns bytes transferred.
    fn transfer(&self, pos: u64, buf_len: usize, writing: bool, buf: *mut u8) -> Result<usize> {
        if pos == self.end {
            return Ok(0);
        }
        if pos > self.end {
            return Err(KernelError::InvalidArgument);
        }
        if buf_len == 0 {
            return Ok(0);
        }

        let blksz = self.block_size as u64;
        let count = (buf_len as u64).min(self.end - pos);
        let nblocks = count / blksz;

        self.request_lock.acquire();
        let result = (|| {
            for i in 0..nblocks {
                let ring = self.ring.get();
                unsafe {
                    (*ring).header.type_ = if writing {
                        VIRTIO_BLK_T_OUT
                    } else {
                        VIRTIO_BLK_T_IN
                    };
                    (*ring).header.sector = pos / blksz + i;
                    (*ring).status = 0xff;

                    // Data descriptor direction follows the request.
                    let data_flags = if writing {
                        VIRTQ_DESC_F_NEXT
                    } else {
                        VIRTQ_DESC_F_NEXT | VIRTQ_DESC_F_WRITE
                    };
                    (*ring).desc[2].flags = data_flags;

                    if writing {
                        core::ptr::copy_nonoverlapping(
                            buf.add((i * blksz) as usize),
                            (*ring).data.as_mut_ptr(),
                            blksz as usize,
                        );
                    }

                    let avail_idx = (*ring).avail.idx;
                    (*ring).avail.ring[0] = 0;
                    fence(Ordering::SeqCst);
                    (*ring).avail.idx = avail_idx.wrapping_add(1);
                }
                self.transport.notify(0);

                // Sleep until the used ring catches up with the avail
                // ring. Each predicate check shares an interrupts-off
                // window with the park; the wait itself re-enables
                // interrupts while the thread is off-CPU.
                let pie = crate::arch::disable_interrupts();
                loop {
                    let caught_up = unsafe {
                        (*ring).avail.idx == read_volatile(addr_of!((*ring).used.idx))
                    };
                    if caught_up {
                        break;
                    }
                    self.completion.wait();
                    crate::arch::disable_interrupts();
                }
                unsafe {
                    (*ring).last_used = read_volatile(addr_of!((*ring).used.idx));
                }
                crate::arch::restore_interrupts(pie);

                let status = unsafe { read_volatile(addr_of!((*ring).status)) };
                if status == VIRTIO_BLK_S_IOERR {
                    return Err(KernelError::Io);
                }
                if status == VIRTIO_BLK_S_UNSUPP {
                    return Err(KernelError::NotSupported);
                }

                if !writing {
                    unsafe {
                        core::ptr::copy_nonoverlapping(
                            addr_of_mut!((*ring).data) as *const u8,
                            buf.add((i * blksz) as usize),
                            blksz as usize,
                        );
                    }
                }
            }
            Ok((nblocks * blksz) as usize)
        })();
        self.request_lock.release();
        result
    }
}

impl Io for VirtioBlock {
    fn refs(&self) -> &IoRefCount {
        &self.refs
    }

    fn read_at(&self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        self.transfer(pos, buf.len(), false, buf.as_mut_ptr())
    }

    fn write_at(&self, pos: u64, buf: &[u8]) -> Result<usize> {
        self.transfer(pos, buf.len(), true, buf.as_ptr() as *mut u8)
    }

    fn control(&self, cmd: Control) -> Result<u64> {
        match cmd {
            Control::GetBlockSize => Ok(self.block_size as u64),
            Control::GetEnd => Ok(self.end),
            _ => Err(KernelError::NotSupported),
        }
    }

    /// Last reference gone: quiesce the queue and silence the source.
    fn close(&self) {
        self.transport.reset_queue(0);
        plic::disable_source(self.irq);
        *self.opened.lock() = false;
    }
}
