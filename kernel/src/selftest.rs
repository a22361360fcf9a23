//! In-kernel smoke tests
//!
//! Scenarios that need the live scheduler, timer, and devices, so they
//! cannot run as host unit tests. Built only with the `testing` feature
//! and run once at the end of boot; each check panics on failure, so a
//! surviving boot banner means they all passed.

use alloc::boxed::Box;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use spin::Lazy;

use crate::error::KernelError;
use crate::io::{Control, IoRef};
use crate::task::{self, Lock};
use crate::{arch, drivers, ipc, time};

pub fn run() {
    log::info!("selftest: starting");
    counter_under_lock();
    pipe_across_threads();
    sleep_ordering();
    block_device_bounds();
    log::info!("selftest: all checks passed");
}

// Ten threads increment a shared counter 1000 times each under one
// reentrant lock; the non-atomic read-modify-write would lose updates
// under preemption without it.

static COUNTER: AtomicU64 = AtomicU64::new(0);
static COUNTER_LOCK: Lazy<Lock> = Lazy::new(Lock::new);

fn counter_worker(rounds: u64, _unused: u64) {
    for _ in 0..rounds {
        COUNTER_LOCK.acquire();
        let value = COUNTER.load(Ordering::Relaxed);
        COUNTER.store(value + 1, Ordering::Relaxed);
        COUNTER_LOCK.release();
    }
}

fn counter_under_lock() {
    COUNTER.store(0, Ordering::Relaxed);
    let mut tids = [0usize; 10];
    for tid in tids.iter_mut() {
        *tid = task::spawn("counter", counter_worker, 1000, 0)
            .expect("selftest: spawn failed");
    }
    for tid in tids {
        task::join(tid).expect("selftest: join failed");
    }
    assert_eq!(COUNTER.load(Ordering::Relaxed), 10_000);
    log::info!("selftest: counter under lock ok");
}

// A writer thread pushes 5000 bytes through a pipe in one call while
// this thread drains 100 at a time; order and total must survive, and
// the writer's departure must read as EOF.

const PIPE_TOTAL: usize = 5000;

fn pipe_writer(writer_ptr: u64, _unused: u64) {
    let writer = unsafe { Box::from_raw(writer_ptr as *mut IoRef) };
    let data: alloc::vec::Vec<u8> = (0..PIPE_TOTAL).map(|i| (i % 251) as u8).collect();
    let written = writer.write(&data).expect("selftest: pipe write failed");
    assert_eq!(written, PIPE_TOTAL);
    // Dropping the box closes the write end.
}

fn pipe_across_threads() {
    let (writer, reader) = ipc::create_pipe();
    let writer_ptr = Box::into_raw(Box::new(writer)) as u64;
    let tid = task::spawn("pipe-writer", pipe_writer, writer_ptr, 0)
        .expect("selftest: spawn failed");

    let mut seen = 0usize;
    let mut chunk = [0u8; 100];
    loop {
        let n = reader.read(&mut chunk).expect("selftest: pipe read failed");
        if n == 0 {
            break;
        }
        for &byte in &chunk[..n] {
            assert_eq!(byte, (seen % 251) as u8, "pipe bytes out of order");
            seen += 1;
        }
    }
    assert_eq!(seen, PIPE_TOTAL);
    task::join(tid).expect("selftest: join failed");
    log::info!("selftest: pipe ordering ok");
}

// Two sleepers with different deadlines: the shorter one must wake
// first, roughly the difference apart, and neither early.

static WAKE_50MS: AtomicU64 = AtomicU64::new(0);
static WAKE_20MS: AtomicU64 = AtomicU64::new(0);
static SLEEP_SEQ: AtomicUsize = AtomicUsize::new(0);

fn sleeper(ms: u64, slot: u64) {
    time::sleep_ms(ms);
    let woke = arch::read_time();
    let order = SLEEP_SEQ.fetch_add(1, Ordering::SeqCst);
    match slot {
        0 => {
            WAKE_50MS.store(woke, Ordering::SeqCst);
            assert_eq!(order, 1, "50 ms sleeper woke before the 20 ms one");
        }
        _ => {
            WAKE_20MS.store(woke, Ordering::SeqCst);
            assert_eq!(order, 0, "20 ms sleeper did not wake first");
        }
    }
}

fn sleep_ordering() {
    SLEEP_SEQ.store(0, Ordering::SeqCst);
    let start = arch::read_time();
    let a = task::spawn("sleep-50", sleeper, 50, 0).expect("selftest: spawn failed");
    let b = task::spawn("sleep-20", sleeper, 20, 1).expect("selftest: spawn failed");
    task::join(a).expect("selftest: join failed");
    task::join(b).expect("selftest: join failed");

    let wake_a = WAKE_50MS.load(Ordering::SeqCst);
    let wake_b = WAKE_20MS.load(Ordering::SeqCst);
    assert!(wake_b >= start + time::ms_to_ticks(20), "20 ms sleeper woke early");
    assert!(wake_a >= start + time::ms_to_ticks(50), "50 ms sleeper woke early");
    let gap = wake_a - wake_b;
    assert!(
        (time::ms_to_ticks(25)..=time::ms_to_ticks(35)).contains(&gap),
        "wake gap out of range: {} ticks",
        gap
    );
    log::info!("selftest: sleep ordering ok");
}

// Boundary behavior at the block device end: reading the exact end is
// empty, past it is an error, and a capacity-crossing request clamps.

fn block_device_bounds() {
    let disk = match drivers::open_device("vioblk", 0) {
        Ok(disk) => disk,
        Err(_) => {
            log::warn!("selftest: no block device; skipping bounds check");
            return;
        }
    };
    let end = disk.control(Control::GetEnd).expect("selftest: GetEnd failed");

    let mut sector = [0u8; 512];
    assert_eq!(disk.read_at(end, &mut sector).unwrap(), 0);
    assert_eq!(
        disk.read_at(end + 1, &mut sector),
        Err(KernelError::InvalidArgument)
    );

    let mut two = [0u8; 1024];
    let n = disk
        .read_at(end - 512, &mut two)
        .expect("selftest: clamped read failed");
    assert_eq!(n, 512, "capacity-crossing read did not clamp");
    log::info!("selftest: block device bounds ok");
}
