//! Device drivers and the device registry
//!
//! Drivers register themselves at attach time under a name; each instance
//! of the same name gets the next instance number. The devopen syscall
//! resolves `(name, instance)` to a fresh endpoint reference through the
//! registered open function.

pub mod console;
pub mod virtio;

use alloc::boxed::Box;
use alloc::vec::Vec;

use spin::Mutex;

use crate::error::{KernelError, Result};
use crate::io::IoRef;

type OpenFn = Box<dyn Fn() -> Result<IoRef> + Send + Sync>;

struct DeviceEntry {
    name: &'static str,
    instno: usize,
    open: OpenFn,
}

static DEVICES: Mutex<Vec<DeviceEntry>> = Mutex::new(Vec::new());

/// Register a device instance; returns its instance number.
pub fn register_device(name: &'static str, open: OpenFn) -> usize {
    let mut devices = DEVICES.lock();
    let instno = devices.iter().filter(|d| d.name == name).count();
    devices.push(DeviceEntry { name, instno, open });
    log::info!("Registered device {}{}", name, instno);
    instno
}

/// Open device `name` instance `instno`.
pub fn open_device(name: &str, instno: usize) -> Result<IoRef> {
    let devices = DEVICES.lock();
    let entry = devices
        .iter()
        .find(|d| d.name == name && d.instno == instno)
        .ok_or(KernelError::NoEntry)?;
    (entry.open)()
}

/// Register built-in devices and probe buses.
pub fn init() {
    console::init();
    virtio::init();
}
