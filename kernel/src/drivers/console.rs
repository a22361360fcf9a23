//! Console endpoint
//!
//! Byte-stream endpoint over the serial port, opened onto descriptor 0
//! of every process at init. Writes go straight out; reads block the
//! calling thread (politely, by yielding) until at least one byte is
//! available.

use alloc::boxed::Box;
use alloc::sync::Arc;

use crate::error::Result;
use crate::io::{Io, IoRef, IoRefCount};
use crate::serial;
use crate::task::scheduler;

pub struct Console {
    refs: IoRefCount,
}

impl Io for Console {
    fn refs(&self) -> &IoRefCount {
        &self.refs
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut filled = 0;
        loop {
            while filled < buf.len() {
                match serial::read_byte() {
                    Some(byte) => {
                        buf[filled] = byte;
                        filled += 1;
                    }
                    None => break,
                }
            }
            if filled > 0 {
                return Ok(filled);
            }
            scheduler::yield_now();
        }
    }

    fn write(&self, buf: &[u8]) -> Result<usize> {
        serial::write_bytes(buf);
        Ok(buf.len())
    }
}

static CONSOLE: spin::Lazy<Arc<Console>> = spin::Lazy::new(|| {
    Arc::new(Console {
        refs: IoRefCount::new(),
    })
});

/// A fresh reference to the console endpoint.
pub fn open_console() -> IoRef {
    IoRef::new(CONSOLE.clone())
}

/// Register the console in the device registry.
pub fn init() {
    crate::drivers::register_device("console", Box::new(|| Ok(open_console())));
}
