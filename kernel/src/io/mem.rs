//! Memory-backed endpoint
//!
//! Positional reads and writes against a bounded in-memory buffer. Used
//! for boot images and as the backing store in unit tests, where it
//! stands in for the block device. `SetEnd` may shrink the endpoint but
//! never grow it.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use spin::Mutex;

use super::{Control, Io, IoRef, IoRefCount};
use crate::error::{KernelError, Result};

pub struct MemIo {
    refs: IoRefCount,
    inner: Mutex<MemBuf>,
}

struct MemBuf {
    data: Vec<u8>,
    size: usize,
}

impl MemIo {
    /// A zero-filled endpoint of `size` bytes.
    pub fn new(size: usize) -> Arc<MemIo> {
        MemIo::from_vec(vec![0u8; size])
    }

    /// Wrap an existing buffer.
    pub fn from_vec(data: Vec<u8>) -> Arc<MemIo> {
        let size = data.len();
        Arc::new(MemIo {
            refs: IoRefCount::new(),
            inner: Mutex::new(MemBuf { data, size }),
        })
    }

    /// A fresh open reference.
    pub fn open(self: &Arc<MemIo>) -> IoRef {
        IoRef::new(self.clone())
    }
}

impl Io for MemIo {
    fn refs(&self) -> &IoRefCount {
        &self.refs
    }

    fn read_at(&self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        let inner = self.inner.lock();
        let pos = pos as usize;
        if pos > inner.size {
            return Err(KernelError::InvalidArgument);
        }
        let n = buf.len().min(inner.size - pos);
        buf[..n].copy_from_slice(&inner.data[pos..pos + n]);
        Ok(n)
    }

    fn write_at(&self, pos: u64, buf: &[u8]) -> Result<usize> {
        let mut inner = self.inner.lock();
        let pos = pos as usize;
        if pos > inner.size {
            return Err(KernelError::InvalidArgument);
        }
        let n = buf.len().min(inner.size - pos);
        inner.data[pos..pos + n].copy_from_slice(&buf[..n]);
        Ok(n)
    }

    fn control(&self, cmd: Control) -> Result<u64> {
        match cmd {
            Control::GetBlockSize => Ok(1),
            Control::GetEnd => Ok(self.inner.lock().size as u64),
            Control::SetEnd(end) => {
                let mut inner = self.inner.lock();
                if (end as usize) < inner.size {
                    inner.size = end as usize;
                    Ok(0)
                } else {
                    Err(KernelError::InvalidArgument)
                }
            }
            _ => Err(KernelError::NotSupported),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let mio = MemIo::new(64);
        let io = mio.open();
        assert_eq!(io.write_at(10, b"hello").unwrap(), 5);
        let mut buf = [0u8; 5];
        assert_eq!(io.read_at(10, &mut buf).unwrap(), 5);
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn test_reads_clamp_at_end() {
        let mio = MemIo::new(8);
        let io = mio.open();
        let mut buf = [0u8; 16];
        assert_eq!(io.read_at(4, &mut buf).unwrap(), 4);
        assert_eq!(io.read_at(8, &mut buf).unwrap(), 0);
        assert_eq!(io.read_at(9, &mut buf), Err(KernelError::InvalidArgument));
    }

    #[test]
    fn test_set_end_shrinks_but_never_grows() {
        let mio = MemIo::new(32);
        let io = mio.open();
        assert_eq!(io.control(Control::GetEnd).unwrap(), 32);
        io.control(Control::SetEnd(16)).unwrap();
        assert_eq!(io.control(Control::GetEnd).unwrap(), 16);
        assert_eq!(
            io.control(Control::SetEnd(64)),
            Err(KernelError::InvalidArgument)
        );
        // Writes past the shrunken end clamp to it.
        assert_eq!(io.write_at(12, &[1; 8]).unwrap(), 4);
    }
}
