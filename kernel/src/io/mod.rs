//! Unified I/O objects
//!
//! Every byte-stream or block endpoint in the kernel — devices, files,
//! pipes, adapters — implements the [`Io`] trait. An operation the object
//! does not support reports `NotSupported` through the trait's default
//! methods; the owner of an operation is always `self`, never recovered
//! from a raw pointer.
//!
//! Endpoints are reference counted through [`IoRef`]: cloning a ref is
//! `addref`, dropping the last ref invokes [`Io::close`] exactly once.
//! Devices are constructed with an open count of zero and hand out their
//! first reference from their `open` path.

pub mod mem;
pub mod seek;

use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{KernelError, Result};

/// The closed set of endpoint control commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    GetBlockSize,
    GetEnd,
    SetEnd(u64),
    GetPosition,
    SetPosition(u64),
}

/// Open-reference count embedded in every endpoint.
pub struct IoRefCount(AtomicUsize);

impl IoRefCount {
    pub const fn new() -> IoRefCount {
        IoRefCount(AtomicUsize::new(0))
    }

    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    fn add(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    /// Decrement; true when this drop hit zero.
    fn release(&self) -> bool {
        let prev = self.0.fetch_sub(1, Ordering::SeqCst);
        assert!(prev != 0, "close of an unreferenced endpoint");
        prev == 1
    }
}

impl Default for IoRefCount {
    fn default() -> Self {
        IoRefCount::new()
    }
}

/// A polymorphic I/O endpoint.
///
/// Implementors provide whichever operations make sense; the rest answer
/// `NotSupported`. An endpoint with no `control` of its own still answers
/// `GetBlockSize` with 1.
pub trait Io: Send + Sync {
    /// The endpoint's open-reference count storage.
    fn refs(&self) -> &IoRefCount;

    fn read(&self, _buf: &mut [u8]) -> Result<usize> {
        Err(KernelError::NotSupported)
    }

    fn write(&self, _buf: &[u8]) -> Result<usize> {
        Err(KernelError::NotSupported)
    }

    fn read_at(&self, _pos: u64, _buf: &mut [u8]) -> Result<usize> {
        Err(KernelError::NotSupported)
    }

    fn write_at(&self, _pos: u64, _buf: &[u8]) -> Result<usize> {
        Err(KernelError::NotSupported)
    }

    fn control(&self, cmd: Control) -> Result<u64> {
        match cmd {
            Control::GetBlockSize => Ok(1),
            _ => Err(KernelError::NotSupported),
        }
    }

    /// Invoked exactly once, when the last open reference is dropped.
    fn close(&self) {}
}

/// A counted reference to an endpoint.
pub struct IoRef {
    obj: Arc<dyn Io>,
}

impl IoRef {
    /// Take a new open reference on `obj`.
    pub fn new(obj: Arc<dyn Io>) -> IoRef {
        obj.refs().add();
        IoRef { obj }
    }

    /// Outstanding open references on the underlying endpoint.
    pub fn refcount(&self) -> usize {
        self.obj.refs().count()
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.obj.read(buf)
    }

    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        self.obj.write(buf)
    }

    pub fn read_at(&self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        self.obj.read_at(pos, buf)
    }

    pub fn write_at(&self, pos: u64, buf: &[u8]) -> Result<usize> {
        self.obj.write_at(pos, buf)
    }

    pub fn control(&self, cmd: Control) -> Result<u64> {
        self.obj.control(cmd)
    }

    /// Block size of the endpoint; 1 when it does not say otherwise.
    pub fn block_size(&self) -> u64 {
        self.obj.control(Control::GetBlockSize).unwrap_or(1)
    }

    /// Read until `buf` is full, EOF, or an error. Short reads from the
    /// endpoint are retried; returns the number of bytes placed.
    pub fn read_fully(&self, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.obj.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    /// Write all of `buf`, retrying short writes; returns the number of
    /// bytes consumed (less than `buf.len()` only on EOF-like stops).
    pub fn write_fully(&self, buf: &[u8]) -> Result<usize> {
        let mut written = 0;
        while written < buf.len() {
            let n = self.obj.write(&buf[written..])?;
            if n == 0 {
                break;
            }
            written += n;
        }
        Ok(written)
    }
}

impl Clone for IoRef {
    fn clone(&self) -> IoRef {
        IoRef::new(self.obj.clone())
    }
}

impl Drop for IoRef {
    fn drop(&mut self) {
        if self.obj.refs().release() {
            self.obj.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicUsize;

    struct Probe {
        refs: IoRefCount,
        closes: AtomicUsize,
    }

    impl Io for Probe {
        fn refs(&self) -> &IoRefCount {
            &self.refs
        }
        fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_close_called_exactly_once_at_zero() {
        let probe = Arc::new(Probe {
            refs: IoRefCount::new(),
            closes: AtomicUsize::new(0),
        });

        let r1 = IoRef::new(probe.clone());
        let r2 = r1.clone();
        let r3 = IoRef::new(probe.clone());
        assert_eq!(r1.refcount(), 3);

        drop(r2);
        drop(r3);
        assert_eq!(probe.closes.load(Ordering::SeqCst), 0);
        drop(r1);
        assert_eq!(probe.closes.load(Ordering::SeqCst), 1);
        assert_eq!(probe.refs.count(), 0);
    }

    #[test]
    fn test_default_operations_unsupported() {
        let probe = Arc::new(Probe {
            refs: IoRefCount::new(),
            closes: AtomicUsize::new(0),
        });
        let r = IoRef::new(probe);
        let mut buf = [0u8; 4];
        assert_eq!(r.read(&mut buf), Err(KernelError::NotSupported));
        assert_eq!(r.write(&buf), Err(KernelError::NotSupported));
        assert_eq!(r.read_at(0, &mut buf), Err(KernelError::NotSupported));
        assert_eq!(r.write_at(0, &buf), Err(KernelError::NotSupported));
        assert_eq!(r.control(Control::GetEnd), Err(KernelError::NotSupported));
        // An endpoint with no control of its own still has block size 1.
        assert_eq!(r.block_size(), 1);
    }
}
