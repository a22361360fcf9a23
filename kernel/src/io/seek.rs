//! Seekable adapter
//!
//! Turns a positional endpoint into one that also supports streaming
//! reads and writes through a cursor. Streaming requests must cover at
//! least one backing block and are truncated down to a block multiple;
//! writes that run past the stored end grow the backing endpoint with a
//! `SetEnd` control call before the data moves.

use alloc::sync::Arc;

use spin::Mutex;

use super::{Control, Io, IoRef, IoRefCount};
use crate::error::{KernelError, Result};

pub struct SeekIo {
    refs: IoRefCount,
    inner: Mutex<SeekState>,
}

struct SeekState {
    backing: Option<IoRef>,
    pos: u64,
    end: u64,
    blksz: u64,
}

impl SeekIo {
    /// Wrap `backing`, which must report a power-of-two block size and
    /// answer `GetEnd`.
    pub fn new(backing: IoRef) -> Result<Arc<SeekIo>> {
        let blksz = backing.block_size();
        if blksz == 0 || !blksz.is_power_of_two() {
            return Err(KernelError::BadFormat);
        }
        let end = backing.control(Control::GetEnd)?;
        Ok(Arc::new(SeekIo {
            refs: IoRefCount::new(),
            inner: Mutex::new(SeekState {
                backing: Some(backing),
                pos: 0,
                end,
                blksz,
            }),
        }))
    }

    pub fn open(self: &Arc<SeekIo>) -> IoRef {
        IoRef::new(self.clone())
    }
}

impl Io for SeekIo {
    fn refs(&self) -> &IoRefCount {
        &self.refs
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut inner = self.inner.lock();
        let (pos, end, blksz) = (inner.pos, inner.end, inner.blksz);
        let backing = inner.backing.as_ref().ok_or(KernelError::InvalidArgument)?;

        // The cursor can sit past the end after a shrinking SetEnd.
        let mut want = (buf.len() as u64).min(end.saturating_sub(pos));
        if want == 0 {
            return Ok(0);
        }
        if want < blksz {
            return Err(KernelError::InvalidArgument);
        }
        want &= !(blksz - 1);

        let n = backing.read_at(pos, &mut buf[..want as usize])?;
        inner.pos = pos + n as u64;
        Ok(n)
    }

    fn write(&self, buf: &[u8]) -> Result<usize> {
        let mut inner = self.inner.lock();
        let (pos, end, blksz) = (inner.pos, inner.end, inner.blksz);

        let mut len = buf.len() as u64;
        if len == 0 {
            return Ok(0);
        }
        if len < blksz {
            return Err(KernelError::InvalidArgument);
        }
        len &= !(blksz - 1);

        if end.saturating_sub(pos) < len {
            let new_end = pos.checked_add(len).ok_or(KernelError::InvalidArgument)?;
            let backing = inner.backing.as_ref().ok_or(KernelError::InvalidArgument)?;
            backing.control(Control::SetEnd(new_end))?;
            inner.end = new_end;
        }

        let backing = inner.backing.as_ref().ok_or(KernelError::InvalidArgument)?;
        let n = backing.write_at(pos, &buf[..len as usize])?;
        inner.pos = pos + n as u64;
        Ok(n)
    }

    fn read_at(&self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        let inner = self.inner.lock();
        let backing = inner.backing.as_ref().ok_or(KernelError::InvalidArgument)?;
        backing.read_at(pos, buf)
    }

    fn write_at(&self, pos: u64, buf: &[u8]) -> Result<usize> {
        let inner = self.inner.lock();
        let backing = inner.backing.as_ref().ok_or(KernelError::InvalidArgument)?;
        backing.write_at(pos, buf)
    }

    fn control(&self, cmd: Control) -> Result<u64> {
        let mut inner = self.inner.lock();
        match cmd {
            Control::GetBlockSize => Ok(inner.blksz),
            Control::GetPosition => Ok(inner.pos),
            Control::SetPosition(pos) => {
                if pos & (inner.blksz - 1) != 0 || pos > inner.end {
                    return Err(KernelError::InvalidArgument);
                }
                inner.pos = pos;
                Ok(0)
            }
            Control::GetEnd => Ok(inner.end),
            Control::SetEnd(end) => {
                let backing =
                    inner.backing.as_ref().ok_or(KernelError::InvalidArgument)?;
                backing.control(Control::SetEnd(end))?;
                inner.end = end;
                Ok(0)
            }
        }
    }

    fn close(&self) {
        // Release the backing reference now rather than when the adapter
        // object is eventually dropped; the backing close may have
        // side effects (device reset, open-file bookkeeping).
        self.inner.lock().backing.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::mem::MemIo;

    /// A positional endpoint with a fixed block size, standing in for a
    /// block device.
    struct Blocky {
        refs: IoRefCount,
        mem: IoRef,
        blksz: u64,
    }

    impl Io for Blocky {
        fn refs(&self) -> &IoRefCount {
            &self.refs
        }
        fn read_at(&self, pos: u64, buf: &mut [u8]) -> Result<usize> {
            self.mem.read_at(pos, buf)
        }
        fn write_at(&self, pos: u64, buf: &[u8]) -> Result<usize> {
            self.mem.write_at(pos, buf)
        }
        fn control(&self, cmd: Control) -> Result<u64> {
            match cmd {
                Control::GetBlockSize => Ok(self.blksz),
                other => self.mem.control(other),
            }
        }
    }

    fn blocky(size: usize, blksz: u64) -> IoRef {
        let mem = MemIo::new(size);
        IoRef::new(Arc::new(Blocky {
            refs: IoRefCount::new(),
            mem: mem.open(),
            blksz,
        }))
    }

    #[test]
    fn test_stream_read_advances_cursor() {
        let backing = MemIo::new(64);
        backing.open().write_at(0, b"abcdefgh").unwrap();
        let sio = SeekIo::new(backing.open()).unwrap();
        let io = sio.open();

        let mut buf = [0u8; 4];
        assert_eq!(io.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(io.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"efgh");
        assert_eq!(io.control(Control::GetPosition).unwrap(), 8);
    }

    #[test]
    fn test_partial_block_requests_fail() {
        let sio = SeekIo::new(blocky(4096, 512)).unwrap();
        let io = sio.open();

        let mut small = [0u8; 100];
        assert_eq!(io.read(&mut small), Err(KernelError::InvalidArgument));
        assert_eq!(io.write(&small), Err(KernelError::InvalidArgument));

        // 700 bytes truncates down to one 512-byte block.
        let mut buf = [0u8; 700];
        assert_eq!(io.read(&mut buf).unwrap(), 512);
    }

    #[test]
    fn test_read_stops_at_end() {
        let sio = SeekIo::new(blocky(1024, 512)).unwrap();
        let io = sio.open();
        let mut buf = [0u8; 2048];
        assert_eq!(io.read(&mut buf).unwrap(), 1024);
        assert_eq!(io.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_set_position_validates_alignment_and_end() {
        let sio = SeekIo::new(blocky(2048, 512)).unwrap();
        let io = sio.open();
        io.control(Control::SetPosition(1024)).unwrap();
        assert_eq!(io.control(Control::GetPosition).unwrap(), 1024);
        assert_eq!(
            io.control(Control::SetPosition(100)),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(
            io.control(Control::SetPosition(4096)),
            Err(KernelError::InvalidArgument)
        );
    }

    #[test]
    fn test_write_past_end_grows_backing() {
        // A growable backing: report whatever end was last set.
        struct Growable {
            refs: IoRefCount,
            mem: IoRef,
            end: Mutex<u64>,
        }
        impl Io for Growable {
            fn refs(&self) -> &IoRefCount {
                &self.refs
            }
            fn read_at(&self, pos: u64, buf: &mut [u8]) -> Result<usize> {
                self.mem.read_at(pos, buf)
            }
            fn write_at(&self, pos: u64, buf: &[u8]) -> Result<usize> {
                self.mem.write_at(pos, buf)
            }
            fn control(&self, cmd: Control) -> Result<u64> {
                match cmd {
                    Control::GetBlockSize => Ok(512),
                    Control::GetEnd => Ok(*self.end.lock()),
                    Control::SetEnd(end) => {
                        *self.end.lock() = end;
                        Ok(0)
                    }
                    _ => Err(KernelError::NotSupported),
                }
            }
        }

        let mem = MemIo::new(8192);
        let g = Arc::new(Growable {
            refs: IoRefCount::new(),
            mem: mem.open(),
            end: Mutex::new(0),
        });
        let sio = SeekIo::new(IoRef::new(g.clone())).unwrap();
        let io = sio.open();

        let data = [7u8; 1024];
        assert_eq!(io.write(&data).unwrap(), 1024);
        // The adapter grew the backing endpoint and cached the new end.
        assert_eq!(*g.end.lock(), 1024);
        assert_eq!(io.control(Control::GetEnd).unwrap(), 1024);
    }
}
