//! Open-file endpoint
//!
//! The positional endpoint handed out by [`Filesystem::open`], normally
//! wrapped in a seekable adapter. Carries a copy of the directory entry
//! and a cached copy of the inode; the cached copy is kept in step with
//! every resize. Reads and writes clamp to the file size — extension
//! only happens through the `SetEnd` control path.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};

use spin::Mutex;

use super::dir::DirEntry;
use super::inode::Inode;
use super::{Filesystem, BLOCK_SIZE};
use crate::error::{KernelError, Result};
use crate::io::{Control, Io, IoRefCount};

pub struct FsFile {
    refs: IoRefCount,
    fs: Arc<Filesystem>,
    entry: DirEntry,
    inode: Mutex<Inode>,
    open: AtomicBool,
}

impl FsFile {
    pub(super) fn new(fs: Arc<Filesystem>, entry: DirEntry, inode: Inode) -> FsFile {
        FsFile {
            refs: IoRefCount::new(),
            fs,
            entry,
            inode: Mutex::new(inode),
            open: AtomicBool::new(true),
        }
    }

    /// Deleting an open file severs its endpoint.
    pub(super) fn mark_closed(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    fn check_open(&self) -> Result<()> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(KernelError::Io)
        }
    }

    /// Clamp a request at `pos` to the file size; `Ok(0)` at the exact
    /// end, `InvalidArgument` beyond it.
    fn clamp(&self, pos: u64, len: usize) -> Result<(Inode, usize)> {
        self.check_open()?;
        let inode = *self.inode.lock();
        let size = inode.size as u64;
        if pos > size {
            return Err(KernelError::InvalidArgument);
        }
        Ok((inode, len.min((size - pos) as usize)))
    }
}

impl Io for FsFile {
    fn refs(&self) -> &IoRefCount {
        &self.refs
    }

    fn read_at(&self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        self.fs.lock.acquire();
        let result = (|| {
            let (inode, len) = self.clamp(pos, buf.len())?;
            let mut done = 0;
            while done < len {
                let cursor = pos + done as u64;
                let logical = cursor / BLOCK_SIZE as u64;
                let offset = (cursor % BLOCK_SIZE as u64) as usize;
                let chunk = (BLOCK_SIZE - offset).min(len - done);

                let ptr = self.fs.lookup_block(&inode, logical)?;
                let guard = self.fs.cache.get(self.fs.block_pos(ptr))?;
                buf[done..done + chunk].copy_from_slice(&guard[offset..offset + chunk]);
                guard.release(false)?;
                done += chunk;
            }
            Ok(len)
        })();
        self.fs.lock.release();
        result
    }

    fn write_at(&self, pos: u64, buf: &[u8]) -> Result<usize> {
        self.fs.lock.acquire();
        let result = (|| {
            let (inode, len) = self.clamp(pos, buf.len())?;
            let mut done = 0;
            while done < len {
                let cursor = pos + done as u64;
                let logical = cursor / BLOCK_SIZE as u64;
                let offset = (cursor % BLOCK_SIZE as u64) as usize;
                let chunk = (BLOCK_SIZE - offset).min(len - done);

                let ptr = self.fs.lookup_block(&inode, logical)?;
                let mut guard = self.fs.cache.get(self.fs.block_pos(ptr))?;
                guard[offset..offset + chunk].copy_from_slice(&buf[done..done + chunk]);
                guard.release(true)?;
                done += chunk;
            }
            Ok(len)
        })();
        self.fs.lock.release();
        result
    }

    fn control(&self, cmd: Control) -> Result<u64> {
        match cmd {
            Control::GetBlockSize => Ok(1),
            Control::GetEnd => {
                self.check_open()?;
                Ok(self.inode.lock().size as u64)
            }
            Control::SetEnd(target) => {
                self.fs.lock.acquire();
                let result = (|| {
                    self.check_open()?;
                    let mut inode = *self.inode.lock();
                    self.fs.resize_inode(self.entry.inode, &mut inode, target)?;
                    *self.inode.lock() = inode;
                    Ok(0)
                })();
                self.fs.lock.release();
                result
            }
            _ => Err(KernelError::NotSupported),
        }
    }

    fn close(&self) {
        self.mark_closed();
        self.fs.close_file(self.entry.inode);
    }
}
