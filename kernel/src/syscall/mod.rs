//! System call dispatch
//!
//! a7 selects the call, a0..a2 carry arguments, and the result goes back
//! in a0: non-negative on success, a negative error code otherwise.
//! User pointers are validated against the user address range before any
//! dereference; supervisor access to user pages is enabled globally.

use alloc::string::String;
use alloc::vec::Vec;

use crate::error::{as_sysret, KernelError, Result};
use crate::io::{Control, IoRef};
use crate::memory::{USER_END_VMA, USER_START_VMA};
use crate::process::{self, PROCESS_IOMAX};
use crate::task::thread;
use crate::trap::TrapFrame;
use crate::{drivers, fs, ipc, task, time};

pub const SYS_EXIT: u64 = 0;
pub const SYS_EXEC: u64 = 1;
pub const SYS_FORK: u64 = 2;
pub const SYS_WAIT: u64 = 3;
pub const SYS_PRINT: u64 = 4;
pub const SYS_USLEEP: u64 = 5;
pub const SYS_DEVOPEN: u64 = 6;
pub const SYS_FSOPEN: u64 = 7;
pub const SYS_CLOSE: u64 = 8;
pub const SYS_READ: u64 = 9;
pub const SYS_WRITE: u64 = 10;
pub const SYS_IOCTL: u64 = 11;
pub const SYS_FSCREATE: u64 = 12;
pub const SYS_FSDELETE: u64 = 13;
pub const SYS_PIPE: u64 = 14;
pub const SYS_IODUP: u64 = 15;

// Control command numbers on the ioctl ABI.
const IOCTL_GETBLKSZ: u64 = 0;
const IOCTL_GETEND: u64 = 1;
const IOCTL_SETEND: u64 = 2;
const IOCTL_GETPOS: u64 = 3;
const IOCTL_SETPOS: u64 = 4;

/// Dispatch one trapped ecall.
pub fn dispatch(tfr: &TrapFrame) -> i64 {
    let (a0, a1, a2) = (tfr.a0, tfr.a1, tfr.a2);
    match tfr.a7 {
        SYS_EXIT => process::exit(),
        SYS_EXEC => ret(sys_exec(a0 as i64, a1 as usize, a2 as usize)),
        SYS_FORK => ret(sys_fork(tfr)),
        SYS_WAIT => ret(sys_wait(a0 as i64)),
        SYS_PRINT => ret(sys_print(a0 as usize)),
        SYS_USLEEP => ret(sys_usleep(a0)),
        SYS_DEVOPEN => ret(sys_devopen(a0 as i64, a1 as usize, a2 as usize)),
        SYS_FSOPEN => ret(sys_fsopen(a0 as i64, a1 as usize)),
        SYS_CLOSE => ret(sys_close(a0 as i64)),
        SYS_READ => as_sysret(sys_read(a0 as i64, a1 as usize, a2 as usize)),
        SYS_WRITE => as_sysret(sys_write(a0 as i64, a1 as usize, a2 as usize)),
        SYS_IOCTL => ret(sys_ioctl(a0 as i64, a1, a2 as usize)),
        SYS_FSCREATE => ret(sys_fscreate(a0 as usize)),
        SYS_FSDELETE => ret(sys_fsdelete(a0 as usize)),
        SYS_PIPE => ret(sys_pipe(a0 as usize, a1 as usize)),
        SYS_IODUP => ret(sys_iodup(a0 as i64, a1 as i64)),
        _ => KernelError::NotSupported.code(),
    }
}

fn ret(result: Result<i64>) -> i64 {
    match result {
        Ok(v) => v,
        Err(e) => e.code(),
    }
}

// User-memory access. The SUM bit is set at boot, so validated user
// pointers can be dereferenced directly.

fn user_range_ok(addr: usize, len: usize) -> bool {
    addr >= USER_START_VMA && addr <= USER_END_VMA && len <= USER_END_VMA - addr
}

fn user_slice<'a>(addr: usize, len: usize) -> Result<&'a [u8]> {
    if !user_range_ok(addr, len) {
        return Err(KernelError::InvalidArgument);
    }
    Ok(unsafe { core::slice::from_raw_parts(addr as *const u8, len) })
}

fn user_slice_mut<'a>(addr: usize, len: usize) -> Result<&'a mut [u8]> {
    if !user_range_ok(addr, len) {
        return Err(KernelError::InvalidArgument);
    }
    Ok(unsafe { core::slice::from_raw_parts_mut(addr as *mut u8, len) })
}

/// A NUL-terminated user string, copied into kernel memory.
fn user_string(addr: usize) -> Result<String> {
    const MAX_STR: usize = 4096;
    let mut bytes = Vec::new();
    for i in 0..MAX_STR {
        let b = user_slice(addr + i, 1)?[0];
        if b == 0 {
            return String::from_utf8(bytes).map_err(|_| KernelError::InvalidArgument);
        }
        bytes.push(b);
    }
    Err(KernelError::InvalidArgument)
}

fn user_read_u64(addr: usize) -> Result<u64> {
    let slice = user_slice(addr, 8)?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(slice);
    Ok(u64::from_le_bytes(raw))
}

fn user_write_u64(addr: usize, value: u64) -> Result<()> {
    user_slice_mut(addr, 8)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

fn valid_fd(fd: i64) -> Result<usize> {
    if (0..PROCESS_IOMAX as i64).contains(&fd) {
        Ok(fd as usize)
    } else {
        Err(KernelError::BadFileDescriptor)
    }
}

/// Install `io` into the named slot, or the first free one when `fd` is
/// negative. Returns the slot used.
fn install_endpoint(fd: i64, io: IoRef) -> Result<i64> {
    process::with_current(|proc| {
        if fd >= 0 {
            let fd = fd as usize;
            if fd >= PROCESS_IOMAX || proc.iotab[fd].is_some() {
                return Err(KernelError::BadFileDescriptor);
            }
            proc.iotab[fd] = Some(io);
            Ok(fd as i64)
        } else {
            match proc.iotab.iter().position(|slot| slot.is_none()) {
                Some(free) => {
                    proc.iotab[free] = Some(io);
                    Ok(free as i64)
                }
                None => Err(KernelError::TooManyFiles),
            }
        }
    })?
}

fn sys_exec(fd: i64, argc: usize, argv: usize) -> Result<i64> {
    let fd = valid_fd(fd)?;
    let exe = process::descriptor(fd)?;

    // Collect argv views before the old image goes away.
    let mut args: Vec<String> = Vec::new();
    for i in 0..argc {
        let ptr = user_read_u64(argv + i * 8)? as usize;
        args.push(user_string(ptr)?);
    }
    let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();

    // The descriptor does not survive into the new image.
    let _ = sys_close(fd as i64);

    match process::exec(exe, &arg_refs) {
        Ok(()) => Ok(0),
        Err(e) => {
            // The old image is already torn down; the process cannot
            // resume.
            log::warn!("exec failed after teardown: {}; killing process", e);
            process::exit();
        }
    }
}

fn sys_fork(tfr: &TrapFrame) -> Result<i64> {
    process::fork(tfr).map(|tid| tid as i64)
}

fn sys_wait(tid: i64) -> Result<i64> {
    if tid < 0 {
        return Err(KernelError::InvalidArgument);
    }
    task::join(tid as usize).map(|t| t as i64)
}

fn sys_print(msg: usize) -> Result<i64> {
    let msg = user_string(msg)?;
    let tid = thread::current_tid();
    crate::serial_println!(
        "Thread <{}:{}> says: {}",
        thread::thread_name(tid).unwrap_or("?"),
        tid,
        msg
    );
    Ok(0)
}

fn sys_usleep(us: u64) -> Result<i64> {
    time::sleep_us(us);
    Ok(0)
}

fn sys_devopen(fd: i64, name: usize, instno: usize) -> Result<i64> {
    let name = user_string(name)?;
    let io = drivers::open_device(&name, instno)?;
    install_endpoint(fd, io)
}

fn sys_fsopen(fd: i64, name: usize) -> Result<i64> {
    let name = user_string(name)?;
    let io = fs::fs_open(&name)?;
    install_endpoint(fd, io)
}

fn sys_close(fd: i64) -> Result<i64> {
    let fd = valid_fd(fd)?;
    let closed = process::with_current(|proc| proc.iotab[fd].take())?;
    match closed {
        Some(io) => {
            drop(io);
            Ok(0)
        }
        None => Err(KernelError::BadFileDescriptor),
    }
}

fn sys_read(fd: i64, buf: usize, len: usize) -> Result<usize> {
    let fd = valid_fd(fd)?;
    let io = process::descriptor(fd)?;
    let buf = user_slice_mut(buf, len)?;
    io.read(buf)
}

fn sys_write(fd: i64, buf: usize, len: usize) -> Result<usize> {
    let fd = valid_fd(fd)?;
    let io = process::descriptor(fd)?;
    let buf = user_slice(buf, len)?;
    io.write(buf)
}

fn sys_ioctl(fd: i64, cmd: u64, arg: usize) -> Result<i64> {
    let fd = valid_fd(fd)?;
    let io = process::descriptor(fd)?;
    match cmd {
        IOCTL_GETBLKSZ => io.control(Control::GetBlockSize).map(|v| v as i64),
        IOCTL_GETEND => {
            let end = io.control(Control::GetEnd)?;
            user_write_u64(arg, end)?;
            Ok(0)
        }
        IOCTL_SETEND => {
            let end = user_read_u64(arg)?;
            io.control(Control::SetEnd(end))?;
            Ok(0)
        }
        IOCTL_GETPOS => {
            let pos = io.control(Control::GetPosition)?;
            user_write_u64(arg, pos)?;
            Ok(0)
        }
        IOCTL_SETPOS => {
            let pos = user_read_u64(arg)?;
            io.control(Control::SetPosition(pos))?;
            Ok(0)
        }
        _ => Err(KernelError::NotSupported),
    }
}

fn sys_fscreate(name: usize) -> Result<i64> {
    let name = user_string(name)?;
    fs::fs_create(&name)?;
    Ok(0)
}

fn sys_fsdelete(name: usize) -> Result<i64> {
    let name = user_string(name)?;
    fs::fs_delete(&name)?;
    Ok(0)
}

/// Create a pipe. The user passes pointers holding requested descriptor
/// numbers (negative to let the kernel pick); the chosen descriptors are
/// written back.
fn sys_pipe(wfd_ptr: usize, rfd_ptr: usize) -> Result<i64> {
    let wfd_req = user_read_u64(wfd_ptr)? as i64;
    let rfd_req = user_read_u64(rfd_ptr)? as i64;
    if wfd_req >= 0 && wfd_req == rfd_req {
        return Err(KernelError::BadFileDescriptor);
    }

    let (writer, reader) = ipc::create_pipe();
    let wfd = install_endpoint(wfd_req, writer)?;
    let rfd = match install_endpoint(rfd_req, reader) {
        Ok(fd) => fd,
        Err(e) => {
            let _ = sys_close(wfd);
            return Err(e);
        }
    };

    user_write_u64(wfd_ptr, wfd as u64)?;
    user_write_u64(rfd_ptr, rfd as u64)?;
    Ok(0)
}

/// Duplicate a descriptor: into the named slot (closing whatever was
/// there) or into the first free slot when `new` is negative. Returns
/// the slot used.
fn sys_iodup(old: i64, new: i64) -> Result<i64> {
    let old = valid_fd(old)?;
    let io = process::descriptor(old)?;

    if new >= 0 {
        let new = valid_fd(new)?;
        let previous = process::with_current(|proc| proc.iotab[new].replace(io))?;
        drop(previous);
        Ok(new as i64)
    } else {
        install_endpoint(-1, io)
    }
}
