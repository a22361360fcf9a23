//! Kernel error set
//!
//! One closed set of error conditions shared by every subsystem. Errors
//! cross the syscall boundary as small negative integers, so the set is
//! kernel-wide rather than per-module: the numbering is part of the ABI.

use core::fmt;

/// Errors surfaced by kernel operations.
///
/// Every endpoint operation and every syscall reports failure with one of
/// these. Invariant violations inside the scheduler or the page-table
/// manager do not use this type; they panic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// Malformed argument (bad pointer, bad length, bad position)
    InvalidArgument,
    /// The object does not implement the requested operation
    NotSupported,
    /// The resource is in use (file already open, duplicate name)
    Busy,
    /// Descriptor out of range or not open
    BadFileDescriptor,
    /// No file with that name
    NoEntry,
    /// Physical or heap memory exhausted
    NoMemory,
    /// Per-process or per-filesystem file limit reached
    TooManyFiles,
    /// Thread table exhausted
    TooManyThreads,
    /// Write on a pipe whose read end is closed
    BrokenPipe,
    /// The device reported an I/O error
    Io,
    /// The filesystem has no free data blocks
    NoDataBlocks,
    /// On-disk or in-file structure failed validation
    BadFormat,
    /// Operation not permitted on this object
    AccessDenied,
}

pub type Result<T> = core::result::Result<T, KernelError>;

impl KernelError {
    /// Negative integer code for the syscall ABI.
    pub const fn code(self) -> i64 {
        match self {
            KernelError::InvalidArgument => -1,
            KernelError::Busy => -2,
            KernelError::NotSupported => -3,
            KernelError::BadFileDescriptor => -4,
            KernelError::BadFormat => -5,
            KernelError::Io => -6,
            KernelError::NoEntry => -7,
            KernelError::AccessDenied => -8,
            KernelError::NoMemory => -9,
            KernelError::TooManyFiles => -10,
            KernelError::TooManyThreads => -11,
            KernelError::BrokenPipe => -12,
            KernelError::NoDataBlocks => -13,
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            KernelError::InvalidArgument => "invalid argument",
            KernelError::NotSupported => "not supported",
            KernelError::Busy => "busy",
            KernelError::BadFileDescriptor => "bad file descriptor",
            KernelError::NoEntry => "no such file",
            KernelError::NoMemory => "out of memory",
            KernelError::TooManyFiles => "too many files",
            KernelError::TooManyThreads => "too many threads",
            KernelError::BrokenPipe => "broken pipe",
            KernelError::Io => "I/O error",
            KernelError::NoDataBlocks => "no free data blocks",
            KernelError::BadFormat => "bad format",
            KernelError::AccessDenied => "access denied",
        };
        f.write_str(msg)
    }
}

/// Fold a `Result<usize>` into the signed return convention used at the
/// syscall boundary: non-negative count on success, negative code on error.
pub fn as_sysret(result: Result<usize>) -> i64 {
    match result {
        Ok(n) => n as i64,
        Err(e) => e.code(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_negative_and_distinct() {
        let all = [
            KernelError::InvalidArgument,
            KernelError::NotSupported,
            KernelError::Busy,
            KernelError::BadFileDescriptor,
            KernelError::NoEntry,
            KernelError::NoMemory,
            KernelError::TooManyFiles,
            KernelError::TooManyThreads,
            KernelError::BrokenPipe,
            KernelError::Io,
            KernelError::NoDataBlocks,
            KernelError::BadFormat,
            KernelError::AccessDenied,
        ];
        for (i, a) in all.iter().enumerate() {
            assert!(a.code() < 0);
            for b in &all[i + 1..] {
                assert_ne!(a.code(), b.code());
            }
        }
    }

    #[test]
    fn test_sysret_folding() {
        assert_eq!(as_sysret(Ok(17)), 17);
        assert_eq!(
            as_sysret(Err(KernelError::BrokenPipe)),
            KernelError::BrokenPipe.code()
        );
    }
}
