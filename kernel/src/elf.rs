//! ELF64 program loading
//!
//! Just enough of the format to load a static RISC-V executable into the
//! active user address space: validate the identity fields, walk the
//! program headers, map and copy each PT_LOAD segment, then restrict the
//! segment permissions to what the header asks for.

use crate::error::{KernelError, Result};
use crate::io::IoRef;
use crate::memory::paging::{self, PteFlags};
use crate::memory::{round_down, round_up, PAGE_SIZE, USER_END_VMA, USER_START_VMA};

const EHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const CLASS_64: u8 = 2;
const DATA_LE: u8 = 1;
const TYPE_EXEC: u16 = 2;
const MACHINE_RISCV: u16 = 243;

const PT_LOAD: u32 = 1;

const PF_X: u32 = 1;
const PF_W: u32 = 2;
const PF_R: u32 = 4;

fn read_u16(b: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([b[off], b[off + 1]])
}

fn read_u32(b: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([b[off], b[off + 1], b[off + 2], b[off + 3]])
}

fn read_u64(b: &[u8], off: usize) -> u64 {
    u64::from_le_bytes([
        b[off],
        b[off + 1],
        b[off + 2],
        b[off + 3],
        b[off + 4],
        b[off + 5],
        b[off + 6],
        b[off + 7],
    ])
}

/// Load `exe` into the active address space; returns the entry point.
pub fn load(exe: &IoRef) -> Result<usize> {
    let mut ehdr = [0u8; EHDR_SIZE];
    if exe.read_at(0, &mut ehdr)? != EHDR_SIZE {
        return Err(KernelError::BadFormat);
    }

    if ehdr[0..4] != ELF_MAGIC
        || ehdr[4] != CLASS_64
        || ehdr[5] != DATA_LE
        || read_u16(&ehdr, 16) != TYPE_EXEC
        || read_u16(&ehdr, 18) != MACHINE_RISCV
    {
        return Err(KernelError::BadFormat);
    }

    let entry = read_u64(&ehdr, 24) as usize;
    let phoff = read_u64(&ehdr, 32);
    let phentsize = read_u16(&ehdr, 54) as u64;
    let phnum = read_u16(&ehdr, 56) as u64;
    if phentsize as usize != PHDR_SIZE {
        return Err(KernelError::BadFormat);
    }

    for i in 0..phnum {
        let mut phdr = [0u8; PHDR_SIZE];
        if exe.read_at(phoff + i * phentsize, &mut phdr)? != PHDR_SIZE {
            return Err(KernelError::BadFormat);
        }
        if read_u32(&phdr, 0) != PT_LOAD {
            continue;
        }

        let flags = read_u32(&phdr, 4);
        let offset = read_u64(&phdr, 8);
        let vaddr = read_u64(&phdr, 16) as usize;
        let filesz = read_u64(&phdr, 32) as usize;
        let memsz = read_u64(&phdr, 40) as usize;

        if filesz > memsz {
            return Err(KernelError::BadFormat);
        }
        let seg_start = round_down(vaddr, PAGE_SIZE);
        let seg_end = round_up(vaddr + memsz, PAGE_SIZE);
        if seg_start < USER_START_VMA || seg_end > USER_END_VMA {
            return Err(KernelError::BadFormat);
        }

        // Map writable first; the copy below goes through the mapping.
        paging::alloc_and_map_range(seg_start, seg_end - seg_start, PteFlags::RWU)?;

        let dst = unsafe { core::slice::from_raw_parts_mut(vaddr as *mut u8, filesz) };
        let mut filled = 0;
        while filled < filesz {
            let n = exe.read_at(offset + filled as u64, &mut dst[filled..])?;
            if n == 0 {
                return Err(KernelError::BadFormat);
            }
            filled += n;
        }
        // memsz beyond filesz is BSS; alloc_and_map_range hands out
        // zeroed frames, so nothing more to do.

        let mut perms = PteFlags::USER;
        if flags & PF_R != 0 {
            perms |= PteFlags::READ;
        }
        if flags & PF_W != 0 {
            perms |= PteFlags::WRITE;
        }
        if flags & PF_X != 0 {
            perms |= PteFlags::EXEC;
        }
        paging::set_range_flags(seg_start, seg_end - seg_start, perms);
    }

    if !(USER_START_VMA..USER_END_VMA).contains(&entry) {
        return Err(KernelError::BadFormat);
    }
    Ok(entry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_field_extraction() {
        let mut ehdr = [0u8; EHDR_SIZE];
        ehdr[0..4].copy_from_slice(&ELF_MAGIC);
        ehdr[4] = CLASS_64;
        ehdr[5] = DATA_LE;
        ehdr[16..18].copy_from_slice(&TYPE_EXEC.to_le_bytes());
        ehdr[18..20].copy_from_slice(&MACHINE_RISCV.to_le_bytes());
        ehdr[24..32].copy_from_slice(&0xC000_1000u64.to_le_bytes());
        ehdr[54..56].copy_from_slice(&(PHDR_SIZE as u16).to_le_bytes());

        assert_eq!(read_u64(&ehdr, 24), 0xC000_1000);
        assert_eq!(read_u16(&ehdr, 54) as usize, PHDR_SIZE);
    }

    #[test]
    fn test_rejects_foreign_binaries() {
        use crate::io::mem::MemIo;

        // x86-64 machine id in an otherwise valid-looking header.
        let mut image = alloc::vec![0u8; 4096];
        image[0..4].copy_from_slice(&ELF_MAGIC);
        image[4] = CLASS_64;
        image[5] = DATA_LE;
        image[16..18].copy_from_slice(&TYPE_EXEC.to_le_bytes());
        image[18..20].copy_from_slice(&62u16.to_le_bytes());
        let mem = MemIo::from_vec(image);

        assert_eq!(load(&mem.open()), Err(KernelError::BadFormat));
    }
}
