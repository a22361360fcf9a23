//! Inode file system
//!
//! A flat-root-directory filesystem over a positional block endpoint,
//! always accessed through the block cache. Layout: block 0 is the
//! superblock, then the data-block bitmap, then the inode blocks, then
//! data blocks. Inodes address data through four direct pointers, one
//! indirect pointer block, and two double-indirect pointer blocks.
//!
//! The in-memory inode-use bitmap is rebuilt on every mount by scanning
//! the root directory; that is lossless because an inode is only ever
//! allocated together with its directory entry.

pub mod dir;
pub mod file;
pub mod inode;
pub mod superblock;

use alloc::sync::{Arc, Weak};
use alloc::vec;
use alloc::vec::Vec;

use spin::Mutex;

use crate::block::BlockCache;
use crate::error::{KernelError, Result};
use crate::io::seek::SeekIo;
use crate::io::IoRef;
use crate::task::Lock;

use dir::{DirEntry, DIRENT_SIZE, ENTRIES_PER_BLOCK, NAME_LEN};
use file::FsFile;
use inode::{classify, ExtentSlot, Inode, INODE_SIZE};
use superblock::Superblock;

pub const BLOCK_SIZE: usize = 512;
pub const INODES_PER_BLOCK: usize = BLOCK_SIZE / INODE_SIZE;
/// Hard cap on files per volume, independent of inode capacity.
pub const MAX_FILES: usize = 95;

struct OpenEntry {
    inode: u16,
    file: Weak<FsFile>,
}

struct FsMeta {
    /// In-memory copy of the root directory inode.
    root_inode: Inode,
    /// In-memory inode-use bitmap, rebuilt at mount.
    inode_used: Vec<bool>,
    open: Vec<OpenEntry>,
}

pub struct Filesystem {
    pub(super) cache: BlockCache,
    /// Keeps the backing endpoint referenced for the life of the mount.
    #[allow(dead_code)]
    backing: IoRef,
    superblock: Superblock,
    /// Serializes every filesystem operation (reentrant).
    pub(super) lock: Lock,
    meta: Mutex<FsMeta>,
}

impl Filesystem {
    /// Read the volume metadata and build the in-memory state.
    pub fn mount(io: IoRef) -> Result<Arc<Filesystem>> {
        let cache = BlockCache::new(io.clone());

        let guard = cache.get(0)?;
        let superblock = Superblock::from_bytes(&guard[..]);
        guard.release(false)?;
        let superblock = superblock?;

        let fs = Filesystem {
            cache,
            backing: io,
            superblock,
            lock: Lock::new(),
            meta: Mutex::new(FsMeta {
                root_inode: Inode::default(),
                inode_used: vec![false; superblock.inode_capacity()],
                open: Vec::new(),
            }),
        };

        let root = fs.read_inode(superblock.root_inode)?;
        let entry_count = root.size as u64 / DIRENT_SIZE as u64;

        {
            let mut meta = fs.meta.lock();
            meta.root_inode = root;
            meta.inode_used[superblock.root_inode as usize] = true;
        }
        for idx in 0..entry_count {
            let entry = fs.dir_entry_at(&root, idx)?;
            let mut meta = fs.meta.lock();
            if (entry.inode as usize) < meta.inode_used.len() {
                meta.inode_used[entry.inode as usize] = true;
            }
        }

        log::info!(
            "Mounted volume: {} files, {} inode slots, {} data blocks max",
            entry_count,
            superblock.inode_capacity(),
            superblock.data_capacity()
        );
        Ok(Arc::new(fs))
    }

    /// Open `name`, returning a seekable endpoint over the file.
    pub fn open(self: &Arc<Filesystem>, name: &str) -> Result<IoRef> {
        self.lock.acquire();
        let result = (|| {
            let (_, entry) = self.find_entry(name)?.ok_or(KernelError::NoEntry)?;

            {
                let meta = self.meta.lock();
                if meta.open.iter().any(|e| e.inode == entry.inode) {
                    return Err(KernelError::Busy);
                }
            }

            let inode = self.read_inode(entry.inode)?;
            let file = Arc::new(FsFile::new(self.clone(), entry, inode));
            self.meta.lock().open.push(OpenEntry {
                inode: entry.inode,
                file: Arc::downgrade(&file),
            });

            let seek = SeekIo::new(IoRef::new(file))?;
            Ok(seek.open())
        })();
        self.lock.release();
        result
    }

    /// Create an empty file named `name`.
    pub fn create(&self, name: &str) -> Result<()> {
        self.lock.acquire();
        let result = (|| {
            let mut entry = DirEntry::new(name, 0)?;
            if self.find_entry(name)?.is_some() {
                return Err(KernelError::Busy);
            }

            let mut root = self.root();
            let num_files = root.size as u64 / DIRENT_SIZE as u64;
            if num_files >= MAX_FILES as u64 {
                return Err(KernelError::TooManyFiles);
            }
            let inode_no = {
                let meta = self.meta.lock();
                match meta.inode_used.iter().position(|used| !used) {
                    Some(i) => i as u16,
                    None => return Err(KernelError::TooManyFiles),
                }
            };

            // The current directory block is full (or absent); grow the
            // directory by one data block.
            if num_files % ENTRIES_PER_BLOCK as u64 == 0 {
                let ptr = self.alloc_zeroed_block()?;
                self.attach_block(&mut root, num_files / ENTRIES_PER_BLOCK as u64, ptr)?;
            }

            entry.inode = inode_no;
            self.write_dir_entry_at(&root, num_files, &entry)?;
            self.write_inode(inode_no, &Inode::default())?;

            root.size += DIRENT_SIZE as u32;
            self.set_root(root)?;
            self.meta.lock().inode_used[inode_no as usize] = true;
            Ok(())
        })();
        self.lock.release();
        result
    }

    /// Remove `name`: free every block it references, swap-delete its
    /// directory entry, release its inode, and flush.
    pub fn delete(&self, name: &str) -> Result<()> {
        self.lock.acquire();
        let result = (|| {
            let (idx, entry) = self.find_entry(name)?.ok_or(KernelError::NoEntry)?;

            // An open file is force-closed first.
            {
                let mut meta = self.meta.lock();
                if let Some(pos) = meta.open.iter().position(|e| e.inode == entry.inode) {
                    if let Some(file) = meta.open[pos].file.upgrade() {
                        file.mark_closed();
                    }
                    meta.open.remove(pos);
                }
            }

            // Shrinking to zero walks every extent level, clearing the
            // bitmap bit of each data block and freeing the pointer
            // blocks themselves.
            let mut inode = self.read_inode(entry.inode)?;
            self.resize_inode(entry.inode, &mut inode, 0)?;

            let mut root = self.root();
            let num_files = root.size as u64 / DIRENT_SIZE as u64;
            let last_idx = num_files - 1;
            let last = self.dir_entry_at(&root, last_idx)?;
            if idx != last_idx {
                self.write_dir_entry_at(&root, idx, &last)?;
            }
            self.write_dir_entry_at(
                &root,
                last_idx,
                &DirEntry {
                    name: [0; NAME_LEN],
                    inode: 0,
                },
            )?;

            self.meta.lock().inode_used[entry.inode as usize] = false;
            self.write_inode(entry.inode, &Inode::default())?;

            root.size -= DIRENT_SIZE as u32;
            self.set_root(root)?;
            self.flush()
        })();
        self.lock.release();
        result
    }

    /// Flush cached state to the backing endpoint.
    pub fn flush(&self) -> Result<()> {
        self.cache.flush()
    }

    /// Drop a file from the open table; called when its endpoint closes.
    pub(super) fn close_file(&self, inode_no: u16) {
        self.meta.lock().open.retain(|e| e.inode != inode_no);
    }

    // Geometry helpers.

    /// Byte position of data block `ptr` on the backing endpoint.
    pub(super) fn block_pos(&self, ptr: u32) -> u64 {
        (self.superblock.data_start() + ptr as u64) * BLOCK_SIZE as u64
    }

    fn inode_location(&self, inode_no: u16) -> (u64, usize) {
        let block = inode_no as u64 / INODES_PER_BLOCK as u64;
        let offset = (inode_no as usize % INODES_PER_BLOCK) * INODE_SIZE;
        (
            (self.superblock.inode_start() + block) * BLOCK_SIZE as u64,
            offset,
        )
    }

    pub(super) fn read_inode(&self, inode_no: u16) -> Result<Inode> {
        let (pos, offset) = self.inode_location(inode_no);
        let guard = self.cache.get(pos)?;
        let inode = Inode::from_bytes(&guard[offset..offset + INODE_SIZE]);
        guard.release(false)?;
        Ok(inode)
    }

    pub(super) fn write_inode(&self, inode_no: u16, inode: &Inode) -> Result<()> {
        let (pos, offset) = self.inode_location(inode_no);
        let mut guard = self.cache.get(pos)?;
        inode.write_to(&mut guard[offset..offset + INODE_SIZE]);
        guard.release(true)
    }

    // Extent translation.

    fn read_ptr(&self, pointer_block: u32, index: usize) -> Result<u32> {
        let guard = self.cache.get(self.block_pos(pointer_block))?;
        let offset = index * 4;
        let value = u32::from_le_bytes([
            guard[offset],
            guard[offset + 1],
            guard[offset + 2],
            guard[offset + 3],
        ]);
        guard.release(false)?;
        Ok(value)
    }

    fn write_ptr(&self, pointer_block: u32, index: usize, value: u32) -> Result<()> {
        let mut guard = self.cache.get(self.block_pos(pointer_block))?;
        let offset = index * 4;
        guard[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
        guard.release(true)
    }

    /// Translate a logical block index of `inode` to its data block
    /// pointer, walking direct -> indirect -> double-indirect.
    pub(super) fn lookup_block(&self, inode: &Inode, logical: u64) -> Result<u32> {
        match classify(logical)? {
            ExtentSlot::Direct { index } => Ok(inode.direct[index]),
            ExtentSlot::Indirect { index } => self.read_ptr(inode.indirect, index),
            ExtentSlot::DoubleIndirect {
                which,
                outer,
                inner,
            } => {
                let mid = self.read_ptr(inode.dindirect[which], outer)?;
                self.read_ptr(mid, inner)
            }
        }
    }

    /// Install data block `ptr` as logical block `logical`, allocating
    /// (zeroed) pointer blocks as the index crosses into a new region.
    /// Attachment is always sequential, so a container exists exactly
    /// when its region already holds an earlier block.
    fn attach_block(&self, inode: &mut Inode, logical: u64, ptr: u32) -> Result<()> {
        match classify(logical)? {
            ExtentSlot::Direct { index } => {
                inode.direct[index] = ptr;
                Ok(())
            }
            ExtentSlot::Indirect { index } => {
                if index == 0 {
                    inode.indirect = self.alloc_zeroed_block()?;
                }
                self.write_ptr(inode.indirect, index, ptr)
            }
            ExtentSlot::DoubleIndirect {
                which,
                outer,
                inner,
            } => {
                if outer == 0 && inner == 0 {
                    inode.dindirect[which] = self.alloc_zeroed_block()?;
                }
                if inner == 0 {
                    let mid = self.alloc_zeroed_block()?;
                    self.write_ptr(inode.dindirect[which], outer, mid)?;
                }
                let mid = self.read_ptr(inode.dindirect[which], outer)?;
                self.write_ptr(mid, inner, ptr)
            }
        }
    }

    /// Remove the pointer for logical block `logical`, freeing pointer
    /// blocks that become empty. Detachment runs from the tail of the
    /// file backwards, so a container empties exactly when its first
    /// entry is detached.
    fn detach_block(&self, inode: &mut Inode, logical: u64) -> Result<()> {
        match classify(logical)? {
            ExtentSlot::Direct { index } => {
                inode.direct[index] = 0;
                Ok(())
            }
            ExtentSlot::Indirect { index } => {
                self.write_ptr(inode.indirect, index, 0)?;
                if index == 0 {
                    self.free_data_block(inode.indirect)?;
                    inode.indirect = 0;
                }
                Ok(())
            }
            ExtentSlot::DoubleIndirect {
                which,
                outer,
                inner,
            } => {
                let mid = self.read_ptr(inode.dindirect[which], outer)?;
                self.write_ptr(mid, inner, 0)?;
                if inner == 0 {
                    self.free_data_block(mid)?;
                    self.write_ptr(inode.dindirect[which], outer, 0)?;
                    if outer == 0 {
                        self.free_data_block(inode.dindirect[which])?;
                        inode.dindirect[which] = 0;
                    }
                }
                Ok(())
            }
        }
    }

    /// Grow or shrink a file to exactly `target` bytes.
    ///
    /// Growing rounds up block by block, attaching freshly zeroed data
    /// blocks, then sets the exact byte size. Shrinking frees every data
    /// block past the new end, containers included. On an allocation
    /// failure mid-grow the size is set to the fully attached prefix, so
    /// the on-disk state stays consistent.
    pub(super) fn resize_inode(
        &self,
        inode_no: u16,
        inode: &mut Inode,
        target: u64,
    ) -> Result<()> {
        if target > u32::MAX as u64 || Inode::block_count(target) > inode::MAX_FILE_BLOCKS {
            return Err(KernelError::InvalidArgument);
        }

        let old_blocks = Inode::block_count(inode.size as u64);
        let new_blocks = Inode::block_count(target);

        if new_blocks > old_blocks {
            for logical in old_blocks..new_blocks {
                let attached = self
                    .alloc_zeroed_block()
                    .and_then(|ptr| self.attach_block(inode, logical, ptr));
                if let Err(e) = attached {
                    inode.size = (logical * BLOCK_SIZE as u64) as u32;
                    self.write_inode(inode_no, inode)?;
                    return Err(e);
                }
            }
        } else if new_blocks < old_blocks {
            for logical in (new_blocks..old_blocks).rev() {
                let ptr = self.lookup_block(inode, logical)?;
                self.free_data_block(ptr)?;
                self.detach_block(inode, logical)?;
            }
        }

        inode.size = target as u32;
        self.write_inode(inode_no, inode)
    }

    // Data-block bitmap.

    /// Claim the first free data block.
    fn alloc_data_block(&self) -> Result<u32> {
        for bitmap_block in 0..self.superblock.bitmap_blocks as u64 {
            let pos = (1 + bitmap_block) * BLOCK_SIZE as u64;
            let mut guard = self.cache.get(pos)?;
            for byte in 0..BLOCK_SIZE {
                if guard[byte] == 0xff {
                    continue;
                }
                for bit in 0..8 {
                    if guard[byte] & (1 << bit) == 0 {
                        guard[byte] |= 1 << bit;
                        guard.release(true)?;
                        let ptr =
                            bitmap_block * (BLOCK_SIZE as u64 * 8) + (byte * 8 + bit) as u64;
                        return Ok(ptr as u32);
                    }
                }
            }
            guard.release(false)?;
        }
        Err(KernelError::NoDataBlocks)
    }

    fn alloc_zeroed_block(&self) -> Result<u32> {
        let ptr = self.alloc_data_block()?;
        let mut guard = self.cache.get(self.block_pos(ptr))?;
        guard.fill(0);
        guard.release(true)?;
        Ok(ptr)
    }

    /// Clear a data block's bitmap bit.
    fn free_data_block(&self, ptr: u32) -> Result<()> {
        let bits_per_block = BLOCK_SIZE as u64 * 8;
        let bitmap_block = 1 + ptr as u64 / bits_per_block;
        let bit_index = (ptr as u64 % bits_per_block) as usize;

        let mut guard = self.cache.get(bitmap_block * BLOCK_SIZE as u64)?;
        guard[bit_index / 8] &= !(1 << (bit_index % 8));
        guard.release(true)
    }

    // Root directory.

    fn root(&self) -> Inode {
        self.meta.lock().root_inode
    }

    fn set_root(&self, root: Inode) -> Result<()> {
        self.meta.lock().root_inode = root;
        self.write_inode(self.superblock.root_inode, &root)
    }

    fn dir_entry_at(&self, root: &Inode, idx: u64) -> Result<DirEntry> {
        let ptr = self.lookup_block(root, idx / ENTRIES_PER_BLOCK as u64)?;
        let guard = self.cache.get(self.block_pos(ptr))?;
        let offset = (idx as usize % ENTRIES_PER_BLOCK) * DIRENT_SIZE;
        let entry = DirEntry::from_bytes(&guard[offset..offset + DIRENT_SIZE]);
        guard.release(false)?;
        Ok(entry)
    }

    fn write_dir_entry_at(&self, root: &Inode, idx: u64, entry: &DirEntry) -> Result<()> {
        let ptr = self.lookup_block(root, idx / ENTRIES_PER_BLOCK as u64)?;
        let mut guard = self.cache.get(self.block_pos(ptr))?;
        let offset = (idx as usize % ENTRIES_PER_BLOCK) * DIRENT_SIZE;
        entry.write_to(&mut guard[offset..offset + DIRENT_SIZE]);
        guard.release(true)
    }

    fn find_entry(&self, name: &str) -> Result<Option<(u64, DirEntry)>> {
        let root = self.root();
        let entry_count = root.size as u64 / DIRENT_SIZE as u64;
        for idx in 0..entry_count {
            let entry = self.dir_entry_at(&root, idx)?;
            if entry.matches(name) {
                return Ok(Some((idx, entry)));
            }
        }
        Ok(None)
    }
}

// Process-wide root volume.

static ROOT_FS: Mutex<Option<Arc<Filesystem>>> = Mutex::new(None);

/// Mount `io` as the root volume.
pub fn mount_root(io: IoRef) -> Result<()> {
    let fs = Filesystem::mount(io)?;
    *ROOT_FS.lock() = Some(fs);
    Ok(())
}

fn root_volume() -> Result<Arc<Filesystem>> {
    ROOT_FS.lock().clone().ok_or(KernelError::NoEntry)
}

/// Open a file on the root volume (syscall surface).
pub fn fs_open(name: &str) -> Result<IoRef> {
    root_volume()?.open(name)
}

pub fn fs_create(name: &str) -> Result<()> {
    root_volume()?.create(name)
}

pub fn fs_delete(name: &str) -> Result<()> {
    root_volume()?.delete(name)
}

pub fn fs_flush() -> Result<()> {
    root_volume()?.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::mem::MemIo;
    use crate::io::Control;

    const TEST_BITMAP_BLOCKS: u16 = 1;
    const TEST_INODE_BLOCKS: u16 = 6; // 96 inodes

    /// Build a fresh volume image: superblock + zeroed bitmap, inode,
    /// and data blocks.
    fn mkfs(total_blocks: usize) -> Arc<MemIo> {
        let mut image = vec![0u8; total_blocks * BLOCK_SIZE];
        Superblock {
            root_inode: 0,
            bitmap_blocks: TEST_BITMAP_BLOCKS,
            inode_blocks: TEST_INODE_BLOCKS,
        }
        .write_to(&mut image);
        MemIo::from_vec(image)
    }

    fn used_data_blocks(mem: &Arc<MemIo>) -> usize {
        let io = mem.open();
        let mut bitmap = [0u8; BLOCK_SIZE];
        io.read_at(BLOCK_SIZE as u64, &mut bitmap).unwrap();
        bitmap.iter().map(|b| b.count_ones() as usize).sum()
    }

    #[test]
    fn test_create_open_write_read_delete() {
        let mem = mkfs(64);
        let fs = Filesystem::mount(mem.open()).unwrap();

        fs.create("a").unwrap();
        let io = fs.open("a").unwrap();

        let payload = b"hello from disk\n\0";
        assert_eq!(io.write(payload).unwrap(), 17);
        drop(io);

        let io = fs.open("a").unwrap();
        assert_eq!(io.control(Control::GetEnd).unwrap(), 17);
        let mut buf = [0u8; 17];
        assert_eq!(io.read(&mut buf).unwrap(), 17);
        assert_eq!(&buf, payload);
        drop(io);

        fs.delete("a").unwrap();
        assert_eq!(fs.open("a").err(), Some(KernelError::NoEntry));

        // Recreating the name yields an empty file.
        fs.create("a").unwrap();
        let io = fs.open("a").unwrap();
        assert_eq!(io.control(Control::GetEnd).unwrap(), 0);
    }

    #[test]
    fn test_duplicate_create_and_double_open() {
        let mem = mkfs(64);
        let fs = Filesystem::mount(mem.open()).unwrap();

        fs.create("x").unwrap();
        assert_eq!(fs.create("x").err(), Some(KernelError::Busy));

        let _io = fs.open("x").unwrap();
        assert_eq!(fs.open("x").err(), Some(KernelError::Busy));
        drop(_io);
        // Closing makes the file openable again.
        let _io = fs.open("x").unwrap();
    }

    #[test]
    fn test_grow_through_double_indirect_and_shrink() {
        // 1.5 MB of data plus containers and directory: ~3000 blocks.
        let mem = mkfs(3100);
        let fs = Filesystem::mount(mem.open()).unwrap();

        fs.create("big").unwrap();
        let baseline = used_data_blocks(&mem);

        let io = fs.open("big").unwrap();
        io.control(Control::SetEnd(1_500_000)).unwrap();
        assert_eq!(io.control(Control::GetEnd).unwrap(), 1_500_000);

        // Grown region reads as zeros at both ends.
        let mut byte = [0xaau8; 1];
        assert_eq!(io.read_at(0, &mut byte).unwrap(), 1);
        assert_eq!(byte[0], 0);
        let mut byte = [0xaau8; 1];
        assert_eq!(io.read_at(1_499_999, &mut byte).unwrap(), 1);
        assert_eq!(byte[0], 0);

        // 1.5 MB spans 2930 blocks: past direct (4) and indirect (128),
        // so a double-indirect container must exist.
        let on_disk = fs.read_inode(fs.find_entry("big").unwrap().unwrap().1.inode).unwrap();
        assert!(on_disk.dindirect[0] != 0);
        assert_eq!(on_disk.size, 1_500_000);

        // Shrinking to zero returns every block to the bitmap.
        io.control(Control::SetEnd(0)).unwrap();
        assert_eq!(io.control(Control::GetEnd).unwrap(), 0);
        assert_eq!(used_data_blocks(&mem), baseline);

        let on_disk = fs.read_inode(fs.find_entry("big").unwrap().unwrap().1.inode).unwrap();
        assert_eq!(on_disk.indirect, 0);
        assert_eq!(on_disk.dindirect, [0, 0]);
    }

    #[test]
    fn test_write_read_across_block_boundaries() {
        let mem = mkfs(128);
        let fs = Filesystem::mount(mem.open()).unwrap();

        fs.create("span").unwrap();
        let io = fs.open("span").unwrap();

        let data: Vec<u8> = (0..2000u32).map(|i| (i * 7 % 256) as u8).collect();
        assert_eq!(io.write(&data).unwrap(), 2000);

        // Unaligned positional read crossing two block boundaries.
        let mut buf = vec![0u8; 1000];
        assert_eq!(io.read_at(300, &mut buf).unwrap(), 1000);
        assert_eq!(&buf[..], &data[300..1300]);

        // Positional write inside the file, then read it back.
        io.write_at(700, b"MARKER").unwrap();
        let mut buf = [0u8; 6];
        io.read_at(700, &mut buf).unwrap();
        assert_eq!(&buf, b"MARKER");
    }

    #[test]
    fn test_reads_clamp_to_file_size() {
        let mem = mkfs(64);
        let fs = Filesystem::mount(mem.open()).unwrap();
        fs.create("short").unwrap();
        let io = fs.open("short").unwrap();
        io.write(b"0123456789").unwrap();

        let mut buf = [0u8; 64];
        assert_eq!(io.read_at(5, &mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"56789");
        assert_eq!(io.read_at(10, &mut buf).unwrap(), 0);
        assert_eq!(
            io.read_at(11, &mut buf).err(),
            Some(KernelError::InvalidArgument)
        );
    }

    #[test]
    fn test_swap_delete_keeps_remaining_entries() {
        let mem = mkfs(64);
        let fs = Filesystem::mount(mem.open()).unwrap();
        for name in ["a", "b", "c"] {
            fs.create(name).unwrap();
        }

        fs.delete("a").unwrap();
        assert!(fs.find_entry("a").unwrap().is_none());
        assert!(fs.find_entry("b").unwrap().is_some());
        assert!(fs.find_entry("c").unwrap().is_some());
        // The last entry was swapped into the vacated slot.
        assert_eq!(fs.root().size as usize, 2 * DIRENT_SIZE);
        assert!(fs.find_entry("c").unwrap().unwrap().0 == 0);
    }

    #[test]
    fn test_file_cap_and_inode_reuse() {
        let mem = mkfs(256);
        let fs = Filesystem::mount(mem.open()).unwrap();

        let mut names = Vec::new();
        for i in 0..MAX_FILES {
            let name = alloc::format!("f{}", i);
            fs.create(&name).unwrap();
            names.push(name);
        }
        assert_eq!(fs.create("straw").err(), Some(KernelError::TooManyFiles));

        // Deleting one frees its slot and inode for reuse.
        fs.delete("f7").unwrap();
        fs.create("again").unwrap();
    }

    #[test]
    fn test_remount_preserves_volume_state() {
        let mem = mkfs(128);
        {
            let fs = Filesystem::mount(mem.open()).unwrap();
            fs.create("keep").unwrap();
            let io = fs.open("keep").unwrap();
            io.write(b"persistent data").unwrap();
            drop(io);
            fs.flush().unwrap();
        }

        // Remount the same backing store from scratch.
        let fs = Filesystem::mount(mem.open()).unwrap();
        let (_, entry) = fs.find_entry("keep").unwrap().unwrap();
        {
            let meta = fs.meta.lock();
            assert!(meta.inode_used[entry.inode as usize]);
            assert!(meta.inode_used[0], "root inode marked used");
            assert_eq!(meta.inode_used.iter().filter(|&&u| u).count(), 2);
        }

        let io = fs.open("keep").unwrap();
        let mut buf = [0u8; 15];
        assert_eq!(io.read(&mut buf).unwrap(), 15);
        assert_eq!(&buf, b"persistent data");
    }

    #[test]
    fn test_delete_closes_open_file() {
        let mem = mkfs(64);
        let fs = Filesystem::mount(mem.open()).unwrap();
        fs.create("doomed").unwrap();
        let io = fs.open("doomed").unwrap();
        io.write(b"going away soon").unwrap();

        fs.delete("doomed").unwrap();
        // The surviving endpoint is dead.
        let mut buf = [0u8; 4];
        assert_eq!(io.read_at(0, &mut buf).err(), Some(KernelError::Io));
    }
}
