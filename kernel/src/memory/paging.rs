//! Sv39 page-table manager
//!
//! Maintains the three-level table of the *active* address space, which is
//! always read from satp. The kernel identity mapping is installed once at
//! boot with the global bit set, so it survives per-process resets; user
//! mappings are non-global and demand-paged.
//!
//! Structural rules: every valid interior entry points at a zeroed
//! subtable page; a subtable is freed only once it holds no valid entries;
//! the paging barrier is issued after every structural change.

use bitflags::bitflags;

use super::{frame_allocator, round_down, round_up, PAGE_SIZE};
use crate::arch;
use crate::error::{KernelError, Result};

const PTE_COUNT: usize = 512;
const PPN_SHIFT: u64 = 10;
const SATP_MODE_SV39: u64 = 8 << 60;

bitflags! {
    /// Low flag bits of an Sv39 PTE.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u64 {
        const VALID    = 1 << 0;
        const READ     = 1 << 1;
        const WRITE    = 1 << 2;
        const EXEC     = 1 << 3;
        const USER     = 1 << 4;
        const GLOBAL   = 1 << 5;
        const ACCESSED = 1 << 6;
        const DIRTY    = 1 << 7;
    }
}

impl PteFlags {
    pub const RW: PteFlags = PteFlags::READ.union(PteFlags::WRITE);
    pub const RWU: PteFlags = PteFlags::RW.union(PteFlags::USER);

    fn is_leaf(self) -> bool {
        self.intersects(PteFlags::READ | PteFlags::WRITE | PteFlags::EXEC)
    }
}

/// One Sv39 page-table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Pte(u64);

impl Pte {
    pub const INVALID: Pte = Pte(0);

    /// Leaf entry mapping `pa` with the given permission bits. A and D are
    /// pre-set so the hardware never faults to update them.
    pub fn leaf(pa: usize, flags: PteFlags) -> Pte {
        debug_assert!(flags.is_leaf());
        let bits = ((pa as u64 >> 12) << PPN_SHIFT)
            | (flags | PteFlags::VALID | PteFlags::ACCESSED | PteFlags::DIRTY).bits();
        Pte(bits)
    }

    /// Interior entry pointing at the subtable page `pa`.
    pub fn table(pa: usize, global: bool) -> Pte {
        let mut flags = PteFlags::VALID;
        if global {
            flags |= PteFlags::GLOBAL;
        }
        Pte(((pa as u64 >> 12) << PPN_SHIFT) | flags.bits())
    }

    pub fn is_valid(self) -> bool {
        self.flags().contains(PteFlags::VALID)
    }

    pub fn is_global(self) -> bool {
        self.flags().contains(PteFlags::GLOBAL)
    }

    /// Leaf entries carry at least one permission bit; interior entries
    /// carry none.
    pub fn is_leaf(self) -> bool {
        self.flags().is_leaf()
    }

    pub fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    /// Physical address of the mapped page or subtable.
    pub fn pa(self) -> usize {
        (((self.0 >> PPN_SHIFT) & ((1 << 44) - 1)) << 12) as usize
    }

    /// Replace the R/W/X/U/G permission bits, keeping the mapping.
    pub fn with_permissions(self, flags: PteFlags) -> Pte {
        let perm_mask = (PteFlags::READ
            | PteFlags::WRITE
            | PteFlags::EXEC
            | PteFlags::USER
            | PteFlags::GLOBAL)
            .bits();
        Pte((self.0 & !perm_mask) | (flags.bits() & perm_mask))
    }
}

/// Opaque handle for an address space: paging mode, ASID, and the root
/// table frame, in satp layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemTag(u64);

impl MemTag {
    pub fn from_root(root_pa: usize, asid: u16) -> MemTag {
        MemTag(SATP_MODE_SV39 | ((asid as u64) << 44) | (root_pa as u64 >> 12))
    }

    pub fn bits(self) -> u64 {
        self.0
    }

    fn root_pa(self) -> usize {
        ((self.0 & ((1 << 44) - 1)) << 12) as usize
    }
}

#[inline]
fn vpn(level: usize, vma: usize) -> usize {
    (vma >> (12 + 9 * level)) & (PTE_COUNT - 1)
}

/// Sv39 addresses must sign-extend bit 38.
#[inline]
fn wellformed(vma: usize) -> bool {
    let bits = (vma as i64) >> 38;
    bits == 0 || bits == -1
}

/// The kernel runs on an identity mapping, so a physical table address is
/// also its virtual address.
unsafe fn table_at<'a>(pa: usize) -> &'a mut [Pte; PTE_COUNT] {
    &mut *(pa as *mut [Pte; PTE_COUNT])
}

fn alloc_table() -> Result<usize> {
    let page = frame_allocator::alloc_page().ok_or(KernelError::NoMemory)?;
    unsafe { core::ptr::write_bytes(page, 0, PAGE_SIZE) };
    Ok(page as usize)
}

fn table_empty(table: &[Pte; PTE_COUNT]) -> bool {
    table.iter().all(|pte| !pte.is_valid())
}

static MAIN_TAG: spin::Once<MemTag> = spin::Once::new();

/// The process-wide kernel identity space.
pub fn main_space() -> MemTag {
    *MAIN_TAG.get().expect("paging not initialized")
}

/// Tag of the space the hart is running on.
pub fn active_space() -> MemTag {
    MemTag(arch::read_satp())
}

/// Switch spaces; returns the previous tag.
pub fn switch_space(tag: MemTag) -> MemTag {
    let prev = arch::swap_satp(tag.bits());
    arch::sfence_vma();
    MemTag(prev)
}

fn active_root<'a>() -> &'a mut [Pte; PTE_COUNT] {
    unsafe { table_at(active_space().root_pa()) }
}

/// Install a leaf at `vma` -> `pa` in the active space, allocating any
/// missing interior tables. A pre-existing valid leaf is left untouched.
pub fn map_page(vma: usize, pa: usize, flags: PteFlags) -> Result<usize> {
    if !wellformed(vma) {
        return Err(KernelError::InvalidArgument);
    }
    let vma = round_down(vma, PAGE_SIZE);

    let root = active_root();
    let l1 = descend_or_alloc(root, vpn(2, vma))?;
    let l0 = descend_or_alloc(l1, vpn(1, vma))?;

    let slot = &mut l0[vpn(0, vma)];
    if !slot.is_valid() {
        *slot = Pte::leaf(pa, flags);
    }
    arch::sfence_vma();
    Ok(vma)
}

fn descend_or_alloc(
    table: &mut [Pte; PTE_COUNT],
    index: usize,
) -> Result<&'static mut [Pte; PTE_COUNT]> {
    let entry = table[index];
    let pa = if entry.is_valid() {
        entry.pa()
    } else {
        let pa = alloc_table()?;
        table[index] = Pte::table(pa, false);
        pa
    };
    Ok(unsafe { table_at(pa) })
}

/// Map `size` bytes of physically contiguous memory starting at `pa`.
pub fn map_range(vma: usize, size: usize, pa: usize, flags: PteFlags) -> Result<usize> {
    let vma = round_down(vma, PAGE_SIZE);
    let size = round_up(size, PAGE_SIZE);
    let mut offset = 0;
    while offset < size {
        map_page(vma + offset, pa + offset, flags)?;
        offset += PAGE_SIZE;
    }
    Ok(vma)
}

/// Allocate a fresh zeroed frame for every page of the range and map it.
///
/// On any failure the pages mapped so far are unmapped and freed before
/// the error is returned, so a failed call leaves the space unchanged.
pub fn alloc_and_map_range(vma: usize, size: usize, flags: PteFlags) -> Result<usize> {
    let vma = round_down(vma, PAGE_SIZE);
    let size = round_up(size, PAGE_SIZE);
    let mut offset = 0;
    while offset < size {
        let page = match frame_allocator::alloc_page() {
            Some(p) => p,
            None => {
                unmap_and_free_range(vma, offset);
                return Err(KernelError::NoMemory);
            }
        };
        unsafe { core::ptr::write_bytes(page, 0, PAGE_SIZE) };
        if let Err(e) = map_page(vma + offset, page as usize, flags) {
            frame_allocator::free_page(page);
            unmap_and_free_range(vma, offset);
            return Err(e);
        }
        offset += PAGE_SIZE;
    }
    Ok(vma)
}

/// Rewrite the permission bits of every mapped leaf in the range.
pub fn set_range_flags(vma: usize, size: usize, flags: PteFlags) {
    let vma = round_down(vma, PAGE_SIZE);
    let size = round_up(size, PAGE_SIZE);
    let mut offset = 0;
    while offset < size {
        if let Some(slot) = find_leaf_slot(vma + offset) {
            if slot.is_valid() {
                *slot = slot.with_permissions(flags);
            }
        }
        offset += PAGE_SIZE;
    }
    arch::sfence_vma();
}

/// Level-0 slot for `vma`, if the interior tables exist.
fn find_leaf_slot<'a>(vma: usize) -> Option<&'a mut Pte> {
    if !wellformed(vma) {
        return None;
    }
    let root = active_root();
    let l2e = root[vpn(2, vma)];
    if !l2e.is_valid() || l2e.is_leaf() {
        return None;
    }
    let l1 = unsafe { table_at(l2e.pa()) };
    let l1e = l1[vpn(1, vma)];
    if !l1e.is_valid() || l1e.is_leaf() {
        return None;
    }
    let l0 = unsafe { table_at(l1e.pa()) };
    Some(&mut l0[vpn(0, vma)])
}

/// Remove every leaf in the range, free its frame, and free interior
/// tables as they empty, cascading one level at a time up to the root.
pub fn unmap_and_free_range(vma: usize, size: usize) {
    if vma % PAGE_SIZE != 0 {
        return;
    }
    let size = round_up(size, PAGE_SIZE);
    let mut offset = 0;
    while offset < size {
        unmap_one(vma + offset);
        offset += PAGE_SIZE;
    }
}

fn unmap_one(vma: usize) {
    if !wellformed(vma) {
        return;
    }
    let root = active_root();
    let l2_index = vpn(2, vma);
    let l2e = root[l2_index];
    if !l2e.is_valid() || l2e.is_leaf() {
        return;
    }
    let l1 = unsafe { table_at(l2e.pa()) };
    let l1_index = vpn(1, vma);
    let l1e = l1[l1_index];
    if !l1e.is_valid() || l1e.is_leaf() {
        return;
    }
    let l0 = unsafe { table_at(l1e.pa()) };
    let l0_index = vpn(0, vma);
    let leaf = l0[l0_index];
    if !leaf.is_valid() || !leaf.is_leaf() {
        return;
    }

    frame_allocator::free_page(leaf.pa() as *mut u8);
    l0[l0_index] = Pte::INVALID;
    arch::sfence_vma();

    if table_empty(l0) {
        frame_allocator::free_page(l1e.pa() as *mut u8);
        l1[l1_index] = Pte::INVALID;
        arch::sfence_vma();

        if table_empty(l1) {
            frame_allocator::free_page(l2e.pa() as *mut u8);
            root[l2_index] = Pte::INVALID;
            arch::sfence_vma();
        }
    }
}

/// Deep-copy every non-global mapping of the active space into a new one.
///
/// Global entries are shared by reference (they are the kernel identity
/// map); everything else gets fresh subtables and fresh data pages with
/// the leaf contents and permissions copied.
pub fn clone_active_space() -> Result<MemTag> {
    let root_pa = alloc_table()?;
    let new_tag = MemTag::from_root(root_pa, 0);
    let new_root = unsafe { table_at(root_pa) };
    let root = active_root();

    let result = (|| -> Result<()> {
        for i in 0..PTE_COUNT {
            let l2e = root[i];
            if !l2e.is_valid() {
                continue;
            }
            if l2e.is_global() {
                new_root[i] = l2e;
                continue;
            }
            let l1_pa = alloc_table()?;
            new_root[i] = Pte::table(l1_pa, false);
            let l1 = unsafe { table_at(l2e.pa()) };
            let new_l1 = unsafe { table_at(l1_pa) };

            for j in 0..PTE_COUNT {
                let l1e = l1[j];
                if !l1e.is_valid() {
                    continue;
                }
                let l0_pa = alloc_table()?;
                new_l1[j] = Pte::table(l0_pa, false);
                let l0 = unsafe { table_at(l1e.pa()) };
                let new_l0 = unsafe { table_at(l0_pa) };

                for k in 0..PTE_COUNT {
                    let leaf = l0[k];
                    if !leaf.is_valid() {
                        continue;
                    }
                    let page =
                        frame_allocator::alloc_page().ok_or(KernelError::NoMemory)?;
                    unsafe {
                        core::ptr::copy_nonoverlapping(
                            leaf.pa() as *const u8,
                            page,
                            PAGE_SIZE,
                        );
                    }
                    new_l0[k] = Pte::leaf(page as usize, leaf.flags());
                }
            }
        }
        Ok(())
    })();

    match result {
        Ok(()) => Ok(new_tag),
        Err(e) => {
            destroy_space(new_tag);
            Err(e)
        }
    }
}

/// Free every non-global leaf frame and emptied subtable of the active
/// space. Global entries and the root table itself are untouched.
pub fn reset_active_space() {
    let root = active_root();
    for i in 0..PTE_COUNT {
        let l2e = root[i];
        if !l2e.is_valid() || l2e.is_global() || l2e.is_leaf() {
            continue;
        }
        let l1 = unsafe { table_at(l2e.pa()) };
        for j in 0..PTE_COUNT {
            let l1e = l1[j];
            if !l1e.is_valid() || l1e.is_global() || l1e.is_leaf() {
                continue;
            }
            let l0 = unsafe { table_at(l1e.pa()) };
            for k in 0..PTE_COUNT {
                let leaf = l0[k];
                if !leaf.is_valid() || leaf.is_global() {
                    continue;
                }
                frame_allocator::free_page(leaf.pa() as *mut u8);
                l0[k] = Pte::INVALID;
            }
            if table_empty(l0) {
                frame_allocator::free_page(l1e.pa() as *mut u8);
                l1[j] = Pte::INVALID;
            }
        }
        if table_empty(l1) {
            frame_allocator::free_page(l2e.pa() as *mut u8);
            root[i] = Pte::INVALID;
        }
    }
    arch::sfence_vma();
}

/// Reset the active space, switch back to the kernel identity space, and
/// free the abandoned root table if it is not the main one.
pub fn discard_active_space() -> MemTag {
    let main = main_space();
    let old = active_space();
    reset_active_space();
    switch_space(main);
    if old != main {
        frame_allocator::free_page(old.root_pa() as *mut u8);
    }
    main
}

/// Tear down a space that is not active (used to unwind a failed clone
/// or a fork whose thread never started).
pub(crate) fn destroy_space(tag: MemTag) {
    let root = unsafe { table_at(tag.root_pa()) };
    for i in 0..PTE_COUNT {
        let l2e = root[i];
        if !l2e.is_valid() || l2e.is_global() || l2e.is_leaf() {
            continue;
        }
        let l1 = unsafe { table_at(l2e.pa()) };
        for j in 0..PTE_COUNT {
            let l1e = l1[j];
            if !l1e.is_valid() || l1e.is_leaf() {
                continue;
            }
            let l0 = unsafe { table_at(l1e.pa()) };
            for k in 0..PTE_COUNT {
                let leaf = l0[k];
                if leaf.is_valid() {
                    frame_allocator::free_page(leaf.pa() as *mut u8);
                }
            }
            frame_allocator::free_page(l1e.pa() as *mut u8);
        }
        frame_allocator::free_page(l2e.pa() as *mut u8);
    }
    frame_allocator::free_page(tag.root_pa() as *mut u8);
}

/// Resolve a U-mode load/store fault at `vma`.
///
/// Faults inside the user range get a fresh zeroed frame mapped R/W/U and
/// the instruction retries; anything else is fatal for the process.
pub fn handle_user_page_fault(vma: usize) -> Result<()> {
    if !(super::USER_START_VMA..super::USER_END_VMA).contains(&vma) {
        return Err(KernelError::AccessDenied);
    }
    let page = frame_allocator::alloc_page().ok_or(KernelError::NoMemory)?;
    unsafe { core::ptr::write_bytes(page, 0, PAGE_SIZE) };
    if let Err(e) = map_page(vma, page as usize, PteFlags::RWU) {
        frame_allocator::free_page(page);
        return Err(e);
    }
    Ok(())
}

// Boot-time construction of the kernel identity space. The three static
// tables cover: [root] -> two MMIO gigapage leaves plus [l1 for RAM] ->
// one finely-mapped first megapage [l0] plus RW megapage leaves for the
// rest of RAM.

#[cfg(target_arch = "riscv64")]
#[repr(C, align(4096))]
struct BootTable([Pte; PTE_COUNT]);

#[cfg(target_arch = "riscv64")]
static mut MAIN_ROOT: BootTable = BootTable([Pte::INVALID; PTE_COUNT]);
#[cfg(target_arch = "riscv64")]
static mut MAIN_L1_RAM: BootTable = BootTable([Pte::INVALID; PTE_COUNT]);
#[cfg(target_arch = "riscv64")]
static mut MAIN_L0_RAM: BootTable = BootTable([Pte::INVALID; PTE_COUNT]);

#[cfg(target_arch = "riscv64")]
pub fn init_kernel_space(
    text_start: usize,
    text_end: usize,
    rodata_start: usize,
    rodata_end: usize,
    data_start: usize,
) {
    use super::{GIGA_SIZE, KERNEL_BASE, MEGA_SIZE, RAM_END, RAM_START};
    use core::ptr::addr_of_mut;

    let root = unsafe { &mut (*addr_of_mut!(MAIN_ROOT)).0 };
    let l1 = unsafe { &mut (*addr_of_mut!(MAIN_L1_RAM)).0 };
    let l0 = unsafe { &mut (*addr_of_mut!(MAIN_L0_RAM)).0 };

    // MMIO region below RAM: identity RW global gigapages.
    let mut pa = 0;
    while pa < RAM_START {
        root[vpn(2, pa)] = Pte::leaf(pa, PteFlags::RW | PteFlags::GLOBAL);
        pa += GIGA_SIZE;
    }

    // RAM gigarange descends into the level-1 table; the kernel
    // megapage descends once more for per-page section permissions.
    root[vpn(2, RAM_START)] = Pte::table(l1 as *const _ as usize, true);
    l1[vpn(1, KERNEL_BASE)] = Pte::table(l0 as *const _ as usize, true);

    // The megapage below the image belongs to the SBI firmware; mapped
    // but never touched.
    l1[vpn(1, RAM_START)] = Pte::leaf(RAM_START, PteFlags::RW | PteFlags::GLOBAL);

    // Kernel megapage: exact per-section permissions, RW for everything
    // after the image (heap and the start of the page pool).
    let mut pa = text_start;
    while pa < text_end {
        l0[vpn(0, pa)] =
            Pte::leaf(pa, PteFlags::READ | PteFlags::EXEC | PteFlags::GLOBAL);
        pa += PAGE_SIZE;
    }
    let mut pa = rodata_start;
    while pa < rodata_end {
        l0[vpn(0, pa)] = Pte::leaf(pa, PteFlags::READ | PteFlags::GLOBAL);
        pa += PAGE_SIZE;
    }
    let mut pa = data_start;
    while pa < KERNEL_BASE + MEGA_SIZE {
        l0[vpn(0, pa)] = Pte::leaf(pa, PteFlags::RW | PteFlags::GLOBAL);
        pa += PAGE_SIZE;
    }

    // Remaining RAM: RW global megapages.
    let mut pa = KERNEL_BASE + MEGA_SIZE;
    while pa < RAM_END {
        l1[vpn(1, pa)] = Pte::leaf(pa, PteFlags::RW | PteFlags::GLOBAL);
        pa += MEGA_SIZE;
    }

    let tag = MemTag::from_root(root as *const _ as usize, 0);
    MAIN_TAG.call_once(|| tag);
    arch::swap_satp(tag.bits());
    arch::sfence_vma();
}

#[cfg(not(target_arch = "riscv64"))]
pub fn init_kernel_space(
    _text_start: usize,
    _text_end: usize,
    _rodata_start: usize,
    _rodata_end: usize,
    _data_start: usize,
) {
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leaf_pte_roundtrip() {
        let pte = Pte::leaf(0x8020_3000, PteFlags::RWU);
        assert!(pte.is_valid());
        assert!(pte.is_leaf());
        assert!(!pte.is_global());
        assert_eq!(pte.pa(), 0x8020_3000);
        assert!(pte.flags().contains(PteFlags::READ | PteFlags::WRITE | PteFlags::USER));
        // A/D pre-set on leaves.
        assert!(pte.flags().contains(PteFlags::ACCESSED | PteFlags::DIRTY));
    }

    #[test]
    fn test_table_pte_is_interior() {
        let pte = Pte::table(0x8040_0000, true);
        assert!(pte.is_valid());
        assert!(!pte.is_leaf());
        assert!(pte.is_global());
        assert_eq!(pte.pa(), 0x8040_0000);
    }

    #[test]
    fn test_permission_rewrite_keeps_mapping() {
        let pte = Pte::leaf(0xC000_0000, PteFlags::RWU);
        let ro = pte.with_permissions(PteFlags::READ | PteFlags::USER);
        assert_eq!(ro.pa(), 0xC000_0000);
        assert!(ro.flags().contains(PteFlags::READ | PteFlags::USER));
        assert!(!ro.flags().contains(PteFlags::WRITE));
        assert!(ro.is_valid());
    }

    #[test]
    fn test_vpn_extraction() {
        // 0xC000_0000 = VPN2 3, VPN1 0, VPN0 0.
        assert_eq!(vpn(2, 0xC000_0000), 3);
        assert_eq!(vpn(1, 0xC000_0000), 0);
        assert_eq!(vpn(0, 0xC000_0000), 0);
        assert_eq!(vpn(0, 0xC000_0000 + 5 * PAGE_SIZE), 5);
    }

    #[test]
    fn test_wellformed_sign_extension() {
        assert!(wellformed(0));
        assert!(wellformed(0x3F_FFFF_F000));
        assert!(wellformed(0xFFFF_FFC0_0000_0000));
        assert!(!wellformed(0x40_0000_0000));
        assert!(!wellformed(0x8000_0000_0000_0000));
    }

    #[test]
    fn test_memtag_roundtrip() {
        let tag = MemTag::from_root(0x8030_0000, 0);
        assert_eq!(tag.root_pa(), 0x8030_0000);
        assert_eq!(tag.bits() >> 60, 8); // Sv39
    }
}
