//! Construction of the kernel page table: an identity mapping of every
//! region of the physical memory map, using the largest leaf size whose
//! alignment and size constraints are met so the table stays small.
//!
//! The pages of the table itself come from a monotonic bump allocator over a
//! fixed scratch window; they are never returned.

use amd64::paging::{Flags, PageTable, PageTableEntry};
use amd64::{PhysAddr, VirtAddr};

use crate::paging::{index_at_level, DirectMapping, Pagetable};
use crate::pmap::{MemoryType, Pmap, Region};
use crate::{PAGE_SIZE, PAGE_SIZE_HUGE, PAGE_SIZE_LARGE};

/// Flags for large and huge leaf entries in PDT and PDPT tables.
fn pd_flags(kind: MemoryType) -> Flags {
    match kind {
        MemoryType::AcpiNvs | MemoryType::Uncached => {
            Flags::PRESENT
                | Flags::GLOBAL
                | Flags::SYSTEM
                | Flags::WRITABLE
                | Flags::SIZE
                | Flags::PWT
                | Flags::PCD
        }

        MemoryType::Bad | MemoryType::Unmapped => Flags::empty(),

        MemoryType::Usable | MemoryType::Reserved | MemoryType::Acpi => {
            Flags::PRESENT | Flags::GLOBAL | Flags::SYSTEM | Flags::WRITABLE | Flags::SIZE
        }
    }
}

/// Flags for 4 KiB leaf entries in PT tables.
fn pt_flags(kind: MemoryType) -> Flags {
    match kind {
        MemoryType::AcpiNvs | MemoryType::Uncached => {
            Flags::PRESENT | Flags::GLOBAL | Flags::SYSTEM | Flags::WRITABLE | Flags::PWT | Flags::PCD
        }

        MemoryType::Bad | MemoryType::Unmapped => Flags::empty(),

        MemoryType::Usable | MemoryType::Reserved | MemoryType::Acpi => {
            Flags::PRESENT | Flags::GLOBAL | Flags::SYSTEM | Flags::WRITABLE
        }
    }
}

/// View the table page at `paddr` through the direct mapping.
unsafe fn table<'a>(mapping: &DirectMapping, paddr: PhysAddr) -> &'a mut PageTable {
    &mut *mapping.phys_to_virt(paddr).as_mut_ptr()
}

/// Claim the next page of the scratch window and return the entry value
/// under which it is installed in its parent. The whole window was zeroed up
/// front, so the page needs no further initialization.
fn alloc_page(pt: &mut Pagetable) -> PageTableEntry {
    if pt.vnext >= pt.vterm {
        panic!("kernel page table scratch exhausted");
    }

    let vaddr = pt.vnext;
    pt.vnext += PAGE_SIZE;
    // the scratch window is identity mapped, its virtual addresses are its
    // physical addresses
    PageTableEntry::new(
        PhysAddr(vaddr.0),
        Flags::SYSTEM | Flags::PRESENT | Flags::WRITABLE,
    )
}

/// Create a 1 GiB leaf for `addr` in the kernel page table.
fn create_huge_page(pt: &mut Pagetable, mapping: &DirectMapping, addr: u64, kind: MemoryType) {
    let vaddr = VirtAddr(addr);

    let pml4t = unsafe { table(mapping, pt.proot) };
    let pml4e = index_at_level(4, vaddr);
    if pml4t[pml4e].is_zero() {
        pml4t[pml4e] = alloc_page(pt);
    }

    let pdpt = unsafe { table(mapping, pml4t[pml4e].base()) };
    pdpt[index_at_level(3, vaddr)] = PageTableEntry::new(PhysAddr(addr), pd_flags(kind));
}

/// Create a 2 MiB leaf for `addr` in the kernel page table.
fn create_large_page(pt: &mut Pagetable, mapping: &DirectMapping, addr: u64, kind: MemoryType) {
    let vaddr = VirtAddr(addr);

    let pml4t = unsafe { table(mapping, pt.proot) };
    let pml4e = index_at_level(4, vaddr);
    if pml4t[pml4e].is_zero() {
        pml4t[pml4e] = alloc_page(pt);
    }

    let pdpt = unsafe { table(mapping, pml4t[pml4e].base()) };
    let pdpte = index_at_level(3, vaddr);
    if pdpt[pdpte].is_zero() {
        pdpt[pdpte] = alloc_page(pt);
    }

    let pdt = unsafe { table(mapping, pdpt[pdpte].base()) };
    pdt[index_at_level(2, vaddr)] = PageTableEntry::new(PhysAddr(addr), pd_flags(kind));
}

/// Create a 4 KiB leaf for `addr` in the kernel page table.
fn create_small_page(pt: &mut Pagetable, mapping: &DirectMapping, addr: u64, kind: MemoryType) {
    let vaddr = VirtAddr(addr);

    let pml4t = unsafe { table(mapping, pt.proot) };
    let pml4e = index_at_level(4, vaddr);
    if pml4t[pml4e].is_zero() {
        pml4t[pml4e] = alloc_page(pt);
    }

    let pdpt = unsafe { table(mapping, pml4t[pml4e].base()) };
    let pdpte = index_at_level(3, vaddr);
    if pdpt[pdpte].is_zero() {
        pdpt[pdpte] = alloc_page(pt);
    }

    let pdt = unsafe { table(mapping, pdpt[pdpte].base()) };
    let pde = index_at_level(2, vaddr);
    if pdt[pde].is_zero() {
        pdt[pde] = alloc_page(pt);
    }

    let ptt = unsafe { table(mapping, pdt[pde].base()) };
    ptt[index_at_level(1, vaddr)] = PageTableEntry::new(PhysAddr(addr), pt_flags(kind));
}

/// Identity map one region, walking it with the largest leaves that fit.
fn map_region(pt: &mut Pagetable, mapping: &DirectMapping, map: &Pmap, region: &Region) {
    // bad and unmapped memory stays unmapped
    if region.kind == MemoryType::Unmapped || region.kind == MemoryType::Bad {
        return;
    }

    // reserved space beyond the last usable byte holds nothing reachable
    if region.kind == MemoryType::Reserved && region.addr >= map.last_usable() {
        return;
    }

    let mut addr = region.addr;
    let term = region.end();

    while addr < term {
        let remain = term - addr;

        if addr & (PAGE_SIZE_HUGE - 1) == 0 && remain >= PAGE_SIZE_HUGE {
            create_huge_page(pt, mapping, addr, region.kind);
            addr += PAGE_SIZE_HUGE;
        } else if addr & (PAGE_SIZE_LARGE - 1) == 0 && remain >= PAGE_SIZE_LARGE {
            create_large_page(pt, mapping, addr, region.kind);
            addr += PAGE_SIZE_LARGE;
        } else {
            create_small_page(pt, mapping, addr, region.kind);
            addr += PAGE_SIZE;
        }
    }
}

/// Build the kernel page table over the scratch window `[root, root + size)`
/// and return its handle. Every region of the memory map ends up identity
/// mapped with cacheability flags matching its type.
pub fn kernel_table(map: &Pmap, mapping: &DirectMapping, root: PhysAddr, size: u64) -> Pagetable {
    // the whole scratch window starts out zeroed
    unsafe {
        let window: *mut u8 = mapping.phys_to_virt(root).as_mut_ptr();
        core::ptr::write_bytes(window, 0, size as usize);
    }

    let mut pt = Pagetable {
        proot: root,
        vroot: VirtAddr(root.0),
        vnext: VirtAddr(root.0) + PAGE_SIZE,
        vterm: VirtAddr(root.0) + size,
    };

    for region in map.regions() {
        map_region(&mut pt, mapping, map, region);
    }

    debug!(
        "[kmem] kernel table built, {} scratch pages used",
        (pt.vnext - pt.vroot) / PAGE_SIZE
    );

    pt
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testutil::{Arena, Env, ARENA_SIZE, SCRATCH_BASE, SCRATCH_SIZE};

    /// Walk the table like the MMU would and return (paddr, leaf level,
    /// flags) for a virtual address.
    fn walk(
        mapping: &DirectMapping,
        pt: &Pagetable,
        vaddr: VirtAddr,
    ) -> Option<(PhysAddr, u32, Flags)> {
        let mut tbl = pt.proot;
        let mut level = 4;
        loop {
            let entry = unsafe {
                (*mapping.phys_to_virt(tbl).as_ptr::<PageTable>()).entries
                    [index_at_level(level, vaddr)]
            };
            if !entry.flags().contains(Flags::PRESENT) {
                return None;
            }
            if level == 1 || entry.flags().contains(Flags::SIZE) {
                let mask = (1_u64 << (12 + 9 * (level - 1))) - 1;
                return Some((
                    PhysAddr((entry.base().0 & !mask) + (vaddr.0 & mask)),
                    level,
                    entry.flags(),
                ));
            }
            tbl = entry.base();
            level -= 1;
        }
    }

    #[test]
    fn every_usable_byte_is_identity_mapped() {
        let env = Env::new();

        for region in env.map.regions() {
            if region.kind != MemoryType::Usable {
                continue;
            }
            let mut addr = region.addr;
            while addr < region.end() {
                let (paddr, _, flags) = walk(env.paging.mapping(), &env.kpt, VirtAddr(addr))
                    .expect("usable byte unmapped");
                assert_eq!(paddr.0, addr, "mapping must be the identity");
                assert!(flags
                    .contains(Flags::PRESENT | Flags::WRITABLE | Flags::GLOBAL | Flags::SYSTEM));
                assert!(!flags.contains(Flags::PCD));
                addr += PAGE_SIZE;
            }
        }
    }

    #[test]
    fn leaf_sizes_match_alignment() {
        let env = Env::new();

        // the first 2 MiB are chopped into 4 KiB pages by the small regions
        let (_, level, _) = walk(env.paging.mapping(), &env.kpt, VirtAddr(0x1000)).unwrap();
        assert_eq!(level, 1);

        // the aligned tail of the usable memory uses 2 MiB leaves
        let (paddr, level, _) =
            walk(env.paging.mapping(), &env.kpt, VirtAddr(0x40_1000)).unwrap();
        assert_eq!(level, 2);
        assert_eq!(paddr, PhysAddr(0x40_1000));
    }

    #[test]
    fn uncacheable_regions_get_pwt_pcd() {
        let mut map = Pmap::new();
        map.push(0, 0x20000, MemoryType::Reserved);
        map.push(0x20000, 0x1E0000, MemoryType::Usable);
        map.push(0x200000, 0x2000, MemoryType::Uncached);
        map.normalize();

        let arena = Arena::new(ARENA_SIZE);
        let kpt = kernel_table(&map, &arena.mapping, SCRATCH_BASE, SCRATCH_SIZE);

        let (paddr, level, flags) = walk(&arena.mapping, &kpt, VirtAddr(0x200000)).unwrap();
        assert_eq!(paddr, PhysAddr(0x200000));
        assert_eq!(level, 1, "a 2 MiB leaf would overshoot the 8 KiB region");
        assert!(flags.contains(Flags::PWT | Flags::PCD));
    }

    #[test]
    fn unmapped_and_trailing_reserved_are_skipped() {
        let mut map = Pmap::new();
        map.push(0, 0x1000, MemoryType::Unmapped);
        map.push(0x1000, 0x1F000, MemoryType::Reserved);
        map.push(0x20000, 0x3E0000, MemoryType::Usable);
        // reserved space beyond the last usable byte
        map.push(0x400000, 0x100000, MemoryType::Reserved);
        map.normalize();
        assert_eq!(map.last_usable(), 0x400000);

        let arena = Arena::new(ARENA_SIZE);
        let kpt = kernel_table(&map, &arena.mapping, SCRATCH_BASE, SCRATCH_SIZE);

        // the null page must not be reachable
        assert!(walk(&arena.mapping, &kpt, VirtAddr(0)).is_none());
        // reserved memory beyond last_usable must not be reachable
        assert!(walk(&arena.mapping, &kpt, VirtAddr(0x500000)).is_none());
        // reserved memory below last_usable is mapped
        assert!(walk(&arena.mapping, &kpt, VirtAddr(0x1000)).is_some());
    }

    #[test]
    #[should_panic(expected = "scratch exhausted")]
    fn scratch_overflow_is_fatal() {
        let mut map = Pmap::new();
        // discontiguous scraps, each a gigabyte apart and needing its own
        // table chain
        for i in 0..24_u64 {
            map.push(i * 0x4000_0000, 0x1000, MemoryType::Usable);
        }
        map.normalize();

        let arena = Arena::new(ARENA_SIZE);
        // a window of 4 pages cannot hold that many PDPT/PDT/PT chains
        kernel_table(&map, &arena.mapping, SCRATCH_BASE, 4 * PAGE_SIZE);
    }
}
