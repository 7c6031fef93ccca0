//! Paged virtual memory management: address space handles, demand mapping of
//! virtual to physical ranges, and teardown.
//!
//! Page tables are never touched through language-level pointers to each
//! other; an entry stores the physical page number of the next level and all
//! access goes through the direct mapping.

pub mod direct;

pub use self::direct::DirectMapping;

use amd64::paging::{Flags, PageTable, PageTableEntry};
use amd64::{PhysAddr, VirtAddr};

use crate::pfdb::{FrameDb, FrameType};
use crate::PAGE_SIZE;

/// Return the index into the page table at the given level (1 is PT, 4 is
/// PML4) that is responsible for mapping the given virtual address.
pub fn index_at_level(level: u32, vaddr: VirtAddr) -> usize {
    ((vaddr.0 >> (12 + 9 * (level - 1))) & 0x1FF) as usize
}

/// An address space handle.
///
/// `proot` is the physical address of the PML4. The pages holding the
/// hierarchy itself are mapped into the address space at `[vroot, vterm)`;
/// `vnext` is the bump pointer within that window where the next interior
/// page will appear. Everything in `[vroot, vnext)` stays mapped to interior
/// pages of this address space.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagetable {
    pub proot: PhysAddr,
    pub vroot: VirtAddr,
    pub vnext: VirtAddr,
    pub vterm: VirtAddr,
}

impl Pagetable {
    pub const fn empty() -> Pagetable {
        Pagetable {
            proot: PhysAddr(0),
            vroot: VirtAddr(0),
            vnext: VirtAddr(0),
            vterm: VirtAddr(0),
        }
    }
}

/// The paging manager: owns the page frame database and knows the kernel
/// page table root, the translation window for reaching table memory, and
/// which address space is live on the CPU.
pub struct Paging {
    frames: FrameDb,
    mapping: DirectMapping,
    kernel_root: PhysAddr,
    active: Option<PhysAddr>,
}

impl Paging {
    pub fn new(kernel_root: PhysAddr, frames: FrameDb, mapping: DirectMapping) -> Paging {
        Paging {
            frames,
            mapping,
            kernel_root,
            active: None,
        }
    }

    pub fn frames(&self) -> &FrameDb {
        &self.frames
    }

    pub fn mapping(&self) -> &DirectMapping {
        &self.mapping
    }

    pub fn kernel_root(&self) -> PhysAddr {
        self.kernel_root
    }

    pub fn active_root(&self) -> Option<PhysAddr> {
        self.active
    }

    /// View the page table page at the given physical address. The lifetime
    /// is unconstrained; the caller must not hold two views of the same page.
    unsafe fn table<'a>(&self, paddr: PhysAddr) -> &'a mut PageTable {
        &mut *self.mapping.phys_to_virt(paddr).as_mut_ptr()
    }

    /// Allocate a page frame, zero its contents, and return its physical
    /// address.
    pub fn pgalloc(&mut self) -> PhysAddr {
        let pfn = self.frames.alloc();
        let paddr = self.frames.frame_address(pfn);
        unsafe {
            let page: *mut u8 = self.mapping.phys_to_virt(paddr).as_mut_ptr();
            core::ptr::write_bytes(page, 0, PAGE_SIZE as usize);
        }
        paddr
    }

    /// Drop a reference to the page frame at the given physical address,
    /// returning it to the free list when the last reference goes away.
    pub fn pgfree(&mut self, paddr: PhysAddr) {
        let pfn = self.frames.frame_number(paddr);
        self.frames.unref(pfn);
    }

    /// Upsert a 4 KiB mapping of `vaddr` to `paddr` into the address space,
    /// allocating any missing interior tables. Every newly allocated interior
    /// page is itself mapped at `pt.vnext` so later walks can reach it by a
    /// known virtual address.
    pub fn add_pte(&mut self, pt: &mut Pagetable, vaddr: VirtAddr, paddr: PhysAddr, flags: Flags) {
        self.add_pte_impl(pt, vaddr, paddr, flags, false)
    }

    fn add_pte_impl(
        &mut self,
        pt: &mut Pagetable,
        vaddr: VirtAddr,
        paddr: PhysAddr,
        flags: Flags,
        contains_table: bool,
    ) {
        // a table page insert past the window means the address space ran
        // out of room for its own hierarchy
        if contains_table && vaddr >= pt.vterm {
            panic!("page table window exhausted at {:p}", vaddr);
        }

        // Kernel entries inherited by other address spaces are immutable
        // there; the kernel table itself may extend below its own entries.
        let inherited = pt.proot != self.kernel_root;

        // interior pages added while walking down, self-mapped afterwards
        let mut added = [PhysAddr(0); 3];
        let mut count = 0;

        let pml4t = unsafe { self.table(pt.proot) };
        let pml4e = index_at_level(4, vaddr);
        if pml4t[pml4e].is_zero() {
            let page = self.pgalloc();
            added[count] = page;
            count += 1;
            pml4t[pml4e] = PageTableEntry::new(page, Flags::PRESENT | Flags::WRITABLE);
        } else if inherited && pml4t[pml4e].flags().contains(Flags::SYSTEM) {
            // checking the root level suffices: kernel tables are only
            // reachable through kernel PML4 entries
            panic!("attempt to modify an inherited kernel mapping at {:p}", vaddr);
        }

        let pdpt = unsafe { self.table(pml4t[pml4e].base()) };
        let pdpte = index_at_level(3, vaddr);
        if pdpt[pdpte].is_zero() {
            let page = self.pgalloc();
            added[count] = page;
            count += 1;
            pdpt[pdpte] = PageTableEntry::new(page, Flags::PRESENT | Flags::WRITABLE);
        } else if pdpt[pdpte].flags().contains(Flags::SIZE) {
            if contains_table {
                // the huge leaf already reaches the new table page
                return;
            }
            panic!("{:p} is covered by a huge page", vaddr);
        }

        let pdt = unsafe { self.table(pdpt[pdpte].base()) };
        let pde = index_at_level(2, vaddr);
        if pdt[pde].is_zero() {
            let page = self.pgalloc();
            added[count] = page;
            count += 1;
            pdt[pde] = PageTableEntry::new(page, Flags::PRESENT | Flags::WRITABLE);
        } else if pdt[pde].flags().contains(Flags::SIZE) {
            if contains_table {
                // the large leaf already reaches the new table page
                return;
            }
            panic!("{:p} is covered by a large page", vaddr);
        }

        let ptt = unsafe { self.table(pdt[pde].base()) };
        ptt[index_at_level(1, vaddr)] = PageTableEntry::new(paddr, flags);

        // growing the hierarchy must keep the hierarchy itself mapped
        for page in added[..count].iter() {
            let vnext = pt.vnext;
            self.add_pte_impl(pt, vnext, *page, Flags::PRESENT | Flags::WRITABLE, true);
            pt.vnext += PAGE_SIZE;
        }
    }

    /// Clear the 4 KiB mapping for `vaddr` and return the physical address it
    /// pointed to. Invalidates the TLB entry if the address space is live.
    pub fn remove_pte(&mut self, pt: &mut Pagetable, vaddr: VirtAddr) -> PhysAddr {
        let pml4t = unsafe { self.table(pt.proot) };
        let pdpt = unsafe { self.table(pml4t[index_at_level(4, vaddr)].base()) };
        let pdt = unsafe { self.table(pdpt[index_at_level(3, vaddr)].base()) };
        let ptt = unsafe { self.table(pdt[index_at_level(2, vaddr)].base()) };

        let pte = index_at_level(1, vaddr);
        let paddr = ptt[pte].base();
        ptt[pte] = PageTableEntry::zero();

        if self.active == Some(pt.proot) {
            unsafe { amd64::paging::invalidate_tlb_address(vaddr) };
        }

        paddr
    }

    /// Resolve a virtual address through the address space, honoring large
    /// and huge leaves.
    pub fn resolve(&self, pt: &Pagetable, vaddr: VirtAddr) -> Option<PhysAddr> {
        let mut table = pt.proot;
        let mut level = 4;
        loop {
            let entry = unsafe { self.table(table) }[index_at_level(level, vaddr)];
            if !entry.flags().contains(Flags::PRESENT) {
                return None;
            }
            if level == 1 || entry.flags().contains(Flags::SIZE) {
                let offset_mask = (1_u64 << (12 + 9 * (level - 1))) - 1;
                return Some(PhysAddr((entry.base().0 & !offset_mask) + (vaddr.0 & offset_mask)));
            }
            table = entry.base();
            level -= 1;
        }
    }

    /// Create a new address space that will keep its own hierarchy mapped at
    /// `[vaddr, vaddr + size)`. The kernel half of the PML4 is copied in so
    /// kernel memory stays reachable.
    pub fn pagetable_create(&mut self, pt: &mut Pagetable, vaddr: VirtAddr, size: u64) {
        if size % PAGE_SIZE != 0 {
            panic!("page table window size must be page aligned");
        }

        pt.proot = self.pgalloc();
        pt.vroot = vaddr;
        pt.vnext = vaddr + PAGE_SIZE;
        pt.vterm = vaddr + size;

        let src = unsafe { self.table(self.kernel_root) };
        let dst = unsafe { self.table(pt.proot) };
        dst.entries.copy_from_slice(&src.entries);
    }

    /// Tear an address space down, returning every frame it allocated to the
    /// database. Inherited kernel entries are left alone.
    pub fn pagetable_destroy(&mut self, pt: &mut Pagetable) {
        if pt.proot.0 == 0 {
            panic!("destroying an address space that does not exist");
        }

        self.free_recurse(pt.proot, 4);

        if self.active == Some(pt.proot) {
            let mut vaddr = pt.vroot;
            while vaddr < pt.vterm {
                unsafe { amd64::paging::invalidate_tlb_address(vaddr) };
                vaddr += PAGE_SIZE;
            }
        }

        *pt = Pagetable::empty();
    }

    fn free_recurse(&mut self, table_paddr: PhysAddr, level: u32) {
        let table = unsafe { self.table(table_paddr) };

        if level == 1 {
            // leaf level: give allocated frames back. Interior pages show up
            // here too, through the self-mapping window.
            for entry in table.entries.iter() {
                let paddr = entry.base();
                if paddr.0 == 0 {
                    continue;
                }
                let pfn = self.frames.frame_number(paddr);
                if self.frames.frame(pfn).kind() == FrameType::Allocated {
                    self.pgfree(paddr);
                }
            }
        } else {
            for entry in table.entries.iter() {
                // never descend into kernel-owned subtrees
                if entry.flags().contains(Flags::SYSTEM) {
                    continue;
                }
                let child = entry.base();
                if child.0 == 0 {
                    continue;
                }
                self.free_recurse(child, level - 1);
            }
        }
    }

    /// Mark an address space as the one live on the CPU and return the root
    /// to be loaded into CR3; `None` selects the kernel table. The caller
    /// performs the actual CR3 write, which keeps this type independent of
    /// the privileged instruction.
    pub fn activate(&mut self, pt: Option<&Pagetable>) -> PhysAddr {
        let root = pt.map_or(self.kernel_root, |p| p.proot);
        if root.0 == 0 {
            panic!("activating an address space that does not exist");
        }
        self.active = Some(root);
        root
    }

    /// Map `count` freshly zeroed pages at contiguous virtual addresses
    /// starting at `vaddr`.
    pub fn page_alloc(&mut self, pt: &mut Pagetable, vaddr: VirtAddr, count: usize) -> VirtAddr {
        let mut va = vaddr;
        for _ in 0..count {
            let paddr = self.pgalloc();
            self.add_pte(pt, va, paddr, Flags::PRESENT | Flags::WRITABLE);
            va += PAGE_SIZE;
        }
        vaddr
    }

    /// Unmap and free `count` pages starting at `vaddr`.
    pub fn page_free(&mut self, pt: &mut Pagetable, vaddr: VirtAddr, count: usize) {
        let mut va = vaddr;
        for _ in 0..count {
            let paddr = self.remove_pte(pt, va);
            self.pgfree(paddr);
            va += PAGE_SIZE;
        }
    }
}
