//! The ACPI table walk. The tables live wherever the firmware put them,
//! usually far above everything the boot page table maps, so the walker
//! extends that table on the fly from a dedicated pool of pages and never
//! writes anywhere else. Every mapped table is also recorded in the physical
//! memory map so the kernel page table will cover it.

use core::mem;

use acpi::{
    AcpiTable, AnySdt, Fadt, InterruptSourceOverride, IoApic, LocalApic, Madt, Mcfg, McfgAddr,
    Rsdp, Rsdt, SdtHeader, Xsdt,
};
use amd64::paging::{Flags, PageTable, PageTableEntry};
use amd64::{Alignable, PhysAddr, VirtAddr};
use kmem::layout;
use kmem::paging::{index_at_level, DirectMapping};
use kmem::pmap::{MemoryType, Pmap};
use kmem::PAGE_SIZE;
use spin::Mutex;

/// The boot loader's temporary page table, with the pool of spare pages the
/// walker may grow it from.
pub struct BootTable<'a> {
    root: PhysAddr,
    next: PhysAddr,
    term: PhysAddr,
    mapping: &'a DirectMapping,
}

impl<'a> BootTable<'a> {
    pub fn new(
        root: PhysAddr,
        next: PhysAddr,
        term: PhysAddr,
        mapping: &'a DirectMapping,
    ) -> BootTable<'a> {
        BootTable {
            root,
            next,
            term,
            mapping,
        }
    }

    /// First pool page that has not been handed out yet.
    pub fn pool_next(&self) -> PhysAddr {
        self.next
    }

    unsafe fn table<'t>(&self, paddr: PhysAddr) -> &'t mut PageTable {
        &mut *self.mapping.phys_to_virt(paddr).as_mut_ptr()
    }

    /// Whether the boot page table already translates `addr`.
    pub fn is_mapped(&self, addr: u64) -> bool {
        let vaddr = VirtAddr(addr);

        let pml4t = unsafe { self.table(self.root) };
        let entry = pml4t[index_at_level(4, vaddr)];
        if entry.is_zero() {
            return false;
        }

        let pdpt = unsafe { self.table(entry.base()) };
        let entry = pdpt[index_at_level(3, vaddr)];
        if entry.is_zero() {
            return false;
        }
        if entry.flags().contains(Flags::SIZE) {
            return true;
        }

        let pdt = unsafe { self.table(entry.base()) };
        let entry = pdt[index_at_level(2, vaddr)];
        if entry.is_zero() {
            return false;
        }
        if entry.flags().contains(Flags::SIZE) {
            return true;
        }

        let ptt = unsafe { self.table(entry.base()) };
        !ptt[index_at_level(1, vaddr)].is_zero()
    }

    /// Take a page from the pool, zero it, and return the entry value that
    /// installs it in its parent table.
    fn alloc_page(&mut self) -> PageTableEntry {
        if self.next == self.term {
            panic!("boot page table pool exhausted");
        }

        let page = self.next;
        self.next += PAGE_SIZE;

        unsafe {
            let ptr: *mut u8 = self.mapping.phys_to_virt(page).as_mut_ptr();
            core::ptr::write_bytes(ptr, 0, PAGE_SIZE as usize);
        }
        PageTableEntry::new(page, Flags::PRESENT | Flags::WRITABLE)
    }

    /// Identity map the page containing `addr`, creating any missing
    /// interior tables from the pool.
    fn create_page(&mut self, addr: u64, flags: Flags) {
        let vaddr = VirtAddr(addr);

        let pml4t = unsafe { self.table(self.root) };
        let pml4e = index_at_level(4, vaddr);
        if pml4t[pml4e].is_zero() {
            pml4t[pml4e] = self.alloc_page();
        }

        let pdpt = unsafe { self.table(pml4t[pml4e].base()) };
        let pdpte = index_at_level(3, vaddr);
        if pdpt[pdpte].is_zero() {
            pdpt[pdpte] = self.alloc_page();
        }

        let pdt = unsafe { self.table(pdpt[pdpte].base()) };
        let pde = index_at_level(2, vaddr);
        if pdt[pde].is_zero() {
            pdt[pde] = self.alloc_page();
        }

        let ptt = unsafe { self.table(pdt[pde].base()) };
        ptt[index_at_level(1, vaddr)] = PageTableEntry::new(PhysAddr(addr), flags);
    }

    /// Make sure every byte of `[addr, addr + size)` is mapped.
    fn map_range(&mut self, addr: u64, size: u64, flags: Flags) {
        let begin = addr.align_down(PAGE_SIZE);
        let term = (addr + size).align_up(PAGE_SIZE);

        let mut page = begin;
        while page < term {
            if !self.is_mapped(page) {
                self.create_page(page, flags);
            }
            page += PAGE_SIZE;
        }
    }
}

/// Everything the walk found. Table references are raw virtual addresses of
/// firmware memory that stays mapped for the kernel's lifetime.
#[derive(Debug, Clone, Copy)]
pub struct AcpiInfo {
    version: u32,
    rsdp: VirtAddr,
    xsdt: Option<VirtAddr>,
    rsdt: Option<VirtAddr>,
    fadt: Option<VirtAddr>,
    madt: Option<VirtAddr>,
    mcfg: Option<VirtAddr>,
}

impl AcpiInfo {
    /// The ACPI major version, derived from the RSDP revision.
    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn rsdp(&self) -> &'static Rsdp {
        unsafe { &*self.rsdp.as_ptr() }
    }

    pub fn fadt(&self) -> Option<&'static Fadt> {
        self.fadt.map(|va| unsafe { &*va.as_ptr() })
    }

    pub fn madt(&self) -> Option<&'static Madt> {
        self.madt.map(|va| unsafe { &*va.as_ptr() })
    }

    pub fn mcfg(&self) -> Option<&'static Mcfg> {
        self.mcfg.map(|va| unsafe { &*va.as_ptr() })
    }

    pub fn has_xsdt(&self) -> bool {
        self.xsdt.is_some()
    }

    /// All local APICs the MADT lists.
    pub fn local_apics(&self) -> impl Iterator<Item = &'static LocalApic> {
        self.madt().into_iter().flat_map(|m| m.local_apics())
    }

    /// All I/O APICs the MADT lists.
    pub fn io_apics(&self) -> impl Iterator<Item = &'static IoApic> {
        self.madt().into_iter().flat_map(|m| m.io_apics())
    }

    /// All ISA interrupt overrides the MADT lists.
    pub fn interrupt_source_overrides(
        &self,
    ) -> impl Iterator<Item = &'static InterruptSourceOverride> {
        self.madt()
            .into_iter()
            .flat_map(|m| m.interrupt_source_overrides())
    }

    /// All PCIe configuration space records of the MCFG.
    pub fn mcfg_addrs(&self) -> impl Iterator<Item = &'static McfgAddr> {
        self.mcfg().into_iter().flat_map(|m| m.entries())
    }
}

/// Map one system description table: the header first, then, once its
/// length can be read, the rest, and record the whole page-aligned span in
/// the memory map.
fn map_table<'t>(btable: &mut BootTable, map: &mut Pmap, addr: PhysAddr) -> &'t AnySdt {
    let flags = Flags::PRESENT | Flags::WRITABLE;

    btable.map_range(addr.0, mem::size_of::<SdtHeader>() as u64, flags);
    let hdr: &AnySdt = unsafe { &*btable.mapping.phys_to_virt(addr).as_ptr() };

    let size = hdr.length() as u64;
    btable.map_range(addr.0, size, flags);

    let begin = addr.0.align_down(PAGE_SIZE);
    let term = (addr.0 + size).align_up(PAGE_SIZE);
    map.add(begin, term - begin, MemoryType::Acpi);

    hdr
}

fn read_table(btable: &mut BootTable, map: &mut Pmap, info: &mut AcpiInfo, addr: PhysAddr) {
    let any = map_table(btable, map, addr);
    let vaddr = VirtAddr(any as *const AnySdt as u64);

    let sig = *any.signature();
    info!(
        "[acpi] found {} table at {:p}",
        core::str::from_utf8(&sig).unwrap_or("<invalid>"),
        addr
    );

    match &sig {
        Fadt::SIGNATURE => info.fadt = Some(vaddr),
        Madt::SIGNATURE => info.madt = Some(vaddr),
        Mcfg::SIGNATURE => info.mcfg = Some(vaddr),
        _ => debug!("[acpi] no reader for this table, skipping"),
    }
}

/// Locate the RSDP, walk the XSDT (or, failing that, the RSDT), and map and
/// record every table reachable from it.
fn discover(map: &mut Pmap, btable: &mut BootTable) -> AcpiInfo {
    let mapping = btable.mapping;
    let scan = |base: PhysAddr, size: u64| unsafe {
        Rsdp::find(
            mapping.phys_to_virt(base),
            mapping.phys_to_virt(base + size),
        )
    };

    // the RSDP sits either in the extended BIOS data area or in the ROM
    // shadow; nowhere else
    let rsdp = scan(layout::EXTENDED_BIOS, layout::EXTENDED_BIOS_SIZE)
        .or_else(|| scan(layout::SYSTEM_ROM, layout::SYSTEM_ROM_SIZE))
        .unwrap_or_else(|| panic!("no ACPI tables found"));

    let mut info = AcpiInfo {
        version: rsdp.revision() as u32 + 1,
        rsdp: VirtAddr(rsdp as *const Rsdp as u64),
        xsdt: None,
        rsdt: None,
        fadt: None,
        madt: None,
        mcfg: None,
    };

    info!(
        "[acpi] ACPI {}.0, RSDP at {:p}, oem '{}'",
        info.version,
        info.rsdp,
        rsdp.oem_id()
    );

    // ACPI 2.0 machines carry an XSDT with 64-bit pointers; prefer it
    if info.version > 1 {
        if let Some(v2) = rsdp.as_v2() {
            if v2.xsdt_address().0 != 0 {
                let hdr = map_table(btable, map, v2.xsdt_address());
                let xsdt =
                    Xsdt::from_any(hdr).unwrap_or_else(|| panic!("XSDT signature mismatch"));
                info.xsdt = Some(VirtAddr(xsdt as *const Xsdt as u64));

                for ptr in xsdt.sdt_pointers() {
                    read_table(btable, map, &mut info, ptr);
                }
            }
        }
    }

    // no XSDT, fall back to the 32-bit RSDT of ACPI 1.0
    if info.xsdt.is_none() {
        let rsdt_addr = rsdp.rsdt_address();
        if rsdt_addr.0 == 0 {
            panic!("neither XSDT nor RSDT present");
        }

        let hdr = map_table(btable, map, rsdt_addr);
        let rsdt = Rsdt::from_any(hdr).unwrap_or_else(|| panic!("RSDT signature mismatch"));
        info.rsdt = Some(VirtAddr(rsdt as *const Rsdt as u64));

        for ptr in rsdt.sdt_pointers() {
            read_table(btable, map, &mut info, ptr);
        }
    }

    // the APIC register pages are memory mapped I/O and must never be
    // cached
    if let Some(madt) = info.madt() {
        map.add(
            madt.local_apic_address().0.align_down(PAGE_SIZE),
            PAGE_SIZE,
            MemoryType::Uncached,
        );
        for io in madt.io_apics() {
            map.add(
                io.address().0.align_down(PAGE_SIZE),
                PAGE_SIZE,
                MemoryType::Uncached,
            );
        }
    }

    info
}

static ACPI: Mutex<Option<AcpiInfo>> = Mutex::new(None);

/// Run the ACPI walk over the real firmware tables. Requires `pmap::init`
/// to have run; must run before the kernel page table is built so the
/// discovered regions make it into the identity mapping.
pub fn init() {
    let mapping = DirectMapping::identity();
    let mut btable = BootTable::new(
        layout::BOOT_PAGETABLE,
        layout::BOOT_PAGETABLE_LOADED,
        layout::BOOT_PAGETABLE_END,
        &mapping,
    );

    let map = unsafe { kmem::pmap::get_mut() };
    let info = discover(map, &mut btable);

    *ACPI.lock() = Some(info);
}

fn info() -> AcpiInfo {
    ACPI.lock().expect("ACPI tables have not been walked yet")
}

/// The ACPI major version of this machine.
pub fn version() -> u32 {
    info().version()
}

pub fn fadt() -> Option<&'static Fadt> {
    info().fadt()
}

pub fn madt() -> Option<&'static Madt> {
    info().madt()
}

pub fn mcfg() -> Option<&'static Mcfg> {
    info().mcfg()
}

pub fn local_apics() -> impl Iterator<Item = &'static LocalApic> {
    info().local_apics()
}

pub fn io_apics() -> impl Iterator<Item = &'static IoApic> {
    info().io_apics()
}

pub fn interrupt_source_overrides() -> impl Iterator<Item = &'static InterruptSourceOverride> {
    info().interrupt_source_overrides()
}

pub fn mcfg_addrs() -> impl Iterator<Item = &'static McfgAddr> {
    info().mcfg_addrs()
}
