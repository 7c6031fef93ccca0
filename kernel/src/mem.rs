//! Bring-up glue for the memory core: places the page frame database,
//! builds and activates the kernel page table, and exposes the paging API
//! over the global state.

use amd64::{PhysAddr, VirtAddr};
use kmem::builder;
use kmem::layout;
use kmem::paging::{DirectMapping, Pagetable, Paging};
use kmem::pfdb::FrameDb;
use spin::Mutex;

struct Mem {
    paging: Paging,
    /// Handle of the kernel's own address space; its growth window is the
    /// page table scratch area.
    kpt: Pagetable,
}

static MEM: Mutex<Option<Mem>> = Mutex::new(None);

fn with_mem<R>(f: impl FnOnce(&mut Mem) -> R) -> R {
    let mut guard = MEM.lock();
    let mem = guard.as_mut().expect("paging not initialized");
    f(mem)
}

/// Initialize paged memory management: carve out the page frame database,
/// identity map everything the memory map describes, switch the CPU over to
/// the kernel page table, and put every usable frame on the free list.
///
/// Requires the memory map to be final: `pmap::init` and the ACPI walk must
/// have happened.
pub unsafe fn page_init() {
    let map = kmem::pmap::get_mut();
    if map.last_usable() == 0 {
        panic!("the memory map reports no usable memory");
    }

    // the database covers every frame below last_usable and lives in a
    // 2 MiB aligned hole carved from the first usable region that fits it
    let count = FrameDb::frames_for(map.last_usable());
    let db_size = FrameDb::size_bytes(count);
    let db_at = map
        .reserve(db_size, kmem::PAGE_SHIFT_LARGE)
        .unwrap_or_else(|| panic!("no room for the page frame database"));

    let mapping = DirectMapping::identity();
    let kpt = builder::kernel_table(
        map,
        &mapping,
        layout::KERNEL_PAGETABLE,
        layout::KERNEL_PAGETABLE_END - layout::KERNEL_PAGETABLE,
    );

    // switch to the kernel table before touching the database memory; the
    // boot page table does not reach that high
    amd64::paging::set_cr3(kpt.proot);

    let mut frames = FrameDb::from_raw(mapping.phys_to_virt(db_at).as_mut_ptr(), count);
    frames.populate(map);

    let mut paging = Paging::new(kpt.proot, frames, mapping);
    paging.activate(None);

    info!(
        "[mem] frame database at {:p}, kernel table active",
        db_at
    );

    *MEM.lock() = Some(Mem { paging, kpt });
}

/// Create an address space that keeps its own tables mapped at
/// `[vaddr, vaddr + size)` and inherits the kernel mappings.
pub fn pagetable_create(pt: &mut Pagetable, vaddr: VirtAddr, size: u64) {
    with_mem(|m| m.paging.pagetable_create(pt, vaddr, size))
}

/// Tear an address space down and reclaim its frames.
pub fn pagetable_destroy(pt: &mut Pagetable) {
    with_mem(|m| m.paging.pagetable_destroy(pt))
}

/// Switch the CPU to the given address space; `None` selects the kernel
/// page table.
pub fn pagetable_activate(pt: Option<&Pagetable>) {
    with_mem(|m| {
        let root = m.paging.activate(pt);
        unsafe { amd64::paging::set_cr3(root) };
    })
}

/// Map `count` zeroed pages at `vaddr` in the given address space.
pub fn page_alloc(pt: &mut Pagetable, vaddr: VirtAddr, count: usize) -> VirtAddr {
    with_mem(|m| m.paging.page_alloc(pt, vaddr, count))
}

/// Unmap and free `count` pages at `vaddr` in the given address space.
pub fn page_free(pt: &mut Pagetable, vaddr: VirtAddr, count: usize) {
    with_mem(|m| m.paging.page_free(pt, vaddr, count))
}

/// Map `count` zeroed pages at `vaddr` in the kernel's own address space.
pub fn kernel_page_alloc(vaddr: VirtAddr, count: usize) -> VirtAddr {
    with_mem(|m| {
        let Mem { paging, kpt } = m;
        paging.page_alloc(kpt, vaddr, count)
    })
}

/// Unmap and free `count` kernel pages at `vaddr`.
pub fn kernel_page_free(vaddr: VirtAddr, count: usize) {
    with_mem(|m| {
        let Mem { paging, kpt } = m;
        paging.page_free(kpt, vaddr, count)
    })
}

/// Physical address of the root of the active address space.
pub fn active_root() -> Option<PhysAddr> {
    with_mem(|m| m.paging.active_root())
}
