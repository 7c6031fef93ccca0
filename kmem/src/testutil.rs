//! Shared scaffolding for the memory tests: a window of fake physical memory
//! inside an ordinary allocation, plus a fully initialized memory system
//! built over it the same way the kernel brings one up.

use amd64::{PhysAddr, VirtAddr};

use crate::builder;
use crate::paging::{DirectMapping, Pagetable, Paging};
use crate::pfdb::FrameDb;
use crate::pmap::{MemoryType, Pmap};

/// Size of the fake physical address space.
pub const ARENA_SIZE: u64 = 0x80_0000;
/// Scratch window for the kernel page table, mirroring the real layout's
/// shape at a test-sized scale.
pub const SCRATCH_BASE: PhysAddr = PhysAddr(0x1_0000);
pub const SCRATCH_SIZE: u64 = 0x1_0000;

/// A page-aligned buffer serving as physical memory `[0, size)`.
pub struct Arena {
    #[allow(dead_code)]
    buf: Vec<u8>,
    pub mapping: DirectMapping,
}

impl Arena {
    pub fn new(size: u64) -> Arena {
        let buf = vec![0_u8; (size + 0x1000) as usize];
        let base = (buf.as_ptr() as u64 + 0xFFF) & !0xFFF;
        let mapping = DirectMapping::new(VirtAddr(base), PhysAddr(0), size);
        Arena { buf, mapping }
    }
}

/// A complete little memory system: memory map, kernel page table and page
/// frame database, assembled in bring-up order.
pub struct Env {
    #[allow(dead_code)]
    pub arena: Arena,
    pub map: Pmap,
    pub kpt: Pagetable,
    pub paging: Paging,
}

impl Env {
    pub fn new() -> Env {
        let arena = Arena::new(ARENA_SIZE);

        // the low 128 KiB play the role of the kernel image and tables
        let mut map = Pmap::new();
        map.push(0, SCRATCH_BASE.0 + SCRATCH_SIZE, MemoryType::Reserved);
        map.push(
            SCRATCH_BASE.0 + SCRATCH_SIZE,
            ARENA_SIZE - (SCRATCH_BASE.0 + SCRATCH_SIZE),
            MemoryType::Usable,
        );
        map.normalize();

        // carve out the frame database, then build and populate
        let count = FrameDb::frames_for(map.last_usable());
        let db_size = FrameDb::size_bytes(count);
        let db_at = map
            .reserve(db_size, crate::PAGE_SHIFT_LARGE)
            .expect("arena too small for the frame database");

        let kpt = builder::kernel_table(&map, &arena.mapping, SCRATCH_BASE, SCRATCH_SIZE);

        let mut frames =
            unsafe { FrameDb::from_raw(arena.mapping.phys_to_virt(db_at).as_mut_ptr(), count) };
        frames.populate(&map);

        let paging = Paging::new(kpt.proot, frames, arena.mapping.clone());

        Env {
            arena,
            map,
            kpt,
            paging,
        }
    }
}
