//! The page frame database: one fixed 32-byte record per 4 KiB frame of
//! addressable physical memory, with the available frames kept on a doubly
//! linked free list threaded through the records.

use core::mem;

use amd64::PhysAddr;

use crate::pmap::{MemoryType, Pmap};
use crate::{PAGE_SHIFT, PAGE_SIZE, PAGE_SIZE_LARGE};

/// Page frame number used as the list terminator.
pub const INVALID_PFN: u32 = u32::MAX;

/// State of a page frame record.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FrameType {
    /// Never handed out; the zeroed initial state of every record.
    Reserved = 0,
    /// On the free list.
    Available = 1,
    /// In use, with at least one reference.
    Allocated = 2,
}

/// A single record of the page frame database.
#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct PageFrame {
    /// Frame number of the previous available frame, or `INVALID_PFN`.
    prev: u32,
    /// Frame number of the next available frame, or `INVALID_PFN`.
    next: u32,
    /// Number of references to this frame.
    refcount: u16,
    /// Number of address spaces sharing this frame.
    sharecount: u16,
    flags: u16,
    kind: FrameType,
    reserved0: u8,
    reserved1: u64,
    reserved2: u64,
}

assert_eq_size!(PageFrame, [u8; 32]);

impl PageFrame {
    const ZERO: PageFrame = PageFrame {
        prev: 0,
        next: 0,
        refcount: 0,
        sharecount: 0,
        flags: 0,
        kind: FrameType::Reserved,
        reserved0: 0,
        reserved1: 0,
        reserved2: 0,
    };

    pub fn kind(&self) -> FrameType {
        self.kind
    }

    pub fn refcount(&self) -> u16 {
        self.refcount
    }

    pub fn next(&self) -> u32 {
        self.next
    }

    pub fn prev(&self) -> u32 {
        self.prev
    }
}

/// The page frame database. Records are indexed by page frame number, i.e.
/// physical address divided by the page size.
pub struct FrameDb {
    pf: *mut PageFrame,
    count: u32,
    avail: u32,
    head: u32,
    tail: u32,
}

// The raw record pointer is only ever dereferenced through &mut self.
unsafe impl Send for FrameDb {}

impl FrameDb {
    /// Number of frames needed to cover physical memory up to `last_usable`.
    pub fn frames_for(last_usable: u64) -> u32 {
        (last_usable / PAGE_SIZE) as u32
    }

    /// Number of bytes of backing storage for a database of `count` records,
    /// rounded up to a whole multiple of 2 MiB.
    pub fn size_bytes(count: u32) -> u64 {
        let raw = count as u64 * mem::size_of::<PageFrame>() as u64;
        (raw + PAGE_SIZE_LARGE - 1) >> crate::PAGE_SHIFT_LARGE << crate::PAGE_SHIFT_LARGE
    }

    /// Create the database over `count` records of backing memory at `ptr`,
    /// zeroing every record. All frames start out reserved; `populate` puts
    /// the usable ones on the free list.
    pub unsafe fn from_raw(ptr: *mut PageFrame, count: u32) -> FrameDb {
        for i in 0..count as usize {
            ptr.add(i).write(PageFrame::ZERO);
        }
        FrameDb {
            pf: ptr,
            count,
            avail: 0,
            head: INVALID_PFN,
            tail: INVALID_PFN,
        }
    }

    /// Walk the memory map and link the frames of every usable region into
    /// the free list.
    pub fn populate(&mut self, map: &Pmap) {
        for region in map.regions() {
            if region.kind != MemoryType::Usable {
                continue;
            }

            let pfn0 = (region.addr >> PAGE_SHIFT) as u32;
            let pfn_end = (region.end() >> PAGE_SHIFT) as u32;
            if pfn0 == pfn_end {
                continue;
            }

            // chain the region's frames together
            for pfn in pfn0..pfn_end {
                let pf = self.frame_mut(pfn);
                pf.prev = pfn.wrapping_sub(1);
                pf.next = pfn + 1;
                pf.kind = FrameType::Available;
            }

            // splice the chain onto the tail of the free list
            let tail = self.tail;
            if tail == INVALID_PFN {
                self.head = pfn0;
            } else {
                self.frame_mut(tail).next = pfn0;
            }
            self.frame_mut(pfn0).prev = tail;
            self.frame_mut(pfn_end - 1).next = INVALID_PFN;
            self.tail = pfn_end - 1;

            self.avail += pfn_end - pfn0;
        }

        debug!("[pfdb] {} of {} frames available", self.avail, self.count);
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn avail(&self) -> u32 {
        self.avail
    }

    pub fn head(&self) -> u32 {
        self.head
    }

    pub fn tail(&self) -> u32 {
        self.tail
    }

    pub fn frame(&self, pfn: u32) -> &PageFrame {
        assert!(pfn < self.count);
        unsafe { &*self.pf.add(pfn as usize) }
    }

    fn frame_mut(&mut self, pfn: u32) -> &mut PageFrame {
        assert!(pfn < self.count);
        unsafe { &mut *self.pf.add(pfn as usize) }
    }

    /// Physical address of the frame with the given number.
    pub fn frame_address(&self, pfn: u32) -> PhysAddr {
        PhysAddr((pfn as u64) << PAGE_SHIFT)
    }

    /// Frame number containing the given physical address.
    pub fn frame_number(&self, paddr: PhysAddr) -> u32 {
        (paddr.0 >> PAGE_SHIFT) as u32
    }

    /// Unlink the first available frame from the free list and hand it out
    /// with a reference count of one. Running out of frames is fatal; there
    /// is no swapping to fall back to.
    pub fn alloc(&mut self) -> u32 {
        if self.avail == 0 {
            panic!("out of page frames");
        }

        let pfn = self.head;
        let next = self.frame(pfn).next;

        self.head = next;
        if next != INVALID_PFN {
            self.frame_mut(next).prev = INVALID_PFN;
        } else {
            self.tail = INVALID_PFN;
        }

        let pf = self.frame_mut(pfn);
        *pf = PageFrame::ZERO;
        pf.refcount = 1;
        pf.kind = FrameType::Allocated;

        self.avail -= 1;
        pfn
    }

    /// Return an allocated frame to the head of the free list.
    pub fn free(&mut self, pfn: u32) {
        if self.frame(pfn).kind != FrameType::Allocated {
            panic!("freeing page frame {} which is not allocated", pfn);
        }

        let head = self.head;
        let pf = self.frame_mut(pfn);
        *pf = PageFrame::ZERO;
        pf.prev = INVALID_PFN;
        pf.next = head;
        pf.kind = FrameType::Available;

        if head != INVALID_PFN {
            self.frame_mut(head).prev = pfn;
        } else {
            self.tail = pfn;
        }
        self.head = pfn;

        self.avail += 1;
    }

    /// Drop one reference to an allocated frame, freeing it when the last
    /// reference goes away.
    pub fn unref(&mut self, pfn: u32) {
        let pf = self.frame_mut(pfn);
        pf.refcount -= 1;
        if pf.refcount == 0 {
            self.free(pfn);
        }
    }

    /// Take an additional reference to an allocated frame.
    pub fn addref(&mut self, pfn: u32) {
        let pf = self.frame_mut(pfn);
        debug_assert!(pf.kind == FrameType::Allocated);
        pf.refcount += 1;
    }

    /// Number of allocated frames; linear walk meant for diagnostics and
    /// tests.
    pub fn allocated(&self) -> u32 {
        let mut n = 0;
        for pfn in 0..self.count {
            if self.frame(pfn).kind == FrameType::Allocated {
                n += 1;
            }
        }
        n
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::pmap::Pmap;

    fn test_db(frames: u32) -> (Vec<PageFrame>, FrameDb) {
        let mut store = vec![PageFrame::ZERO; frames as usize];
        let db = unsafe { FrameDb::from_raw(store.as_mut_ptr(), frames) };
        (store, db)
    }

    /// `avail` must match the free list length walked in both directions.
    fn assert_list_consistent(db: &FrameDb) {
        let mut forward = 0;
        let mut pfn = db.head();
        let mut last = INVALID_PFN;
        while pfn != INVALID_PFN {
            assert_eq!(db.frame(pfn).kind(), FrameType::Available);
            assert_eq!(db.frame(pfn).prev(), last);
            last = pfn;
            pfn = db.frame(pfn).next();
            forward += 1;
        }
        assert_eq!(last, db.tail());

        let mut backward = 0;
        let mut pfn = db.tail();
        while pfn != INVALID_PFN {
            pfn = db.frame(pfn).prev();
            backward += 1;
        }

        assert_eq!(forward, db.avail());
        assert_eq!(backward, db.avail());
    }

    fn two_region_map() -> Pmap {
        let mut map = Pmap::new();
        map.push(0, 0x4000, MemoryType::Reserved);
        map.push(0x4000, 0x8000, MemoryType::Usable);
        map.push(0xC000, 0x2000, MemoryType::Reserved);
        map.push(0xE000, 0x2000, MemoryType::Usable);
        map.normalize();
        map
    }

    #[test]
    fn populate_links_usable_frames() {
        let map = two_region_map();
        let (_store, mut db) = test_db(FrameDb::frames_for(map.last_usable()));
        db.populate(&map);

        // frames 4..12 and 14..16 are usable
        assert_eq!(db.count(), 16);
        assert_eq!(db.avail(), 10);
        assert_eq!(db.head(), 4);
        assert_eq!(db.tail(), 15);
        assert_eq!(db.frame(11).next(), 14);
        assert_eq!(db.frame(14).prev(), 11);
        assert_eq!(db.frame(0).kind(), FrameType::Reserved);
        assert_list_consistent(&db);
    }

    #[test]
    fn alloc_and_free_restore_the_list() {
        let map = two_region_map();
        let (_store, mut db) = test_db(FrameDb::frames_for(map.last_usable()));
        db.populate(&map);

        let initial_avail = db.avail();

        let mut held = Vec::new();
        for _ in 0..4 {
            let pfn = db.alloc();
            assert_eq!(db.frame(pfn).kind(), FrameType::Allocated);
            assert_eq!(db.frame(pfn).refcount(), 1);
            held.push(pfn);
            assert_list_consistent(&db);
        }
        assert_eq!(db.avail(), initial_avail - 4);
        assert_eq!(db.allocated(), 4);

        for pfn in held {
            db.unref(pfn);
            assert_list_consistent(&db);
        }
        assert_eq!(db.avail(), initial_avail);
        assert_eq!(db.allocated(), 0);
    }

    #[test]
    fn alloc_exhausts_to_empty_and_recovers() {
        let mut map = Pmap::new();
        map.push(0, 0x3000, MemoryType::Usable);
        map.normalize();

        let (_store, mut db) = test_db(3);
        db.populate(&map);

        let a = db.alloc();
        let b = db.alloc();
        let c = db.alloc();
        assert_eq!(db.avail(), 0);
        assert_eq!(db.head(), INVALID_PFN);
        assert_eq!(db.tail(), INVALID_PFN);

        db.free(b);
        assert_eq!(db.head(), b);
        assert_eq!(db.tail(), b);
        assert_list_consistent(&db);

        db.free(a);
        db.free(c);
        assert_eq!(db.avail(), 3);
        assert_list_consistent(&db);
    }

    #[test]
    #[should_panic(expected = "out of page frames")]
    fn allocating_from_empty_db_is_fatal() {
        let (_store, mut db) = test_db(4);
        db.alloc();
    }

    #[test]
    #[should_panic(expected = "not allocated")]
    fn freeing_reserved_frame_is_fatal() {
        let (_store, mut db) = test_db(4);
        db.free(1);
    }

    #[test]
    fn refcounted_frames_survive_unref() {
        let mut map = Pmap::new();
        map.push(0, 0x2000, MemoryType::Usable);
        map.normalize();

        let (_store, mut db) = test_db(2);
        db.populate(&map);

        let pfn = db.alloc();
        db.addref(pfn);
        db.unref(pfn);
        assert_eq!(db.frame(pfn).kind(), FrameType::Allocated);
        assert_eq!(db.frame(pfn).refcount(), 1);
        db.unref(pfn);
        assert_eq!(db.frame(pfn).kind(), FrameType::Available);
    }
}
