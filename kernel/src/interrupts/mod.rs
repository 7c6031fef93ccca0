//! Interrupt dispatch: 256 generated entry thunks, an IDT pointing at them,
//! and a per-vector table of Rust handlers called by the common dispatcher.

pub mod dispatch;
pub mod exception;

use amd64::idt::{GateType, Idt, IdtEntry};
use amd64::pic;
use amd64::segments::Ring;
use amd64::VirtAddr;
use kmem::layout;

pub use self::dispatch::InterruptContext;

/// Hardware IRQ lines.
pub const IRQ_TIMER: u8 = 0;
pub const IRQ_KEYBOARD: u8 = 1;

/// Interrupt vectors the PIC lines are remapped onto.
pub const TRAP_IRQ_BASE: u8 = 0x20;
pub const TRAP_IRQ_TIMER: u8 = 0x20;
pub const TRAP_IRQ_KEYBOARD: u8 = 0x21;

/// Software interrupt raised on unrecoverable failures; its handler stops
/// the CPU.
pub const TRAP_FATAL: u8 = 0xFF;

/// An interrupt service routine. Runs with interrupts disabled; hardware
/// IRQ handlers must signal EOI themselves before returning.
pub type IsrHandler = extern "C" fn(&InterruptContext);

/// The CPU exceptions that push an error code; their thunks jump to the
/// dispatcher variant that fixes up the stack layout.
pub const ERROR_CODE_VECTORS: [u8; 6] = [0x08, 0x0A, 0x0B, 0x0C, 0x0D, 0x0E];

/// One interrupt entry thunk: `nop; push imm8; jmp rel32`. The push makes
/// the vector number available to the shared dispatcher.
#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Thunk([u8; 8]);

assert_eq_size!(Thunk, u64);

impl Thunk {
    pub fn new(vector: u8, thunk_addr: u64, dispatcher: u64) -> Thunk {
        // jmp rel32 is relative to the end of the 8-byte thunk
        let rel = dispatcher.wrapping_sub(thunk_addr + 8) as i64;
        debug_assert!(i32::try_from(rel).is_ok());
        let rel = (rel as i32).to_le_bytes();

        Thunk([0x90, 0x6A, vector, 0xE9, rel[0], rel[1], rel[2], rel[3]])
    }

    pub fn bytes(&self) -> &[u8; 8] {
        &self.0
    }

    /// The vector number this thunk pushes.
    pub fn vector(&self) -> u8 {
        self.0[2]
    }

    /// Absolute address its final jump lands on, given where the thunk
    /// itself lives.
    pub fn jump_target(&self, thunk_addr: u64) -> u64 {
        let rel = i32::from_le_bytes([self.0[4], self.0[5], self.0[6], self.0[7]]);
        (thunk_addr + 8).wrapping_add(rel as i64 as u64)
    }
}

/// Fill the thunk table. Error-code exceptions get the special dispatcher,
/// everything else the common one.
pub fn build_thunks(thunks: &mut [Thunk; 256], base: u64, common: u64, special: u64) {
    for v in 0..256 {
        let addr = base + v as u64 * 8;
        let dispatcher = if ERROR_CODE_VECTORS.contains(&(v as u8)) {
            special
        } else {
            common
        };
        thunks[v] = Thunk::new(v as u8, addr, dispatcher);
    }
}

/// Fill the IDT: every vector's descriptor points at its own thunk.
/// Exceptions use interrupt gates so nested interrupts stay disabled while
/// the dispatcher runs; everything above uses trap gates. NMI, double fault
/// and machine check get dedicated stacks via the IST.
pub fn build_idt(idt: &mut Idt, thunk_base: u64) {
    for v in 0..=255_u8 {
        let gate = if v < 32 {
            GateType::INTERRUPT_GATE
        } else {
            GateType::TRAP_GATE
        };
        idt[v] = IdtEntry::new(
            gate,
            crate::selectors::KERNEL_CODE,
            VirtAddr(thunk_base + v as u64 * 8),
            Ring::RING0,
            true,
        );
    }

    idt[0x02].set_ist(1); // NMI
    idt[0x08].set_ist(2); // double fault
    idt[0x12].set_ist(3); // machine check
}

/// Initialize interrupt dispatch: remap and mask the PICs, generate the
/// thunks, clear the handler table, and install and load the IDT.
///
/// Interrupts must not be enabled before this has run.
pub unsafe fn init() {
    // the PICs' reset-time vectors collide with the CPU exceptions
    pic::remap(TRAP_IRQ_BASE, TRAP_IRQ_BASE + 8);
    pic::set_masks(0xFF, 0xFF);

    let thunks = &mut *(layout::ISR_THUNKS.0 as usize as *mut [Thunk; 256]);
    build_thunks(
        thunks,
        layout::ISR_THUNKS.0,
        dispatch::common_address().0,
        dispatch::special_address().0,
    );

    core::ptr::write_bytes(layout::ISR_TABLE.0 as usize as *mut u8, 0, 256 * 8);

    let idt = &mut *(layout::IDT.0 as usize as *mut Idt);
    *idt = Idt::new();
    build_idt(idt, layout::ISR_THUNKS.0);
    amd64::idt::load_idt(idt);

    debug!("[int] thunks generated, IDT loaded");
}

/// Install (or, with `None`, remove) the service routine for a vector. The
/// write happens with interrupts disabled so a concurrent interrupt can
/// never observe a half-written entry.
pub unsafe fn isr_set(vector: u8, handler: Option<IsrHandler>) {
    let rflags = amd64::interrupts::read_rflags();
    amd64::interrupts::disable();

    let entry = (layout::ISR_TABLE.0 as usize as *mut u64).add(vector as usize);
    entry.write_volatile(match handler {
        Some(f) => f as usize as u64,
        None => 0,
    });

    amd64::interrupts::write_rflags(rflags);
}

/// Unmask a hardware interrupt line. Slave lines additionally require the
/// cascade line on the master.
pub unsafe fn irq_enable(irq: u8) {
    let (master, slave) = pic::get_masks();
    if irq >= 8 {
        pic::set_masks(master, slave & !(1 << (irq - 8)));
        irq_enable(2);
    } else {
        pic::set_masks(master & !(1 << irq), slave);
    }
}

/// Mask a hardware interrupt line.
pub unsafe fn irq_disable(irq: u8) {
    let (master, slave) = pic::get_masks();
    if irq >= 8 {
        pic::set_masks(master, slave | (1 << (irq - 8)));
    } else {
        pic::set_masks(master | (1 << irq), slave);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use amd64::segments::Selector;

    // plausible dispatcher addresses on either side of the thunk table
    const BASE: u64 = 0x2800;
    const COMMON: u64 = 0x30_1000;
    const SPECIAL: u64 = 0x30_1080;

    fn thunk_table() -> Box<[Thunk; 256]> {
        let mut thunks = Box::new([Thunk([0; 8]); 256]);
        build_thunks(&mut thunks, BASE, COMMON, SPECIAL);
        thunks
    }

    #[test]
    fn thunk_encoding() {
        let t = Thunk::new(0x21, BASE + 0x21 * 8, COMMON);
        let b = t.bytes();
        assert_eq!(b[0], 0x90, "nop");
        assert_eq!(b[1], 0x6A, "push imm8");
        assert_eq!(b[2], 0x21, "vector operand");
        assert_eq!(b[3], 0xE9, "jmp rel32");
        assert_eq!(t.jump_target(BASE + 0x21 * 8), COMMON);
    }

    #[test]
    fn thunks_select_the_right_dispatcher() {
        let thunks = thunk_table();

        for v in 0..256 {
            let t = &thunks[v];
            assert_eq!(t.vector(), v as u8);

            let target = t.jump_target(BASE + v as u64 * 8);
            if ERROR_CODE_VECTORS.contains(&(v as u8)) {
                assert_eq!(target, SPECIAL, "vector {:#04x}", v);
            } else {
                assert_eq!(target, COMMON, "vector {:#04x}", v);
            }
        }
    }

    #[test]
    fn backward_jump_encoding() {
        // the dispatchers usually live above the thunks, but a target below
        // must encode as a negative displacement
        let t = Thunk::new(0, 0x30_0000, 0x2800);
        assert_eq!(t.jump_target(0x30_0000), 0x2800);
    }

    #[test]
    fn idt_descriptors_point_at_thunks() {
        let mut idt = Box::new(Idt::new());
        build_idt(&mut idt, BASE);

        for v in 0..=255_u8 {
            let e = &idt[v];
            assert!(e.present());
            assert_eq!(e.handler(), VirtAddr(BASE + v as u64 * 8));
            assert_eq!(e.selector(), Selector(8));
            assert_eq!(e.descriptor_privilege(), Ring::RING0);

            let expected_gate = if v < 32 {
                GateType::INTERRUPT_GATE
            } else {
                GateType::TRAP_GATE
            };
            assert_eq!(e.gate_type(), expected_gate, "vector {:#04x}", v);

            let expected_ist = match v {
                0x02 => 1,
                0x08 => 2,
                0x12 => 3,
                _ => 0,
            };
            assert_eq!(e.ist(), expected_ist, "vector {:#04x}", v);
        }
    }
}
