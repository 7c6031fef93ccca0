//! The shared interrupt dispatchers. Both run with the vector number and an
//! error code word on the stack, save the full register file and MXCSR,
//! call the handler registered for the vector, restore everything, and
//! return with `iretq`.
//!
//! The layout of [`InterruptContext`] is a binding ABI between the assembly
//! below and the Rust handlers; the offset assertions at the bottom pin it.

use amd64::VirtAddr;
use kmem::layout;

/// All 64-bit general purpose registers, in the order the dispatcher pushes
/// them.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Registers {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

assert_eq_size!(Registers, [u64; 15]);

/// The CPU state at the moment of an interrupt, as assembled on the stack
/// by the dispatcher (registers) and the CPU itself (the tail from
/// `retaddr` on).
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct InterruptContext {
    pub regs: Registers,
    /// Exception error code; 0 for vectors that don't push one.
    pub error: u64,
    /// The interrupt vector number.
    pub vector: u64,
    /// Interrupt return address.
    pub retaddr: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

assert_eq_size!(InterruptContext, [u64; 22]);
const_assert_eq!(core::mem::offset_of!(InterruptContext, error), 120);
const_assert_eq!(core::mem::offset_of!(InterruptContext, vector), 128);
const_assert_eq!(core::mem::offset_of!(InterruptContext, retaddr), 136);

const ISR_TABLE_ADDR: u64 = layout::ISR_TABLE.0;

// The common dispatcher runs with [vector][CPU frame] on the stack; it
// pushes a dummy error code to keep one frame layout for all vectors. The
// special dispatcher runs after an error-code exception, so the stack holds
// [vector][error][CPU frame]; it swaps the two words into the common order
// and joins the common save path behind the dummy push.
//
// After the register file is saved, a 16-byte slot keeps MXCSR and lands
// the stack on a 16-byte boundary for the call. The vector slot is masked
// to 8 bits because `push imm8` sign-extended it.
core::arch::global_asm!(
    r#"
.text
.p2align 4
.global isr_dispatch_special
isr_dispatch_special:
    push r15
    push r14
    mov r14, [rsp + 16]
    mov r15, [rsp + 24]
    mov [rsp + 16], r15
    mov [rsp + 24], r14
    jmp 2f

.p2align 4
.global isr_dispatch_common
isr_dispatch_common:
    push 0
    push r15
    push r14
2:
    push r13
    push r12
    push r11
    push r10
    push r9
    push r8
    push rbp
    push rdi
    push rsi
    push rdx
    push rcx
    push rbx
    push rax
    sub rsp, 16
    stmxcsr [rsp]
    cld
    mov rax, [rsp + 144]
    and rax, 0xff
    mov [rsp + 144], rax
    mov rax, [{isr_table} + rax*8]
    test rax, rax
    jz 3f
    lea rdi, [rsp + 16]
    call rax
3:
    ldmxcsr [rsp]
    add rsp, 16
    pop rax
    pop rbx
    pop rcx
    pop rdx
    pop rsi
    pop rdi
    pop rbp
    pop r8
    pop r9
    pop r10
    pop r11
    pop r12
    pop r13
    pop r14
    pop r15
    add rsp, 16
    iretq
"#,
    isr_table = const ISR_TABLE_ADDR,
);

extern "C" {
    fn isr_dispatch_common();
    fn isr_dispatch_special();
}

/// Address of the dispatcher for vectors without a CPU error code.
pub fn common_address() -> VirtAddr {
    VirtAddr(isr_dispatch_common as usize as u64)
}

/// Address of the dispatcher for the error-code exceptions.
pub fn special_address() -> VirtAddr {
    VirtAddr(isr_dispatch_special as usize as u64)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn dispatchers_are_distinct() {
        assert_ne!(common_address(), special_address());
        assert_ne!(common_address(), VirtAddr(0));
    }

    #[test]
    fn context_mirrors_the_stack_frame() {
        // the register save area must sit directly below the error word,
        // mirroring push order
        assert_eq!(core::mem::offset_of!(Registers, rax), 0);
        assert_eq!(core::mem::offset_of!(Registers, r15), 112);
        assert_eq!(core::mem::offset_of!(InterruptContext, ss), 168);
    }
}
