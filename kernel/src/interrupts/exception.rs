//! CPU exception handling. Until there is a reason to recover from any of
//! them, every exception logs the interrupted CPU state and stops the
//! machine; only breakpoints are survivable.

use super::{isr_set, InterruptContext, TRAP_FATAL};

/// Vector 3, the one exception with a harmless default.
pub const EXCEPTION_BREAKPOINT: u8 = 3;

static EXCEPTION_NAMES: [&str; 21] = [
    "#DE: Divide by zero exception",
    "#DB: Debug exception",
    "Non-maskable interrupt",
    "#BP: Breakpoint exception",
    "#OF: Overflow exception",
    "#BR: BOUND Range exceeded exception",
    "#UD: Invalid opcode exception",
    "#NM: Device not available exception",
    "#DF: Double fault exception",
    "Coprocessor segment overrun",
    "#TS: Invalid TSS exception",
    "#NP: Segment not present exception",
    "#SS: Stack fault exception",
    "#GP: General protection exception",
    "#PF: Page fault exception",
    "Unknown exception",
    "#MF: x87 FPU floating-point error",
    "#AC: Alignment check exception",
    "#MC: Machine-check exception",
    "#XM: SIMD floating-point exception",
    "#VE: Virtualization exception",
];

fn dump_context(context: &InterruptContext) {
    error!(
        "INT: {:02x}   Error: {:08x}",
        context.vector, context.error
    );
    error!(
        "CS:RIP: {:04x}:{:016x}   SS:RSP: {:04x}:{:016x}",
        context.cs, context.retaddr, context.ss, context.rsp
    );

    let r = &context.regs;
    error!("RAX: {:016x}   RBX: {:016x}   RCX: {:016x}", r.rax, r.rbx, r.rcx);
    error!("RDX: {:016x}   RSI: {:016x}   RDI: {:016x}", r.rdx, r.rsi, r.rdi);
    error!("RBP: {:016x}   R8:  {:016x}   R9:  {:016x}", r.rbp, r.r8, r.r9);
    error!("R10: {:016x}   R11: {:016x}   R12: {:016x}", r.r10, r.r11, r.r12);
    error!("R13: {:016x}   R14: {:016x}   R15: {:016x}", r.r13, r.r14, r.r15);

    error!(
        "RFLAGS: {:016x} [{}{}{}{}{}{}]",
        context.rflags,
        if context.rflags & (1 << 11) != 0 { 'O' } else { '-' },
        if context.rflags & (1 << 7) != 0 { 'S' } else { '-' },
        if context.rflags & (1 << 6) != 0 { 'Z' } else { '-' },
        if context.rflags & (1 << 4) != 0 { 'A' } else { '-' },
        if context.rflags & (1 << 2) != 0 { 'P' } else { '-' },
        if context.rflags & 1 != 0 { 'C' } else { '-' },
    );
}

fn hang() -> ! {
    loop {
        unsafe {
            amd64::interrupts::disable();
            amd64::hlt();
        }
    }
}

extern "C" fn isr_fatal(context: &InterruptContext) {
    let name = EXCEPTION_NAMES
        .get(context.vector as usize)
        .unwrap_or(&"Unknown exception");
    error!("{}", name);
    dump_context(context);
    hang();
}

extern "C" fn isr_breakpoint(_context: &InterruptContext) {
    info!("breakpoint hit");
}

/// Install handlers for all CPU exceptions and the fatal vector.
pub unsafe fn init() {
    for vector in 0..32 {
        isr_set(vector, Some(isr_fatal));
    }
    isr_set(TRAP_FATAL, Some(isr_fatal));

    isr_set(EXCEPTION_BREAKPOINT, Some(isr_breakpoint));
}
