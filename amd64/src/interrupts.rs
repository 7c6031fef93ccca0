use core::arch::asm;

/// RFLAGS bit that controls whether maskable interrupts are serviced.
pub const RFLAGS_INTERRUPT: u64 = 1 << 9;
/// RFLAGS direction flag.
pub const RFLAGS_DIRECTION: u64 = 1 << 10;

/// Enable interrupts on the current CPU.
#[inline]
pub unsafe fn enable() {
    asm!("sti", options(nomem, nostack));
}

/// Disable interrupts on the current CPU.
#[inline]
pub unsafe fn disable() {
    asm!("cli", options(nomem, nostack));
}

/// Read the RFLAGS register.
#[inline]
pub unsafe fn read_rflags() -> u64 {
    let rflags: u64;
    asm!("pushfq", "pop {}", out(reg) rflags, options(nomem));
    rflags
}

/// Write the RFLAGS register. This can enable or disable interrupts,
/// depending on the interrupt bit of the written value.
#[inline]
pub unsafe fn write_rflags(rflags: u64) {
    asm!("push {}", "popfq", in(reg) rflags, options(nomem));
}
