//! The torito kernel: a small x86-64 kernel booted from an El-Torito ISO by
//! a two-stage loader that leaves the CPU in long mode with the layout
//! described in `kmem::layout`. This crate ties the memory core together
//! and owns interrupt dispatch.

#![cfg_attr(not(test), no_std)]

#[macro_use]
extern crate log;
#[macro_use]
extern crate static_assertions;

pub mod acpi;
pub mod diagnostics;
pub mod globals;
pub mod interrupts;
pub mod mem;
mod panic;

// This kernel is 64 bit only; `usize` casts of addresses rely on it.
assert_eq_size!(usize, u64);

mod selectors {
    use amd64::segments::Selector;

    pub const KERNEL_CODE: Selector = Selector(8);
    #[allow(dead_code)]
    pub const KERNEL_DATA: Selector = Selector(16);
}

/// Rust entry point, called by the loader after the jump to long mode.
/// Interrupts are disabled until the whole core is up.
#[no_mangle]
pub extern "C" fn kernel_main() -> ! {
    diagnostics::init();
    info!("torito starting");

    // Memory: normalize the BIOS map, walk the ACPI tables (which extends
    // the boot page table and adds regions), then build the real kernel
    // page table and the frame database on top of the finished map.
    unsafe {
        kmem::pmap::init();
    }
    acpi::init();
    unsafe {
        mem::page_init();
    }

    // Interrupts: thunks, IDT, dispatchers, then the exception handlers.
    unsafe {
        interrupts::init();
        interrupts::exception::init();
    }

    cpu_ident();

    unsafe {
        amd64::interrupts::enable();
    }
    info!("bring-up complete");

    unsafe { amd64::hang() }
}

/// Log what the CPU says about itself.
fn cpu_ident() {
    let (_, b, c, d) = amd64::cpuid::cpuid(0);

    let mut vendor = [0_u8; 12];
    vendor[0..4].copy_from_slice(&b.to_le_bytes());
    vendor[4..8].copy_from_slice(&d.to_le_bytes());
    vendor[8..12].copy_from_slice(&c.to_le_bytes());

    let (version, ..) = amd64::cpuid::cpuid(1);
    info!(
        "cpu: {} family {:#x} model {:#x} stepping {:#x}",
        core::str::from_utf8(&vendor).unwrap_or("<unknown>"),
        (version >> 8) & 0xF,
        (version >> 4) & 0xF,
        version & 0xF,
    );
}
