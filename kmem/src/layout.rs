//! The fixed physical memory layout the boot loader guarantees on kernel
//! entry. Everything below the kernel image is placed by the loader; the
//! kernel only ever fills in the contents.

use amd64::PhysAddr;

/// Interrupt descriptor table (256 x 16 bytes).
pub const IDT: PhysAddr = PhysAddr(0x0000_1000);
/// ISR function pointer table (256 x 8 bytes).
pub const ISR_TABLE: PhysAddr = PhysAddr(0x0000_2000);
/// ISR entry thunks (256 x 8 bytes, with overflow space).
pub const ISR_THUNKS: PhysAddr = PhysAddr(0x0000_2800);
/// Global descriptor table, copied here by the loader.
pub const GDT: PhysAddr = PhysAddr(0x0000_3000);
/// 64-bit task state segment, owning the IST stack pointers.
pub const TSS: PhysAddr = PhysAddr(0x0000_3100);

/// Root of the page table the loader booted with.
pub const BOOT_PAGETABLE: PhysAddr = PhysAddr(0x0001_0000);
/// First page of the boot page table that is still unused after loading.
pub const BOOT_PAGETABLE_LOADED: PhysAddr = PhysAddr(0x0001_4000);
/// End of the boot page table pool.
pub const BOOT_PAGETABLE_END: PhysAddr = PhysAddr(0x0002_0000);

/// Root of the kernel page table.
pub const KERNEL_PAGETABLE: PhysAddr = PhysAddr(0x0002_0000);
/// End of the scratch area that holds the kernel page table's pages.
pub const KERNEL_PAGETABLE_END: PhysAddr = PhysAddr(0x0007_0000);

/// The physical memory map, seeded from the BIOS E820 data by the loader.
pub const PMAP: PhysAddr = PhysAddr(0x0007_0000);

/// Dedicated stacks for the exceptions that run on an IST slot.
pub const STACK_NMI_BOTTOM: PhysAddr = PhysAddr(0x0008_A000);
pub const STACK_NMI_TOP: PhysAddr = PhysAddr(0x0008_C000);
pub const STACK_DF_BOTTOM: PhysAddr = PhysAddr(0x0008_C000);
pub const STACK_DF_TOP: PhysAddr = PhysAddr(0x0008_E000);
pub const STACK_MC_BOTTOM: PhysAddr = PhysAddr(0x0008_E000);
pub const STACK_MC_TOP: PhysAddr = PhysAddr(0x0009_0000);

/// Extended BIOS data area, scanned for the ACPI RSDP.
pub const EXTENDED_BIOS: PhysAddr = PhysAddr(0x0009_F800);
pub const EXTENDED_BIOS_SIZE: u64 = 0x0000_0800;

/// VGA memory mapped I/O.
pub const VIDEO: PhysAddr = PhysAddr(0x000A_0000);
pub const VIDEO_SIZE: u64 = 0x0002_0000;

/// System ROM shadow, the second RSDP scan window.
pub const SYSTEM_ROM: PhysAddr = PhysAddr(0x000C_0000);
pub const SYSTEM_ROM_SIZE: u64 = 0x0004_0000;

pub const STACK_INTERRUPT_BOTTOM: PhysAddr = PhysAddr(0x0010_0000);
pub const STACK_INTERRUPT_TOP: PhysAddr = PhysAddr(0x0020_0000);
pub const STACK_KERNEL_BOTTOM: PhysAddr = PhysAddr(0x0020_0000);
pub const STACK_KERNEL_TOP: PhysAddr = PhysAddr(0x0030_0000);

/// Load base of the kernel image.
pub const KERNEL_IMAGE: PhysAddr = PhysAddr(0x0030_0000);
/// The loader jumps here after switching to long mode.
pub const KERNEL_ENTRYPOINT: PhysAddr = PhysAddr(0x0030_1000);
/// Everything below this address is reserved for the kernel and its tables.
pub const KERNEL_IMAGE_END: PhysAddr = PhysAddr(0x00A0_0000);
