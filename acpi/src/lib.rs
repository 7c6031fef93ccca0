//! Typed, read-only views over the ACPI firmware tables. The in-memory layout
//! of every structure here is an external ABI defined by the ACPI
//! specification, hence all the `repr(C, packed)`.

#![cfg_attr(not(test), no_std)]

pub mod util;
mod fadt;
mod madt;
mod mcfg;
mod rsdp;
mod sdt;

pub use self::fadt::*;
pub use self::madt::*;
pub use self::mcfg::*;
pub use self::rsdp::*;
pub use self::sdt::*;

use amd64::VirtAddr;

pub trait AcpiTable {
    fn is_valid(&self) -> bool;
    fn length(&self) -> usize;
    fn from_any(any: &AnySdt) -> Option<&Self>;
}

/// Header of an ACPI system description table.
#[repr(C, packed)]
pub struct SdtHeader {
    signature: [u8; 4],
    length: u32,
    revision: u8,
    checksum: u8,
    oem_id: [u8; 6],
    oem_table_id: [u8; 8],
    oem_revision: u32,
    creator_id: [u8; 4],
    creator_revision: u32,
}

impl SdtHeader {
    pub fn signature(&self) -> &[u8; 4] {
        &self.signature
    }

    pub fn length(&self) -> usize {
        self.length as usize
    }

    pub fn oem_id(&self) -> &[u8; 6] {
        &self.oem_id
    }

    pub fn oem_table_id(&self) -> &[u8; 8] {
        &self.oem_table_id
    }

    pub fn oem_revision(&self) -> u32 {
        self.oem_revision
    }

    pub fn creator_id(&self) -> &[u8; 4] {
        &self.creator_id
    }
}

/// A generic ACPI table that provides only access to the header that is
/// common to all ACPI tables.
#[repr(C, packed)]
pub struct AnySdt {
    header: SdtHeader,
}

impl AcpiTable for AnySdt {
    fn is_valid(&self) -> bool {
        unsafe { util::acpi_table_checksum(self) == 0 }
    }

    fn length(&self) -> usize {
        self.header.length()
    }

    fn from_any(any: &AnySdt) -> Option<&Self> {
        Some(any)
    }
}

impl AnySdt {
    pub fn signature(&self) -> &[u8; 4] {
        self.header.signature()
    }

    pub fn header(&self) -> &SdtHeader {
        &self.header
    }
}

/// Acquire a reference to an ACPI table from a raw virtual address. This
/// function ensures that the memory area pointed to contains a valid ACPI
/// table of the requested type.
pub unsafe fn table_from_raw<T: AcpiTable>(table_addr: VirtAddr) -> Option<&'static T> {
    let table: *const T = table_addr.as_ptr();
    if (*table).is_valid() {
        Some(&*table)
    } else {
        None
    }
}
