//! Physical memory management for the kernel: the normalized physical memory
//! map, the page frame database, the kernel page table builder and the
//! per-address-space paging API.

#![cfg_attr(not(test), no_std)]

#[macro_use]
extern crate log;
#[macro_use]
extern crate static_assertions;

pub mod builder;
pub mod layout;
pub mod paging;
pub mod pfdb;
pub mod pmap;

#[cfg(test)]
mod testutil;

/// Number of trailing zeros in a page aligned address.
pub const PAGE_SHIFT: u32 = 12;

/// Number of trailing zeros in a large page aligned address.
pub const PAGE_SHIFT_LARGE: u32 = 21;

/// Number of trailing zeros in a huge page aligned address.
pub const PAGE_SHIFT_HUGE: u32 = 30;

/// Size of a normal page, 4 KiB.
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// Size of a large page, 2 MiB.
pub const PAGE_SIZE_LARGE: u64 = 1 << PAGE_SHIFT_LARGE;

/// Size of a huge page, 1 GiB.
pub const PAGE_SIZE_HUGE: u64 = 1 << PAGE_SHIFT_HUGE;
