// Copyright 2023 The Petrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Describes the layout of the 32-bit virtual address space.
//!
//! The address space is split at [`PHYS_BASE`]: everything below
//! it is user virtual memory, everything at or above it belongs
//! to the kernel. Virtual addresses are represented by the
//! [`VirtAddr`] type, which provides the page arithmetic the
//! rest of the kernel relies on.
//!
//! # Layout
//!
//! ```text
//! 0xffff_ffff  +------------------+
//!              |      kernel      |
//! 0xc000_0000  +------------------+  <- PHYS_BASE
//!              |    user stack    |  (grows down)
//!              |        ...       |
//!              |   user binary    |
//! 0x0000_1000  +------------------+
//!              |  page 0, unmapped|
//! 0x0000_0000  +------------------+
//! ```

#![no_std]
#![deny(clippy::missing_panics_doc)]
#![allow(clippy::panic)]
#![deny(clippy::wildcard_imports)]
#![forbid(unsafe_code)]

use core::convert::TryFrom;
use core::fmt;
use core::ops::{Add, Sub};

/// The number of bits in a page offset.
///
pub const PGBITS: u32 = 12;

/// The size of a virtual page in bytes.
///
pub const PGSIZE: usize = 1 << PGBITS;

/// The base address of kernel virtual memory, which is also the
/// exclusive upper bound on user virtual addresses.
///
pub const PHYS_BASE: VirtAddr = VirtAddr::new(0xc000_0000);

/// A virtual address in the 32-bit address space.
///
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct VirtAddr(u32);

impl VirtAddr {
    /// Returns the given virtual address.
    ///
    pub const fn new(addr: u32) -> Self {
        VirtAddr(addr)
    }

    /// Returns the zero address.
    ///
    pub const fn zero() -> Self {
        VirtAddr(0)
    }

    /// Returns the address as a `u32`.
    ///
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the address as a `usize`.
    ///
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Returns the address of the page containing this address,
    /// that is, the address rounded down to the nearest page
    /// boundary.
    ///
    pub const fn page_base(self) -> VirtAddr {
        VirtAddr(self.0 & !((PGSIZE as u32) - 1))
    }

    /// Returns the address rounded up to the nearest page
    /// boundary, saturating at the top of the address space.
    ///
    pub const fn page_round_up(self) -> VirtAddr {
        match self.0.checked_add((PGSIZE as u32) - 1) {
            Some(up) => VirtAddr(up & !((PGSIZE as u32) - 1)),
            None => VirtAddr(!((PGSIZE as u32) - 1)),
        }
    }

    /// Returns the offset of this address within its page.
    ///
    pub const fn page_offset(self) -> usize {
        (self.0 as usize) & (PGSIZE - 1)
    }

    /// Returns whether the address lies on a page boundary.
    ///
    pub const fn is_page_aligned(self) -> bool {
        self.page_offset() == 0
    }

    /// Returns whether the address is a user virtual address.
    ///
    pub const fn is_user(self) -> bool {
        self.0 < PHYS_BASE.0
    }

    /// Returns `self + offset`, or `None` if the sum would wrap
    /// the address space.
    ///
    pub fn checked_add(self, offset: usize) -> Option<VirtAddr> {
        let offset = u32::try_from(offset).ok()?;
        self.0.checked_add(offset).map(VirtAddr)
    }
}

impl Add<usize> for VirtAddr {
    type Output = VirtAddr;

    /// # Panics
    ///
    /// Panics if the sum would wrap the address space.
    ///
    fn add(self, offset: usize) -> VirtAddr {
        self.checked_add(offset)
            .unwrap_or_else(|| panic!("virtual address {:p} + {} wraps", self, offset))
    }
}

impl Sub<usize> for VirtAddr {
    type Output = VirtAddr;

    /// # Panics
    ///
    /// Panics if the difference would underflow.
    ///
    fn sub(self, offset: usize) -> VirtAddr {
        match u32::try_from(offset).ok().and_then(|n| self.0.checked_sub(n)) {
            Some(addr) => VirtAddr(addr),
            None => panic!("virtual address {:p} - {} underflows", self, offset),
        }
    }
}

impl Sub<VirtAddr> for VirtAddr {
    type Output = usize;

    /// # Panics
    ///
    /// Panics if `other` is larger than `self`.
    ///
    fn sub(self, other: VirtAddr) -> usize {
        if other.0 > self.0 {
            panic!("virtual address {:p} - {:p} underflows", self, other);
        }

        (self.0 - other.0) as usize
    }
}

impl fmt::Pointer for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_arithmetic() {
        let addr = VirtAddr::new(0x1234_5678);
        assert_eq!(addr.page_base(), VirtAddr::new(0x1234_5000));
        assert_eq!(addr.page_offset(), 0x678);
        assert_eq!(addr.page_round_up(), VirtAddr::new(0x1234_6000));
        assert!(!addr.is_page_aligned());
        assert!(addr.page_base().is_page_aligned());

        let aligned = VirtAddr::new(0x8000_0000);
        assert_eq!(aligned.page_round_up(), aligned);
    }

    #[test]
    fn user_kernel_split() {
        assert!(VirtAddr::new(0x0000_1000).is_user());
        assert!((PHYS_BASE - 1_usize).is_user());
        assert!(!PHYS_BASE.is_user());
        assert!(!VirtAddr::new(0xffff_ffff).is_user());
    }

    #[test]
    fn checked_add() {
        let addr = VirtAddr::new(0xffff_f000);
        assert_eq!(addr.checked_add(0xfff), Some(VirtAddr::new(0xffff_ffff)));
        assert_eq!(addr.checked_add(0x1000), None);

        assert_eq!(VirtAddr::new(0x1000) + PGSIZE, VirtAddr::new(0x2000));
        assert_eq!(VirtAddr::new(0x2000) - VirtAddr::new(0x1000), PGSIZE);
    }
}
