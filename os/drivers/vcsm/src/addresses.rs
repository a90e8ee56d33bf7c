//! # Address Kinds
//!
//! The broker juggles three address spaces:
//!
//! * [`VirtualAddress`]: a host virtual address inside some process (or the kernel),
//! * [`PhysicalAddress`]: a host physical address,
//! * [`BusAddress`]: an address as the remote side sees it. Only the low 30 bits
//!   carry the offset into the shared window; the upper bits select a bus alias.
//!
//! The types only tag the *kind* of an address so the three never get mixed up.

use core::fmt;
use core::ops::Add;

/// Host page shift.
pub const PAGE_SHIFT: u32 = 12;

/// Host page size in bytes.
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// Bits of a [`BusAddress`] that address the shared window; the rest select the alias.
pub const BUS_ALIAS_MASK: u32 = 0x3FFF_FFFF;

/// Rounds `size` up to the next multiple of [`PAGE_SIZE`].
#[inline]
#[must_use]
pub const fn page_align_up(size: u64) -> Option<u64> {
    match size.checked_add(PAGE_SIZE - 1) {
        Some(v) => Some(v & !(PAGE_SIZE - 1)),
        None => None,
    }
}

/// Host virtual address.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualAddress(u64);

impl VirtualAddress {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_page_aligned(self) -> bool {
        self.0 & (PAGE_SIZE - 1) == 0
    }

    /// Base of the page containing this address.
    #[inline]
    #[must_use]
    pub const fn page_base(self) -> Self {
        Self(self.0 & !(PAGE_SIZE - 1))
    }
}

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VA(0x{:016X})", self.0)
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

impl Add<u64> for VirtualAddress {
    type Output = Self;

    #[inline]
    fn add(self, rhs: u64) -> Self {
        Self(self.0 + rhs)
    }
}

/// Host physical address.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalAddress(u64);

impl PhysicalAddress {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// The page frame containing this address.
    #[inline]
    #[must_use]
    pub const fn frame(self) -> PageFrame {
        PageFrame(self.0 >> PAGE_SHIFT)
    }
}

impl fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PA(0x{:016X})", self.0)
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

impl Add<u64> for PhysicalAddress {
    type Output = Self;

    #[inline]
    fn add(self, rhs: u64) -> Self {
        Self(self.0 + rhs)
    }
}

/// Address of remote memory as reported by the remote side.
///
/// Zero is the remote side's null address.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct BusAddress(u32);

impl BusAddress {
    pub const NULL: Self = Self(0);

    #[inline]
    #[must_use]
    pub const fn new(v: u32) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Translates into the host physical address space, given where the
    /// shared window starts physically.
    #[inline]
    #[must_use]
    pub const fn to_physical(self, window_base: PhysicalAddress) -> PhysicalAddress {
        PhysicalAddress(window_base.0 + (self.0 & BUS_ALIAS_MASK) as u64)
    }
}

impl fmt::Debug for BusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BUS(0x{:08X})", self.0)
    }
}

impl fmt::Display for BusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

/// Physical page frame number.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PageFrame(u64);

impl PageFrame {
    #[inline]
    #[must_use]
    pub const fn number(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        PhysicalAddress(self.0 << PAGE_SHIFT)
    }
}

/// Half-open range of host virtual addresses.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct VirtualRange {
    pub start: VirtualAddress,
    pub len: u64,
}

impl VirtualRange {
    #[inline]
    #[must_use]
    pub const fn new(start: VirtualAddress, len: u64) -> Self {
        Self { start, len }
    }

    #[inline]
    #[must_use]
    pub const fn end(&self) -> VirtualAddress {
        VirtualAddress(self.start.0 + self.len)
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, address: VirtualAddress) -> bool {
        address.0 >= self.start.0 && address.0 - self.start.0 < self.len
    }

    /// Base addresses of every page the range touches.
    #[allow(clippy::cast_possible_truncation)]
    pub fn pages(&self) -> impl Iterator<Item = VirtualAddress> + use<> {
        let first = self.start.page_base().0;
        let end = self.start.0 + self.len;
        (first..end)
            .step_by(PAGE_SIZE as usize)
            .map(VirtualAddress)
    }
}

/// Half-open range of host physical addresses.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct PhysicalRange {
    pub start: PhysicalAddress,
    pub len: u64,
}

impl PhysicalRange {
    #[inline]
    #[must_use]
    pub const fn new(start: PhysicalAddress, len: u64) -> Self {
        Self { start, len }
    }
}
