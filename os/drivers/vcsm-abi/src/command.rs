//! # Control Command Word
//!
//! Commands are encoded like classic `ioctl` numbers: an 8-bit command
//! number, an 8-bit driver magic, the size of the record that travels with
//! the command and the transfer direction.

use bitfield_struct::bitfield;
use core::mem::size_of;

use crate::records::{
    AllocRecord, CacheRecord, CheckRecord, FreeRecord, LockCacheRecord, LockUnlockRecord,
    MapRecord, ResizeRecord, ShareRecord, SizeRecord, WalkRecord,
};

/// Driver magic placed in [`IoctlCommand::kind`].
pub const VCSM_MAGIC: u8 = b'I';

/// Direction of the record transfer, seen from the caller.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Direction {
    /// No record.
    None = 0,
    /// Caller writes, broker reads.
    Write = 1,
    /// Broker writes, caller reads.
    Read = 2,
    /// Record travels both ways.
    ReadWrite = 3,
}

impl Direction {
    #[inline]
    pub const fn into_bits(self) -> u8 {
        self as u8
    }

    #[inline]
    pub const fn from_bits(v: u8) -> Self {
        match v & 0b11 {
            0 => Self::None,
            1 => Self::Write,
            2 => Self::Read,
            _ => Self::ReadWrite,
        }
    }
}

/// Raw 32-bit command word.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct IoctlCommand {
    /// Command number within the driver's namespace.
    pub nr: u8, // bits 0..8

    /// Driver magic, always [`VCSM_MAGIC`] for this driver.
    pub kind: u8, // bits 8..16

    /// Size of the record that accompanies the command.
    #[bits(14)]
    pub size: u16, // bits 16..30

    /// Transfer direction.
    #[bits(2)]
    pub direction: Direction, // bits 30..32
}

/// Every request understood by the broker's control surface.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Command {
    Allocate = 0x5A,
    Share,
    Lock,
    LockWithCache,
    Unlock,
    Resize,
    Free,
    RemoteWalkAllocations,
    HostWalkMappings,
    HostWalkProcessAllocations,
    HostWalkProcessMappings,
    SizeOfHandle,
    CheckHandle,
    HandleFromAddress,
    RemoteHandleFromAddress,
    RemoteHandleFromHandle,
    AddressFromHandle,
    Flush,
    Invalidate,
}

impl Command {
    pub const ALL: [Self; 19] = [
        Self::Allocate,
        Self::Share,
        Self::Lock,
        Self::LockWithCache,
        Self::Unlock,
        Self::Resize,
        Self::Free,
        Self::RemoteWalkAllocations,
        Self::HostWalkMappings,
        Self::HostWalkProcessAllocations,
        Self::HostWalkProcessMappings,
        Self::SizeOfHandle,
        Self::CheckHandle,
        Self::HandleFromAddress,
        Self::RemoteHandleFromAddress,
        Self::RemoteHandleFromHandle,
        Self::AddressFromHandle,
        Self::Flush,
        Self::Invalidate,
    ];

    #[inline]
    #[must_use]
    pub const fn nr(self) -> u8 {
        self as u8
    }

    /// Size of the record carried by this command.
    #[must_use]
    pub const fn record_size(self) -> usize {
        match self {
            Self::Allocate => size_of::<AllocRecord>(),
            Self::Share => size_of::<ShareRecord>(),
            Self::Lock | Self::Unlock => size_of::<LockUnlockRecord>(),
            Self::LockWithCache => size_of::<LockCacheRecord>(),
            Self::Resize => size_of::<ResizeRecord>(),
            Self::Free => size_of::<FreeRecord>(),
            Self::RemoteWalkAllocations | Self::HostWalkMappings => 0,
            Self::HostWalkProcessAllocations | Self::HostWalkProcessMappings => {
                size_of::<WalkRecord>()
            }
            Self::SizeOfHandle => size_of::<SizeRecord>(),
            Self::CheckHandle => size_of::<CheckRecord>(),
            Self::HandleFromAddress
            | Self::RemoteHandleFromAddress
            | Self::RemoteHandleFromHandle
            | Self::AddressFromHandle => size_of::<MapRecord>(),
            Self::Flush | Self::Invalidate => size_of::<CacheRecord>(),
        }
    }

    /// Transfer direction of the record.
    #[must_use]
    pub const fn direction(self) -> Direction {
        match self {
            Self::RemoteWalkAllocations | Self::HostWalkMappings => Direction::None,
            Self::LockWithCache
            | Self::Free
            | Self::HostWalkProcessAllocations
            | Self::HostWalkProcessMappings
            | Self::Flush
            | Self::Invalidate => Direction::Write,
            _ => Direction::ReadWrite,
        }
    }

    /// Builds the command word for this command.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn encode(self) -> IoctlCommand {
        IoctlCommand::new()
            .with_nr(self.nr())
            .with_kind(VCSM_MAGIC)
            .with_size(self.record_size() as u16)
            .with_direction(self.direction())
    }

    /// Decodes a raw command word.
    ///
    /// Words with a foreign magic, an unknown number or a record size that
    /// does not match the command are rejected.
    #[must_use]
    pub fn decode(raw: u32) -> Option<Self> {
        let word = IoctlCommand::from_bits(raw);
        if word.kind() != VCSM_MAGIC {
            return None;
        }
        let command = Self::ALL.into_iter().find(|c| c.nr() == word.nr())?;
        (command.encode() == word).then_some(command)
    }
}
