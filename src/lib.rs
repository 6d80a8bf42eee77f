//! Serial flash loader core: framed packet reception, Intel HEX-style
//! record handling and sector programming for the application region of
//! an internal NOR flash. Board specifics enter through the [`link::Serial`]
//! and [`program::Flash`] traits.

#![no_std]

pub mod boot;
pub mod link;
pub mod program;
pub mod record;
pub mod session;

/// Base of the on-chip flash.
pub const FLASH_BASE: u32 = 0x0800_0000;

/// Size of the region reserved for the loader itself (32 KiB).
pub const BOOTLOADER_SIZE: u32 = 0x8000;

/// First address a record may target.
pub const APP_BASE: u32 = FLASH_BASE + BOOTLOADER_SIZE;

/// Last address a record may target.
pub const APP_MAX: u32 = 0x0805_FFFF;

/// Bank-1 sectors covering the application region.
pub const APP_SECTORS: &[u8] = &[2, 3, 4, 5];

/// Payload byte count bounds for one record.
pub const MIN_CC: u8 = 0x00;
pub const MAX_CC: u8 = 0x10;

/// Counted failures tolerated before a packet or a session is abandoned.
pub const MAX_TIMEOUT: u8 = 5;

/// Size of the per-session working buffer.
pub const DATA_BUFFER_SIZE: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootError {
    /// The transport failed mid-transfer.
    Io,
    /// The transport produced no data before the deadline.
    Timeout,
    /// A record's stated checksum does not match the recomputed one.
    BadChecksum,
    /// A data record targets an address outside the application region.
    AddressOutOfRange,
    /// A record's byte count falls outside `[MIN_CC, MAX_CC]`.
    BadByteCount,
    /// The record type field holds an unassigned value.
    BadRecordType,
    /// The packet body ends before the record it claims to hold.
    Truncated,
    /// Sector erase did not report the no-error sentinel.
    EraseFailed,
    /// A byte program operation returned non-OK.
    ProgramFailed,
    /// Too many counted failures; the transfer is abandoned.
    Overrun,
    /// The command id is not part of the command set.
    UnknownCommand,
    /// The application's initial stack pointer is not a RAM address.
    AppStackInvalid,
    /// The application's reset vector is not in the application region.
    AppResetInvalid,
}

pub type BootResult<T = ()> = Result<T, BootError>;

/// Shorthand for the all-clear result.
pub const OK: BootResult = Ok(());
