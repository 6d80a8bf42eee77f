//! The flash seam and the per-packet programming loop.

use crate::record::{Record, RecordType};
use crate::{APP_BASE, BOOTLOADER_SIZE, BootError, BootResult, FLASH_BASE, MAX_TIMEOUT, OK};

/// Thin shim over the flash controller. The programmer owns the
/// controller between `unlock` and `lock`; nothing else touches it in
/// that window.
pub trait Flash {
    fn unlock(&mut self) -> BootResult;
    fn lock(&mut self);
    /// Erase the listed sectors. Ok only when every sector reports the
    /// controller's no-error sentinel.
    fn erase(&mut self, sectors: &[u8]) -> BootResult;
    fn program_byte(&mut self, addr: u32, value: u8) -> BootResult;
}

impl<T: Flash + ?Sized> Flash for &mut T {
    fn unlock(&mut self) -> BootResult {
        (**self).unlock()
    }

    fn lock(&mut self) {
        (**self).lock()
    }

    fn erase(&mut self, sectors: &[u8]) -> BootResult {
        (**self).erase(sectors)
    }

    fn program_byte(&mut self, addr: u32, value: u8) -> BootResult {
        (**self).program_byte(addr, value)
    }
}

/// Cross-record address state for one flashing session.
pub struct AddressContext {
    /// Upper 16 bits for data record targets, set by the most recent
    /// extended linear address record.
    pub high_word: u16,
    /// Entry point announced by a start linear address record.
    pub start_addr: Option<u32>,
}

impl AddressContext {
    /// High word implied by the flash base until an extended linear
    /// address record says otherwise.
    pub const SEED_HIGH_WORD: u16 = (FLASH_BASE >> 16) as u16;

    pub fn new() -> AddressContext {
        AddressContext {
            high_word: Self::SEED_HIGH_WORD,
            start_addr: None,
        }
    }
}

impl Default for AddressContext {
    fn default() -> AddressContext {
        AddressContext::new()
    }
}

/// How a fully consumed packet left the transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketOutcome {
    /// More records are expected in later packets.
    Continue,
    /// An end-of-file record closed the image.
    Complete,
}

enum Applied {
    /// Record consumed; ASCII span to advance the cursor by.
    Record(usize),
    Eof,
}

/// Apply every record in `body` to flash.
///
/// Records are consumed in index order. A record that fails to parse,
/// validate or program does not advance the cursor; it counts toward
/// [`MAX_TIMEOUT`], after which the packet aborts with
/// [`BootError::Overrun`]. The high word reseeds to the flash base on
/// every packet, so extended linear address records take effect for the
/// remainder of their own packet.
pub fn flash_packet<F: Flash>(
    flash: &mut F,
    ctx: &mut AddressContext,
    body: &[u8],
    record_count: u8,
) -> BootResult<PacketOutcome> {
    ctx.high_word = AddressContext::SEED_HIGH_WORD;

    let mut cursor = 0usize;
    let mut index = 0u8;
    let mut failures = 0u8;

    while index < record_count {
        match apply_record(flash, ctx, body, cursor) {
            Ok(Applied::Eof) => return Ok(PacketOutcome::Complete),
            Ok(Applied::Record(span)) => {
                cursor += span;
                index += 1;
            }
            Err(err) => {
                log::warn!("record {} rejected: {:?}", index, err);
                failures += 1;
                if failures >= MAX_TIMEOUT {
                    return Err(BootError::Overrun);
                }
            }
        }
    }

    Ok(PacketOutcome::Continue)
}

fn apply_record<F: Flash>(
    flash: &mut F,
    ctx: &mut AddressContext,
    body: &[u8],
    cursor: usize,
) -> BootResult<Applied> {
    let record = Record::parse(body, cursor)?;

    match record.record_type {
        RecordType::EndOfFile => Ok(Applied::Eof),
        RecordType::Data => {
            let target = record.validate(ctx.high_word)?;
            program_record(flash, &record, target)?;
            Ok(Applied::Record(record.span()))
        }
        RecordType::ExtLinearAddr => {
            ctx.high_word = ((record.data[0] as u16) << 8) | record.data[1] as u16;
            Ok(Applied::Record(record.span()))
        }
        RecordType::StartLinearAddr => {
            ctx.start_addr = Some(u32::from_be_bytes([
                record.data[0],
                record.data[1],
                record.data[2],
                record.data[3],
            ]));
            Ok(Applied::Record(record.span()))
        }
        RecordType::ExtSegmentAddr => Err(BootError::BadRecordType),
    }
}

/// Program one validated data record byte by byte, in ascending offset
/// order. Wire addresses are displaced by the loader region before
/// programming; no byte may land below [`APP_BASE`].
fn program_record<F: Flash>(flash: &mut F, record: &Record, target: u32) -> BootResult {
    for (i, value) in record.payload().iter().enumerate() {
        let addr = target + BOOTLOADER_SIZE + i as u32;
        if addr < APP_BASE {
            return Err(BootError::AddressOutOfRange);
        }
        flash.program_byte(addr, *value)?;
    }
    OK
}

#[cfg(test)]
pub(crate) struct MockFlash {
    pub writes: [(u32, u8); 64],
    pub write_count: usize,
    pub unlocked: bool,
    pub unlock_calls: usize,
    pub lock_calls: usize,
    pub erased_sectors: usize,
    pub fail_erase: bool,
    pub fail_program: bool,
}

#[cfg(test)]
impl MockFlash {
    pub fn new() -> MockFlash {
        MockFlash {
            writes: [(0, 0); 64],
            write_count: 0,
            unlocked: false,
            unlock_calls: 0,
            lock_calls: 0,
            erased_sectors: 0,
            fail_erase: false,
            fail_program: false,
        }
    }

    pub fn written(&self) -> &[(u32, u8)] {
        &self.writes[..self.write_count]
    }
}

#[cfg(test)]
impl Flash for MockFlash {
    fn unlock(&mut self) -> BootResult {
        self.unlocked = true;
        self.unlock_calls += 1;
        OK
    }

    fn lock(&mut self) {
        self.unlocked = false;
        self.lock_calls += 1;
    }

    fn erase(&mut self, sectors: &[u8]) -> BootResult {
        if self.fail_erase {
            return Err(BootError::EraseFailed);
        }
        self.erased_sectors += sectors.len();
        OK
    }

    fn program_byte(&mut self, addr: u32, value: u8) -> BootResult {
        if self.fail_program {
            return Err(BootError::ProgramFailed);
        }
        self.writes[self.write_count] = (addr, value);
        self.write_count += 1;
        OK
    }
}
