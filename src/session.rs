//! Command dispatch and the multi-packet flashing loop.

use crate::link::{self, Serial};
use crate::program::{self, AddressContext, Flash, PacketOutcome};
use crate::{APP_SECTORS, BootError, BootResult, DATA_BUFFER_SIZE, MAX_TIMEOUT, OK};

/// Loader version reported to the host.
pub const VERSION: (u8, u8, u8) = (1, 1, 1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    GetVersion = 0x01,
    GetHelp = 0x02,
    GetId = 0x03,
    FlashApplication = 0x04,
    FlashErase = 0x05,
    MemRead = 0x06,
    OtpRead = 0x07,
}

impl TryFrom<u8> for Command {
    type Error = BootError;

    fn try_from(raw: u8) -> Result<Command, BootError> {
        match raw {
            0x01 => Ok(Command::GetVersion),
            0x02 => Ok(Command::GetHelp),
            0x03 => Ok(Command::GetId),
            0x04 => Ok(Command::FlashApplication),
            0x05 => Ok(Command::FlashErase),
            0x06 => Ok(Command::MemRead),
            0x07 => Ok(Command::OtpRead),
            _ => Err(BootError::UnknownCommand),
        }
    }
}

/// What a completed poll round did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Command handled without touching the application image.
    Handled(Command),
    /// A full application image was received and programmed.
    Flashed,
}

/// One host session: idle between commands, flashing inside
/// `FlashApplication`. The working buffer is borrowed for the session
/// lifetime and zeroed between packets.
pub struct Session<'a, S: Serial, F: Flash> {
    serial: S,
    flash: F,
    buf: &'a mut [u8; DATA_BUFFER_SIZE],
}

impl<'a, S: Serial, F: Flash> Session<'a, S, F> {
    pub fn new(serial: S, flash: F, buf: &'a mut [u8; DATA_BUFFER_SIZE]) -> Session<'a, S, F> {
        Session { serial, flash, buf }
    }

    /// Receive and handle one host command.
    pub fn poll(&mut self) -> BootResult<SessionEvent> {
        let (declared_len, raw) = link::recv_command(&mut self.serial)?;
        let cmd = match Command::try_from(raw) {
            Ok(cmd) => cmd,
            Err(err) => {
                link::send_nack(&mut self.serial)?;
                return Err(err);
            }
        };
        log::debug!("command {:?}, declared length {}", cmd, declared_len);

        match cmd {
            Command::GetVersion => self.send_version()?,
            Command::FlashApplication => {
                self.update_firmware(declared_len as usize)?;
                return Ok(SessionEvent::Flashed);
            }
            Command::FlashErase => self.erase_application()?,
            // Declared commands with no behavior yet; acknowledged so the
            // host can probe for them.
            Command::GetHelp | Command::GetId | Command::MemRead | Command::OtpRead => {
                link::send_ack(&mut self.serial, cmd as u8)?;
            }
        }

        Ok(SessionEvent::Handled(cmd))
    }

    fn send_version(&mut self) -> BootResult {
        let (major, minor, patch) = VERSION;
        link::send_text(
            &mut self.serial,
            format_args!("Bootloader Version: {}.{}.{}\r\n", major, minor, patch),
        )
    }

    fn erase_application(&mut self) -> BootResult {
        self.flash.unlock()?;
        let erased = self.flash.erase(APP_SECTORS);
        self.flash.lock();

        match erased {
            Ok(()) => link::send_ack(&mut self.serial, Command::FlashErase as u8),
            Err(err) => {
                link::send_nack(&mut self.serial)?;
                Err(err)
            }
        }
    }

    /// Erase the application region, then receive and program packets
    /// until the terminal one. The flash stays unlocked for the whole
    /// transfer and is locked again on every exit path.
    fn update_firmware(&mut self, first_len: usize) -> BootResult {
        link::send_ack(&mut self.serial, Command::FlashApplication as u8)?;

        self.flash.unlock()?;
        let result = self.flash_loop(first_len);
        self.flash.lock();

        if let Err(err) = result {
            log::warn!("firmware update abandoned: {:?}", err);
        }
        result
    }

    fn flash_loop(&mut self, first_len: usize) -> BootResult {
        let mut ctx = AddressContext::new();
        let mut body_len = first_len;
        let mut erased = false;
        let mut failures = 0u8;
        let mut failed: Option<BootError> = None;

        loop {
            let (last, next_len, outcome) = {
                let chunk = link::recv_chunk(&mut self.serial, &mut self.buf[..], body_len)?;

                // The erase waits for the first chunk to actually arrive.
                if !erased {
                    self.flash.erase(APP_SECTORS)?;
                    erased = true;
                }

                let outcome = program::flash_packet(
                    &mut self.flash,
                    &mut ctx,
                    chunk.body(),
                    chunk.record_count(),
                );
                (chunk.is_last(), chunk.next_size(), outcome)
            };

            match outcome {
                Ok(disposition) => {
                    link::send_ack(&mut self.serial, Command::FlashApplication as u8)?;
                    if disposition == PacketOutcome::Complete {
                        log::info!("image complete after end-of-file record");
                        return OK;
                    }
                }
                Err(err) => {
                    link::send_nack(&mut self.serial)?;
                    failures += 1;
                    if failed.is_none() {
                        failed = Some(err);
                    }
                }
            }

            self.buf.fill(0);

            if last {
                return match failed {
                    None => OK,
                    Some(err) => Err(err),
                };
            }
            if failures >= MAX_TIMEOUT {
                return Err(BootError::Overrun);
            }
            body_len = next_len;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::MockFlash;
    use crate::record::encode;

    struct ScriptSerial<'a> {
        rx: &'a [u8],
        rx_pos: usize,
        tx: [u8; 64],
        tx_len: usize,
    }

    impl<'a> ScriptSerial<'a> {
        fn new(rx: &'a [u8]) -> ScriptSerial<'a> {
            ScriptSerial {
                rx,
                rx_pos: 0,
                tx: [0; 64],
                tx_len: 0,
            }
        }

        fn sent(&self) -> &[u8] {
            &self.tx[..self.tx_len]
        }
    }

    impl Serial for ScriptSerial<'_> {
        fn send(&mut self, bytes: &[u8]) -> BootResult {
            self.tx[self.tx_len..self.tx_len + bytes.len()].copy_from_slice(bytes);
            self.tx_len += bytes.len();
            OK
        }

        fn recv_exact(&mut self, buf: &mut [u8], _timeout_ms: u32) -> BootResult {
            if self.rx_pos + buf.len() > self.rx.len() {
                return Err(BootError::Timeout);
            }
            buf.copy_from_slice(&self.rx[self.rx_pos..self.rx_pos + buf.len()]);
            self.rx_pos += buf.len();
            OK
        }
    }

    /// Append a FlashApplication command header for `body_len` bytes.
    fn push_command(rx: &mut [u8], at: usize, body_len: u16, cmd: u8) -> usize {
        rx[at] = body_len as u8;
        rx[at + 1] = (body_len >> 8) as u8;
        rx[at + 2] = cmd;
        at + 3
    }

    /// Append one chunk: metadata then body.
    fn push_chunk(rx: &mut [u8], at: usize, done: u8, records: u8, next: u16, body: &[u8]) -> usize {
        rx[at] = done;
        rx[at + 1] = records;
        rx[at + 2] = (next >> 4) as u8;
        rx[at + 3] = (next & 0x0F) as u8;
        rx[at + 4..at + 4 + body.len()].copy_from_slice(body);
        at + 4 + body.len()
    }

    fn run_session(rx: &[u8], flash: &mut MockFlash) -> (BootResult<SessionEvent>, [u8; 64], usize) {
        let mut serial = ScriptSerial::new(rx);
        let mut buf = [0u8; DATA_BUFFER_SIZE];
        let result = Session::new(&mut serial, &mut *flash, &mut buf).poll();
        (result, serial.tx, serial.tx_len)
    }

    #[test]
    fn get_version_reports_the_triple() {
        let mut flash = MockFlash::new();
        let (result, tx, tx_len) = run_session(&[0x00, 0x00, 0x01], &mut flash);

        assert_eq!(result, Ok(SessionEvent::Handled(Command::GetVersion)));
        assert_eq!(&tx[..tx_len], b"Bootloader Version: 1.1.1\r\n");
    }

    #[test]
    fn unknown_command_is_nacked() {
        let mut flash = MockFlash::new();
        let (result, tx, tx_len) = run_session(&[0x00, 0x00, 0x7F], &mut flash);

        assert_eq!(result, Err(BootError::UnknownCommand));
        assert_eq!(&tx[..tx_len], &[link::NACK]);
    }

    #[test]
    fn erase_command_acks_and_relocks() {
        let mut flash = MockFlash::new();
        let (result, tx, tx_len) = run_session(&[0x00, 0x00, 0x05], &mut flash);

        assert_eq!(result, Ok(SessionEvent::Handled(Command::FlashErase)));
        assert_eq!(&tx[..tx_len], &[0x05]);
        assert_eq!(flash.erased_sectors, APP_SECTORS.len());
        assert!(!flash.unlocked);
        assert_eq!(flash.lock_calls, 1);
    }

    #[test]
    fn erase_command_nacks_on_controller_error() {
        let mut flash = MockFlash::new();
        flash.fail_erase = true;
        let (result, tx, tx_len) = run_session(&[0x00, 0x00, 0x05], &mut flash);

        assert_eq!(result, Err(BootError::EraseFailed));
        assert_eq!(&tx[..tx_len], &[link::NACK]);
        assert!(!flash.unlocked);
    }

    #[test]
    fn stub_commands_are_acknowledged() {
        for cmd in [0x02u8, 0x03, 0x06, 0x07] {
            let mut flash = MockFlash::new();
            let (result, tx, tx_len) = run_session(&[0x00, 0x00, cmd], &mut flash);

            assert!(matches!(result, Ok(SessionEvent::Handled(_))));
            assert_eq!(&tx[..tx_len], &[cmd]);
            assert!(flash.written().is_empty());
        }
    }

    #[test]
    fn eof_only_image_flashes_nothing() {
        let mut body = [0u8; 32];
        let body_len = encode(&mut body, 0x0000, 0x01, &[]);

        let mut rx = [0u8; 64];
        let at = push_command(&mut rx, 0, body_len as u16, 0x04);
        let at = push_chunk(&mut rx, at, 0x00, 1, 0, &body[..body_len]);

        let mut flash = MockFlash::new();
        let (result, tx, tx_len) = run_session(&rx[..at], &mut flash);

        assert_eq!(result, Ok(SessionEvent::Flashed));
        // Ready ack, then the packet ack.
        assert_eq!(&tx[..tx_len], &[0x04, 0x04]);
        assert_eq!(flash.erased_sectors, APP_SECTORS.len());
        assert!(flash.written().is_empty());
        assert!(!flash.unlocked);
        assert_eq!(flash.unlock_calls, 1);
        assert_eq!(flash.lock_calls, 1);
    }

    #[test]
    fn single_data_record_lands_displaced_by_the_loader_region() {
        let mut body = [0u8; 32];
        let body_len = encode(&mut body, 0x8000, 0x00, &[0xDE, 0xAD, 0xBE, 0xEF]);

        let mut rx = [0u8; 64];
        let at = push_command(&mut rx, 0, body_len as u16, 0x04);
        let at = push_chunk(&mut rx, at, 0x01, 1, 0, &body[..body_len]);

        let mut flash = MockFlash::new();
        let (result, _, _) = run_session(&rx[..at], &mut flash);

        assert_eq!(result, Ok(SessionEvent::Flashed));
        assert_eq!(
            flash.written(),
            &[
                (0x0801_0000, 0xDE),
                (0x0801_0001, 0xAD),
                (0x0801_0002, 0xBE),
                (0x0801_0003, 0xEF),
            ]
        );
        assert!(!flash.unlocked);
    }

    #[test]
    fn extended_linear_address_applies_within_the_packet() {
        let mut body = [0u8; 64];
        let mut body_len = encode(&mut body, 0x0000, 0x04, &[0x08, 0x01]);
        body_len += encode(&mut body[body_len..], 0x0000, 0x00, &[0x01, 0x02, 0x03, 0x04]);

        let mut rx = [0u8; 96];
        let at = push_command(&mut rx, 0, body_len as u16, 0x04);
        let at = push_chunk(&mut rx, at, 0x01, 2, 0, &body[..body_len]);

        let mut flash = MockFlash::new();
        let (result, _, _) = run_session(&rx[..at], &mut flash);

        assert_eq!(result, Ok(SessionEvent::Flashed));
        assert_eq!(
            flash.written(),
            &[
                (0x0801_8000, 0x01),
                (0x0801_8001, 0x02),
                (0x0801_8002, 0x03),
                (0x0801_8003, 0x04),
            ]
        );
    }

    #[test]
    fn corrupt_packet_nacks_and_relocks() {
        let mut body = [0u8; 32];
        let body_len = encode(&mut body, 0x8000, 0x00, &[0xDE, 0xAD, 0xBE, 0xEF]);
        // Corrupt the stated checksum pair.
        body[body_len - 3] = b'0';
        body[body_len - 2] = b'0';

        let mut rx = [0u8; 64];
        let at = push_command(&mut rx, 0, body_len as u16, 0x04);
        let at = push_chunk(&mut rx, at, 0x01, 1, 0, &body[..body_len]);

        let mut flash = MockFlash::new();
        let (result, tx, tx_len) = run_session(&rx[..at], &mut flash);

        assert_eq!(result, Err(BootError::Overrun));
        assert_eq!(&tx[..tx_len], &[0x04, link::NACK]);
        assert!(flash.written().is_empty());
        assert!(!flash.unlocked);
        assert_eq!(flash.lock_calls, 1);
    }

    #[test]
    fn next_size_hint_drives_the_second_chunk() {
        let mut first_body = [0u8; 32];
        let first_len = encode(&mut first_body, 0x8000, 0x00, &[0x11]);
        let mut second_body = [0u8; 32];
        let second_len = encode(&mut second_body, 0x0000, 0x01, &[]);

        let mut rx = [0u8; 96];
        let at = push_command(&mut rx, 0, first_len as u16, 0x04);
        let at = push_chunk(
            &mut rx,
            at,
            0x00,
            1,
            second_len as u16,
            &first_body[..first_len],
        );
        let at = push_chunk(&mut rx, at, 0x00, 1, 0, &second_body[..second_len]);

        let mut flash = MockFlash::new();
        let (result, tx, tx_len) = run_session(&rx[..at], &mut flash);

        assert_eq!(result, Ok(SessionEvent::Flashed));
        assert_eq!(&tx[..tx_len], &[0x04, 0x04, 0x04]);
        assert_eq!(flash.written(), &[(0x0801_0000, 0x11)]);
        // One erase for the whole transfer.
        assert_eq!(flash.erased_sectors, APP_SECTORS.len());
    }

    #[test]
    fn transport_loss_mid_transfer_still_relocks() {
        let mut first_body = [0u8; 32];
        let first_len = encode(&mut first_body, 0x8000, 0x00, &[0x11]);

        let mut rx = [0u8; 64];
        let at = push_command(&mut rx, 0, first_len as u16, 0x04);
        // done_flag says more chunks follow, but the host goes silent.
        let at = push_chunk(&mut rx, at, 0x00, 1, 11, &first_body[..first_len]);

        let mut flash = MockFlash::new();
        let (result, _, _) = run_session(&rx[..at], &mut flash);

        assert_eq!(result, Err(BootError::Timeout));
        assert!(!flash.unlocked);
        assert_eq!(flash.lock_calls, 1);
    }

    #[test]
    fn erase_failure_aborts_before_programming() {
        let mut body = [0u8; 32];
        let body_len = encode(&mut body, 0x8000, 0x00, &[0x11]);

        let mut rx = [0u8; 64];
        let at = push_command(&mut rx, 0, body_len as u16, 0x04);
        let at = push_chunk(&mut rx, at, 0x01, 1, 0, &body[..body_len]);

        let mut flash = MockFlash::new();
        flash.fail_erase = true;
        let (result, tx, tx_len) = run_session(&rx[..at], &mut flash);

        assert_eq!(result, Err(BootError::EraseFailed));
        // Only the ready ack went out.
        assert_eq!(&tx[..tx_len], &[0x04]);
        assert!(flash.written().is_empty());
        assert!(!flash.unlocked);
    }
}
