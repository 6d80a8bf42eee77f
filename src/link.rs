//! Byte transport and packet framing.

use core::fmt;

use crate::{BootError, BootResult};

/// Negative acknowledgement byte. The command set starts at 0x01, so zero
/// is unambiguous on the wire.
pub const NACK: u8 = 0x00;

/// Upper bound for one formatted diagnostic string.
pub const TEXT_MAX: usize = 512;

/// Maximum wait for any single reception.
pub const RECV_TIMEOUT_MS: u32 = 5_000;

/// Metadata bytes ahead of each chunk body: done flag, record count and
/// the nibble-packed size of the next body.
pub const CHUNK_HEADER: usize = 4;

const DONE_FLAG: usize = 0;
const RECORD_COUNT: usize = 1;
const NEXT_SIZE_HI: usize = 2;
const NEXT_SIZE_LO: usize = 3;

/// Blocking byte link to the host. Bytes arrive in order; reads complete
/// only when the requested count has arrived or the deadline has elapsed.
pub trait Serial {
    fn send(&mut self, bytes: &[u8]) -> BootResult;
    fn recv_exact(&mut self, buf: &mut [u8], timeout_ms: u32) -> BootResult;
}

impl<T: Serial + ?Sized> Serial for &mut T {
    fn send(&mut self, bytes: &[u8]) -> BootResult {
        (**self).send(bytes)
    }

    fn recv_exact(&mut self, buf: &mut [u8], timeout_ms: u32) -> BootResult {
        (**self).recv_exact(buf, timeout_ms)
    }
}

/// Read the 3-byte command header: declared length (little-endian) in
/// bytes 0..1, command id in byte 2.
pub fn recv_command<S: Serial>(serial: &mut S) -> BootResult<(u16, u8)> {
    let mut header = [0u8; 3];
    serial.recv_exact(&mut header, RECV_TIMEOUT_MS)?;
    Ok((u16::from_le_bytes([header[0], header[1]]), header[2]))
}

/// One received flashing chunk, viewed in the caller's working buffer.
pub struct Chunk<'a> {
    buf: &'a [u8],
    body_len: usize,
}

impl Chunk<'_> {
    pub fn is_last(&self) -> bool {
        self.buf[DONE_FLAG] == 0x01
    }

    pub fn record_count(&self) -> u8 {
        self.buf[RECORD_COUNT]
    }

    /// Body length of the next chunk. The host packs the 16-bit hint with
    /// a 4-bit shift, so values cap at 0xFFF.
    pub fn next_size(&self) -> usize {
        ((self.buf[NEXT_SIZE_HI] as usize) << 4) | self.buf[NEXT_SIZE_LO] as usize
    }

    /// The ASCII record stream.
    pub fn body(&self) -> &[u8] {
        &self.buf[CHUNK_HEADER..CHUNK_HEADER + self.body_len]
    }
}

/// Receive the 4 metadata bytes and `body_len` body bytes into `buf`.
pub fn recv_chunk<'a, S: Serial>(
    serial: &mut S,
    buf: &'a mut [u8],
    body_len: usize,
) -> BootResult<Chunk<'a>> {
    let total = CHUNK_HEADER + body_len;
    if total > buf.len() {
        return Err(BootError::Io);
    }
    serial.recv_exact(&mut buf[..total], RECV_TIMEOUT_MS)?;
    Ok(Chunk { buf, body_len })
}

/// Positive acknowledgement: a single byte equal to the command id.
pub fn send_ack<S: Serial>(serial: &mut S, cmd: u8) -> BootResult {
    serial.send(&[cmd])
}

pub fn send_nack<S: Serial>(serial: &mut S) -> BootResult {
    serial.send(&[NACK])
}

struct TextBuf {
    buf: [u8; TEXT_MAX],
    len: usize,
}

impl fmt::Write for TextBuf {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        // Overlong messages are clipped, not failed.
        let n = s.len().min(TEXT_MAX - self.len);
        self.buf[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
        self.len += n;
        Ok(())
    }
}

/// Format and transmit a diagnostic string of at most [`TEXT_MAX`] bytes.
pub fn send_text<S: Serial>(serial: &mut S, args: fmt::Arguments<'_>) -> BootResult {
    let mut text = TextBuf {
        buf: [0; TEXT_MAX],
        len: 0,
    };
    let _ = fmt::Write::write_fmt(&mut text, args);
    serial.send(&text.buf[..text.len])
}
