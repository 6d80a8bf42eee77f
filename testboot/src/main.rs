#![no_main]
#![no_std]

use cortex_m_semihosting::hprintln;
use log::{Level, Log, Metadata, Record};
use volatile_register::{RO, RW, WO};

use hexboot::link::Serial;
use hexboot::program::Flash;
use hexboot::session::{Session, SessionEvent};
use hexboot::{BootError, BootResult, DATA_BUFFER_SIZE, OK, boot};

struct Logger {}
impl Log for Logger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        hprintln!("[BL] LOG - {}", record.args());
    }

    fn flush(&self) {}
}
static LOGGER: Logger = Logger {};

#[cortex_m_rt::entry]
fn main() -> ! {
    unsafe {
        log::set_logger_racy(&LOGGER).unwrap();
        log::set_max_level_racy(Level::Info.to_level_filter());
    }

    hprintln!("[BL] Starting");

    let mut buf = [0u8; DATA_BUFFER_SIZE];
    let mut session = Session::new(UartPort::take(), FlashPort::take(), &mut buf);

    loop {
        match session.poll() {
            Ok(SessionEvent::Flashed) => {
                hprintln!("[BL] Image flashed, booting");
                let reason = boot::launch();
                hprintln!("[BL] Application rejected: {:?}", reason);
            }
            Ok(SessionEvent::Handled(cmd)) => {
                log::info!("handled {:?}", cmd);
            }
            // No host activity inside the window; keep listening.
            Err(BootError::Timeout) => (),
            Err(err) => {
                log::warn!("command failed: {:?}", err);
            }
        }
    }
}

#[panic_handler]
fn panic(_panic: &core::panic::PanicInfo<'_>) -> ! {
    loop {}
}

#[repr(C)]
struct UartRegisters {
    sr: RO<u32>,
    dr: RW<u32>,
}

struct UartPort {}

impl UartPort {
    const UART: *const UartRegisters = 0x4001_1000 as *const UartRegisters;

    const SR_RXNE: u32 = 1 << 5;
    const SR_TXE: u32 = 1 << 7;

    /// Poll iterations amounting to roughly one millisecond.
    const SPINS_PER_MS: u32 = 4_000;

    fn take() -> UartPort {
        UartPort {}
    }

    fn regs(&self) -> &UartRegisters {
        // SAFETY: The block is a device peripheral, always mapped.
        unsafe { &*Self::UART }
    }
}

impl Serial for UartPort {
    fn send(&mut self, bytes: &[u8]) -> BootResult {
        let uart = self.regs();
        for b in bytes {
            while uart.sr.read() & Self::SR_TXE == 0 {}
            unsafe { uart.dr.write(*b as u32) };
        }
        OK
    }

    fn recv_exact(&mut self, buf: &mut [u8], timeout_ms: u32) -> BootResult {
        let uart = self.regs();
        for slot in buf {
            let mut budget = timeout_ms.saturating_mul(Self::SPINS_PER_MS);
            while uart.sr.read() & Self::SR_RXNE == 0 {
                if budget == 0 {
                    return Err(BootError::Timeout);
                }
                budget -= 1;
            }
            *slot = uart.dr.read() as u8;
        }
        OK
    }
}

#[repr(C)]
struct FlashRegisters {
    acr: RW<u32>,
    keyr: WO<u32>,
    optkeyr: WO<u32>,
    sr: RW<u32>,
    cr: RW<u32>,
}

struct FlashPort {}

impl FlashPort {
    const FLASH: *const FlashRegisters = 0x4002_3C00 as *const FlashRegisters;

    const KEY1: u32 = 0x4567_0123;
    const KEY2: u32 = 0xCDEF_89AB;

    const SR_BSY: u32 = 1 << 16;
    /// Sequence, parallelism, alignment, write protection and operation
    /// error flags; cleared by writing them back.
    const SR_ERRORS: u32 = (1 << 7) | (1 << 6) | (1 << 5) | (1 << 4) | (1 << 1);

    const CR_PG: u32 = 1 << 0;
    const CR_SER: u32 = 1 << 1;
    const CR_SNB_SHIFT: u32 = 3;
    const CR_SNB_MASK: u32 = 0x1F << Self::CR_SNB_SHIFT;
    const CR_PSIZE_MASK: u32 = 0x3 << 8;
    const CR_STRT: u32 = 1 << 16;
    const CR_LOCK: u32 = 1 << 31;

    fn take() -> FlashPort {
        FlashPort {}
    }

    fn regs(&self) -> &FlashRegisters {
        // SAFETY: The block is a device peripheral, always mapped.
        unsafe { &*Self::FLASH }
    }

    fn wait_idle(&self) {
        while self.regs().sr.read() & Self::SR_BSY != 0 {}
    }

    /// Wait out the running operation and map any raised error flag.
    fn finish(&self, fault: BootError) -> BootResult {
        self.wait_idle();
        let sr = self.regs().sr.read();
        if sr & Self::SR_ERRORS != 0 {
            unsafe { self.regs().sr.write(sr & Self::SR_ERRORS) };
            return Err(fault);
        }
        OK
    }
}

impl Flash for FlashPort {
    fn unlock(&mut self) -> BootResult {
        let flash = self.regs();
        self.wait_idle();
        if flash.cr.read() & Self::CR_LOCK != 0 {
            unsafe {
                flash.keyr.write(Self::KEY1);
                flash.keyr.write(Self::KEY2);
            }
        }
        match flash.cr.read() & Self::CR_LOCK {
            0 => OK,
            _ => Err(BootError::ProgramFailed),
        }
    }

    fn lock(&mut self) {
        self.wait_idle();
        unsafe { self.regs().cr.modify(|cr| cr | Self::CR_LOCK) };
    }

    fn erase(&mut self, sectors: &[u8]) -> BootResult {
        let flash = self.regs();
        for &sector in sectors {
            self.wait_idle();
            unsafe {
                flash.cr.modify(|cr| {
                    (cr & !Self::CR_SNB_MASK & !Self::CR_PG)
                        | Self::CR_SER
                        | ((sector as u32) << Self::CR_SNB_SHIFT)
                });
                flash.cr.modify(|cr| cr | Self::CR_STRT);
            }
            self.finish(BootError::EraseFailed)?;
            unsafe { flash.cr.modify(|cr| cr & !Self::CR_SER) };
        }
        OK
    }

    fn program_byte(&mut self, addr: u32, value: u8) -> BootResult {
        let flash = self.regs();
        self.wait_idle();
        unsafe {
            // PSIZE x8 for single-byte parallelism.
            flash.cr.modify(|cr| (cr & !Self::CR_SER & !Self::CR_PSIZE_MASK) | Self::CR_PG);
            core::ptr::write_volatile(addr as *mut u8, value);
        }
        let programmed = self.finish(BootError::ProgramFailed);
        unsafe { self.regs().cr.modify(|cr| cr & !Self::CR_PG) };
        programmed
    }
}
