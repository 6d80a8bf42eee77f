//! Transfer of control to the programmed application.

use crate::{APP_BASE, APP_MAX, BootError, BootResult, OK};

/// SRAM window the application's initial stack pointer must fall in.
const SRAM_BASE: u32 = 0x2000_0000;
const SRAM_SIZE: u32 = 128 * 1024;

/// The two vector-table words that decide whether an image is bootable.
#[derive(Debug, Clone, Copy)]
pub struct AppImage {
    pub stack_ptr: u32,
    pub reset_vector: u32,
}

impl AppImage {
    /// Read the vector table at the application base.
    pub fn read() -> AppImage {
        // SAFETY: APP_BASE points at mapped flash on every supported part.
        let table = APP_BASE as *const u32;
        unsafe {
            AppImage {
                stack_ptr: core::ptr::read_volatile(table),
                reset_vector: core::ptr::read_volatile(table.add(1)),
            }
        }
    }

    /// The stack pointer must land word-aligned in SRAM and the reset
    /// vector, thumb bit set, inside the application region.
    pub fn validate(&self) -> BootResult {
        let sp_ok = self.stack_ptr % 4 == 0
            && (SRAM_BASE..=SRAM_BASE + SRAM_SIZE).contains(&self.stack_ptr);
        if !sp_ok {
            return Err(BootError::AppStackInvalid);
        }

        if self.reset_vector & 1 == 0 || !(APP_BASE..=APP_MAX).contains(&(self.reset_vector & !1)) {
            return Err(BootError::AppResetInvalid);
        }

        OK
    }
}

/// Validate the application image and jump into it. Does not return on
/// success; the rejection reason comes back otherwise.
pub fn launch() -> BootError {
    let image = AppImage::read();
    if let Err(err) = image.validate() {
        return err;
    }

    // SAFETY: Writing VTOR is always safe.
    unsafe {
        (*cortex_m::peripheral::SCB::PTR).vtor.write(APP_BASE);
    }

    // SAFETY: The vector table has been checked; from here the
    // application owns the machine.
    unsafe { cortex_m::asm::bootload(APP_BASE as *const u32) }
}
