//! Bridge-chip flashing seam.

use crate::error::Result;

/// Writes images to the bridge chip once it sits in its ROM bootloader.
pub trait BridgeFlasher {
    /// Handshake with the ROM bootloader.
    fn connect(&mut self) -> Result<()>;

    /// Write `data` at `offset`, reporting `(written, total)` bytes.
    fn write_flash(
        &mut self,
        offset: u32,
        data: &[u8],
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<()>;

    /// Reset the chip out of the bootloader after a write.
    fn reset_after(&mut self) -> Result<()>;
}
