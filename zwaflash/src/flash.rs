//! Flash pipelines.
//!
//! The controller chip is updated through its driver once it sits in the
//! bootloader; the bridge chip through a [`BridgeFlasher`] once it sits in
//! its ROM bootloader. Both report progress as a percentage that never goes
//! backwards within one operation.

use crate::bridge::BridgeFlasher;
use crate::driver::DriverFactory;
use crate::entry::BootloaderEntry;
use crate::error::{Error, Result};
use crate::firmware::{FirmwareFormat, FirmwareImage};
use crate::mode::DeviceMode;
use crate::port::DisconnectSignal;
use crate::session::ControllerSession;
use log::{debug, info, warn};
use std::time::Duration;

/// Default bound for the power-cycle wait after a bridge update.
pub const DEFAULT_POWER_CYCLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Forwards percentages to `sink`, dropping any that would go backwards.
pub struct MonotonicProgress<'a> {
    sink: &'a mut dyn FnMut(u8),
    last: Option<u8>,
}

impl<'a> MonotonicProgress<'a> {
    /// Wrap `sink`.
    pub fn new(sink: &'a mut dyn FnMut(u8)) -> Self {
        Self { sink, last: None }
    }

    /// Report `pct`, clamped to 100.
    pub fn report(&mut self, pct: u8) {
        let pct = pct.min(100);
        if self
            .last
            .is_some_and(|last| pct <= last)
        {
            return;
        }
        self.last = Some(pct);
        (self.sink)(pct);
    }

    /// Report `done` out of `total`.
    pub fn report_ratio(&mut self, done: usize, total: usize) {
        if total == 0 {
            return;
        }
        let pct = (done.min(total) * 100 / total) as u8;
        self.report(pct);
    }

    /// Report completion.
    pub fn finish(&mut self) {
        self.report(100);
    }
}

fn write_failed(e: Error) -> Error {
    match e {
        Error::Interrupted => Error::Interrupted,
        other => Error::FlashWriteFailed(other.to_string()),
    }
}

/// Flash `image` to the controller chip and return the mode it restarts in.
///
/// Enters the bootloader through `entry` when needed. The update only
/// counts as successful when the re-probe finds the application protocol;
/// silence afterwards is [`Error::PostFlashVerificationFailed`] and any
/// other mode is [`Error::UnexpectedMode`].
pub fn flash_controller<F: DriverFactory>(
    session: &mut ControllerSession<F>,
    image: &FirmwareImage,
    entry: &BootloaderEntry<F>,
    progress: &mut dyn FnMut(u8),
) -> Result<DeviceMode> {
    if image.format() != FirmwareFormat::PackagedUpdateFile {
        return Err(Error::UnsupportedFirmwareFormat(format!(
            "{}: the controller bootloader only accepts GBL update files",
            image.file_name()
        )));
    }
    if image.is_empty() {
        return Err(Error::UnsupportedFirmwareFormat(format!("{} is empty", image.file_name())));
    }

    entry.ensure(session)?;

    let driver = session
        .driver_mut()
        .ok_or_else(|| Error::ModeProbeFailed("no driver after entering bootloader".into()))?;
    if driver.mode() != DeviceMode::Bootloader {
        return Err(Error::UnexpectedMode(driver.mode()));
    }

    info!("Flashing {} ({} bytes)", image.file_name(), image.len());
    let mut monotonic = MonotonicProgress::new(progress);
    monotonic.report(0);
    driver
        .firmware_update(image.bytes(), &mut |pct| monotonic.report(pct))
        .map_err(write_failed)?;
    monotonic.finish();

    let mode = session.reprobe();
    debug!("Mode after flashing: {mode}");
    match mode {
        DeviceMode::ApplicationProtocol => {
            info!("Controller firmware updated");
            Ok(mode)
        },
        DeviceMode::Unknown => Err(Error::PostFlashVerificationFailed(
            "device did not respond after flashing".into(),
        )),
        other => Err(Error::UnexpectedMode(other)),
    }
}

/// Write `image` to the bridge chip and reset it.
///
/// The bridge must already sit in its ROM bootloader.
pub fn write_bridge_image(
    flasher: &mut dyn BridgeFlasher,
    image: &FirmwareImage,
    progress: &mut dyn FnMut(u8),
) -> Result<()> {
    if image.format() != FirmwareFormat::RawApplicationImage {
        return Err(Error::UnsupportedFirmwareFormat(format!(
            "{}: the bridge chip needs a raw image",
            image.file_name()
        )));
    }

    flasher
        .connect()
        .map_err(write_failed)?;

    let mut monotonic = MonotonicProgress::new(progress);
    monotonic.report(0);
    info!(
        "Writing {} ({} bytes) at 0x{:X}",
        image.file_name(),
        image.len(),
        image.load_offset()
    );
    flasher
        .write_flash(image.load_offset(), image.bytes(), &mut |written, total| {
            monotonic.report_ratio(written, total);
        })
        .map_err(write_failed)?;
    monotonic.finish();

    flasher
        .reset_after()
        .map_err(write_failed)
}

/// Wait for the user to power-cycle the adapter.
///
/// The bridge's disconnect signal is the only evidence; a timeout is an
/// error, never a silent success.
pub fn await_power_cycle(disconnect: &DisconnectSignal, timeout: Duration) -> Result<()> {
    info!("Waiting up to {}s for the adapter to be power-cycled", timeout.as_secs());
    if disconnect.wait(timeout)? {
        debug!("Power cycle observed");
        Ok(())
    } else {
        warn!("No power cycle within {}s", timeout.as_secs());
        Err(Error::PowerCycleTimeout(timeout))
    }
}

/// Write `image` to the bridge chip, then wait for the power cycle.
pub fn flash_bridge(
    flasher: &mut dyn BridgeFlasher,
    image: &FirmwareImage,
    disconnect: &DisconnectSignal,
    power_cycle_timeout: Duration,
    progress: &mut dyn FnMut(u8),
) -> Result<()> {
    write_bridge_image(flasher, image, progress)?;
    await_power_cycle(disconnect, power_cycle_timeout)
}
