//! Controller-chip protocol driver seam.
//!
//! A [`ControllerDriver`] owns the serial link while it runs. Raw byte
//! exchange by the engine first tears the driver down with
//! [`ControllerDriver::destroy`], which hands the link back, and starts a new
//! driver afterwards through a [`DriverFactory`].

pub mod gecko;

#[cfg(test)]
pub(crate) mod scripted;

use crate::error::{Error, Result};
use crate::mode::DeviceMode;
use crate::port::SerialLink;
use crate::protocol::MenuOption;
use std::fmt;
use std::time::Duration;

pub use gecko::{GeckoDriver, GeckoDriverFactory};

/// Callback receiving progress percentages (0-100).
pub type ProgressSink<'a> = &'a mut dyn FnMut(u8);

/// A running controller-chip driver.
pub trait ControllerDriver: Send {
    /// The mode detected when the driver started or last changed it.
    fn mode(&self) -> DeviceMode;

    /// Whether the application protocol has a direct enter-bootloader command.
    fn supports_enter_bootloader(&self) -> bool;

    /// Ask the application to reboot into its bootloader.
    fn enter_bootloader(&mut self) -> Result<()>;

    /// Start the application from the bootloader.
    fn leave_bootloader(&mut self) -> Result<()>;

    /// Upload a firmware image while in bootloader mode.
    fn firmware_update(&mut self, data: &[u8], progress: ProgressSink<'_>) -> Result<()>;

    /// Options of the bootloader menu, empty outside the bootloader.
    fn bootloader_options(&self) -> Vec<MenuOption>;

    /// Find a bootloader option by exact label.
    fn find_option(&self, label: &str) -> Option<MenuOption> {
        self.bootloader_options()
            .into_iter()
            .find(|o| o.label == label)
    }

    /// Select a bootloader option by number.
    fn select_option(&mut self, num: u8) -> Result<()>;

    /// Write bytes to the device unchanged.
    fn write_raw(&mut self, data: &[u8]) -> Result<()>;

    /// Wait for a bootloader message accepted by `predicate`.
    ///
    /// Returns `Ok(None)` when nothing matching arrives within `timeout`.
    fn wait_for_message(
        &mut self,
        predicate: &dyn Fn(&str) -> bool,
        timeout: Duration,
    ) -> Result<Option<String>>;

    /// Stop the driver and hand the link back.
    fn destroy(self: Box<Self>) -> Box<dyn SerialLink>;
}

/// A driver that could not start, with the link it was given.
pub struct StartFailure {
    /// The link, returned to the caller.
    pub link: Box<dyn SerialLink>,
    /// Why the start failed.
    pub error: Error,
}

impl fmt::Debug for StartFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StartFailure")
            .field("link", &self.link.name())
            .field("error", &self.error)
            .finish()
    }
}

/// Creates drivers bound to a link.
pub trait DriverFactory {
    /// Start a driver on `link`, probing the device mode.
    fn start(
        &self,
        link: Box<dyn SerialLink>,
    ) -> std::result::Result<Box<dyn ControllerDriver>, StartFailure>;
}
