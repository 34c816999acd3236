//! Controller session: ownership of the link between driver and engine.
//!
//! The link is always held by exactly one party. While a driver runs it owns
//! the link; [`ControllerSession::with_raw`] destroys the driver first and
//! lends the bare link out. [`ControllerSession::reprobe`] restarts the
//! driver and returns the freshly detected mode.

use crate::driver::{ControllerDriver, DriverFactory};
use crate::error::{Error, Result};
use crate::mode::DeviceMode;
use crate::port::{DisconnectSignal, SerialLink};
use log::{debug, warn};
use std::mem;

enum Holder {
    Driver(Box<dyn ControllerDriver>),
    Raw(Box<dyn SerialLink>),
    Detached,
}

/// A connected controller chip.
pub struct ControllerSession<F: DriverFactory> {
    factory: F,
    holder: Holder,
    baud_rate: u32,
    signal: DisconnectSignal,
}

impl<F: DriverFactory> ControllerSession<F> {
    /// Open `link` at `baud_rate` and start a driver on it.
    pub fn connect(factory: F, mut link: Box<dyn SerialLink>, baud_rate: u32) -> Result<Self> {
        if link.baud_rate() != Some(baud_rate) {
            link.open(baud_rate)
                .map_err(|e| Error::ConnectionFailed(format!("{}: {e}", link.name())))?;
        }
        let signal = link.disconnect_signal();

        let driver = factory
            .start(link)
            .map_err(|failure| Error::ConnectionFailed(failure.error.to_string()))?;
        debug!("Session started in {} mode", driver.mode());

        Ok(Self {
            factory,
            holder: Holder::Driver(driver),
            baud_rate,
            signal,
        })
    }

    /// Current mode, `Unknown` while no driver runs.
    pub fn mode(&self) -> DeviceMode {
        match &self.holder {
            Holder::Driver(driver) => driver.mode(),
            Holder::Raw(_) | Holder::Detached => DeviceMode::Unknown,
        }
    }

    /// Baud rate the driver runs at.
    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    /// The link's disconnect notification.
    pub fn disconnect_signal(&self) -> DisconnectSignal {
        self.signal
            .clone()
    }

    /// The running driver.
    pub fn driver_mut(&mut self) -> Option<&mut (dyn ControllerDriver + 'static)> {
        match &mut self.holder {
            Holder::Driver(driver) => Some(driver.as_mut()),
            Holder::Raw(_) | Holder::Detached => None,
        }
    }

    fn take_link(&mut self) -> Option<Box<dyn SerialLink>> {
        match mem::replace(&mut self.holder, Holder::Detached) {
            Holder::Driver(driver) => Some(driver.destroy()),
            Holder::Raw(link) => Some(link),
            Holder::Detached => None,
        }
    }

    /// Destroy the driver and run `f` on the bare link.
    ///
    /// The driver stays down afterwards; call [`Self::reprobe`] to restart it.
    pub fn with_raw<R>(&mut self, f: impl FnOnce(&mut dyn SerialLink) -> R) -> Option<R> {
        let mut link = self.take_link()?;
        let result = f(link.as_mut());
        self.holder = Holder::Raw(link);
        Some(result)
    }

    /// Start the application from the bootloader and return the new mode.
    ///
    /// Landing back in the bootloader counts as a failure.
    pub fn run_application(&mut self) -> Result<DeviceMode> {
        let driver = self
            .driver_mut()
            .ok_or_else(|| Error::ModeProbeFailed("no driver running".into()))?;
        if driver.mode() != DeviceMode::Bootloader {
            return Err(Error::UnexpectedMode(driver.mode()));
        }
        driver.leave_bootloader()?;
        match driver.mode() {
            DeviceMode::Bootloader => Err(Error::Protocol("still in bootloader after run".into())),
            mode => Ok(mode),
        }
    }

    /// Restart the driver and return the detected mode.
    ///
    /// A driver that fails to start yields `Unknown`; the link is kept so a
    /// later reprobe can try again.
    pub fn reprobe(&mut self) -> DeviceMode {
        let Some(mut link) = self.take_link() else {
            return DeviceMode::Unknown;
        };

        if !link.is_open() || link.baud_rate() != Some(self.baud_rate) {
            if let Err(e) = link.open(self.baud_rate) {
                warn!("Could not reopen {}: {e}", link.name());
                self.holder = Holder::Raw(link);
                return DeviceMode::Unknown;
            }
        }

        match self
            .factory
            .start(link)
        {
            Ok(driver) => {
                let mode = driver.mode();
                debug!("Re-probed mode: {mode}");
                self.holder = Holder::Driver(driver);
                mode
            },
            Err(failure) => {
                warn!("Driver did not start: {}", failure.error);
                self.holder = Holder::Raw(failure.link);
                DeviceMode::Unknown
            },
        }
    }

    /// Stop the driver and close the link.
    pub fn close(mut self) -> Result<()> {
        match self.take_link() {
            Some(mut link) => link.close(),
            None => Ok(()),
        }
    }
}
