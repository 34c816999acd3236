//! Bridge-chip bootloader entry and command mode.
//!
//! The bridge chip has no command-response protocol. It watches the host
//! side of the USB serial port for a magic sequence of baud rates: older
//! firmware resets straight into the ESP ROM bootloader (the port vanishes),
//! newer firmware opens a text command menu with a `cmd>` prompt.
//!
//! Commands understood by the menu:
//!
//! | Command | Effect                                        |
//! |---------|-----------------------------------------------|
//! | `I`     | Print firmware information                    |
//! | `BE`    | Reset the bridge chip into its ROM bootloader |
//! | `BZ`    | Reset the controller chip into its bootloader |
//!
//! Losing the link's byte stream during any of these steps is taken as
//! proof that the device reset.

pub mod esptool;
pub mod flasher;

use crate::entry::BootloaderEntryOutcome;
use crate::error::{Error, Result};
use crate::port::{DEFAULT_BAUD, ReadOutcome, SerialLink};
use log::{debug, info, warn};
use std::thread;
use std::time::{Duration, Instant};

pub use esptool::{CommandRunner, EsptoolFlasher, SystemRunner};
pub use flasher::BridgeFlasher;

/// Baud rates whose sequence unlocks the bridge command mode.
pub const MAGIC_BAUD_RATES: [u32; 3] = [150, 300, 600];

/// Prompt of the bridge command menu.
pub const MENU_PROMPT: &str = "cmd>";

/// Bridge entry settings.
#[derive(Debug, Clone)]
pub struct BridgeEntryOptions {
    /// Magic baud rates, opened in order.
    pub magic_baud_rates: Vec<u32>,
    /// Pause between two magic rates.
    pub rate_delay: Duration,
    /// Bound for the disconnect/menu race after the magic sequence.
    pub menu_timeout: Duration,
    /// Bound for the disconnect after a reset command.
    pub disconnect_timeout: Duration,
    /// Bound for the firmware information text.
    pub info_timeout: Duration,
    /// Baud rate the menu runs at.
    pub baud_rate: u32,
    /// Command printing firmware information.
    pub info_command: String,
    /// Command leaving the menu without touching the device.
    pub exit_command: String,
    /// Command resetting the bridge into its ROM bootloader.
    pub enter_command: String,
    /// Command resetting the controller chip into its bootloader.
    pub reset_controller_command: String,
}

impl Default for BridgeEntryOptions {
    fn default() -> Self {
        Self {
            magic_baud_rates: MAGIC_BAUD_RATES.to_vec(),
            rate_delay: Duration::from_millis(100),
            menu_timeout: Duration::from_secs(2),
            disconnect_timeout: Duration::from_secs(5),
            info_timeout: Duration::from_secs(1),
            baud_rate: DEFAULT_BAUD,
            info_command: "I".into(),
            exit_command: "X".into(),
            enter_command: "BE".into(),
            reset_controller_command: "BZ".into(),
        }
    }
}

impl BridgeEntryOptions {
    /// Set the disconnect bound after `BE`/`BZ`.
    #[must_use]
    pub fn with_disconnect_timeout(mut self, timeout: Duration) -> Self {
        self.disconnect_timeout = timeout;
        self
    }

    /// Set the disconnect/menu race bound.
    #[must_use]
    pub fn with_menu_timeout(mut self, timeout: Duration) -> Self {
        self.menu_timeout = timeout;
        self
    }
}

/// What the bridge did after the magic sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MenuDetection {
    /// The port dropped; the bridge reset on its own.
    Disconnected,
    /// The command menu prompt appeared.
    Menu,
    /// Neither happened within the bound.
    Silent,
}

/// Close and reopen the link at each magic baud rate in turn.
pub fn send_magic_baud_sequence(link: &mut dyn SerialLink, options: &BridgeEntryOptions) -> Result<()> {
    for (i, &rate) in options
        .magic_baud_rates
        .iter()
        .enumerate()
    {
        if i > 0 {
            thread::sleep(options.rate_delay);
        }
        link.close()?;
        link.open(rate)?;
    }
    debug!("Sent magic baud rate sequence");
    Ok(())
}

/// Race the disconnect notification against the command menu prompt.
pub fn detect_command_menu(link: &mut dyn SerialLink, options: &BridgeEntryOptions) -> Result<MenuDetection> {
    let signal = link.disconnect_signal();
    let deadline = Instant::now() + options.menu_timeout;

    if signal.is_fired() {
        return Ok(MenuDetection::Disconnected);
    }
    link.close()?;
    if let Err(e) = link.open(options.baud_rate) {
        // A bridge that is resetting cannot be reopened; let the signal decide.
        debug!("Reopen failed: {e}");
        return if signal.wait(options.menu_timeout)? {
            Ok(MenuDetection::Disconnected)
        } else {
            Err(e)
        };
    }

    let mut text = String::new();
    while Instant::now() < deadline {
        if crate::is_interrupted_requested() {
            return Err(Error::Interrupted);
        }
        if signal.is_fired() {
            return Ok(MenuDetection::Disconnected);
        }
        let Some(mut raw) = link.raw() else {
            debug!("Stream gone while waiting for the menu");
            return Ok(MenuDetection::Disconnected);
        };
        match raw.read_once()? {
            ReadOutcome::Data(bytes) => {
                text.push_str(&String::from_utf8_lossy(&bytes));
                if text.contains(MENU_PROMPT) {
                    debug!("Bridge command menu detected");
                    return Ok(MenuDetection::Menu);
                }
            },
            ReadOutcome::Idle => {},
            ReadOutcome::Closed => return Ok(MenuDetection::Disconnected),
        }
    }

    Ok(if signal.is_fired() {
        MenuDetection::Disconnected
    } else {
        MenuDetection::Silent
    })
}

/// Write a menu command. Returns `false` when the stream is gone.
fn send_command(link: &mut dyn SerialLink, command: &str) -> Result<bool> {
    match link.raw() {
        Some(mut raw) => {
            raw.write_str(command)?;
            debug!("Sent '{command}'");
            Ok(true)
        },
        None => Ok(false),
    }
}

/// Read the firmware information text.
fn read_firmware_info(link: &mut dyn SerialLink, options: &BridgeEntryOptions) -> Result<Option<String>> {
    if !send_command(link, &options.info_command)? {
        return Ok(None);
    }
    let Some(mut raw) = link.raw() else {
        return Ok(None);
    };
    let text = raw.collect_text(
        |t| {
            t.trim_end()
                .ends_with(MENU_PROMPT)
        },
        options.info_timeout,
    )?;
    Ok(Some(
        text.trim_end()
            .trim_end_matches(MENU_PROMPT)
            .trim()
            .to_string(),
    ))
}

/// Get the bridge chip into its ROM bootloader.
///
/// `version_check` sees the firmware information text when the command menu
/// shows up; returning `false` leaves the menu and yields
/// [`BootloaderEntryOutcome::NoUpdateNeeded`].
pub fn enter_bridge_bootloader(
    link: &mut dyn SerialLink,
    options: &BridgeEntryOptions,
    version_check: Option<&mut dyn FnMut(&str) -> bool>,
) -> Result<BootloaderEntryOutcome> {
    info!("Entering bridge bootloader");
    send_magic_baud_sequence(link, options)?;

    match detect_command_menu(link, options)? {
        MenuDetection::Disconnected => {
            info!("Bridge reset into its bootloader after the magic sequence");
            return Ok(BootloaderEntryOutcome::Success);
        },
        MenuDetection::Menu => {
            if let Some(check) = version_check {
                let Some(info) = read_firmware_info(link, options)? else {
                    return Ok(BootloaderEntryOutcome::Success);
                };
                debug!("Bridge firmware info: {info}");
                if !check(&info) {
                    info!("Bridge firmware is current, leaving command mode");
                    send_command(link, &options.exit_command)?;
                    return Ok(BootloaderEntryOutcome::NoUpdateNeeded);
                }
            }
        },
        MenuDetection::Silent => {
            debug!("No command menu, trying '{}' anyway", options.enter_command);
        },
    }

    let signal = link.disconnect_signal();
    if !send_command(link, &options.enter_command)? {
        return Ok(BootloaderEntryOutcome::Success);
    }
    if signal.wait(options.disconnect_timeout)? {
        info!("Bridge reset into its bootloader");
        Ok(BootloaderEntryOutcome::Success)
    } else {
        warn!(
            "Bridge did not disconnect within {}s",
            options
                .disconnect_timeout
                .as_secs()
        );
        Ok(BootloaderEntryOutcome::Failed)
    }
}

/// Ask the bridge to reset the controller chip into its bootloader.
///
/// `Failed` means the bridge firmware has no command mode.
pub fn reset_controller_via_command_mode(
    link: &mut dyn SerialLink,
    options: &BridgeEntryOptions,
) -> Result<BootloaderEntryOutcome> {
    info!("Resetting controller via bridge command mode");
    send_magic_baud_sequence(link, options)?;

    match detect_command_menu(link, options)? {
        MenuDetection::Disconnected => Ok(BootloaderEntryOutcome::Success),
        MenuDetection::Menu => {
            send_command(link, &options.reset_controller_command)?;
            Ok(BootloaderEntryOutcome::Success)
        },
        MenuDetection::Silent => {
            debug!("Did not enter command mode, command mode may not be supported");
            Ok(BootloaderEntryOutcome::Failed)
        },
    }
}
