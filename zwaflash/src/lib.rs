//! # zwaflash
//!
//! Recovery, diagnosis and firmware update engine for dual-chip Z-Wave USB
//! adapters such as the ZWA-2.
//!
//! The adapter carries two chips behind one USB serial port:
//!
//! - the **controller** chip runs the Z-Wave firmware (or an end-device CLI)
//!   and updates itself through a Gecko bootloader menu over XMODEM;
//! - the **bridge** chip converts USB to serial, can reset the controller
//!   and is updated from its ROM bootloader with `esptool`.
//!
//! This crate provides:
//!
//! - mode detection and a session that owns the link ([`ControllerSession`])
//! - bootloader entry with ordered fallback strategies ([`BootloaderEntry`])
//! - bridge command mode and bridge flashing ([`bridge`])
//! - firmware acquisition with integrity checks ([`firmware`])
//! - controller and bridge flash pipelines ([`flash`]), NVM erase ([`erase`])
//! - diagnosis ([`diagnose()`]) and the wizard workflows ([`workflow`])
//!
//! ## Features
//!
//! - `native` (default): OS serial ports via the `serialport` crate
//! - `http` (default): blocking HTTPS client for release indexes
//!
//! ## Example
//!
//! ```rust,no_run
//! use zwaflash::{BootloaderEntry, ControllerSession, EntryConfig, GeckoDriverFactory, NativeLink};
//! use zwaflash::firmware::read_firmware_file;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let link = NativeLink::new("/dev/ttyUSB0");
//!     let mut session = ControllerSession::connect(GeckoDriverFactory::default(), Box::new(link), 115_200)?;
//!     println!("Adapter is in {} mode", session.mode());
//!
//!     let image = read_firmware_file("zwa2_controller.gbl")?;
//!     let entry = BootloaderEntry::new(EntryConfig::default());
//!     zwaflash::flash::flash_controller(&mut session, &image, &entry, &mut |pct| {
//!         println!("{pct}%");
//!     })?;
//!     session.close()?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod bridge;
pub mod device;
pub mod diagnose;
pub mod driver;
pub mod entry;
pub mod erase;
pub mod error;
pub mod firmware;
pub mod flash;
pub mod mode;
pub mod port;
pub mod protocol;
pub mod session;
pub mod workflow;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker used by long-running library loops.
///
/// The checker should return `true` when the current operation should stop
/// (for example after receiving Ctrl-C in CLI applications).
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn is_interrupted_requested() -> bool {
    #[cfg(test)]
    {
        if TEST_THREAD_INTERRUPTED.with(std::cell::Cell::get) {
            return true;
        }
    }
    INTERRUPT_CHECKER
        .get()
        .is_some_and(|checker| checker())
}

#[cfg(test)]
thread_local! {
    static TEST_THREAD_INTERRUPTED: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
}

/// Request interruption for the calling test thread only.
#[cfg(test)]
pub(crate) fn test_interrupt_this_thread(value: bool) {
    TEST_THREAD_INTERRUPTED.with(|flag| flag.set(value));
}

#[cfg(test)]
pub(crate) fn test_set_interrupted(value: bool) {
    use std::sync::atomic::{AtomicBool, Ordering};

    static TEST_INTERRUPT_FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

    let flag = TEST_INTERRUPT_FLAG
        .get_or_init(|| {
            let shared = Arc::new(AtomicBool::new(false));
            let checker = Arc::clone(&shared);
            set_interrupt_checker(move || checker.load(Ordering::Relaxed));
            shared
        })
        .clone();

    flag.store(value, Ordering::Relaxed);
}

#[cfg(feature = "native")]
pub use port::{NativeLink, NativeLinkConfig};
pub use {
    bridge::{BridgeEntryOptions, BridgeFlasher, EsptoolFlasher, enter_bridge_bootloader},
    device::{DetectedPort, DeviceKind, auto_detect_port, detect_ports, find_port_by_name, wait_for_port},
    diagnose::{DiagnosisResult, Remediation, diagnose},
    driver::{ControllerDriver, DriverFactory, GeckoDriver, GeckoDriverFactory},
    entry::{BootloaderEntry, BootloaderEntryOutcome, EntryConfig, EntryTimings},
    erase::{EraseReport, erase_nvm},
    error::{Error, Result},
    firmware::{FirmwareDigest, FirmwareFormat, FirmwareImage, FirmwareSourceConfig, FirmwareTarget, HttpClient},
    mode::DeviceMode,
    port::{ControlSignals, DEFAULT_BAUD, DisconnectSignal, SerialLink},
    session::ControllerSession,
};
