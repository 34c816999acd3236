//! Bridge-chip firmware update.
//!
//! ```text
//! Acquire -> EnterBootloader -> AwaitBootloaderPort -> Flash -> AwaitPowerCycle -> Done
//!                  |
//!                  +-> Done (version check says up to date)
//! ```

use super::outcome::{Outcome, Severity};
use super::{FirmwareRequest, WorkflowContext};
use crate::bridge::{BridgeEntryOptions, BridgeFlasher, enter_bridge_bootloader};
use crate::entry::BootloaderEntryOutcome;
use crate::error::{Error, Result};
use crate::firmware::{FirmwareImage, FirmwareTarget};
use crate::flash::{DEFAULT_POWER_CYCLE_TIMEOUT, await_power_cycle, write_bridge_image};
use crate::port::{DisconnectSignal, SerialLink};
use log::{debug, info};
use std::time::Duration;

/// Access to the bridge chip once it sits in its ROM bootloader.
pub trait BridgeHost {
    /// Wait for the ROM bootloader's serial port and return its name.
    fn wait_for_bootloader_port(&mut self) -> Result<String>;

    /// A flasher bound to `port`.
    fn flasher(&mut self, port: &str) -> Result<Box<dyn BridgeFlasher>>;

    /// A signal that fires when `port` goes away.
    fn watch_port(&mut self, port: &str) -> Result<DisconnectSignal>;
}

/// Settings of the bridge update.
#[derive(Debug, Clone)]
pub struct BridgeUpdateOptions {
    /// Magic baud sequence and command menu settings.
    pub entry: BridgeEntryOptions,
    /// Ask the prompter whether the running version needs an update.
    pub version_check: bool,
    /// Bound for the power-cycle wait.
    pub power_cycle_timeout: Duration,
}

impl Default for BridgeUpdateOptions {
    fn default() -> Self {
        Self {
            entry: BridgeEntryOptions::default(),
            version_check: true,
            power_cycle_timeout: DEFAULT_POWER_CYCLE_TIMEOUT,
        }
    }
}

/// How a bridge update ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeUpdateReport {
    /// The image was written and the adapter power-cycled.
    Updated {
        /// Name of the written image.
        file_name: String,
    },
    /// The version check found nothing to do.
    UpToDate,
}

impl BridgeUpdateReport {
    /// User-facing wording.
    pub fn outcome(&self) -> Outcome {
        match self {
            Self::Updated { file_name } => Outcome::new(
                "BRIDGE_UPDATED",
                Severity::Success,
                "Bridge firmware updated",
                format!("{file_name} was installed on the bridge chip of your ZWA-2 adapter."),
            ),
            Self::UpToDate => Outcome::new(
                "NO_UPDATE_NEEDED",
                Severity::Success,
                "Bridge firmware is up to date",
                "The bridge chip already runs the selected firmware version.",
            ),
        }
    }
}

/// Steps of the bridge update.
#[derive(Debug)]
pub enum BridgeUpdateState {
    /// Download or load the image.
    Acquire(FirmwareRequest),
    /// Send the magic baud sequence and the bootloader command.
    EnterBootloader(FirmwareImage),
    /// Wait for the ROM bootloader port to enumerate.
    AwaitBootloaderPort(FirmwareImage),
    /// Write the image.
    Flash {
        /// Image to write.
        image: FirmwareImage,
        /// ROM bootloader port.
        port: String,
    },
    /// Wait for the user to unplug the adapter.
    AwaitPowerCycle {
        /// Name of the written image.
        file_name: String,
        /// Fires when the bootloader port disappears.
        disconnect: DisconnectSignal,
    },
    /// Finished.
    Done(BridgeUpdateReport),
}

impl BridgeUpdateState {
    /// Phase name reported to observers.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Acquire(_) => "acquire",
            Self::EnterBootloader(_) => "enter-bootloader",
            Self::AwaitBootloaderPort(_) => "await-bootloader-port",
            Self::Flash { .. } => "flash",
            Self::AwaitPowerCycle { .. } => "await-power-cycle",
            Self::Done(_) => "done",
        }
    }

    /// Run this step and return the next one.
    pub fn next(
        self,
        link: &mut dyn SerialLink,
        host: &mut dyn BridgeHost,
        options: &BridgeUpdateOptions,
        ctx: &mut WorkflowContext<'_>,
    ) -> Result<Self> {
        Ok(match self {
            Self::Acquire(request) => Self::EnterBootloader(ctx.acquire(FirmwareTarget::Bridge, &request)?),
            Self::EnterBootloader(image) => {
                let outcome = if options.version_check {
                    let prompter = ctx.prompter();
                    let mut check = |info: &str| prompter.bridge_update_wanted(info);
                    enter_bridge_bootloader(link, &options.entry, Some(&mut check))?
                } else {
                    enter_bridge_bootloader(link, &options.entry, None)?
                };
                match outcome {
                    BootloaderEntryOutcome::Success => {
                        // The adapter port is gone once the bridge resets.
                        if let Err(e) = link.close() {
                            debug!("Closing {} after reset: {e}", link.name());
                        }
                        Self::AwaitBootloaderPort(image)
                    },
                    BootloaderEntryOutcome::NoUpdateNeeded => Self::Done(BridgeUpdateReport::UpToDate),
                    BootloaderEntryOutcome::Failed => {
                        return Err(Error::BootloaderEntryFailed {
                            attempted: vec!["bridge-magic-baud", "bridge-command-mode"],
                        });
                    },
                }
            },
            Self::AwaitBootloaderPort(image) => {
                let port = host.wait_for_bootloader_port()?;
                ctx.message(format!("Bridge bootloader on {port}"));
                Self::Flash { image, port }
            },
            Self::Flash { image, port } => {
                let disconnect = host.watch_port(&port)?;
                let mut flasher = host.flasher(&port)?;
                let mut sink = ctx.progress_sink();
                write_bridge_image(flasher.as_mut(), &image, &mut sink)?;
                Self::AwaitPowerCycle {
                    file_name: image
                        .file_name()
                        .to_string(),
                    disconnect,
                }
            },
            Self::AwaitPowerCycle { file_name, disconnect } => {
                ctx.prompter()
                    .power_cycle_notice(options.power_cycle_timeout);
                await_power_cycle(&disconnect, options.power_cycle_timeout)?;
                Self::Done(BridgeUpdateReport::Updated { file_name })
            },
            done @ Self::Done(_) => done,
        })
    }
}

/// Update the bridge chip reachable through `link`.
pub fn update_bridge(
    link: &mut dyn SerialLink,
    host: &mut dyn BridgeHost,
    options: &BridgeUpdateOptions,
    ctx: &mut WorkflowContext<'_>,
    request: FirmwareRequest,
) -> Result<BridgeUpdateReport> {
    let mut state = BridgeUpdateState::Acquire(request);
    loop {
        ctx.phase(state.name());
        state = match state {
            BridgeUpdateState::Done(report) => {
                info!("Bridge update finished: {}", report.outcome().tag);
                return Ok(report);
            },
            step => step.next(link, host, options, ctx)?,
        };
    }
}

#[cfg(feature = "native")]
pub use self::native::NativeBridgeHost;

#[cfg(feature = "native")]
mod native {
    use super::BridgeHost;
    use crate::bridge::{BridgeFlasher, EsptoolFlasher};
    use crate::device::{DeviceKind, wait_for_port};
    use crate::error::Result;
    use crate::port::native::NativeLink;
    use crate::port::{DisconnectSignal, SerialLink};
    use std::time::Duration;

    /// [`BridgeHost`] on the local machine, flashing with `esptool`.
    pub struct NativeBridgeHost {
        esptool: String,
        port_timeout: Duration,
        watched: Option<NativeLink>,
    }

    impl NativeBridgeHost {
        /// Host running `esptool` and waiting up to `port_timeout` for the
        /// bootloader port.
        pub fn new(esptool: impl Into<String>, port_timeout: Duration) -> Self {
            Self {
                esptool: esptool.into(),
                port_timeout,
                watched: None,
            }
        }

        /// Name of the port currently watched for unplug.
        pub fn watched_port(&self) -> Option<&str> {
            self.watched
                .as_ref()
                .map(SerialLink::name)
        }
    }

    impl BridgeHost for NativeBridgeHost {
        fn wait_for_bootloader_port(&mut self) -> Result<String> {
            Ok(wait_for_port(DeviceKind::EspBootloader, self.port_timeout)?.name)
        }

        fn flasher(&mut self, port: &str) -> Result<Box<dyn BridgeFlasher>> {
            Ok(Box::new(EsptoolFlasher::new(self.esptool.clone(), port)))
        }

        fn watch_port(&mut self, port: &str) -> Result<DisconnectSignal> {
            let mut link = NativeLink::new(port);
            link.watch();
            let signal = link.disconnect_signal();
            // Replacing the link stops the previous watcher.
            self.watched = Some(link);
            Ok(signal)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_watch_port_keeps_only_latest_watch() {
            let mut host = NativeBridgeHost::new("esptool.py", Duration::from_millis(10));
            assert!(host.watched_port().is_none());

            host.watch_port("/dev/zwaflash-missing-a")
                .unwrap();
            host.watch_port("/dev/zwaflash-missing-b")
                .unwrap();
            assert_eq!(host.watched_port(), Some("/dev/zwaflash-missing-b"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::tests::TestFlasher;
    use crate::port::DEFAULT_BAUD;
    use crate::port::mock::{Action, MockLink};
    use crate::workflow::tests::Recorder;
    use crate::workflow::{FixedAnswers, WorkflowContext};
    use crate::firmware::http::MockHttpClient;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};

    struct TestHost {
        flasher_calls: Arc<Mutex<Vec<String>>>,
        disconnect: DisconnectSignal,
        port_found: bool,
    }

    struct SharedFlasher {
        inner: TestFlasher,
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl BridgeFlasher for SharedFlasher {
        fn connect(&mut self) -> Result<()> {
            self.inner
                .connect()
        }

        fn write_flash(&mut self, offset: u32, data: &[u8], progress: &mut dyn FnMut(usize, usize)) -> Result<()> {
            self.inner
                .write_flash(offset, data, progress)
        }

        fn reset_after(&mut self) -> Result<()> {
            self.inner
                .reset_after()?;
            self.calls
                .lock()
                .unwrap()
                .extend(
                    self.inner
                        .calls
                        .drain(..),
                );
            Ok(())
        }
    }

    impl TestHost {
        fn new() -> Self {
            Self {
                flasher_calls: Arc::default(),
                disconnect: DisconnectSignal::new(),
                port_found: true,
            }
        }
    }

    impl BridgeHost for TestHost {
        fn wait_for_bootloader_port(&mut self) -> Result<String> {
            if self.port_found {
                Ok("/dev/ttyACM1".into())
            } else {
                Err(Error::Timeout("no ESP bootloader port appeared".into()))
            }
        }

        fn flasher(&mut self, port: &str) -> Result<Box<dyn BridgeFlasher>> {
            assert_eq!(port, "/dev/ttyACM1");
            Ok(Box::new(SharedFlasher {
                inner: TestFlasher {
                    chunk: 4,
                    ..TestFlasher::default()
                },
                calls: Arc::clone(&self.flasher_calls),
            }))
        }

        fn watch_port(&mut self, _port: &str) -> Result<DisconnectSignal> {
            Ok(self
                .disconnect
                .clone())
        }
    }

    fn options() -> BridgeUpdateOptions {
        BridgeUpdateOptions {
            entry: BridgeEntryOptions {
                rate_delay: Duration::from_millis(1),
                info_timeout: Duration::from_millis(100),
                ..BridgeEntryOptions::default()
            }
            .with_menu_timeout(Duration::from_millis(150))
            .with_disconnect_timeout(Duration::from_millis(150)),
            version_check: true,
            power_cycle_timeout: Duration::from_millis(200),
        }
    }

    fn bridge_image(dir: &tempfile::TempDir) -> PathBuf {
        let path = dir
            .path()
            .join("zwa2-bridge.factory.bin");
        std::fs::write(&path, [0xE9u8; 16]).unwrap();
        path
    }

    #[test]
    fn test_update_after_magic_sequence_disconnect() {
        let dir = tempfile::tempdir().unwrap();
        let (mut link, handle) = MockLink::opened("mock0", DEFAULT_BAUD);
        handle.on_open(600, Action::Disconnect);
        let mut host = TestHost::new();
        host.disconnect
            .fire();

        let http = MockHttpClient::new();
        let mut answers = FixedAnswers::default();
        let mut recorder = Recorder::default();
        let mut ctx = WorkflowContext::new(&http, &mut answers, &mut recorder);
        let report = update_bridge(
            &mut link,
            &mut host,
            &options(),
            &mut ctx,
            FirmwareRequest::File(bridge_image(&dir)),
        )
        .unwrap();
        drop(ctx);

        assert_eq!(
            report,
            BridgeUpdateReport::Updated {
                file_name: "zwa2-bridge.factory.bin".into()
            }
        );
        assert_eq!(
            recorder.phases(),
            vec![
                "acquire",
                "enter-bootloader",
                "await-bootloader-port",
                "flash",
                "await-power-cycle",
                "done"
            ]
        );
        assert_eq!(recorder.progress(), vec![0, 25, 50, 75, 100]);
        assert_eq!(
            *host
                .flasher_calls
                .lock()
                .unwrap(),
            vec!["connect", "write:0x0", "reset"]
        );
    }

    #[test]
    fn test_version_check_declines_update() {
        let dir = tempfile::tempdir().unwrap();
        let (mut link, handle) = MockLink::opened("mock0", DEFAULT_BAUD);
        handle.on_open(DEFAULT_BAUD, Action::Respond(b"ZWA-2 bridge\r\ncmd> ".to_vec()));
        handle.on_write(b"I", Action::Respond(b"fw 1.2.0\r\ncmd> ".to_vec()));
        let mut host = TestHost::new();

        let http = MockHttpClient::new();
        let mut answers = FixedAnswers {
            update_bridge: false,
            ..FixedAnswers::default()
        };
        let mut recorder = Recorder::default();
        let mut ctx = WorkflowContext::new(&http, &mut answers, &mut recorder);
        let report = update_bridge(
            &mut link,
            &mut host,
            &options(),
            &mut ctx,
            FirmwareRequest::File(bridge_image(&dir)),
        )
        .unwrap();

        assert_eq!(report, BridgeUpdateReport::UpToDate);
        assert!(
            host.flasher_calls
                .lock()
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn test_missing_power_cycle_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let (mut link, handle) = MockLink::opened("mock0", DEFAULT_BAUD);
        handle.on_open(600, Action::Disconnect);
        let mut host = TestHost::new();

        let http = MockHttpClient::new();
        let mut answers = FixedAnswers::default();
        let mut recorder = Recorder::default();
        let mut ctx = WorkflowContext::new(&http, &mut answers, &mut recorder);
        let err = update_bridge(
            &mut link,
            &mut host,
            &options(),
            &mut ctx,
            FirmwareRequest::File(bridge_image(&dir)),
        )
        .unwrap_err();

        assert!(matches!(err, Error::PowerCycleTimeout(_)));
    }

    #[test]
    fn test_missing_bootloader_port() {
        let dir = tempfile::tempdir().unwrap();
        let (mut link, handle) = MockLink::opened("mock0", DEFAULT_BAUD);
        handle.on_open(600, Action::Disconnect);
        let mut host = TestHost::new();
        host.port_found = false;

        let http = MockHttpClient::new();
        let mut answers = FixedAnswers::default();
        let mut recorder = Recorder::default();
        let mut ctx = WorkflowContext::new(&http, &mut answers, &mut recorder);
        let err = update_bridge(
            &mut link,
            &mut host,
            &options(),
            &mut ctx,
            FirmwareRequest::File(bridge_image(&dir)),
        )
        .unwrap_err();

        assert!(matches!(err, Error::Timeout(_)));
    }

    #[test]
    fn test_gbl_is_rejected_for_bridge() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir
            .path()
            .join("zwa2.gbl");
        std::fs::write(&path, crate::firmware::gbl::tests::sample_gbl(&[1; 8])).unwrap();
        let (mut link, handle) = MockLink::opened("mock0", DEFAULT_BAUD);
        handle.on_open(600, Action::Disconnect);
        let mut host = TestHost::new();

        let http = MockHttpClient::new();
        let mut answers = FixedAnswers::default();
        let mut recorder = Recorder::default();
        let mut ctx = WorkflowContext::new(&http, &mut answers, &mut recorder);
        let err = update_bridge(&mut link, &mut host, &options(), &mut ctx, FirmwareRequest::File(path)).unwrap_err();

        assert!(matches!(err, Error::UnsupportedFirmwareFormat(_)));
    }
}
