//! Minimal controller-chip driver speaking the Gecko bootloader menu.
//!
//! Mode detection:
//!
//! 1. Send a carriage return. A bootloader answers with its full menu, an
//!    end-device CLI with a bare `>` prompt.
//! 2. Otherwise send a Serial API `GetVersion` request. An ACK means the
//!    controller application is running.
//! 3. Anything else is [`DeviceMode::Unknown`].
//!
//! The menu is probed first because the Serial API start-of-frame byte
//! (`0x01`) doubles as the bootloader's "upload" menu key.

use crate::driver::{ControllerDriver, DriverFactory, ProgressSink, StartFailure};
use crate::error::{Error, Result};
use crate::mode::DeviceMode;
use crate::port::SerialLink;
use crate::protocol::gecko::{self, BootloaderMenu, MenuOption};
use crate::protocol::xmodem::{XmodemConfig, XmodemTransfer};
use log::{debug, info};
use std::thread;
use std::time::Duration;

/// Serial API frame requesting the firmware version.
const GET_VERSION_FRAME: [u8; 5] = [0x01, 0x03, 0x00, 0x15, 0xE9];

/// Serial API acknowledgement.
const ACK: u8 = 0x06;

/// Driver timing.
#[derive(Debug, Clone)]
pub struct GeckoConfig {
    /// Bound for the bootloader menu or CLI prompt to appear.
    pub menu_timeout: Duration,
    /// Bound for the Serial API ACK.
    pub ack_timeout: Duration,
    /// Pause after starting the application before probing again.
    pub run_settle: Duration,
    /// XMODEM timing for uploads.
    pub xmodem: XmodemConfig,
}

impl Default for GeckoConfig {
    fn default() -> Self {
        Self {
            menu_timeout: Duration::from_millis(1000),
            ack_timeout: Duration::from_millis(1000),
            run_settle: Duration::from_millis(1500),
            xmodem: XmodemConfig::default(),
        }
    }
}

/// Whether `text` ends at an end-device CLI prompt.
fn is_cli_prompt(text: &str) -> bool {
    let trimmed = text.trim_end();
    trimmed.ends_with('>') && !trimmed.ends_with(gecko::PROMPT)
}

/// Probe the device on `link`.
fn probe(link: &mut dyn SerialLink, config: &GeckoConfig) -> Result<(DeviceMode, Option<BootloaderMenu>)> {
    let name = link
        .name()
        .to_string();
    let mut raw = link
        .raw()
        .ok_or_else(|| Error::ConnectionFailed(format!("{name} is not open")))?;

    raw.drain(Duration::from_millis(20), Duration::from_millis(200))?;
    raw.write_str("\r")?;
    if let Some(text) = raw.read_text_until(
        |t| gecko::is_complete_menu(t) || is_cli_prompt(t),
        config.menu_timeout,
    )? {
        if let Some(menu) = gecko::parse_menu(&text) {
            debug!("Bootloader menu: {:?}", menu.options);
            return Ok((DeviceMode::Bootloader, Some(menu)));
        }
        return Ok((DeviceMode::CommandLineMenu, None));
    }

    raw.drain(Duration::from_millis(20), Duration::from_millis(200))?;
    raw.write_all(&GET_VERSION_FRAME)?;
    if raw
        .read_text_until(|t| t.contains(char::from(ACK)), config.ack_timeout)?
        .is_some()
    {
        // Swallow the response frame and acknowledge it.
        raw.drain(Duration::from_millis(50), Duration::from_millis(500))?;
        raw.write_all(&[ACK])?;
        return Ok((DeviceMode::ApplicationProtocol, None));
    }

    Ok((DeviceMode::Unknown, None))
}

/// Starts [`GeckoDriver`]s.
#[derive(Debug, Clone, Default)]
pub struct GeckoDriverFactory {
    config: GeckoConfig,
}

impl GeckoDriverFactory {
    /// Factory with explicit timing.
    pub fn with_config(config: GeckoConfig) -> Self {
        Self { config }
    }
}

impl DriverFactory for GeckoDriverFactory {
    fn start(
        &self,
        mut link: Box<dyn SerialLink>,
    ) -> std::result::Result<Box<dyn ControllerDriver>, StartFailure> {
        match probe(link.as_mut(), &self.config) {
            Ok((mode, menu)) => {
                info!("Controller is in {mode} mode");
                Ok(Box::new(GeckoDriver {
                    link,
                    mode,
                    menu,
                    config: self
                        .config
                        .clone(),
                }))
            },
            Err(error) => Err(StartFailure { link, error }),
        }
    }
}

/// Driver for the controller chip's Gecko bootloader.
pub struct GeckoDriver {
    link: Box<dyn SerialLink>,
    mode: DeviceMode,
    menu: Option<BootloaderMenu>,
    config: GeckoConfig,
}

impl GeckoDriver {
    fn require_bootloader(&self) -> Result<()> {
        if self.mode == DeviceMode::Bootloader {
            Ok(())
        } else {
            Err(Error::UnexpectedMode(self.mode))
        }
    }

    fn option(&self, label: &str) -> Result<MenuOption> {
        self.find_option(label)
            .ok_or_else(|| Error::Protocol(format!("bootloader menu has no '{label}' option")))
    }

    fn run_application(&mut self) -> Result<()> {
        let run = self.option(gecko::RUN_OPTION)?;
        self.select_option(run.num)?;
        thread::sleep(self.config.run_settle);
        let (mode, menu) = probe(self.link.as_mut(), &self.config)?;
        debug!("After starting the application: {mode}");
        self.mode = mode;
        self.menu = menu;
        Ok(())
    }
}

impl ControllerDriver for GeckoDriver {
    fn mode(&self) -> DeviceMode {
        self.mode
    }

    fn supports_enter_bootloader(&self) -> bool {
        false
    }

    fn enter_bootloader(&mut self) -> Result<()> {
        Err(Error::Protocol(
            "the Gecko driver has no application-level bootloader command".into(),
        ))
    }

    fn leave_bootloader(&mut self) -> Result<()> {
        self.require_bootloader()?;
        self.run_application()
    }

    fn firmware_update(&mut self, data: &[u8], progress: ProgressSink<'_>) -> Result<()> {
        self.require_bootloader()?;
        let upload = self.option(gecko::UPLOAD_OPTION)?;
        self.select_option(upload.num)?;

        let stream = self
            .link
            .stream()
            .ok_or_else(|| Error::ConnectionFailed("link closed during upload".into()))?;
        XmodemTransfer::with_config(stream, self.config.xmodem.clone()).transfer(data, |sent, total| {
            let pct = if total == 0 { 100 } else { sent * 100 / total };
            progress(u8::try_from(pct).unwrap_or(100));
        })?;

        if let Some(mut raw) = self.link.raw() {
            if let Some(text) = raw.read_text_until(gecko::is_complete_menu, self.config.menu_timeout)? {
                self.menu = gecko::parse_menu(&text);
            }
        }
        info!("Upload complete, starting application");
        self.run_application()
    }

    fn bootloader_options(&self) -> Vec<MenuOption> {
        self.menu
            .as_ref()
            .map(|m| m.options.clone())
            .unwrap_or_default()
    }

    fn select_option(&mut self, num: u8) -> Result<()> {
        debug!("Selecting bootloader option {num}");
        self.write_raw(num.to_string().as_bytes())
    }

    fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        let mut raw = self
            .link
            .raw()
            .ok_or_else(|| Error::ConnectionFailed("link closed".into()))?;
        raw.write_all(data)
    }

    fn wait_for_message(
        &mut self,
        predicate: &dyn Fn(&str) -> bool,
        timeout: Duration,
    ) -> Result<Option<String>> {
        let mut raw = self
            .link
            .raw()
            .ok_or_else(|| Error::ConnectionFailed("link closed".into()))?;
        raw.read_text_until(|t| t.lines().any(predicate), timeout)
    }

    fn destroy(self: Box<Self>) -> Box<dyn SerialLink> {
        debug!("Driver destroyed");
        self.link
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::DEFAULT_BAUD;
    use crate::port::mock::{Action, MockLink};

    const MENU: &[u8] = b"\r\nGecko Bootloader v1.12.00\r\n1. upload gbl\r\n2. run\r\n3. ebl info\r\n4. erase nvm\r\nBL > ";

    fn fast() -> GeckoDriverFactory {
        GeckoDriverFactory::with_config(GeckoConfig {
            menu_timeout: Duration::from_millis(60),
            ack_timeout: Duration::from_millis(60),
            run_settle: Duration::from_millis(1),
            xmodem: XmodemConfig {
                char_timeout: Duration::from_millis(50),
                c_timeout: Duration::from_millis(100),
                max_retries: 2,
            },
        })
    }

    #[test]
    fn test_detects_bootloader_menu() {
        let (link, handle) = MockLink::opened("mock0", DEFAULT_BAUD);
        handle.on_write(b"\r", Action::Respond(MENU.to_vec()));

        let driver = fast().start(Box::new(link)).unwrap();
        assert_eq!(driver.mode(), DeviceMode::Bootloader);
        assert_eq!(driver.find_option("erase nvm").map(|o| o.num), Some(4));
        assert!(!driver.supports_enter_bootloader());
    }

    #[test]
    fn test_detects_cli_prompt() {
        let (link, handle) = MockLink::opened("mock0", DEFAULT_BAUD);
        handle.on_write(b"\r", Action::Respond(b"\r\n> ".to_vec()));

        let driver = fast().start(Box::new(link)).unwrap();
        assert_eq!(driver.mode(), DeviceMode::CommandLineMenu);
        assert!(driver.bootloader_options().is_empty());
    }

    #[test]
    fn test_detects_serial_api_ack() {
        let (link, handle) = MockLink::opened("mock0", DEFAULT_BAUD);
        handle.on_write(&GET_VERSION_FRAME, Action::Respond(vec![ACK]));

        let driver = fast().start(Box::new(link)).unwrap();
        assert_eq!(driver.mode(), DeviceMode::ApplicationProtocol);
        assert_eq!(handle.written().last(), Some(&ACK));
    }

    #[test]
    fn test_silence_is_unknown() {
        let (link, _handle) = MockLink::opened("mock0", DEFAULT_BAUD);
        let driver = fast().start(Box::new(link)).unwrap();
        assert_eq!(driver.mode(), DeviceMode::Unknown);
    }

    #[test]
    fn test_closed_link_fails_and_returns_link() {
        let (link, _handle) = MockLink::new("mock7");
        let failure = fast().start(Box::new(link)).err().unwrap();
        assert_eq!(failure.link.name(), "mock7");
        assert!(matches!(failure.error, Error::ConnectionFailed(_)));
    }

    #[test]
    fn test_leave_bootloader_starts_application() {
        let (link, handle) = MockLink::opened("mock0", DEFAULT_BAUD);
        handle.on_write(b"\r", Action::Respond(MENU.to_vec()));
        handle.on_write(&GET_VERSION_FRAME, Action::Respond(vec![ACK]));

        let mut driver = fast().start(Box::new(link)).unwrap();
        driver.leave_bootloader().unwrap();
        assert_eq!(driver.mode(), DeviceMode::ApplicationProtocol);
        assert!(handle.written_text().contains('2'));
    }

    #[test]
    fn test_wait_for_message_matches_line() {
        let (link, handle) = MockLink::opened("mock0", DEFAULT_BAUD);
        handle.on_write(b"\r", Action::Respond(MENU.to_vec()));
        let mut driver = fast().start(Box::new(link)).unwrap();

        handle.push_read(b"Erase NVM? Are you sure? (y/N)\r\n");
        let msg = driver
            .wait_for_message(&|m| m.to_lowercase().contains("are you sure"), Duration::from_millis(100))
            .unwrap();
        assert!(msg.is_some());

        let none = driver
            .wait_for_message(&|m| m.contains("erased"), Duration::from_millis(30))
            .unwrap();
        assert!(none.is_none());
    }

    #[test]
    fn test_enter_bootloader_unsupported() {
        let (link, _handle) = MockLink::opened("mock0", DEFAULT_BAUD);
        let mut driver = fast().start(Box::new(link)).unwrap();
        assert!(driver.enter_bootloader().is_err());
        let link = driver.destroy();
        assert_eq!(link.name(), "mock0");
    }
}
