//! NVM erase through the bootloader menu.
//!
//! ```text
//! BL > 4                       select "erase nvm"
//! Are you sure? (y/n)          within 1 s, else EraseConfirmationTimeout
//! y
//! NVM erased                   within 1 s, else ErasePromptTimeout
//! ```

use crate::driver::DriverFactory;
use crate::entry::BootloaderEntry;
use crate::error::{Error, Result};
use crate::mode::DeviceMode;
use crate::protocol::gecko::ERASE_NVM_OPTION;
use crate::session::ControllerSession;
use log::{info, warn};
use std::time::Duration;

/// Bound for each bootloader reply during the erase.
pub const ERASE_REPLY_TIMEOUT: Duration = Duration::from_secs(1);

/// Warning attached when the application does not come back.
pub const START_APPLICATION_WARNING: &str = "NVM erased successfully, but failed to start application";

/// Result of a completed erase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EraseReport {
    /// Mode after trying to start the application.
    pub mode: DeviceMode,
    /// Set when the NVM was erased but the application did not start.
    pub warning: Option<String>,
}

impl EraseReport {
    /// Whether the erase finished without warnings.
    pub fn is_clean(&self) -> bool {
        self.warning
            .is_none()
    }
}

fn contains_ignore_case(needle: &'static str) -> impl Fn(&str) -> bool {
    move |line: &str| {
        line.to_lowercase()
            .contains(needle)
    }
}

/// Erase the controller's NVM.
///
/// Enters the bootloader first. A failure to start the application after a
/// successful erase is reported as a warning in the [`EraseReport`].
pub fn erase_nvm<F: DriverFactory>(
    session: &mut ControllerSession<F>,
    entry: &BootloaderEntry<F>,
) -> Result<EraseReport> {
    entry.ensure(session)?;

    let driver = session
        .driver_mut()
        .ok_or_else(|| Error::ModeProbeFailed("no driver after entering bootloader".into()))?;
    let option = driver
        .find_option(ERASE_NVM_OPTION)
        .ok_or(Error::EraseOptionNotFound)?;

    info!("Erasing NVM");
    driver.select_option(option.num)?;
    if driver
        .wait_for_message(&contains_ignore_case("are you sure"), ERASE_REPLY_TIMEOUT)?
        .is_none()
    {
        return Err(Error::EraseConfirmationTimeout);
    }

    driver.write_raw(b"y")?;
    if driver
        .wait_for_message(&contains_ignore_case("erased"), ERASE_REPLY_TIMEOUT)?
        .is_none()
    {
        return Err(Error::ErasePromptTimeout);
    }
    info!("NVM erased");

    match session.run_application() {
        Ok(mode) => Ok(EraseReport { mode, warning: None }),
        Err(Error::Interrupted) => Err(Error::Interrupted),
        Err(e) => {
            warn!("Application did not start after erase: {e}");
            Ok(EraseReport {
                mode: session.mode(),
                warning: Some(START_APPLICATION_WARNING.to_string()),
            })
        },
    }
}
