//! Install, update and erase workflows on the controller chip.

use super::outcome::{Outcome, Severity};
use super::{FirmwareRequest, WorkflowContext};
use crate::driver::DriverFactory;
use crate::entry::BootloaderEntry;
use crate::erase::{EraseReport, erase_nvm};
use crate::error::{Error, Result};
use crate::firmware::{FirmwareImage, FirmwareTarget};
use crate::flash::flash_controller;
use crate::mode::DeviceMode;
use crate::session::ControllerSession;
use log::info;

/// Result of a successful install or update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
    /// Name of the installed image.
    pub file_name: String,
    /// Mode after the update.
    pub mode: DeviceMode,
}

impl InstallReport {
    /// User-facing wording.
    pub fn outcome(&self) -> Outcome {
        Outcome::new(
            "INSTALLED",
            Severity::Success,
            "Firmware installed",
            format!(
                "{} was installed and your ZWA-2 adapter is running the Z-Wave controller firmware.",
                self.file_name
            ),
        )
    }
}

/// Fail unless `mode` is the application protocol.
pub fn verify_application(mode: DeviceMode) -> Result<DeviceMode> {
    if mode.is_application() {
        Ok(mode)
    } else {
        Err(Error::PostFlashVerificationFailed(format!(
            "Firmware installed but device is in {mode} mode instead of application mode"
        )))
    }
}

/// Steps of the install and update workflows.
#[derive(Debug)]
pub enum InstallState {
    /// Announce the chosen firmware.
    SelectFirmware(FirmwareRequest),
    /// Download or load the image.
    Acquire(FirmwareRequest),
    /// Enter the bootloader and write the image.
    Flash(FirmwareImage),
    /// Check the mode the chip restarted in.
    Verify {
        /// Name of the written image.
        file_name: String,
        /// Mode found after flashing.
        mode: DeviceMode,
    },
    /// Finished.
    Done(InstallReport),
}

impl InstallState {
    /// Phase name reported to observers.
    pub fn name(&self) -> &'static str {
        match self {
            Self::SelectFirmware(_) => "select-firmware",
            Self::Acquire(_) => "acquire",
            Self::Flash(_) => "flash",
            Self::Verify { .. } => "verify",
            Self::Done(_) => "done",
        }
    }

    /// Run this step and return the next one.
    pub fn next<F: DriverFactory>(
        self,
        session: &mut ControllerSession<F>,
        entry: &BootloaderEntry<F>,
        ctx: &mut WorkflowContext<'_>,
    ) -> Result<Self> {
        Ok(match self {
            Self::SelectFirmware(request) => {
                match &request {
                    FirmwareRequest::Latest => ctx.message("Selected the latest controller firmware"),
                    FirmwareRequest::File(path) => ctx.message(format!("Selected {}", path.display())),
                    FirmwareRequest::Manifest { url, chip_family } => {
                        ctx.message(format!("Selected the {chip_family} build from {url}"));
                    },
                }
                Self::Acquire(request)
            },
            Self::Acquire(request) => Self::Flash(ctx.acquire(FirmwareTarget::Controller, &request)?),
            Self::Flash(image) => {
                let mut sink = ctx.progress_sink();
                let mode = match flash_controller(session, &image, entry, &mut sink) {
                    Ok(mode) | Err(Error::UnexpectedMode(mode)) => mode,
                    Err(Error::PostFlashVerificationFailed(_)) => DeviceMode::Unknown,
                    Err(e) => return Err(e),
                };
                Self::Verify {
                    file_name: image
                        .file_name()
                        .to_string(),
                    mode,
                }
            },
            Self::Verify { file_name, mode } => {
                verify_application(mode)?;
                Self::Done(InstallReport { file_name, mode })
            },
            done @ Self::Done(_) => done,
        })
    }
}

/// Install `request` on the controller chip.
///
/// Also serves the update workflow, which differs only in the request the
/// caller passes.
pub fn install<F: DriverFactory>(
    session: &mut ControllerSession<F>,
    entry: &BootloaderEntry<F>,
    ctx: &mut WorkflowContext<'_>,
    request: FirmwareRequest,
) -> Result<InstallReport> {
    let mut state = InstallState::SelectFirmware(request);
    loop {
        ctx.phase(state.name());
        state = match state {
            InstallState::Done(report) => {
                info!("Installed {}", report.file_name);
                return Ok(report);
            },
            step => step.next(session, entry, ctx)?,
        };
    }
}

/// Steps of the erase workflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EraseState {
    /// Ask the user.
    Confirm,
    /// Enter the bootloader and erase.
    Erase,
    /// Finished; `None` when the user declined.
    Done(Option<EraseReport>),
}

impl EraseState {
    /// Phase name reported to observers.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Confirm => "confirm",
            Self::Erase => "erase",
            Self::Done(_) => "done",
        }
    }

    /// Run this step and return the next one.
    pub fn next<F: DriverFactory>(
        self,
        session: &mut ControllerSession<F>,
        entry: &BootloaderEntry<F>,
        ctx: &mut WorkflowContext<'_>,
    ) -> Result<Self> {
        Ok(match self {
            Self::Confirm => {
                if ctx
                    .prompter()
                    .confirm_erase()?
                {
                    Self::Erase
                } else {
                    ctx.message("Erase cancelled");
                    Self::Done(None)
                }
            },
            Self::Erase => Self::Done(Some(erase_nvm(session, entry)?)),
            done @ Self::Done(_) => done,
        })
    }
}

/// Erase the controller's NVM after confirmation.
pub fn erase<F: DriverFactory>(
    session: &mut ControllerSession<F>,
    entry: &BootloaderEntry<F>,
    ctx: &mut WorkflowContext<'_>,
) -> Result<Option<EraseReport>> {
    let mut state = EraseState::Confirm;
    loop {
        ctx.phase(state.name());
        state = match state {
            EraseState::Done(report) => return Ok(report),
            step => step.next(session, entry, ctx)?,
        };
    }
}

/// User-facing wording of an erase run.
pub fn erase_outcome(report: Option<&EraseReport>) -> Outcome {
    match report {
        None => Outcome::new(
            "CANCELLED",
            Severity::Warning,
            "Erase cancelled",
            "The NVM was not erased.",
        ),
        Some(report) => match &report.warning {
            None => Outcome::new(
                "ERASED",
                Severity::Success,
                "NVM erased",
                "All Z-Wave network data was removed from your ZWA-2 adapter.",
            ),
            Some(warning) => Outcome::new("ERASED_WITH_WARNING", Severity::Warning, "NVM erased", warning.clone()),
        },
    }
}
