//! Health diagnosis of a connected adapter.
//!
//! | Mode after connecting | Run application | Result               |
//! |-----------------------|-----------------|----------------------|
//! | serial API            | -               | `NoIssues`           |
//! | CLI                   | -               | `EndDeviceFirmware`  |
//! | bootloader            | serial API      | `StartedApplication` |
//! | bootloader            | CLI             | `EndDeviceFirmware`  |
//! | bootloader            | unknown         | `UnknownFirmware`    |
//! | bootloader            | fails           | `CorruptedFirmware`  |
//! | unknown               | -               | `UnknownFirmware`    |
//! | connection failed     | -               | `ConnectionFailed`   |

use crate::driver::DriverFactory;
use crate::error::{Error, Result};
use crate::mode::DeviceMode;
use crate::session::ControllerSession;
use log::{info, warn};
use std::fmt;

/// Classification of the adapter's health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiagnosisResult {
    /// Controller firmware is running.
    NoIssues,
    /// End-device firmware with a CLI is installed.
    EndDeviceFirmware,
    /// The bootloader could not start the application.
    CorruptedFirmware,
    /// The adapter sat in the bootloader and was started.
    StartedApplication,
    /// Nothing recognizable answered.
    UnknownFirmware,
    /// The serial link or driver could not be brought up.
    ConnectionFailed,
}

/// What to do after a diagnosis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Remediation {
    /// Nothing to repair here; show the summary.
    Summary,
    /// Offer to install the latest or a custom image.
    OfferRecovery,
}

impl DiagnosisResult {
    /// Stable tag used in reports.
    pub fn tag(self) -> &'static str {
        match self {
            Self::NoIssues => "NO_ISSUES",
            Self::EndDeviceFirmware => "END_DEVICE_CLI",
            Self::CorruptedFirmware => "CORRUPTED_FIRMWARE",
            Self::StartedApplication => "STARTED_APPLICATION",
            Self::UnknownFirmware => "UNKNOWN_FIRMWARE",
            Self::ConnectionFailed => "CONNECTION_FAILED",
        }
    }

    /// The remediation branch for this result.
    pub fn remediation(self) -> Remediation {
        match self {
            Self::CorruptedFirmware | Self::UnknownFirmware => Remediation::OfferRecovery,
            Self::NoIssues | Self::EndDeviceFirmware | Self::StartedApplication | Self::ConnectionFailed => {
                Remediation::Summary
            },
        }
    }

    /// Whether the user may decline the offered recovery.
    pub fn allows_abort(self) -> bool {
        self == Self::UnknownFirmware
    }
}

impl fmt::Display for DiagnosisResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Diagnose the outcome of a connection attempt.
///
/// Only an interruption is returned as an error; every other failure is
/// part of the diagnosis.
pub fn diagnose<F: DriverFactory>(connection: &mut Result<ControllerSession<F>>) -> Result<DiagnosisResult> {
    match connection {
        Ok(session) => diagnose_session(session),
        Err(Error::Interrupted) => Err(Error::Interrupted),
        Err(e) => {
            warn!("Connection failed: {e}");
            Ok(DiagnosisResult::ConnectionFailed)
        },
    }
}

/// Diagnose an established session.
pub fn diagnose_session<F: DriverFactory>(session: &mut ControllerSession<F>) -> Result<DiagnosisResult> {
    let mode = session.mode();
    info!("Diagnosing adapter in {mode} mode");

    let result = match mode {
        DeviceMode::ApplicationProtocol => DiagnosisResult::NoIssues,
        DeviceMode::CommandLineMenu => DiagnosisResult::EndDeviceFirmware,
        DeviceMode::Unknown => DiagnosisResult::UnknownFirmware,
        DeviceMode::Bootloader => match session.run_application() {
            Ok(DeviceMode::ApplicationProtocol) => DiagnosisResult::StartedApplication,
            Ok(DeviceMode::CommandLineMenu) => DiagnosisResult::EndDeviceFirmware,
            Ok(DeviceMode::Unknown) => DiagnosisResult::UnknownFirmware,
            Ok(DeviceMode::Bootloader) => DiagnosisResult::CorruptedFirmware,
            Err(Error::Interrupted) => return Err(Error::Interrupted),
            Err(e) => {
                warn!("Could not start the application: {e}");
                DiagnosisResult::CorruptedFirmware
            },
        },
    };
    info!("Diagnosis: {result}");
    Ok(result)
}
