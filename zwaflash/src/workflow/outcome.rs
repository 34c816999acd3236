//! Terminal outcomes and their user-facing wording.

use crate::diagnose::DiagnosisResult;
use std::fmt;

/// How a terminal outcome should be presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Nothing left to do.
    Success,
    /// Usable, but the user should act.
    Warning,
    /// The operation failed.
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Success => "success",
            Self::Warning => "warning",
            Self::Error => "error",
        })
    }
}

/// A terminal outcome with its explanation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    /// Stable tag.
    pub tag: &'static str,
    /// Presentation severity.
    pub severity: Severity,
    /// One-line headline.
    pub title: &'static str,
    /// Explanation for the user.
    pub message: String,
}

impl Outcome {
    /// Build an outcome.
    pub fn new(tag: &'static str, severity: Severity, title: &'static str, message: impl Into<String>) -> Self {
        Self {
            tag,
            severity,
            title,
            message: message.into(),
        }
    }

    /// Whether the outcome is a success.
    pub fn is_success(&self) -> bool {
        self.severity == Severity::Success
    }
}

/// Terminal state of a recovery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecoveryOutcome {
    /// Fresh firmware was installed and the application runs.
    Recovered,
    /// The attempt did not bring the application back.
    RecoveryFailed,
    /// The latest firmware could not be downloaded.
    DownloadFailed,
    /// An invalid controller node ID was corrected.
    FixedInvalidControllerId,
    /// Correcting an invalid controller node ID failed.
    FixInvalidControllerIdFailed,
}

impl RecoveryOutcome {
    /// Stable tag.
    pub fn tag(self) -> &'static str {
        match self {
            Self::Recovered => "RECOVERED",
            Self::RecoveryFailed => "RECOVERY_FAILED",
            Self::DownloadFailed => "DOWNLOAD_FAILED",
            Self::FixedInvalidControllerId => "FIXED_CONTROLLER_NODE_ID_239",
            Self::FixInvalidControllerIdFailed => "FIXING_CONTROLLER_NODE_ID_239_FAILED",
        }
    }

    /// User-facing wording.
    pub fn outcome(self) -> Outcome {
        let (severity, title, message) = match self {
            Self::Recovered => (
                Severity::Success,
                "Adapter successfully recovered",
                "Your ZWA-2 adapter has been successfully recovered by installing fresh firmware. \
                 It is now ready to use as a Z-Wave controller.",
            ),
            Self::RecoveryFailed => (
                Severity::Error,
                "Recovery failed",
                "The recovery process failed to restore your ZWA-2 adapter to a working state.",
            ),
            Self::DownloadFailed => (
                Severity::Error,
                "Firmware download failed",
                "Failed to download the latest firmware from the internet. This could be due to a network \
                 connectivity issue or the firmware repository being temporarily unavailable. \
                 Check your internet connection and try again, or install a custom firmware file.",
            ),
            Self::FixedInvalidControllerId => (
                Severity::Success,
                "Controller node ID corrected",
                "The invalid controller node ID on your ZWA-2 adapter has been successfully corrected.",
            ),
            Self::FixInvalidControllerIdFailed => (
                Severity::Error,
                "Failed to correct controller node ID",
                "Failed to correct the invalid controller node ID on your ZWA-2 adapter.",
            ),
        };
        Outcome::new(self.tag(), severity, title, message)
    }
}

/// User-facing wording of a diagnosis that ends the recovery workflow.
pub fn diagnosis_outcome(result: DiagnosisResult) -> Outcome {
    let (severity, title, message) = match result {
        DiagnosisResult::NoIssues => (
            Severity::Success,
            "Adapter is working properly",
            "Your ZWA-2 adapter is working correctly and is ready to use as a Z-Wave controller.",
        ),
        DiagnosisResult::StartedApplication => (
            Severity::Success,
            "Adapter successfully recovered",
            "Your ZWA-2 adapter was in bootloader mode but has been successfully started. \
             It is now ready to use as a Z-Wave controller.",
        ),
        DiagnosisResult::EndDeviceFirmware => (
            Severity::Warning,
            "Wrong firmware detected",
            "Your ZWA-2 adapter is running an end device CLI firmware, which may cause it to appear \
             unresponsive in Z-Wave controller applications. Install the Z-Wave controller firmware \
             to fix this.",
        ),
        DiagnosisResult::ConnectionFailed => (
            Severity::Error,
            "Connection failed",
            "Unable to establish a connection with your ZWA-2 adapter. \
             This issue cannot be recovered automatically.",
        ),
        DiagnosisResult::CorruptedFirmware => (
            Severity::Error,
            "Recovery required",
            "Your ZWA-2 adapter has corrupted firmware and requires recovery, but no recovery was attempted.",
        ),
        DiagnosisResult::UnknownFirmware => (
            Severity::Warning,
            "Unknown firmware",
            "Your ZWA-2 adapter is running an unknown firmware that is not recognized as a standard \
             Z-Wave controller firmware.",
        ),
    };
    Outcome::new(result.tag(), severity, title, message)
}

/// Where the recovery workflow ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoverResult {
    /// The diagnosis itself was final.
    Diagnosis(DiagnosisResult),
    /// A recovery was attempted.
    Recovery(RecoveryOutcome),
}

impl RecoverResult {
    /// User-facing wording.
    pub fn outcome(self) -> Outcome {
        match self {
            Self::Diagnosis(result) => diagnosis_outcome(result),
            Self::Recovery(outcome) => outcome.outcome(),
        }
    }
}
