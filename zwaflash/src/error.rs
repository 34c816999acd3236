//! Error types for zwaflash.

use crate::mode::DeviceMode;
use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type for zwaflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for zwaflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The serial link could not be opened or the driver never came up.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The device answered, but its mode could not be determined.
    #[error("Mode probe failed: {0}")]
    ModeProbeFailed(String),

    /// Every bootloader entry strategy was exhausted.
    #[error("Failed to enter bootloader (tried: {})", .attempted.join(", "))]
    BootloaderEntryFailed {
        /// Names of the strategies that were attempted, in order.
        attempted: Vec<&'static str>,
    },

    /// A release index, manifest or firmware asset could not be fetched.
    #[error("Download failed: {0}")]
    DownloadFailed(String),

    /// Downloaded bytes do not hash to the published digest.
    #[error("Checksum verification failed: expected {expected}, got {actual}")]
    DigestMismatch {
        /// Published SHA-256 (lowercase hex).
        expected: String,
        /// Computed SHA-256 (lowercase hex).
        actual: String,
    },

    /// A digest string was not of the form `sha256:<64 hex>`.
    #[error("Invalid digest: {0}")]
    InvalidDigest(String),

    /// An archive held no usable firmware image, or more than one.
    #[error("Unsupported archive contents: {0}")]
    UnsupportedArchiveContents(String),

    /// The image format could not be determined from its name and bytes.
    #[error("Unsupported firmware format: {0}")]
    UnsupportedFirmwareFormat(String),

    /// The newest release carries no asset matching the naming convention.
    #[error("No firmware asset matching {pattern} found in release {release}")]
    ReleaseAssetNotFound {
        /// Release tag name.
        release: String,
        /// Human description of the expected asset name.
        pattern: String,
    },

    /// The manifest has no build for the requested chip family.
    #[error("Manifest has no build for chip family {0}")]
    ChipFamilyNotFound(String),

    /// The manifest document is structurally invalid.
    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),

    /// Writing the image to the device failed.
    #[error("Flash write failed: {0}")]
    FlashWriteFailed(String),

    /// The device could not be identified after flashing.
    #[error("Post-flash verification failed: {0}")]
    PostFlashVerificationFailed(String),

    /// The device is in a mode the operation cannot continue from.
    #[error("Device is in {0} mode")]
    UnexpectedMode(DeviceMode),

    /// The bootloader menu has no `erase nvm` option.
    #[error("Erase NVM option not found in bootloader menu")]
    EraseOptionNotFound,

    /// The bootloader never asked to confirm the erase.
    #[error("Erase NVM confirmation not received")]
    EraseConfirmationTimeout,

    /// The bootloader never reported the erase as complete.
    #[error("NVM erase success message not received")]
    ErasePromptTimeout,

    /// The adapter was not power-cycled within the allotted time.
    #[error("Adapter was not power-cycled within {}s", .0.as_secs())]
    PowerCycleTimeout(Duration),

    /// No matching serial port is present.
    #[error("Device not found")]
    DeviceNotFound,

    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// HTTP transport error.
    #[cfg(feature = "http")]
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON decoding error for release indexes and manifests.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// ZIP archive error.
    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// A bounded wait elapsed.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Unexpected bytes on the wire.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// XMODEM transfer error.
    #[error("XMODEM error: {0}")]
    Xmodem(String),

    /// An external flashing tool is missing or failed.
    #[error("External tool error: {0}")]
    Tool(String),

    /// The embedding application asked to stop.
    #[error("Operation interrupted")]
    Interrupted,
}

/// What the user should do about a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Remedy {
    /// Run the same operation again.
    Retry,
    /// Pick another firmware file or source.
    DifferentFirmware,
    /// Check the cable, the port and the bridge GPIO wiring.
    CheckWiring,
    /// Stop; this cannot be fixed from here.
    Abandon,
}

impl Remedy {
    /// Short imperative sentence shown to the user.
    pub fn advice(self) -> &'static str {
        match self {
            Self::Retry => "Try the operation again.",
            Self::DifferentFirmware => "Supply a different firmware file.",
            Self::CheckWiring => {
                "Check the USB connection and the bridge chip's reset and boot GPIO wiring, then try again."
            },
            Self::Abandon => "This cannot be recovered automatically. Contact support.",
        }
    }
}

impl fmt::Display for Remedy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.advice())
    }
}

impl Error {
    /// Which kind of user action can resolve this error.
    pub fn remedy(&self) -> Remedy {
        match self {
            Self::ConnectionFailed(_) | Self::BootloaderEntryFailed { .. } | Self::DeviceNotFound => {
                Remedy::CheckWiring
            },
            #[cfg(feature = "native")]
            Self::Serial(_) => Remedy::CheckWiring,
            Self::DigestMismatch { .. }
            | Self::InvalidDigest(_)
            | Self::UnsupportedArchiveContents(_)
            | Self::UnsupportedFirmwareFormat(_)
            | Self::ReleaseAssetNotFound { .. }
            | Self::ChipFamilyNotFound(_)
            | Self::InvalidManifest(_)
            | Self::PostFlashVerificationFailed(_)
            | Self::UnexpectedMode(_)
            | Self::Json(_)
            | Self::Zip(_) => Remedy::DifferentFirmware,
            Self::EraseOptionNotFound | Self::Tool(_) | Self::Interrupted => Remedy::Abandon,
            Self::ModeProbeFailed(_)
            | Self::DownloadFailed(_)
            | Self::FlashWriteFailed(_)
            | Self::EraseConfirmationTimeout
            | Self::ErasePromptTimeout
            | Self::PowerCycleTimeout(_)
            | Self::Io(_)
            | Self::Timeout(_)
            | Self::Protocol(_)
            | Self::Xmodem(_) => Remedy::Retry,
            #[cfg(feature = "http")]
            Self::Http(_) => Remedy::Retry,
        }
    }

    /// Whether a plain re-run has a reasonable chance of succeeding.
    pub fn is_retriable(&self) -> bool {
        self.remedy() == Remedy::Retry
    }

    /// Stable error code for support requests.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ConnectionFailed(_) => "ZWA-001",
            Self::ModeProbeFailed(_) => "ZWA-002",
            Self::DeviceNotFound => "ZWA-003",
            Self::BootloaderEntryFailed { .. } => "ZWA-010",
            Self::UnexpectedMode(_) => "ZWA-011",
            Self::DownloadFailed(_) => "ZWA-020",
            Self::DigestMismatch { .. } => "ZWA-021",
            Self::InvalidDigest(_) => "ZWA-022",
            Self::ReleaseAssetNotFound { .. } => "ZWA-023",
            Self::ChipFamilyNotFound(_) => "ZWA-024",
            Self::InvalidManifest(_) => "ZWA-025",
            Self::UnsupportedArchiveContents(_) => "ZWA-030",
            Self::UnsupportedFirmwareFormat(_) => "ZWA-031",
            Self::FlashWriteFailed(_) => "ZWA-040",
            Self::PostFlashVerificationFailed(_) => "ZWA-041",
            Self::PowerCycleTimeout(_) => "ZWA-042",
            Self::EraseOptionNotFound => "ZWA-050",
            Self::EraseConfirmationTimeout => "ZWA-051",
            Self::ErasePromptTimeout => "ZWA-052",
            Self::Io(_) => "ZWA-060",
            #[cfg(feature = "native")]
            Self::Serial(_) => "ZWA-061",
            #[cfg(feature = "http")]
            Self::Http(_) => "ZWA-062",
            Self::Json(_) => "ZWA-063",
            Self::Zip(_) => "ZWA-064",
            Self::Timeout(_) => "ZWA-070",
            Self::Protocol(_) => "ZWA-071",
            Self::Xmodem(_) => "ZWA-072",
            Self::Tool(_) => "ZWA-080",
            Self::Interrupted => "ZWA-099",
        }
    }
}
