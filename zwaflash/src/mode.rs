//! Operating modes of the controller chip.
//!
//! The mode is never cached across reconnects. Every operation that can
//! change it returns the freshly probed value.

use std::fmt;

/// The mode the controller chip is currently running in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeviceMode {
    /// Nothing recognizable answered the probes.
    #[default]
    Unknown,
    /// The Gecko bootloader menu is active.
    Bootloader,
    /// A text command line from non-controller firmware is active.
    CommandLineMenu,
    /// The Serial API of controller firmware is active.
    ApplicationProtocol,
}

impl DeviceMode {
    /// Short human-readable name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Bootloader => "bootloader",
            Self::CommandLineMenu => "CLI",
            Self::ApplicationProtocol => "serial API",
        }
    }

    /// Whether the normal controller application is running.
    pub fn is_application(self) -> bool {
        self == Self::ApplicationProtocol
    }
}

impl fmt::Display for DeviceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
