//! Gecko bootloader text menu.
//!
//! The controller chip's bootloader prints a numbered menu and waits at a
//! `BL >` prompt:
//!
//! ```text
//! Gecko Bootloader v1.12.00
//! 1. upload gbl
//! 2. run
//! 3. ebl info
//! 4. erase nvm
//! BL >
//! ```
//!
//! Selecting an option means sending its number as a single ASCII digit.

/// Banner printed at the top of the menu.
pub const PREAMBLE: &str = "Gecko Bootloader";

/// Prompt printed after the option list.
pub const PROMPT: &str = "BL >";

/// Label of the upload option.
pub const UPLOAD_OPTION: &str = "upload gbl";

/// Label of the run-application option.
pub const RUN_OPTION: &str = "run";

/// Label of the erase option.
pub const ERASE_NVM_OPTION: &str = "erase nvm";

/// Line printed when an upload is ready to receive.
pub const BEGIN_UPLOAD: &str = "begin upload";

/// One numbered menu entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MenuOption {
    /// Number to send to select the option.
    pub num: u8,
    /// Lowercased label.
    pub label: String,
}

/// A parsed bootloader menu.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BootloaderMenu {
    /// Version string from the banner, if present.
    pub version: Option<String>,
    /// Options in the order they were printed.
    pub options: Vec<MenuOption>,
}

impl BootloaderMenu {
    /// Find an option by exact label.
    pub fn find(&self, label: &str) -> Option<&MenuOption> {
        self.options
            .iter()
            .find(|o| o.label == label)
    }
}

/// Whether `text` contains a complete menu ending at the prompt.
pub fn is_complete_menu(text: &str) -> bool {
    text.find(PREAMBLE)
        .is_some_and(|start| text[start..].contains(PROMPT))
}

/// Parse one `N. label` line.
fn parse_option_line(line: &str) -> Option<MenuOption> {
    let (num, label) = line
        .trim()
        .split_once(". ")?;
    let num = num.parse().ok()?;
    let label = label.trim();
    if label.is_empty() {
        return None;
    }
    Some(MenuOption {
        num,
        label: label.to_lowercase(),
    })
}

/// Parse the last complete menu found in `text`.
pub fn parse_menu(text: &str) -> Option<BootloaderMenu> {
    let start = text.rfind(PREAMBLE)?;
    let body = &text[start..];
    let end = body.find(PROMPT)?;
    let mut lines = body[..end].lines();

    let banner = lines.next()?;
    let version = banner[PREAMBLE.len()..]
        .trim()
        .trim_start_matches('v')
        .to_string();

    Some(BootloaderMenu {
        version: (!version.is_empty()).then_some(version),
        options: lines
            .filter_map(parse_option_line)
            .collect(),
    })
}
