//! Protocol implementations.

pub mod gecko;
pub mod xmodem;

pub use gecko::{BootloaderMenu, MenuOption};
