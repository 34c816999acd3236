//! Command implementations.
//!
//! Each subcommand is implemented in its own module for clean separation.

pub(crate) mod bridge;
pub(crate) mod completions;
pub(crate) mod controller;
pub(crate) mod fetch;
pub(crate) mod inspect;
pub(crate) mod ports;
