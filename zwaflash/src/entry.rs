//! Controller-chip bootloader entry.
//!
//! Entry is an ordered list of named strategies. Each one gets the session,
//! does its thing and re-probes; the first that lands in the bootloader wins.
//!
//! | Strategy              | Applies when                          |
//! |-----------------------|---------------------------------------|
//! | `direct-command`      | application mode with a direct command |
//! | `hardware-reset`      | always                                |
//! | `bridge-command-mode` | always                                |

use crate::bridge::{self, BridgeEntryOptions};
use crate::driver::DriverFactory;
use crate::error::{Error, Result};
use crate::mode::DeviceMode;
use crate::port::ControlSignals;
use crate::session::ControllerSession;
use log::{debug, info, warn};
use std::thread;
use std::time::Duration;

/// Result of a bootloader entry attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootloaderEntryOutcome {
    /// The chip is in its bootloader.
    Success,
    /// Every strategy was tried without reaching the bootloader.
    Failed,
    /// The caller's version check decided no update is needed.
    NoUpdateNeeded,
}

/// Delays of the hardware reset sequence.
#[derive(Debug, Clone)]
pub struct EntryTimings {
    /// DTR low/RTS high settle time.
    pub settle: Duration,
    /// DTR high/RTS low hold time.
    pub hold: Duration,
    /// Wait after releasing both lines.
    pub release: Duration,
    /// Wait before re-probing after a command-based reset.
    pub probe_delay: Duration,
}

impl Default for EntryTimings {
    fn default() -> Self {
        Self {
            settle: Duration::from_millis(100),
            hold: Duration::from_millis(500),
            release: Duration::from_millis(500),
            probe_delay: Duration::from_millis(500),
        }
    }
}

impl EntryTimings {
    /// All delays zero.
    pub fn immediate() -> Self {
        Self {
            settle: Duration::ZERO,
            hold: Duration::ZERO,
            release: Duration::ZERO,
            probe_delay: Duration::ZERO,
        }
    }
}

/// What a single strategy achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    /// The re-probe found the bootloader.
    Reached,
    /// The strategy ran but the chip is elsewhere.
    Missed,
    /// The strategy does not apply to the current state.
    Skipped,
}

/// Settings shared by all strategies.
#[derive(Debug, Clone, Default)]
pub struct EntryConfig {
    /// Hardware reset delays.
    pub timings: EntryTimings,
    /// Bridge command mode settings.
    pub bridge: BridgeEntryOptions,
}

/// Signature of one entry strategy.
pub type StrategyFn<F> = fn(&mut ControllerSession<F>, &EntryConfig) -> Result<Attempt>;

/// A named entry strategy.
pub struct Strategy<F: DriverFactory> {
    /// Name reported in logs and errors.
    pub name: &'static str,
    /// The attempt itself.
    pub attempt: StrategyFn<F>,
}

fn reached(mode: DeviceMode) -> Attempt {
    if mode == DeviceMode::Bootloader {
        Attempt::Reached
    } else {
        Attempt::Missed
    }
}

/// Use the application protocol's own enter-bootloader command.
pub fn direct_command<F: DriverFactory>(session: &mut ControllerSession<F>, _config: &EntryConfig) -> Result<Attempt> {
    let Some(driver) = session.driver_mut() else {
        return Ok(Attempt::Skipped);
    };
    if !driver
        .mode()
        .is_application()
        || !driver.supports_enter_bootloader()
    {
        return Ok(Attempt::Skipped);
    }
    driver.enter_bootloader()?;
    Ok(reached(session.reprobe()))
}

/// Pulse DTR/RTS to reset the chip into its bootloader.
pub fn hardware_reset<F: DriverFactory>(session: &mut ControllerSession<F>, config: &EntryConfig) -> Result<Attempt> {
    let timings = &config.timings;
    let pulsed = session.with_raw(|link| -> Result<()> {
        link.set_signals(ControlSignals::new(false, true))?;
        thread::sleep(timings.settle);
        link.set_signals(ControlSignals::new(true, false))?;
        thread::sleep(timings.hold);
        link.set_signals(ControlSignals::new(false, false))?;
        Ok(())
    });
    match pulsed {
        Some(result) => result?,
        None => return Ok(Attempt::Skipped),
    }
    thread::sleep(timings.release);
    Ok(reached(session.reprobe()))
}

/// Have the bridge chip reset the controller through its command menu.
pub fn bridge_command_mode<F: DriverFactory>(
    session: &mut ControllerSession<F>,
    config: &EntryConfig,
) -> Result<Attempt> {
    let Some(outcome) = session.with_raw(|link| bridge::reset_controller_via_command_mode(link, &config.bridge))
    else {
        return Ok(Attempt::Skipped);
    };
    if outcome? != BootloaderEntryOutcome::Success {
        // A silent menu can still have reset the controller.
        debug!("No command menu; checking for the bootloader anyway");
    }
    thread::sleep(config.timings.probe_delay);
    Ok(reached(session.reprobe()))
}

/// Ordered bootloader entry strategies.
pub struct BootloaderEntry<F: DriverFactory> {
    strategies: Vec<Strategy<F>>,
    config: EntryConfig,
}

impl<F: DriverFactory> Default for BootloaderEntry<F> {
    fn default() -> Self {
        Self::new(EntryConfig::default())
    }
}

impl<F: DriverFactory> BootloaderEntry<F> {
    /// The standard strategy order.
    pub fn new(config: EntryConfig) -> Self {
        Self {
            strategies: vec![
                Strategy {
                    name: "direct-command",
                    attempt: direct_command::<F>,
                },
                Strategy {
                    name: "hardware-reset",
                    attempt: hardware_reset::<F>,
                },
                Strategy {
                    name: "bridge-command-mode",
                    attempt: bridge_command_mode::<F>,
                },
            ],
            config,
        }
    }

    /// A custom strategy list.
    pub fn with_strategies(strategies: Vec<Strategy<F>>, config: EntryConfig) -> Self {
        Self { strategies, config }
    }

    /// Names of the strategies, in order.
    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies
            .iter()
            .map(|s| s.name)
            .collect()
    }

    /// Run the strategies until one reaches the bootloader.
    ///
    /// Returns the names of the strategies that ran when none succeeded.
    fn run(&self, session: &mut ControllerSession<F>) -> Result<std::result::Result<(), Vec<&'static str>>> {
        if session.mode() == DeviceMode::Bootloader {
            debug!("Already in bootloader");
            return Ok(Ok(()));
        }

        let mut attempted = Vec::new();
        for strategy in &self.strategies {
            debug!("Trying bootloader entry strategy {}", strategy.name);
            match (strategy.attempt)(session, &self.config) {
                Ok(Attempt::Reached) => {
                    info!("Entered bootloader via {}", strategy.name);
                    return Ok(Ok(()));
                },
                Ok(Attempt::Missed) => {
                    warn!("{} did not reach the bootloader", strategy.name);
                    attempted.push(strategy.name);
                },
                Ok(Attempt::Skipped) => {},
                Err(Error::Interrupted) => return Err(Error::Interrupted),
                Err(e) => {
                    warn!("{} failed: {e}", strategy.name);
                    attempted.push(strategy.name);
                },
            }
        }
        Ok(Err(attempted))
    }

    /// Drive the controller into its bootloader.
    pub fn enter(&self, session: &mut ControllerSession<F>) -> Result<BootloaderEntryOutcome> {
        Ok(match self.run(session)? {
            Ok(()) => BootloaderEntryOutcome::Success,
            Err(_) => BootloaderEntryOutcome::Failed,
        })
    }

    /// Like [`Self::enter`], but a failure is an error naming the strategies tried.
    pub fn ensure(&self, session: &mut ControllerSession<F>) -> Result<()> {
        self.run(session)?
            .map_err(|attempted| Error::BootloaderEntryFailed { attempted })
    }
}
