//! Wizard workflows: install, update, erase, recover and bridge update.
//!
//! Each workflow is a state enum whose `next()` performs one step and
//! returns the following state. The runners ([`install`], [`erase`],
//! [`recover`], [`update_bridge`]) drive the enum to its terminal variant
//! and report every phase change to a [`WorkflowObserver`]. User choices
//! come from a [`Prompter`], so the same workflows back an interactive
//! terminal and a non-interactive run.

mod bridge;
mod controller;
pub mod outcome;
mod recover;

pub use bridge::{BridgeHost, BridgeUpdateOptions, BridgeUpdateReport, BridgeUpdateState, update_bridge};
#[cfg(feature = "native")]
pub use bridge::NativeBridgeHost;
pub use controller::{EraseState, InstallReport, InstallState, erase, erase_outcome, install, verify_application};
pub use outcome::{Outcome, RecoverResult, RecoveryOutcome, Severity, diagnosis_outcome};
pub use recover::{RecoverState, recover};

use crate::diagnose::DiagnosisResult;
use crate::error::Result;
use crate::firmware::manifest::download_manifest_image;
use crate::firmware::release::download_latest;
use crate::firmware::{FirmwareImage, FirmwareSourceConfig, FirmwareTarget, HttpClient, read_firmware_file};
use log::{debug, info};
use std::path::PathBuf;
use std::time::Duration;

/// Something a workflow wants the user to see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowEvent {
    /// A new step started.
    PhaseChanged(&'static str),
    /// Progress of the running step, 0-100.
    Progress(u8),
    /// Informational text.
    Message(String),
}

/// Receives [`WorkflowEvent`]s.
pub trait WorkflowObserver {
    /// Handle one event.
    fn event(&mut self, event: WorkflowEvent);
}

/// Drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl WorkflowObserver for NullObserver {
    fn event(&mut self, _event: WorkflowEvent) {}
}

/// Forwards events to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl WorkflowObserver for LogObserver {
    fn event(&mut self, event: WorkflowEvent) {
        match event {
            WorkflowEvent::PhaseChanged(phase) => info!("Phase: {phase}"),
            WorkflowEvent::Progress(pct) => debug!("Progress: {pct}%"),
            WorkflowEvent::Message(text) => info!("{text}"),
        }
    }
}

/// How the user wants a broken adapter repaired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryChoice {
    /// Download and install the latest controller firmware.
    Latest,
    /// Install a local image.
    Custom(PathBuf),
    /// Leave the adapter as it is.
    Abort,
}

/// Source of the decisions a workflow needs from the user.
pub trait Prompter {
    /// Confirm wiping the NVM.
    fn confirm_erase(&mut self) -> Result<bool>;

    /// Pick a recovery path for `diagnosis`.
    ///
    /// [`RecoveryChoice::Abort`] should only be offered when
    /// [`DiagnosisResult::allows_abort`] holds.
    fn choose_recovery(&mut self, diagnosis: DiagnosisResult) -> Result<RecoveryChoice>;

    /// Decide from the bridge's firmware information whether to update it.
    fn bridge_update_wanted(&mut self, firmware_info: &str) -> bool;

    /// Tell the user to unplug and replug the adapter within `timeout`.
    fn power_cycle_notice(&mut self, timeout: Duration);
}

/// Answers fixed up front, for non-interactive runs.
#[derive(Debug, Clone)]
pub struct FixedAnswers {
    /// Answer to the erase confirmation.
    pub erase: bool,
    /// Answer to the recovery choice.
    pub recovery: RecoveryChoice,
    /// Answer to the bridge version check.
    pub update_bridge: bool,
}

impl Default for FixedAnswers {
    fn default() -> Self {
        Self {
            erase: false,
            recovery: RecoveryChoice::Abort,
            update_bridge: true,
        }
    }
}

impl Prompter for FixedAnswers {
    fn confirm_erase(&mut self) -> Result<bool> {
        Ok(self.erase)
    }

    fn choose_recovery(&mut self, _diagnosis: DiagnosisResult) -> Result<RecoveryChoice> {
        Ok(self
            .recovery
            .clone())
    }

    fn bridge_update_wanted(&mut self, _firmware_info: &str) -> bool {
        self.update_bridge
    }

    fn power_cycle_notice(&mut self, timeout: Duration) {
        info!("Unplug the adapter and plug it back in within {}s", timeout.as_secs());
    }
}

/// Where a workflow takes its firmware image from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirmwareRequest {
    /// The newest published release.
    Latest,
    /// A local file.
    File(PathBuf),
    /// A web-installer manifest.
    Manifest {
        /// Manifest URL.
        url: String,
        /// Build to select.
        chip_family: String,
    },
}

/// Collaborators shared by every workflow.
pub struct WorkflowContext<'a> {
    http: &'a dyn HttpClient,
    sources: FirmwareSourceConfig,
    prompter: &'a mut dyn Prompter,
    observer: &'a mut dyn WorkflowObserver,
}

impl<'a> WorkflowContext<'a> {
    /// Context with the default firmware sources.
    pub fn new(http: &'a dyn HttpClient, prompter: &'a mut dyn Prompter, observer: &'a mut dyn WorkflowObserver) -> Self {
        Self {
            http,
            sources: FirmwareSourceConfig::default(),
            prompter,
            observer,
        }
    }

    /// Use `sources` for release lookups.
    #[must_use]
    pub fn with_sources(mut self, sources: FirmwareSourceConfig) -> Self {
        self.sources = sources;
        self
    }

    /// The user prompt.
    pub fn prompter(&mut self) -> &mut (dyn Prompter + 'a) {
        &mut *self.prompter
    }

    /// Report an event.
    pub fn emit(&mut self, event: WorkflowEvent) {
        self.observer
            .event(event);
    }

    fn phase(&mut self, name: &'static str) {
        debug!("Entering phase {name}");
        self.emit(WorkflowEvent::PhaseChanged(name));
    }

    fn message(&mut self, text: impl Into<String>) {
        self.emit(WorkflowEvent::Message(text.into()));
    }

    /// A progress sink feeding [`WorkflowEvent::Progress`].
    fn progress_sink(&mut self) -> impl FnMut(u8) + '_ {
        move |pct| {
            self.observer
                .event(WorkflowEvent::Progress(pct));
        }
    }

    /// Resolve `request` to an image for `target`.
    pub fn acquire(&mut self, target: FirmwareTarget, request: &FirmwareRequest) -> Result<FirmwareImage> {
        let image = match request {
            FirmwareRequest::Latest => {
                self.message(format!("Downloading the latest {target} firmware"));
                download_latest(self.http, &self.sources, target)?
            },
            FirmwareRequest::File(path) => read_firmware_file(path)?,
            FirmwareRequest::Manifest { url, chip_family } => {
                let (manifest, image) = download_manifest_image(self.http, url, chip_family)?;
                self.message(format!("{} {}", manifest.name, manifest.version));
                image
            },
        };
        self.message(format!("Using {} ({}, {} bytes)", image.file_name(), image.format(), image.len()));
        Ok(image)
    }
}
