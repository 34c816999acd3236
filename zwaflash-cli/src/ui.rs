//! Terminal presentation: progress bars, prompts and outcome summaries.

use console::style;
use dialoguer::{Confirm, Select, theme::ColorfulTheme};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::debug;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use zwaflash::DiagnosisResult;
use zwaflash::workflow::{Outcome, Prompter, RecoveryChoice, Severity, WorkflowEvent, WorkflowObserver};

use crate::use_fancy_output;

/// Renders workflow events on stderr.
pub(crate) struct TerminalObserver {
    quiet: bool,
    bar: Option<ProgressBar>,
}

impl TerminalObserver {
    pub(crate) fn new(quiet: bool) -> Self {
        Self { quiet, bar: None }
    }

    fn progress_bar(&mut self) -> &ProgressBar {
        let quiet = self.quiet;
        self.bar
            .get_or_insert_with(|| new_progress_bar(quiet))
    }

    fn finish_bar(&mut self) {
        if let Some(bar) = self
            .bar
            .take()
        {
            bar.finish_and_clear();
        }
    }
}

impl Drop for TerminalObserver {
    fn drop(&mut self) {
        self.finish_bar();
    }
}

fn new_progress_bar(quiet: bool) -> ProgressBar {
    if quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(100);
    if let Ok(bar_style) =
        ProgressStyle::default_bar().template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
    {
        pb.set_style(bar_style.progress_chars("#>-"));
    }
    pb.set_draw_target(ProgressDrawTarget::stderr());
    pb
}

/// Status line for a workflow phase, `None` for silent phases.
fn phase_line(phase: &str) -> Option<&'static str> {
    Some(match phase {
        "diagnose" => "Checking adapter",
        "acquire" => "Getting firmware",
        "flash" => "Flashing firmware",
        "verify" => "Verifying",
        "erase" => "Erasing NVM",
        "enter-bootloader" => "Entering bridge bootloader",
        "await-bootloader-port" => "Waiting for bridge bootloader port",
        "await-power-cycle" => "Waiting for power cycle",
        _ => return None,
    })
}

impl WorkflowObserver for TerminalObserver {
    fn event(&mut self, event: WorkflowEvent) {
        match event {
            WorkflowEvent::PhaseChanged(phase) => {
                self.finish_bar();
                debug!("Phase {phase}");
                if let (false, Some(line)) = (self.quiet, phase_line(phase)) {
                    eprintln!("{} {line}", style("⏳").yellow());
                }
            },
            WorkflowEvent::Progress(pct) => {
                self.progress_bar()
                    .set_position(u64::from(pct));
            },
            WorkflowEvent::Message(text) => {
                if self.quiet {
                    return;
                }
                match &self.bar {
                    Some(bar) => bar.println(format!("  {text}")),
                    None => eprintln!("  {}", style(text).dim()),
                }
            },
        }
    }
}

fn to_library_error(err: dialoguer::Error) -> zwaflash::Error {
    match err {
        dialoguer::Error::IO(e) if e.kind() == io::ErrorKind::Interrupted => zwaflash::Error::Interrupted,
        dialoguer::Error::IO(e) => zwaflash::Error::Io(e),
    }
}

/// Answers the workflows' questions on the terminal.
///
/// Answers given on the command line are used without asking; in
/// non-interactive mode unanswered questions take the safe default.
pub(crate) struct TerminalPrompter {
    pub(crate) interactive: bool,
    pub(crate) erase_confirmed: bool,
    pub(crate) recovery: Option<RecoveryChoice>,
}

impl TerminalPrompter {
    pub(crate) fn new(interactive: bool) -> Self {
        Self {
            interactive,
            erase_confirmed: false,
            recovery: None,
        }
    }
}

impl Prompter for TerminalPrompter {
    fn confirm_erase(&mut self) -> zwaflash::Result<bool> {
        if self.erase_confirmed {
            return Ok(true);
        }
        if !self.interactive {
            eprintln!("{} Pass --yes to erase the NVM without asking", style("⚠").yellow());
            return Ok(false);
        }
        eprintln!(
            "{} Erasing the NVM removes the Z-Wave network and all included devices from the adapter.",
            style("⚠").yellow()
        );
        Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt("Erase the NVM now?")
            .default(false)
            .interact()
            .map_err(to_library_error)
    }

    fn choose_recovery(&mut self, diagnosis: DiagnosisResult) -> zwaflash::Result<RecoveryChoice> {
        if let Some(choice) = self
            .recovery
            .clone()
        {
            return Ok(choice);
        }
        if !self.interactive {
            return Ok(RecoveryChoice::Abort);
        }

        let mut items = vec!["Install the latest controller firmware", "Install a firmware file"];
        if diagnosis.allows_abort() {
            items.push("Leave the adapter as it is");
        }
        let index = Select::with_theme(&ColorfulTheme::default())
            .with_prompt(format!("Adapter diagnosis: {diagnosis}. How do you want to recover?"))
            .items(&items)
            .default(0)
            .interact()
            .map_err(to_library_error)?;

        Ok(match index {
            0 => RecoveryChoice::Latest,
            1 => {
                let path: String = dialoguer::Input::with_theme(&ColorfulTheme::default())
                    .with_prompt("Path to the firmware file")
                    .interact_text()
                    .map_err(to_library_error)?;
                RecoveryChoice::Custom(PathBuf::from(path.trim()))
            },
            _ => RecoveryChoice::Abort,
        })
    }

    fn bridge_update_wanted(&mut self, firmware_info: &str) -> bool {
        if !self.interactive {
            return true;
        }
        eprintln!("{} Bridge firmware:", style("ℹ").blue());
        for line in firmware_info.lines() {
            eprintln!("    {line}");
        }
        Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt("Update the bridge firmware?")
            .default(true)
            .interact()
            .unwrap_or(false)
    }

    fn power_cycle_notice(&mut self, timeout: Duration) {
        eprintln!(
            "{} Unplug the adapter and plug it back in within {} seconds.",
            style("🔌").cyan(),
            timeout.as_secs()
        );
    }
}

/// Print the final outcome of a workflow.
pub(crate) fn print_outcome(outcome: &Outcome) {
    let (mark, title) = match outcome.severity {
        Severity::Success => (
            style("✓")
                .green()
                .bold(),
            style(outcome.title)
                .green()
                .bold(),
        ),
        Severity::Warning => (
            style("⚠")
                .yellow()
                .bold(),
            style(outcome.title)
                .yellow()
                .bold(),
        ),
        Severity::Error => (
            style("✗")
                .red()
                .bold(),
            style(outcome.title)
                .red()
                .bold(),
        ),
    };
    eprintln!("\n{mark} {title}");
    eprintln!("  {}", outcome.message);
    debug!("Outcome tag: {}", outcome.tag);
}
