//! Controller chip commands: diagnose, recover, install, update, erase and
//! bootloader entry.

use {
    crate::{
        Cli, CliError,
        config::Config,
        get_port,
        ui::{TerminalObserver, TerminalPrompter, print_outcome},
    },
    anyhow::Result,
    console::style,
    log::debug,
    std::{io::IsTerminal, path::PathBuf},
    zwaflash::{
        BootloaderEntry, ControllerSession, DEFAULT_BAUD, EntryConfig, GeckoDriverFactory, NativeLink, Remediation,
        diagnose,
        firmware::ReqwestClient,
        workflow::{
            self, FirmwareRequest, Outcome, RecoverResult, RecoveryChoice, Severity, WorkflowContext,
            diagnosis_outcome, erase_outcome,
        },
    },
};

type Session = ControllerSession<GeckoDriverFactory>;

/// Open the adapter's port and start a driver on it.
fn connect(port: &str) -> zwaflash::Result<Session> {
    debug!("Connecting to {port} at {DEFAULT_BAUD} baud");
    ControllerSession::connect(GeckoDriverFactory::default(), Box::new(NativeLink::new(port)), DEFAULT_BAUD)
}

fn close(session: Session) {
    if let Err(e) = session.close() {
        debug!("Closing session: {e}");
    }
}

/// Whether prompts may be shown.
pub(crate) fn is_interactive(cli: &Cli) -> bool {
    !cli.non_interactive && std::io::stdin().is_terminal()
}

/// Terminal collaborators of a workflow run.
pub(crate) struct Terminal {
    http: ReqwestClient,
    pub(crate) prompter: TerminalPrompter,
    observer: TerminalObserver,
}

impl Terminal {
    pub(crate) fn new(cli: &Cli) -> Result<Self> {
        Ok(Self {
            http: ReqwestClient::new()?,
            prompter: TerminalPrompter::new(is_interactive(cli)),
            observer: TerminalObserver::new(cli.quiet),
        })
    }

    pub(crate) fn context(&mut self, config: &Config) -> WorkflowContext<'_> {
        WorkflowContext::new(&self.http, &mut self.prompter, &mut self.observer).with_sources(
            config
                .firmware
                .sources(),
        )
    }
}

/// Error for an outcome that did not reach its goal.
fn outcome_failure(outcome: &Outcome) -> CliError {
    let message = format!("{} ({})", outcome.title, outcome.tag);
    match outcome.tag {
        "CONNECTION_FAILED" => CliError::Device(message),
        "DOWNLOAD_FAILED" => CliError::Firmware(message),
        _ => CliError::Failed(message),
    }
}

/// Print `outcome` and turn an error severity into a failure.
pub(crate) fn finish(outcome: &Outcome) -> Result<()> {
    print_outcome(outcome);
    match outcome.severity {
        Severity::Error => Err(outcome_failure(outcome).into()),
        Severity::Success | Severity::Warning => Ok(()),
    }
}

/// Diagnose command implementation.
pub(crate) fn cmd_diagnose(cli: &Cli, config: &mut Config) -> Result<()> {
    let port = get_port(cli, config)?;
    let mut connection = connect(&port);
    let result = diagnose(&mut connection)?;
    if let Ok(session) = connection {
        close(session);
    }

    let outcome = diagnosis_outcome(result);
    if result.remediation() == Remediation::OfferRecovery {
        print_outcome(&outcome);
        eprintln!(
            "\n  Run {} to repair the adapter.",
            style("zwaflash recover").cyan()
        );
        return Err(outcome_failure(&outcome).into());
    }
    finish(&outcome)
}

/// Recovery choice given on the command line.
fn preset_recovery(firmware: Option<PathBuf>, latest: bool) -> Option<RecoveryChoice> {
    match (firmware, latest) {
        (Some(path), _) => Some(RecoveryChoice::Custom(path)),
        (None, true) => Some(RecoveryChoice::Latest),
        (None, false) => None,
    }
}

/// Recover command implementation.
pub(crate) fn cmd_recover(cli: &Cli, config: &mut Config, firmware: Option<PathBuf>, latest: bool) -> Result<()> {
    let port = get_port(cli, config)?;
    let mut terminal = Terminal::new(cli)?;
    terminal
        .prompter
        .recovery = preset_recovery(firmware, latest);

    let entry = BootloaderEntry::new(EntryConfig::default());
    let mut connection = connect(&port);
    let result = {
        let mut ctx = terminal.context(config);
        workflow::recover(&mut connection, &entry, &mut ctx)?
    };
    drop(terminal);
    if let Ok(session) = connection {
        close(session);
    }

    if let RecoverResult::Diagnosis(diagnosis) = result {
        if diagnosis.remediation() == Remediation::OfferRecovery {
            // Declined recovery leaves the adapter broken.
            print_outcome(&result.outcome());
            return Err(CliError::Failed(
                "Recovery was not attempted; pass --latest or --firmware to repair without prompts".into(),
            )
            .into());
        }
    }
    finish(&result.outcome())
}

fn run_install(cli: &Cli, config: &mut Config, request: FirmwareRequest) -> Result<()> {
    let port = get_port(cli, config)?;
    let mut terminal = Terminal::new(cli)?;
    let entry = BootloaderEntry::new(EntryConfig::default());
    let mut session = connect(&port)?;
    let report = {
        let mut ctx = terminal.context(config);
        workflow::install(&mut session, &entry, &mut ctx, request)
    };
    drop(terminal);
    close(session);
    finish(&report?.outcome())
}

/// Install command implementation.
pub(crate) fn cmd_install(cli: &Cli, config: &mut Config, file: Option<PathBuf>, latest: bool) -> Result<()> {
    let request = match (file, latest) {
        (Some(path), false) => FirmwareRequest::File(path),
        (None, true) => FirmwareRequest::Latest,
        _ => return Err(CliError::Usage("install needs either a FILE or --latest".into()).into()),
    };
    run_install(cli, config, request)
}

/// Update command implementation.
pub(crate) fn cmd_update(cli: &Cli, config: &mut Config, file: PathBuf) -> Result<()> {
    run_install(cli, config, FirmwareRequest::File(file))
}

/// Erase NVM command implementation.
pub(crate) fn cmd_erase_nvm(cli: &Cli, config: &mut Config, yes: bool) -> Result<()> {
    if cli.non_interactive && !yes {
        return Err(CliError::Usage("erase-nvm needs --yes in non-interactive mode".into()).into());
    }
    let port = get_port(cli, config)?;
    let mut terminal = Terminal::new(cli)?;
    terminal
        .prompter
        .erase_confirmed = yes;

    let entry = BootloaderEntry::new(EntryConfig::default());
    let mut session = connect(&port)?;
    let report = {
        let mut ctx = terminal.context(config);
        workflow::erase(&mut session, &entry, &mut ctx)
    };
    drop(terminal);
    close(session);

    let report = report?;
    let outcome = erase_outcome(report.as_ref());
    if report.is_none() {
        print_outcome(&outcome);
        return Err(CliError::Cancelled("NVM erase cancelled".into()).into());
    }
    finish(&outcome)
}

/// Enter bootloader command implementation.
pub(crate) fn cmd_enter_bootloader(cli: &Cli, config: &mut Config) -> Result<()> {
    let port = get_port(cli, config)?;
    let mut session = connect(&port)?;
    let entry = BootloaderEntry::new(EntryConfig::default());
    let result = entry.ensure(&mut session);
    close(session);
    result?;

    eprintln!(
        "{} Controller is in bootloader mode on {}",
        style("✓")
            .green()
            .bold(),
        style(&port).cyan()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preset_recovery() {
        assert_eq!(preset_recovery(None, false), None);
        assert_eq!(preset_recovery(None, true), Some(RecoveryChoice::Latest));
        assert_eq!(
            preset_recovery(Some(PathBuf::from("fw.gbl")), false),
            Some(RecoveryChoice::Custom(PathBuf::from("fw.gbl")))
        );
    }

    #[test]
    fn test_outcome_failure_kinds() {
        let connection = diagnosis_outcome(zwaflash::DiagnosisResult::ConnectionFailed);
        assert!(matches!(outcome_failure(&connection), CliError::Device(_)));

        let download = workflow::RecoveryOutcome::DownloadFailed.outcome();
        assert!(matches!(outcome_failure(&download), CliError::Firmware(_)));

        let failed = workflow::RecoveryOutcome::RecoveryFailed.outcome();
        let err = outcome_failure(&failed);
        assert!(matches!(err, CliError::Failed(_)));
        assert!(
            err.to_string()
                .contains("RECOVERY_FAILED")
        );
    }

    #[test]
    fn test_finish_passes_warnings() {
        let warning = diagnosis_outcome(zwaflash::DiagnosisResult::EndDeviceFirmware);
        assert!(finish(&warning).is_ok());
        let error = diagnosis_outcome(zwaflash::DiagnosisResult::CorruptedFirmware);
        assert!(finish(&error).is_err());
    }
}
