//! zwaflash CLI - recover, diagnose and update Z-Wave USB adapters.
//!
//! ## Features
//!
//! - Diagnose the adapter and repair broken controller firmware
//! - Install controller firmware from a file or the latest release
//! - Erase the controller's NVM
//! - Update the bridge chip through its ROM bootloader
//! - Inspect firmware files and fetch release images
//! - Interactive serial port selection
//! - Shell completion generation

use anyhow::Result;
use clap::{ArgGroup, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use log::debug;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use zwaflash::FirmwareTarget;

mod commands;
mod config;
mod serial;
mod ui;

use config::Config;
use serial::{SerialOptions, ask_remember_port, select_serial_port};

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if emoji/animations should be used (TTY and colors enabled).
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether the user pressed Ctrl-C.
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

/// zwaflash - recover and update Z-Wave USB adapters.
///
/// Environment variables:
///   ZWAFLASH_PORT              - Default serial port
///   ZWAFLASH_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
///   ZWAFLASH_ESPTOOL           - esptool executable for bridge updates
#[derive(Parser)]
#[command(name = "zwaflash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[allow(clippy::struct_excessive_bools)]
pub(crate) struct Cli {
    /// Serial port to use (auto-detected if not specified).
    #[arg(short, long, global = true, env = "ZWAFLASH_PORT")]
    port: Option<String>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "ZWAFLASH_NON_INTERACTIVE")]
    non_interactive: bool,

    /// Confirm port selection even for auto-detected ports.
    #[arg(long, global = true)]
    confirm_port: bool,

    /// List all available ports (including unknown types).
    #[arg(long, global = true)]
    list_all_ports: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Which chip a release image is for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum TargetArg {
    /// Z-Wave controller chip (GBL update file).
    Controller,
    /// USB bridge chip (raw image).
    Bridge,
}

impl From<TargetArg> for FirmwareTarget {
    fn from(target: TargetArg) -> Self {
        match target {
            TargetArg::Controller => FirmwareTarget::Controller,
            TargetArg::Bridge => FirmwareTarget::Bridge,
        }
    }
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// List available serial ports.
    ListPorts {
        /// Output as JSON on stdout.
        #[arg(long)]
        json: bool,
    },

    /// Show format, size and checksum of a firmware file.
    Inspect {
        /// Path to the firmware file (.gbl, .bin, .hex or .zip).
        file: PathBuf,

        /// Output as JSON on stdout.
        #[arg(long)]
        json: bool,
    },

    /// Download the latest release image without flashing it.
    Fetch {
        /// Chip the image is for.
        #[arg(value_enum)]
        target: TargetArg,

        /// Directory to save the image in.
        #[arg(short, long, value_name = "DIR")]
        output: Option<PathBuf>,

        /// Download release assets directly instead of through the proxy.
        #[arg(long)]
        no_proxy: bool,
    },

    /// Check the adapter and report what is wrong with it.
    Diagnose,

    /// Diagnose the adapter and repair broken firmware.
    Recover {
        /// Install this file if a repair is needed.
        #[arg(long, value_name = "FILE", conflicts_with = "latest")]
        firmware: Option<PathBuf>,

        /// Install the latest release if a repair is needed.
        #[arg(long)]
        latest: bool,
    },

    /// Install controller firmware.
    #[command(group(ArgGroup::new("source").required(true).args(["file", "latest"])))]
    Install {
        /// Firmware file to install.
        file: Option<PathBuf>,

        /// Install the latest release.
        #[arg(long)]
        latest: bool,
    },

    /// Update the controller firmware from a local file.
    Update {
        /// Firmware file to install.
        file: PathBuf,
    },

    /// Erase the controller's non-volatile memory.
    EraseNvm {
        /// Erase without asking for confirmation.
        #[arg(short, long)]
        yes: bool,
    },

    /// Put the controller chip into its bootloader.
    EnterBootloader,

    /// Update the USB bridge chip firmware.
    #[command(group(ArgGroup::new("source").required(true).args(["firmware", "latest", "manifest"])))]
    UpdateBridge {
        /// Raw bridge image to flash.
        #[arg(long, value_name = "FILE")]
        firmware: Option<PathBuf>,

        /// Flash the latest bridge release.
        #[arg(long)]
        latest: bool,

        /// Web-installer manifest to take the image from.
        #[arg(long, value_name = "URL", requires = "chip_family")]
        manifest: Option<String>,

        /// Build to pick from the manifest.
        #[arg(long, value_name = "NAME", requires = "manifest")]
        chip_family: Option<String>,

        /// Flash even if the running version is current.
        #[arg(long)]
        skip_version_check: bool,

        /// esptool executable.
        #[arg(long, value_name = "PATH", env = "ZWAFLASH_ESPTOOL")]
        esptool: Option<String>,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type (auto-detected with --install if omitted).
        #[arg(value_enum)]
        shell: Option<Shell>,

        /// Install completions into the shell's completion directory.
        #[arg(long)]
        install: bool,
    },
}

/// Failures with a dedicated exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Bad arguments or missing interactive terminal.
    #[error("{0}")]
    Usage(String),
    /// Unusable configuration.
    #[error("{0}")]
    Config(String),
    /// Adapter not found or not reachable.
    #[error("{0}")]
    Device(String),
    /// Firmware could not be obtained or was rejected.
    #[error("{0}")]
    Firmware(String),
    /// The user cancelled.
    #[error("{0}")]
    Cancelled(String),
    /// A workflow ended without reaching its goal.
    #[error("{0}")]
    Failed(String),
}

impl CliError {
    fn exit_code(&self) -> u8 {
        match self {
            Self::Usage(_) => 2,
            Self::Config(_) => 3,
            Self::Device(_) => 4,
            Self::Firmware(_) => 5,
            Self::Cancelled(_) => 130,
            Self::Failed(_) => 1,
        }
    }
}

/// Exit code for a library error.
fn library_exit_code(err: &zwaflash::Error) -> u8 {
    use zwaflash::Error;
    match err {
        Error::Interrupted => 130,
        Error::ConnectionFailed(_)
        | Error::ModeProbeFailed(_)
        | Error::DeviceNotFound
        | Error::BootloaderEntryFailed { .. }
        | Error::Serial(_) => 4,
        Error::DownloadFailed(_)
        | Error::DigestMismatch { .. }
        | Error::InvalidDigest(_)
        | Error::UnsupportedArchiveContents(_)
        | Error::UnsupportedFirmwareFormat(_)
        | Error::ReleaseAssetNotFound { .. }
        | Error::ChipFamilyNotFound(_)
        | Error::InvalidManifest(_)
        | Error::Http(_) => 5,
        _ => 1,
    }
}

fn exit_code(err: &anyhow::Error) -> u8 {
    if let Some(cli) = err.downcast_ref::<CliError>() {
        return cli.exit_code();
    }
    if let Some(lib) = err.downcast_ref::<zwaflash::Error>() {
        return library_exit_code(lib);
    }
    if was_interrupted() { 130 } else { 1 }
}

fn report_error(err: &anyhow::Error) {
    eprintln!(
        "{} {err:#}",
        style("Error:")
            .red()
            .bold()
    );
    if let Some(lib) = err.downcast_ref::<zwaflash::Error>() {
        if !matches!(lib, zwaflash::Error::Interrupted) {
            eprintln!("  {}", lib.remedy());
            eprintln!(
                "  {}",
                style(format!("Error code: {}", lib.error_code())).dim()
            );
        }
    }
}

fn main() -> ExitCode {
    // --- NO_COLOR and TTY detection ---
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!(
        "zwaflash v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    if let Err(e) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::Relaxed)) {
        debug!("Could not install Ctrl-C handler: {e}");
    }
    zwaflash::set_interrupt_checker(was_interrupted);

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            report_error(&err);
            ExitCode::from(exit_code(&err))
        },
    }
}

fn run(cli: &Cli) -> Result<()> {
    let mut config = if let Some(ref path) = cli.config_path {
        if !path.is_file() {
            return Err(CliError::Config(format!("Config file not found: {}", path.display())).into());
        }
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::ListPorts { json } => commands::ports::cmd_list_ports(&config, *json),
        Commands::Inspect { file, json } => commands::inspect::cmd_inspect(file, *json),
        Commands::Fetch {
            target,
            output,
            no_proxy,
        } => commands::fetch::cmd_fetch(&config, (*target).into(), output.as_deref(), *no_proxy),
        Commands::Diagnose => commands::controller::cmd_diagnose(cli, &mut config),
        Commands::Recover { firmware, latest } => {
            commands::controller::cmd_recover(cli, &mut config, firmware.clone(), *latest)
        },
        Commands::Install { file, latest } => {
            commands::controller::cmd_install(cli, &mut config, file.clone(), *latest)
        },
        Commands::Update { file } => commands::controller::cmd_update(cli, &mut config, file.clone()),
        Commands::EraseNvm { yes } => commands::controller::cmd_erase_nvm(cli, &mut config, *yes),
        Commands::EnterBootloader => commands::controller::cmd_enter_bootloader(cli, &mut config),
        Commands::UpdateBridge {
            firmware,
            latest,
            manifest,
            chip_family,
            skip_version_check,
            esptool,
        } => {
            let request = commands::bridge::bridge_request(
                firmware.clone(),
                *latest,
                manifest.clone(),
                chip_family.clone(),
            )?;
            commands::bridge::cmd_update_bridge(
                cli,
                &mut config,
                request,
                !*skip_version_check,
                esptool.as_deref(),
            )
        },
        Commands::Completions { shell, install } => {
            if *install {
                commands::completions::cmd_completions_install(*shell)
            } else {
                let shell = shell.ok_or_else(|| {
                    CliError::Usage(
                        "specify a shell type, e.g.: zwaflash completions bash \
                         (or use zwaflash completions --install)"
                            .into(),
                    )
                })?;
                commands::completions::cmd_completions(shell);
                Ok(())
            }
        },
    }
}

/// Get serial port from CLI args or interactive selection.
pub(crate) fn get_port(cli: &Cli, config: &mut Config) -> Result<String> {
    let options = SerialOptions {
        port: cli
            .port
            .clone(),
        list_all_ports: cli.list_all_ports,
        non_interactive: cli.non_interactive,
        confirm_port: cli.confirm_port,
    };

    let selected = select_serial_port(&options, config)?;

    if !selected.is_known && !cli.non_interactive {
        ask_remember_port(&selected.port, config)?;
    }

    Ok(selected
        .port
        .name)
}
