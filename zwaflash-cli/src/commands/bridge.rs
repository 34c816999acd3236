//! Bridge chip firmware update.

use {
    crate::{
        Cli, CliError,
        commands::controller::{Terminal, finish},
        config::Config,
        get_port,
    },
    anyhow::Result,
    log::debug,
    std::path::PathBuf,
    zwaflash::{
        NativeLink,
        workflow::{BridgeUpdateOptions, FirmwareRequest, NativeBridgeHost, update_bridge},
    },
};

/// Where the bridge image comes from, from the command-line flags.
pub(crate) fn bridge_request(
    firmware: Option<PathBuf>,
    latest: bool,
    manifest: Option<String>,
    chip_family: Option<String>,
) -> Result<FirmwareRequest> {
    match (firmware, latest, manifest, chip_family) {
        (Some(path), false, None, _) => Ok(FirmwareRequest::File(path)),
        (None, true, None, _) => Ok(FirmwareRequest::Latest),
        (None, false, Some(url), Some(chip_family)) => Ok(FirmwareRequest::Manifest { url, chip_family }),
        _ => Err(CliError::Usage(
            "pass exactly one of --firmware, --latest or --manifest with --chip-family".into(),
        )
        .into()),
    }
}

/// Update bridge command implementation.
pub(crate) fn cmd_update_bridge(
    cli: &Cli,
    config: &mut Config,
    request: FirmwareRequest,
    version_check: bool,
    esptool: Option<&str>,
) -> Result<()> {
    let port = get_port(cli, config)?;
    let esptool = esptool.unwrap_or_else(|| {
        config
            .bridge
            .esptool()
    });
    debug!("Updating bridge on {port} with {esptool}");

    let options = BridgeUpdateOptions {
        version_check,
        power_cycle_timeout: config
            .bridge
            .power_cycle_timeout(),
        ..BridgeUpdateOptions::default()
    };
    let mut host = NativeBridgeHost::new(
        esptool,
        config
            .bridge
            .port_timeout(),
    );
    let mut link = NativeLink::new(port);

    let mut terminal = Terminal::new(cli)?;
    let report = {
        let mut ctx = terminal.context(config);
        update_bridge(&mut link, &mut host, &options, &mut ctx, request)
    };
    drop(terminal);
    finish(&report?.outcome())
}
