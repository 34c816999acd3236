//! Release download without flashing.

use {
    crate::{CliError, config::Config},
    anyhow::{Context, Result},
    console::style,
    log::debug,
    std::{
        fs,
        path::{Path, PathBuf},
    },
    zwaflash::{
        FirmwareSourceConfig, FirmwareTarget,
        firmware::{ReqwestClient, release::download_latest},
    },
};

/// Firmware sources for a fetch, honouring `--no-proxy`.
fn fetch_sources(config: &Config, no_proxy: bool) -> FirmwareSourceConfig {
    let sources = config
        .firmware
        .sources();
    if no_proxy { sources.with_proxy(false) } else { sources }
}

fn output_dir(output: Option<&Path>) -> Result<PathBuf> {
    let dir = output.map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    if dir.exists() && !dir.is_dir() {
        return Err(CliError::Usage(format!("{} is not a directory", dir.display())).into());
    }
    Ok(dir)
}

/// Fetch command implementation.
pub(crate) fn cmd_fetch(config: &Config, target: FirmwareTarget, output: Option<&Path>, no_proxy: bool) -> Result<()> {
    let dir = output_dir(output)?;
    let sources = fetch_sources(config, no_proxy);
    debug!("Release index: {}", sources.index_url(target));

    eprintln!(
        "{} Downloading the latest {target} firmware...",
        style("⬇").cyan()
    );
    let http = ReqwestClient::new()?;
    let image = download_latest(&http, &sources, target)?;

    fs::create_dir_all(&dir).with_context(|| format!("Failed to create directory: {}", dir.display()))?;
    let path = dir.join(image.file_name());
    fs::write(&path, image.bytes()).with_context(|| format!("Failed to write {}", path.display()))?;

    eprintln!(
        "{} Saved {} ({}, {} bytes)",
        style("✓")
            .green()
            .bold(),
        style(path.display()).yellow(),
        image.format(),
        image.len()
    );
    eprintln!("  {}", style(image.digest()).dim());
    Ok(())
}

#[cfg(test)]
mod tests {
    use {super::*, tempfile::tempdir};

    #[test]
    fn test_no_proxy_overrides_config() {
        let config = Config::default();
        assert!(
            !fetch_sources(&config, true)
                .use_proxy
        );
    }

    #[test]
    fn test_output_dir_rejects_file() {
        let dir = tempdir().unwrap();
        let file = dir
            .path()
            .join("not-a-dir");
        fs::write(&file, b"x").unwrap();
        assert!(output_dir(Some(&file)).is_err());
        assert_eq!(output_dir(Some(dir.path())).unwrap(), dir.path());
        assert_eq!(output_dir(None).unwrap(), PathBuf::from("."));
    }
}
