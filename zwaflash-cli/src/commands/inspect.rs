//! Firmware file inspection.

use {
    anyhow::{Context, Result},
    console::style,
    std::path::Path,
    zwaflash::firmware::{FirmwareFormat, FirmwareImage, gbl, read_firmware_file},
};

/// Which chip an image can go to.
fn target_for(format: FirmwareFormat) -> &'static str {
    match format {
        FirmwareFormat::PackagedUpdateFile => "controller",
        FirmwareFormat::RawApplicationImage => "bridge",
    }
}

fn load(file: &Path) -> Result<FirmwareImage> {
    read_firmware_file(file).with_context(|| format!("Failed to load firmware: {}", file.display()))
}

/// GBL tag names, empty for raw images.
fn gbl_tags(image: &FirmwareImage) -> Vec<&'static str> {
    if image.format() != FirmwareFormat::PackagedUpdateFile {
        return Vec::new();
    }
    gbl::parse(image.bytes()).map_or_else(
        |_| Vec::new(),
        |info| {
            info.tags
                .iter()
                .map(gbl::GblTag::name)
                .collect()
        },
    )
}

/// Inspect command implementation.
pub(crate) fn cmd_inspect(file: &Path, json: bool) -> Result<()> {
    let image = load(file)?;

    if json {
        let info = serde_json::json!({
            "ok": true,
            "data": {
                "file_name": image.file_name(),
                "format": image.format().name(),
                "target": target_for(image.format()),
                "size": image.len(),
                "load_offset": format!("0x{:08X}", image.load_offset()),
                "sha256": image.digest().hex(),
                "gbl_tags": gbl_tags(&image),
            }
        });
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    eprintln!(
        "{}",
        style(format!("Firmware: {}", image.file_name()))
            .bold()
            .underlined()
    );
    eprintln!("  Format:      {}", image.format());
    eprintln!("  Target:      {} chip", target_for(image.format()));
    eprintln!("  Size:        {} bytes", image.len());
    if image.load_offset() != 0 {
        eprintln!("  Load offset: 0x{:08X}", image.load_offset());
    }
    eprintln!("  Checksum:    {}", image.digest());

    let tags = gbl_tags(&image);
    if !tags.is_empty() {
        eprintln!("  GBL tags:    {}", style(tags.join(", ")).dim());
    }

    Ok(())
}
