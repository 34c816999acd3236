//! ZIP archives wrapping a single firmware image.

use crate::error::{Error, Result};
use log::debug;
use std::io::{Cursor, Read};
use zip::ZipArchive;

/// File extensions accepted as firmware images.
pub const FIRMWARE_EXTENSIONS: &[&str] = &["gbl", "bin", "hex", "otw"];

/// Lowercase extension of `name`, empty when it has none.
pub fn extension(name: &str) -> String {
    let base = name
        .rsplit('/')
        .next()
        .unwrap_or(name);
    match base.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => ext.to_ascii_lowercase(),
        _ => String::new(),
    }
}

/// Whether `name` has a firmware image extension.
pub fn is_firmware_name(name: &str) -> bool {
    FIRMWARE_EXTENSIONS.contains(&extension(name).as_str())
}

/// Whether `name` is a ZIP archive by extension.
pub fn is_archive_name(name: &str) -> bool {
    extension(name) == "zip"
}

/// Extract the only firmware image in a ZIP archive.
///
/// Returns the entry's base name and contents.
pub fn extract_single(bytes: &[u8]) -> Result<(String, Vec<u8>)> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))?;

    let mut candidates = Vec::new();
    for i in 0..archive.len() {
        let entry = archive.by_index(i)?;
        let name = entry
            .name()
            .to_string();
        if entry.is_dir() || name.starts_with("__MACOSX/") {
            continue;
        }
        if is_firmware_name(&name) {
            candidates.push((i, name));
        }
    }

    let (index, name) = match candidates.len() {
        0 => {
            return Err(Error::UnsupportedArchiveContents(
                "archive contains no firmware image".into(),
            ));
        },
        1 => candidates.remove(0),
        n => {
            let names: Vec<_> = candidates
                .iter()
                .map(|(_, name)| name.as_str())
                .collect();
            return Err(Error::UnsupportedArchiveContents(format!(
                "archive contains {n} firmware images: {}",
                names.join(", ")
            )));
        },
    };

    let mut entry = archive.by_index(index)?;
    let mut data = Vec::with_capacity(usize::try_from(entry.size()).unwrap_or(0));
    entry.read_to_end(&mut data)?;

    let base = name
        .rsplit('/')
        .next()
        .unwrap_or(&name)
        .to_string();
    debug!("Extracted {base} ({} bytes) from archive", data.len());
    Ok((base, data))
}
