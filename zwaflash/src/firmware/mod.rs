//! Firmware images and where they come from.
//!
//! An image is either loaded from a local file ([`read_firmware_file`]),
//! downloaded from the latest release ([`release::download_latest`]) or
//! assembled from a web-installer manifest
//! ([`manifest::download_manifest_image`]). All three paths end in
//! [`FirmwareImage::from_bytes`] or build the image directly, so format
//! detection and archive handling are shared.

pub mod archive;
pub mod digest;
pub mod gbl;
pub mod hex;
pub mod http;
pub mod manifest;
pub mod release;

pub use digest::FirmwareDigest;
pub use http::HttpClient;
#[cfg(feature = "http")]
pub use http::ReqwestClient;
pub use manifest::{ChangelogSource, Manifest};
pub use release::{FirmwareSourceConfig, FirmwareTarget, Release, ReleaseAsset};

use crate::error::{Error, Result};
use log::debug;
use std::fmt;
use std::path::Path;

/// How an image is consumed by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FirmwareFormat {
    /// Bytes written verbatim at the load offset.
    RawApplicationImage,
    /// A GBL update file interpreted by the Gecko bootloader.
    PackagedUpdateFile,
}

impl FirmwareFormat {
    /// Short human-readable name.
    pub fn name(self) -> &'static str {
        match self {
            Self::RawApplicationImage => "raw image",
            Self::PackagedUpdateFile => "GBL update file",
        }
    }
}

impl fmt::Display for FirmwareFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A firmware image ready to be flashed.
#[derive(Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    file_name: String,
    bytes: Vec<u8>,
    format: FirmwareFormat,
    load_offset: u32,
}

impl fmt::Debug for FirmwareImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FirmwareImage")
            .field("file_name", &self.file_name)
            .field("len", &self.bytes.len())
            .field("format", &self.format)
            .field("load_offset", &self.load_offset)
            .finish()
    }
}

impl FirmwareImage {
    /// Image with an already known format, loaded at offset 0.
    pub fn new(file_name: impl Into<String>, bytes: Vec<u8>, format: FirmwareFormat) -> Self {
        Self {
            file_name: file_name.into(),
            bytes,
            format,
            load_offset: 0,
        }
    }

    /// Detect the format of `bytes` named `file_name`.
    ///
    /// ZIP archives are unpacked to their single firmware entry. Intel HEX
    /// is flattened to raw bytes with the load offset taken from the lowest
    /// address.
    pub fn from_bytes(file_name: impl Into<String>, bytes: Vec<u8>) -> Result<Self> {
        let file_name = file_name.into();
        let ext = archive::extension(&file_name);

        if ext == "zip" {
            let (inner, data) = archive::extract_single(&bytes)?;
            return Self::from_bytes(inner, data);
        }

        if ext == "gbl" || gbl::has_magic(&bytes) {
            let info = gbl::parse(&bytes)?;
            debug!("{file_name}: GBL v{:08X}, {} tags", info.version, info.tags.len());
            return Ok(Self::new(file_name, bytes, FirmwareFormat::PackagedUpdateFile));
        }

        match ext.as_str() {
            "hex" => {
                if !hex::looks_like_hex(&bytes) {
                    return Err(Error::UnsupportedFirmwareFormat(format!(
                        "{file_name} is not Intel HEX text"
                    )));
                }
                let text = String::from_utf8_lossy(&bytes);
                let image = hex::parse(&text)?;
                Ok(Self::new(file_name, image.data, FirmwareFormat::RawApplicationImage)
                    .with_load_offset(image.base_address))
            },
            "bin" | "otw" => Ok(Self::new(file_name, bytes, FirmwareFormat::RawApplicationImage)),
            _ => Err(Error::UnsupportedFirmwareFormat(format!(
                "{file_name}: expected .gbl, .bin, .hex, .otw or .zip"
            ))),
        }
    }

    /// Set the load offset.
    #[must_use]
    pub fn with_load_offset(mut self, offset: u32) -> Self {
        self.load_offset = offset;
        self
    }

    /// File name the image was loaded or downloaded as.
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Image bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Detected format.
    pub fn format(&self) -> FirmwareFormat {
        self.format
    }

    /// Flash offset for raw images.
    pub fn load_offset(&self) -> u32 {
        self.load_offset
    }

    /// Size in bytes.
    pub fn len(&self) -> usize {
        self.bytes
            .len()
    }

    /// Whether the image has no bytes.
    pub fn is_empty(&self) -> bool {
        self.bytes
            .is_empty()
    }

    /// SHA-256 of the image bytes.
    pub fn digest(&self) -> FirmwareDigest {
        FirmwareDigest::compute(&self.bytes)
    }
}

/// Load a local firmware file.
pub fn read_firmware_file(path: impl AsRef<Path>) -> Result<FirmwareImage> {
    let path = path.as_ref();
    let bytes = std::fs::read(path)?;
    let name = path
        .file_name()
        .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned());
    debug!("Read {} bytes from {}", bytes.len(), path.display());
    FirmwareImage::from_bytes(name, bytes)
}
