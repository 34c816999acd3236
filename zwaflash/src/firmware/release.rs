//! Latest-release lookup on a GitHub-style release index.

use crate::error::{Error, Result};
use crate::firmware::FirmwareImage;
use crate::firmware::digest::FirmwareDigest;
use crate::firmware::http::{HttpClient, get_json};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Release index of the controller firmware.
pub const CONTROLLER_RELEASES_URL: &str =
    "https://api.github.com/repos/NabuCasa/zwave-firmware/releases/latest";

/// Release index of the bridge firmware.
pub const BRIDGE_RELEASES_URL: &str =
    "https://api.github.com/repos/NabuCasa/zwave-esp-bridge/releases/latest";

/// Download proxy prefix; the asset URL is appended percent-encoded.
pub const DEFAULT_PROXY_PREFIX: &str = "https://corsproxy.io/?";

/// A published release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    /// Tag name, e.g. `v7.23.1`.
    pub tag_name: String,
    /// Display name.
    #[serde(default)]
    pub name: Option<String>,
    /// Release notes.
    #[serde(default)]
    pub body: Option<String>,
    /// Downloadable assets.
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
}

/// One downloadable file of a release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseAsset {
    /// File name.
    pub name: String,
    /// Direct download URL.
    pub browser_download_url: String,
    /// Published digest, `sha256:<hex>`.
    #[serde(default)]
    pub digest: Option<String>,
}

/// Which chip a firmware image is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FirmwareTarget {
    /// The Z-Wave controller chip.
    Controller,
    /// The USB bridge chip.
    Bridge,
}

impl FirmwareTarget {
    /// Short name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Controller => "controller",
            Self::Bridge => "bridge",
        }
    }

    /// Human description of the asset naming convention.
    pub fn asset_pattern(self) -> &'static str {
        match self {
            Self::Controller => "*.gbl",
            Self::Bridge => "zwa2*.factory.bin",
        }
    }

    /// Whether `asset_name` follows this target's naming convention.
    pub fn matches(self, asset_name: &str) -> bool {
        let name = asset_name.to_ascii_lowercase();
        match self {
            Self::Controller => name.ends_with(".gbl"),
            Self::Bridge => name.starts_with("zwa2") && name.ends_with(".factory.bin"),
        }
    }

    /// First asset of `release` matching this target.
    pub fn find_asset(self, release: &Release) -> Result<&ReleaseAsset> {
        release
            .assets
            .iter()
            .find(|asset| self.matches(&asset.name))
            .ok_or_else(|| Error::ReleaseAssetNotFound {
                release: release
                    .tag_name
                    .clone(),
                pattern: self
                    .asset_pattern()
                    .to_string(),
            })
    }
}

impl fmt::Display for FirmwareTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The controller firmware asset of `release`.
pub fn controller_asset(release: &Release) -> Result<&ReleaseAsset> {
    FirmwareTarget::Controller.find_asset(release)
}

/// The bridge firmware asset of `release`.
pub fn bridge_asset(release: &Release) -> Result<&ReleaseAsset> {
    FirmwareTarget::Bridge.find_asset(release)
}

/// Where firmware is fetched from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FirmwareSourceConfig {
    /// Latest-release endpoint for controller firmware.
    pub controller_index_url: String,
    /// Latest-release endpoint for bridge firmware.
    pub bridge_index_url: String,
    /// Prefix of the download proxy.
    pub proxy_prefix: String,
    /// Route asset downloads through the proxy.
    pub use_proxy: bool,
}

impl Default for FirmwareSourceConfig {
    fn default() -> Self {
        Self {
            controller_index_url: CONTROLLER_RELEASES_URL.to_string(),
            bridge_index_url: BRIDGE_RELEASES_URL.to_string(),
            proxy_prefix: DEFAULT_PROXY_PREFIX.to_string(),
            use_proxy: true,
        }
    }
}

impl FirmwareSourceConfig {
    /// Set the controller index URL.
    #[must_use]
    pub fn with_controller_index_url(mut self, url: impl Into<String>) -> Self {
        self.controller_index_url = url.into();
        self
    }

    /// Set the bridge index URL.
    #[must_use]
    pub fn with_bridge_index_url(mut self, url: impl Into<String>) -> Self {
        self.bridge_index_url = url.into();
        self
    }

    /// Set the proxy prefix.
    #[must_use]
    pub fn with_proxy_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.proxy_prefix = prefix.into();
        self
    }

    /// Enable or disable the download proxy.
    #[must_use]
    pub fn with_proxy(mut self, use_proxy: bool) -> Self {
        self.use_proxy = use_proxy;
        self
    }

    /// Index endpoint for `target`.
    pub fn index_url(&self, target: FirmwareTarget) -> &str {
        match target {
            FirmwareTarget::Controller => &self.controller_index_url,
            FirmwareTarget::Bridge => &self.bridge_index_url,
        }
    }

    /// URL an asset is actually fetched from.
    pub fn download_url(&self, asset_url: &str) -> String {
        if self.use_proxy && !self.proxy_prefix.is_empty() {
            proxied_url(&self.proxy_prefix, asset_url)
        } else {
            asset_url.to_string()
        }
    }
}

/// Percent-encode everything except `A-Z a-z 0-9 - _ . ! ~ * ' ( )`.
pub fn encode_uri_component(text: &str) -> String {
    let mut out = String::with_capacity(text.len() * 3);
    for byte in text.bytes() {
        match byte {
            b'A'..=b'Z'
            | b'a'..=b'z'
            | b'0'..=b'9'
            | b'-'
            | b'_'
            | b'.'
            | b'!'
            | b'~'
            | b'*'
            | b'\''
            | b'('
            | b')' => out.push(char::from(byte)),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

/// `url` routed through the proxy at `prefix`.
pub fn proxied_url(prefix: &str, url: &str) -> String {
    format!("{prefix}{}", encode_uri_component(url))
}

/// Fetch the newest release from `index_url`.
pub fn latest_release(http: &dyn HttpClient, index_url: &str) -> Result<Release> {
    let release: Release = get_json(http, index_url).map_err(|e| match e {
        Error::DownloadFailed(msg) => {
            Error::DownloadFailed(format!("Failed to fetch release information: {msg}"))
        },
        other => other,
    })?;
    info!("Latest release: {}", release.tag_name);
    Ok(release)
}

/// Download and verify the newest image for `target`.
///
/// The asset's published digest is checked when present; a missing or
/// malformed digest downloads without verification.
pub fn download_latest(
    http: &dyn HttpClient,
    config: &FirmwareSourceConfig,
    target: FirmwareTarget,
) -> Result<FirmwareImage> {
    let release = latest_release(http, config.index_url(target))?;
    let asset = target.find_asset(&release)?;
    let expected = FirmwareDigest::from_published(
        asset
            .digest
            .as_deref(),
    );

    let url = config.download_url(&asset.browser_download_url);
    info!("Downloading {} from release {}", asset.name, release.tag_name);
    let bytes = http.get(&url)?;

    match expected {
        Some(digest) => {
            digest.verify(&bytes)?;
            info!("Firmware checksum verified: {}", digest.hex());
        },
        None => warn!("No checksum available for {}, proceeding without verification", asset.name),
    }

    FirmwareImage::from_bytes(asset.name.clone(), bytes)
}
