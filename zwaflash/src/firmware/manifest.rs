//! Web-installer manifests for bridge firmware.
//!
//! ```json
//! {
//!   "name": "ZWA-2 bridge",
//!   "version": "1.2.0",
//!   "builds": [
//!     { "chipFamily": "ESP32-S3", "parts": [
//!       { "path": "zwa2.factory.bin", "offset": 0, "sha256": "sha256:<64 hex>" }
//!     ] }
//!   ]
//! }
//! ```
//!
//! Part paths are resolved against the manifest URL. Builds with several
//! parts are merged into one image starting at the lowest offset. A part
//! with a published digest must match it.

use crate::error::{Error, Result};
use crate::firmware::digest::FirmwareDigest;
use crate::firmware::http::{HttpClient, get_json, get_text};
use crate::firmware::release::Release;
use crate::firmware::{FirmwareFormat, FirmwareImage};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

/// Largest merged image accepted from a manifest.
pub const MAX_MERGED_SIZE: u32 = 16 * 1024 * 1024;

/// A firmware manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Product name.
    pub name: String,
    /// Firmware version.
    pub version: String,
    /// One build per supported chip family.
    pub builds: Vec<ManifestBuild>,
}

/// Images for one chip family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestBuild {
    /// Chip family, e.g. `ESP32-S3`.
    #[serde(rename = "chipFamily")]
    pub chip_family: String,
    /// Images and their flash offsets.
    pub parts: Vec<ManifestPart>,
}

/// One image of a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestPart {
    /// Path or URL of the image.
    pub path: String,
    /// Flash offset.
    pub offset: u32,
    /// Published `sha256:<hex>` digest of the image.
    #[serde(default, alias = "digest", skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

impl Manifest {
    /// Decode a manifest document.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let manifest: Self =
            serde_json::from_slice(bytes).map_err(|e| Error::InvalidManifest(e.to_string()))?;
        if manifest
            .builds
            .is_empty()
        {
            return Err(Error::InvalidManifest("no builds".into()));
        }
        if let Some(build) = manifest
            .builds
            .iter()
            .find(|b| b.parts.is_empty())
        {
            return Err(Error::InvalidManifest(format!(
                "build for {} has no parts",
                build.chip_family
            )));
        }
        Ok(manifest)
    }

    /// The build for `chip_family`, compared case-insensitively.
    pub fn select_build(&self, chip_family: &str) -> Result<&ManifestBuild> {
        self.builds
            .iter()
            .find(|b| {
                b.chip_family
                    .eq_ignore_ascii_case(chip_family)
            })
            .ok_or_else(|| Error::ChipFamilyNotFound(chip_family.to_string()))
    }
}

/// Resolve a part path relative to the manifest's URL.
pub fn resolve_part_url(manifest_url: &str, path: &str) -> Result<String> {
    if path.contains("://") {
        return Ok(path.to_string());
    }

    let base = manifest_url
        .split(['?', '#'])
        .next()
        .unwrap_or(manifest_url);
    let Some(scheme_end) = base.find("://") else {
        return Err(Error::InvalidManifest(format!("manifest URL {manifest_url} is not absolute")));
    };
    let authority_start = scheme_end + 3;
    let authority_end = base[authority_start..]
        .find('/')
        .map_or(base.len(), |i| authority_start + i);

    if path.starts_with('/') {
        return Ok(format!("{}{path}", &base[..authority_end]));
    }

    let dir = match base[authority_end..].rfind('/') {
        Some(i) => &base[..authority_end + i + 1],
        None => return Ok(format!("{base}/{path}")),
    };
    Ok(format!("{dir}{}", path.trim_start_matches("./")))
}

fn file_name_of(path: &str) -> &str {
    path.rsplit('/')
        .next()
        .unwrap_or(path)
}

/// Fetch the manifest at `manifest_url` and the image for `chip_family`.
pub fn download_manifest_image(
    http: &dyn HttpClient,
    manifest_url: &str,
    chip_family: &str,
) -> Result<(Manifest, FirmwareImage)> {
    let manifest = Manifest::parse(&http.get(manifest_url)?)?;
    let build = manifest.select_build(chip_family)?;
    info!(
        "Manifest {} {}: {} part(s) for {}",
        manifest.name,
        manifest.version,
        build.parts.len(),
        build.chip_family
    );

    let mut parts = Vec::with_capacity(build.parts.len());
    for part in &build.parts {
        let url = resolve_part_url(manifest_url, &part.path)?;
        debug!("Fetching part {} at 0x{:X}", part.path, part.offset);
        let bytes = http.get(&url)?;
        match FirmwareDigest::from_published(part.sha256.as_deref()) {
            Some(digest) => {
                digest.verify(&bytes)?;
                debug!("Verified {} against {digest}", part.path);
            },
            None => warn!("No checksum available for {}, proceeding without verification", part.path),
        }
        parts.push((part.offset, bytes));
    }

    let image = if let [(offset, bytes)] = parts.as_slice() {
        FirmwareImage::new(
            file_name_of(&build.parts[0].path),
            bytes.clone(),
            FirmwareFormat::RawApplicationImage,
        )
        .with_load_offset(*offset)
    } else {
        let (base, merged) = merge_parts(parts)?;
        let name = format!("{}-{}.merged.bin", manifest.name.replace(' ', "_"), manifest.version);
        FirmwareImage::new(name, merged, FirmwareFormat::RawApplicationImage).with_load_offset(base)
    };

    Ok((manifest, image))
}

/// Lay `parts` out by offset into one image, filling gaps with `0xFF`.
fn merge_parts(mut parts: Vec<(u32, Vec<u8>)>) -> Result<(u32, Vec<u8>)> {
    parts.sort_by_key(|(offset, _)| *offset);
    let base = parts
        .first()
        .map_or(0, |(offset, _)| *offset);

    let mut merged: Vec<u8> = Vec::new();
    for (offset, bytes) in parts {
        let at = (offset - base) as usize;
        if at < merged.len() {
            return Err(Error::InvalidManifest(format!("part at 0x{offset:X} overlaps previous part")));
        }
        let end = at + bytes.len();
        if end > MAX_MERGED_SIZE as usize {
            return Err(Error::InvalidManifest("merged image too large".into()));
        }
        merged.resize(at, 0xFF);
        merged.extend_from_slice(&bytes);
    }
    Ok((base, merged))
}

/// Where release notes for a manifest version live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangelogSource {
    /// A plain-text document.
    Text(String),
    /// A GitHub repository API root, e.g.
    /// `https://api.github.com/repos/owner/repo`.
    GithubReleases(String),
}

/// Release notes for `version`, if any are published.
pub fn changelog(
    http: &dyn HttpClient,
    source: &ChangelogSource,
    version: &str,
) -> Result<Option<String>> {
    match source {
        ChangelogSource::Text(url) => {
            let text = get_text(http, url)?;
            Ok(Some(text).filter(|t| !t.trim().is_empty()))
        },
        ChangelogSource::GithubReleases(repo) => {
            let url = format!("{}/releases", repo.trim_end_matches('/'));
            let releases: Vec<Release> = get_json(http, &url)?;
            let wanted = version.trim_start_matches('v');
            Ok(releases
                .into_iter()
                .find(|r| r.tag_name.trim_start_matches('v') == wanted)
                .and_then(|r| r.body)
                .filter(|body| !body.trim().is_empty()))
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firmware::http::MockHttpClient;

    const MANIFEST_URL: &str = "https://fw.test/zwa2/manifest.json?ref=main";

    const MANIFEST: &str = r#"{
        "name": "ZWA-2 bridge",
        "version": "1.2.0",
        "builds": [
            {"chipFamily": "ESP32", "parts": [{"path": "esp32.bin", "offset": 0}]},
            {"chipFamily": "ESP32-S3", "parts": [
                {"path": "boot.bin", "offset": 0},
                {"path": "/assets/app.bin", "offset": 16}
            ]}
        ]
    }"#;

    #[test]
    fn test_resolve_part_url() {
        assert_eq!(
            resolve_part_url(MANIFEST_URL, "fw.bin").unwrap(),
            "https://fw.test/zwa2/fw.bin"
        );
        assert_eq!(
            resolve_part_url(MANIFEST_URL, "./sub/fw.bin").unwrap(),
            "https://fw.test/zwa2/sub/fw.bin"
        );
        assert_eq!(
            resolve_part_url(MANIFEST_URL, "/root.bin").unwrap(),
            "https://fw.test/root.bin"
        );
        assert_eq!(
            resolve_part_url(MANIFEST_URL, "https://cdn.test/x.bin").unwrap(),
            "https://cdn.test/x.bin"
        );
        assert_eq!(resolve_part_url("https://fw.test", "x.bin").unwrap(), "https://fw.test/x.bin");
        assert!(resolve_part_url("manifest.json", "x.bin").is_err());
    }

    #[test]
    fn test_select_build() {
        let manifest = Manifest::parse(MANIFEST.as_bytes()).unwrap();
        assert_eq!(
            manifest
                .select_build("esp32-s3")
                .unwrap()
                .parts
                .len(),
            2
        );
        assert!(matches!(
            manifest.select_build("ESP8266"),
            Err(Error::ChipFamilyNotFound(ref family)) if family == "ESP8266"
        ));
    }

    #[test]
    fn test_invalid_manifest() {
        assert!(matches!(Manifest::parse(b"{}"), Err(Error::InvalidManifest(_))));
        assert!(matches!(
            Manifest::parse(br#"{"name": "x", "version": "1", "builds": []}"#),
            Err(Error::InvalidManifest(_))
        ));
    }

    #[test]
    fn test_single_part_keeps_offset() {
        let manifest = MANIFEST.replace(r#""offset": 0}]}"#, r#""offset": 4096}]}"#);
        let mut http = MockHttpClient::new();
        http.expect_get()
            .withf(|url| url == MANIFEST_URL)
            .returning(move |_| Ok(manifest.clone().into_bytes()));
        http.expect_get()
            .withf(|url| url == "https://fw.test/zwa2/esp32.bin")
            .returning(|_| Ok(vec![1, 2, 3]));

        let (_, image) = download_manifest_image(&http, MANIFEST_URL, "ESP32").unwrap();
        assert_eq!(image.file_name(), "esp32.bin");
        assert_eq!(image.load_offset(), 4096);
        assert_eq!(image.bytes(), &[1, 2, 3]);
    }

    #[test]
    fn test_manifest_digest_mismatch_is_rejected() {
        let manifest = MANIFEST.replace(
            r#"{"path": "esp32.bin", "offset": 0}"#,
            &format!(r#"{{"path": "esp32.bin", "offset": 0, "sha256": "sha256:{}"}}"#, "0".repeat(64)),
        );
        let mut http = MockHttpClient::new();
        http.expect_get()
            .withf(|url| url == MANIFEST_URL)
            .returning(move |_| Ok(manifest.clone().into_bytes()));
        http.expect_get()
            .withf(|url| url == "https://fw.test/zwa2/esp32.bin")
            .returning(|_| Ok(vec![1, 2, 3]));

        let err = download_manifest_image(&http, MANIFEST_URL, "ESP32").unwrap_err();
        assert!(matches!(err, Error::DigestMismatch { .. }));
    }

    #[test]
    fn test_manifest_digest_match_is_accepted() {
        let expected = FirmwareDigest::compute(&[1, 2, 3]);
        let manifest = MANIFEST.replace(
            r#"{"path": "esp32.bin", "offset": 0}"#,
            &format!(r#"{{"path": "esp32.bin", "offset": 0, "digest": "{expected}"}}"#),
        );
        let mut http = MockHttpClient::new();
        http.expect_get()
            .withf(|url| url == MANIFEST_URL)
            .returning(move |_| Ok(manifest.clone().into_bytes()));
        http.expect_get()
            .withf(|url| url == "https://fw.test/zwa2/esp32.bin")
            .returning(|_| Ok(vec![1, 2, 3]));

        let (manifest, image) = download_manifest_image(&http, MANIFEST_URL, "ESP32").unwrap();
        assert_eq!(
            manifest.builds[0].parts[0]
                .sha256
                .as_deref(),
            Some(expected.to_string().as_str())
        );
        assert_eq!(image.bytes(), &[1, 2, 3]);
    }

    #[test]
    fn test_parts_are_merged() {
        let mut http = MockHttpClient::new();
        http.expect_get()
            .withf(|url| url == MANIFEST_URL)
            .returning(|_| Ok(MANIFEST.as_bytes().to_vec()));
        http.expect_get()
            .withf(|url| url == "https://fw.test/zwa2/boot.bin")
            .returning(|_| Ok(vec![0xAA; 4]));
        http.expect_get()
            .withf(|url| url == "https://fw.test/assets/app.bin")
            .returning(|_| Ok(vec![0xBB; 2]));

        let (manifest, image) = download_manifest_image(&http, MANIFEST_URL, "ESP32-S3").unwrap();
        assert_eq!(manifest.version, "1.2.0");
        assert_eq!(image.load_offset(), 0);
        assert_eq!(image.len(), 18);
        assert_eq!(&image.bytes()[..4], &[0xAA; 4]);
        assert!(image.bytes()[4..16].iter().all(|b| *b == 0xFF));
        assert_eq!(&image.bytes()[16..], &[0xBB; 2]);
    }

    #[test]
    fn test_overlapping_parts_rejected() {
        let err = merge_parts(vec![(0, vec![0; 8]), (4, vec![0; 4])]).unwrap_err();
        assert!(matches!(err, Error::InvalidManifest(_)));
    }

    #[test]
    fn test_changelog_from_github_release() {
        let mut http = MockHttpClient::new();
        http.expect_get()
            .withf(|url| url == "https://api.test/repos/o/r/releases")
            .returning(|_| {
                Ok(br#"[
                    {"tag_name": "v1.3.0", "body": "newer", "assets": []},
                    {"tag_name": "v1.2.0", "body": "Fixed reconnects", "assets": []}
                ]"#
                .to_vec())
            });

        let source = ChangelogSource::GithubReleases("https://api.test/repos/o/r/".into());
        assert_eq!(
            changelog(&http, &source, "1.2.0").unwrap(),
            Some("Fixed reconnects".to_string())
        );
        assert_eq!(changelog(&http, &source, "9.9.9").unwrap(), None);
    }

    #[test]
    fn test_changelog_from_text() {
        let mut http = MockHttpClient::new();
        http.expect_get()
            .returning(|_| Ok(b"## 1.2.0\n- notes\n".to_vec()));
        let source = ChangelogSource::Text("https://fw.test/CHANGELOG.md".into());
        assert!(
            changelog(&http, &source, "1.2.0")
                .unwrap()
                .unwrap()
                .contains("notes")
        );
    }
}
