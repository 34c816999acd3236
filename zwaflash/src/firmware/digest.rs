//! SHA-256 digests published next to release assets.

use crate::error::{Error, Result};
use log::warn;
use sha2::{Digest, Sha256};
use std::fmt::{self, Write};

/// Prefix of a published digest string.
pub const SHA256_PREFIX: &str = "sha256:";

/// A SHA-256 digest, stored as lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FirmwareDigest {
    hex: String,
}

impl FirmwareDigest {
    /// Parse a `sha256:<64 hex>` string. Hex case is ignored.
    pub fn parse(text: &str) -> Result<Self> {
        let hex = text
            .trim()
            .strip_prefix(SHA256_PREFIX)
            .ok_or_else(|| Error::InvalidDigest(text.to_string()))?;
        if hex.len() != 64
            || !hex
                .chars()
                .all(|c| c.is_ascii_hexdigit())
        {
            return Err(Error::InvalidDigest(text.to_string()));
        }
        Ok(Self {
            hex: hex.to_ascii_lowercase(),
        })
    }

    /// Digest published for a release asset, if any.
    ///
    /// A missing or malformed digest means the asset is downloaded without
    /// verification.
    pub fn from_published(published: Option<&str>) -> Option<Self> {
        let text = published?;
        match Self::parse(text) {
            Ok(digest) => Some(digest),
            Err(_) => {
                warn!("Ignoring malformed published digest {text:?}");
                None
            },
        }
    }

    /// Hash `bytes`.
    pub fn compute(bytes: &[u8]) -> Self {
        let hash = Sha256::digest(bytes);
        let mut hex = String::with_capacity(64);
        for byte in hash {
            let _ = write!(hex, "{byte:02x}");
        }
        Self { hex }
    }

    /// Lowercase hex form without prefix.
    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Check that `bytes` hash to this digest.
    pub fn verify(&self, bytes: &[u8]) -> Result<()> {
        let actual = Self::compute(bytes);
        if actual != *self {
            return Err(Error::DigestMismatch {
                expected: self
                    .hex
                    .clone(),
                actual: actual.hex,
            });
        }
        Ok(())
    }
}

impl fmt::Display for FirmwareDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SHA256_PREFIX}{}", self.hex)
    }
}
