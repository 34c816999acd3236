//! Gecko Bootloader (GBL) update file.
//!
//! A GBL file is a sequence of tags, each a little-endian `u32` id and
//! `u32` length followed by `length` bytes of payload:
//!
//! ```text
//! +-----------------------------+
//! | Header tag   03A617EB       |  version(4) type(4)
//! +-----------------------------+
//! | Application / program tags  |
//! |            ...              |
//! +-----------------------------+
//! | End tag      FC0404FC       |  crc32(4)
//! +-----------------------------+
//! ```
//!
//! Only the tag framing is checked here. Signatures and the trailing CRC are
//! left to the bootloader.

use crate::error::{Error, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

/// Header tag id.
pub const HEADER_TAG: u32 = 0x03A6_17EB;

/// End tag id.
pub const END_TAG: u32 = 0xFC04_04FC;

/// First four bytes of every GBL file.
pub const MAGIC: [u8; 4] = [0xEB, 0x17, 0xA6, 0x03];

/// Whether `bytes` start with the GBL header tag.
pub fn has_magic(bytes: &[u8]) -> bool {
    bytes.starts_with(&MAGIC)
}

/// One tag of a GBL file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GblTag {
    /// Tag id.
    pub id: u32,
    /// Payload length in bytes.
    pub length: u32,
}

impl GblTag {
    /// Readable tag name.
    pub fn name(&self) -> &'static str {
        match self.id {
            HEADER_TAG => "header",
            END_TAG => "end",
            0xF40A_0AF4 => "application",
            0xF509_09F5 => "bootloader",
            0x5EA6_17EB => "se upgrade",
            0xF608_08F6 => "metadata",
            0xFE01_01FE => "program data",
            0xFD05_05FD => "program data (lz4)",
            0xFD07_07FD => "program data (lzma)",
            0xF70A_0AF7 => "signature",
            0xF30B_0BF3 => "certificate",
            0xFA06_06FA => "encryption header",
            0xF907_07F9 => "encryption init",
            0xF808_08F8 => "encrypted program data",
            _ => "unknown",
        }
    }
}

/// Summary of a GBL file's framing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GblInfo {
    /// GBL format version from the header tag.
    pub version: u32,
    /// Image type flags from the header tag.
    pub image_type: u32,
    /// All tags in file order, header and end tag included.
    pub tags: Vec<GblTag>,
}

fn invalid(msg: impl Into<String>) -> Error {
    Error::UnsupportedFirmwareFormat(format!("not a valid GBL file: {}", msg.into()))
}

/// Walk the tags of a GBL file.
pub fn parse(bytes: &[u8]) -> Result<GblInfo> {
    if !has_magic(bytes) {
        return Err(invalid("missing header tag"));
    }

    let mut cursor = Cursor::new(bytes);
    let mut tags = Vec::new();
    let mut version = 0;
    let mut image_type = 0;

    loop {
        let (Ok(id), Ok(length)) = (
            cursor.read_u32::<LittleEndian>(),
            cursor.read_u32::<LittleEndian>(),
        ) else {
            return Err(invalid("truncated before end tag"));
        };

        let start = usize::try_from(cursor.position()).map_err(|_| invalid("file too large"))?;
        let len = length as usize;
        let remaining = bytes.len() - start;
        if len > remaining {
            return Err(invalid(format!(
                "tag 0x{id:08X} claims {len} bytes, {remaining} left"
            )));
        }

        if id == HEADER_TAG {
            if !tags.is_empty() {
                return Err(invalid("header tag repeated"));
            }
            if len < 8 {
                return Err(invalid("header tag too short"));
            }
            version = cursor.read_u32::<LittleEndian>()?;
            image_type = cursor.read_u32::<LittleEndian>()?;
        }

        tags.push(GblTag { id, length });
        cursor.set_position((start + len) as u64);

        if id == END_TAG {
            break;
        }
    }

    Ok(GblInfo {
        version,
        image_type,
        tags,
    })
}
