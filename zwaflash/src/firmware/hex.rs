//! Intel HEX to raw image conversion.

use crate::error::{Error, Result};
use log::debug;

/// Largest span an Intel HEX file may cover once flattened.
pub const MAX_IMAGE_SPAN: u32 = 16 * 1024 * 1024;

const RECORD_DATA: u8 = 0x00;
const RECORD_EOF: u8 = 0x01;
const RECORD_EXT_SEGMENT: u8 = 0x02;
const RECORD_START_SEGMENT: u8 = 0x03;
const RECORD_EXT_LINEAR: u8 = 0x04;
const RECORD_START_LINEAR: u8 = 0x05;

/// A flattened Intel HEX image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HexImage {
    /// Address of the first byte.
    pub base_address: u32,
    /// Contiguous bytes; gaps are filled with `0xFF`.
    pub data: Vec<u8>,
}

/// Whether `bytes` look like Intel HEX text.
pub fn looks_like_hex(bytes: &[u8]) -> bool {
    bytes
        .iter()
        .find(|b| !b.is_ascii_whitespace())
        == Some(&b':')
}

fn invalid(line: usize, msg: &str) -> Error {
    Error::UnsupportedFirmwareFormat(format!("Intel HEX line {line}: {msg}"))
}

fn decode_record(line: usize, text: &str) -> Result<Vec<u8>> {
    let digits = text
        .strip_prefix(':')
        .ok_or_else(|| invalid(line, "missing ':'"))?;
    if !digits.is_ascii() || digits.len() % 2 != 0 {
        return Err(invalid(line, "malformed hex digits"));
    }

    let bytes = (0..digits.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&digits[i..i + 2], 16))
        .collect::<std::result::Result<Vec<u8>, _>>()
        .map_err(|_| invalid(line, "malformed hex digits"))?;

    if bytes.len() < 5 || bytes.len() != usize::from(bytes[0]) + 5 {
        return Err(invalid(line, "record length mismatch"));
    }
    let sum = bytes
        .iter()
        .fold(0u8, |acc, b| acc.wrapping_add(*b));
    if sum != 0 {
        return Err(invalid(line, "checksum mismatch"));
    }
    Ok(bytes)
}

/// Parse Intel HEX text and flatten it into one contiguous image.
pub fn parse(text: &str) -> Result<HexImage> {
    let mut upper: u32 = 0;
    let mut segments: Vec<(u32, Vec<u8>)> = Vec::new();
    let mut saw_eof = false;

    for (index, raw) in text
        .lines()
        .enumerate()
    {
        let line = index + 1;
        let record = raw.trim();
        if record.is_empty() {
            continue;
        }

        let bytes = decode_record(line, record)?;
        let count = usize::from(bytes[0]);
        let offset = u32::from(u16::from_be_bytes([bytes[1], bytes[2]]));
        let data = &bytes[4..4 + count];

        match bytes[3] {
            RECORD_DATA => {
                let address = upper
                    .checked_add(offset)
                    .ok_or_else(|| invalid(line, "address overflow"))?;
                segments.push((address, data.to_vec()));
            },
            RECORD_EOF => {
                saw_eof = true;
                break;
            },
            RECORD_EXT_SEGMENT | RECORD_EXT_LINEAR => {
                if count != 2 {
                    return Err(invalid(line, "bad extended address record"));
                }
                let value = u32::from(u16::from_be_bytes([data[0], data[1]]));
                upper = if bytes[3] == RECORD_EXT_SEGMENT {
                    value << 4
                } else {
                    value << 16
                };
            },
            RECORD_START_SEGMENT | RECORD_START_LINEAR => {},
            other => return Err(invalid(line, &format!("unknown record type {other:02X}"))),
        }
    }

    if !saw_eof {
        return Err(Error::UnsupportedFirmwareFormat(
            "Intel HEX: missing end-of-file record".into(),
        ));
    }

    let Some(base) = segments
        .iter()
        .map(|(addr, _)| *addr)
        .min()
    else {
        return Err(Error::UnsupportedFirmwareFormat("Intel HEX: no data records".into()));
    };
    let end = segments
        .iter()
        .map(|(addr, data)| u64::from(*addr) + data.len() as u64)
        .max()
        .unwrap_or(u64::from(base));
    let span = end - u64::from(base);
    if span > u64::from(MAX_IMAGE_SPAN) {
        return Err(Error::UnsupportedFirmwareFormat(format!(
            "Intel HEX spans {span} bytes"
        )));
    }

    let mut image = vec![0xFF; span as usize];
    for (addr, data) in &segments {
        let at = (addr - base) as usize;
        image[at..at + data.len()].copy_from_slice(data);
    }
    debug!("Intel HEX: {} bytes at 0x{base:08X}", image.len());

    Ok(HexImage {
        base_address: base,
        data: image,
    })
}
