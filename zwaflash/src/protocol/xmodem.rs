//! XMODEM-CRC file transfer.
//!
//! The Gecko bootloader receives firmware uploads over XMODEM with 128-byte
//! blocks and CRC16 error detection:
//!
//! ```text
//! Block format:
//! +-----+-----+------+--------------+--------+
//! | SOH | SEQ | ~SEQ |  DATA (128)  | CRC16  |
//! +-----+-----+------+--------------+--------+
//! | 1   | 1   | 1    |     128      | 2 (BE) |
//! +-----+-----+------+--------------+--------+
//! ```
//!
//! Sequence numbers start at 1 and wrap. The last block is padded with SUB.

use crate::error::{Error, Result};
use log::{debug, trace};
use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

/// XMODEM control characters.
pub mod control {
    /// Start of Header (128-byte block).
    pub const SOH: u8 = 0x01;
    /// End of Transmission.
    pub const EOT: u8 = 0x04;
    /// Acknowledge.
    pub const ACK: u8 = 0x06;
    /// Not Acknowledge.
    pub const NAK: u8 = 0x15;
    /// Cancel.
    pub const CAN: u8 = 0x18;
    /// Padding for the final block.
    pub const SUB: u8 = 0x1A;
    /// CRC mode request character.
    pub const C: u8 = b'C';
}

/// Payload size of one block.
pub const BLOCK_SIZE: usize = 128;

/// CRC16-XMODEM of `data`.
pub fn crc16_xmodem(data: &[u8]) -> u16 {
    crc16::State::<crc16::XMODEM>::calculate(data)
}

/// XMODEM configuration options.
#[derive(Debug, Clone)]
pub struct XmodemConfig {
    /// Timeout for waiting for an ACK/NAK.
    pub char_timeout: Duration,
    /// Timeout for waiting for the initial 'C'.
    pub c_timeout: Duration,
    /// Maximum retries for sending a block.
    pub max_retries: u32,
}

impl Default for XmodemConfig {
    fn default() -> Self {
        Self {
            char_timeout: Duration::from_secs(2),
            c_timeout: Duration::from_secs(10),
            max_retries: 10,
        }
    }
}

/// XMODEM sender.
pub struct XmodemTransfer<'a, P: Read + Write + ?Sized> {
    port: &'a mut P,
    config: XmodemConfig,
}

impl<'a, P: Read + Write + ?Sized> XmodemTransfer<'a, P> {
    /// Create a sender with default timing.
    pub fn new(port: &'a mut P) -> Self {
        Self::with_config(port, XmodemConfig::default())
    }

    /// Create a sender with custom configuration.
    pub fn with_config(port: &'a mut P, config: XmodemConfig) -> Self {
        Self { port, config }
    }

    /// Read one byte, retrying short port timeouts until `timeout`.
    fn read_byte(&mut self, timeout: Duration) -> Result<u8> {
        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; 1];
        loop {
            if crate::is_interrupted_requested() {
                return Err(Error::Interrupted);
            }
            match self
                .port
                .read(&mut buf)
            {
                Ok(1) => return Ok(buf[0]),
                Ok(_) => {},
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {},
                Err(e) => return Err(Error::Io(e)),
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout("read_byte: timeout".into()));
            }
        }
    }

    /// Wait for the receiver to send 'C' (CRC mode request).
    pub fn wait_for_c(&mut self) -> Result<()> {
        debug!("Waiting for 'C' from receiver...");
        let deadline = Instant::now() + self.config.c_timeout;

        while Instant::now() < deadline {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.read_byte(remaining) {
                Ok(control::C) => {
                    debug!("Received 'C', starting transfer");
                    return Ok(());
                },
                Ok(c) => {
                    trace!("Received unexpected char: 0x{c:02X}");
                },
                Err(Error::Timeout(_)) => {},
                Err(e) => return Err(e),
            }
        }

        Err(Error::Timeout("Timeout waiting for 'C'".into()))
    }

    /// Build one block, padding short payloads with SUB.
    pub(crate) fn build_block(seq: u8, data: &[u8]) -> Vec<u8> {
        let mut block = Vec::with_capacity(3 + BLOCK_SIZE + 2);

        block.push(control::SOH);
        block.push(seq);
        block.push(!seq);

        let n = data.len().min(BLOCK_SIZE);
        block.extend_from_slice(&data[..n]);
        block.resize(3 + BLOCK_SIZE, control::SUB);

        let crc = crc16_xmodem(&block[3..]);
        block.extend_from_slice(&crc.to_be_bytes());

        block
    }

    /// Send a block and wait for ACK.
    fn send_block(&mut self, block: &[u8]) -> Result<()> {
        for retry in 0..self.config.max_retries {
            trace!("Sending block {} (attempt {})", block[1], retry + 1);

            self.port
                .write_all(block)?;
            self.port
                .flush()?;

            match self.read_byte(self.config.char_timeout) {
                Ok(control::ACK) => {
                    trace!("Block ACKed");
                    return Ok(());
                },
                Ok(control::NAK) => {
                    debug!("Block NAKed, retrying...");
                },
                Ok(control::CAN) => {
                    return Err(Error::Xmodem("Transfer cancelled by receiver".into()));
                },
                Ok(c) => {
                    debug!("Unexpected response: 0x{c:02X}, retrying...");
                },
                Err(Error::Timeout(_)) => {
                    debug!("Timeout waiting for ACK, retrying...");
                },
                Err(e) => return Err(e),
            }
        }

        Err(Error::Xmodem(format!(
            "Block transfer failed after {} retries",
            self.config.max_retries
        )))
    }

    /// Send EOT (End of Transmission) until it is acknowledged.
    pub fn send_eot(&mut self) -> Result<()> {
        debug!("Sending EOT");

        for _retry in 0..self.config.max_retries {
            self.port
                .write_all(&[control::EOT])?;
            self.port
                .flush()?;

            match self.read_byte(self.config.char_timeout) {
                Ok(control::ACK) => {
                    debug!("EOT ACKed");
                    return Ok(());
                },
                Ok(_) | Err(Error::Timeout(_)) => {},
                Err(e) => return Err(e),
            }
        }

        Err(Error::Xmodem("EOT was never acknowledged".into()))
    }

    /// Transfer `data`, reporting `(bytes_sent, total)` after every block.
    pub fn transfer<F>(&mut self, data: &[u8], mut progress: F) -> Result<()>
    where
        F: FnMut(usize, usize),
    {
        debug!("Starting XMODEM transfer ({} bytes)", data.len());

        self.wait_for_c()?;

        let total = data.len();
        let mut seq: u8 = 1;
        let mut sent = 0;
        for chunk in data.chunks(BLOCK_SIZE) {
            let block = Self::build_block(seq, chunk);
            self.send_block(&block)?;
            seq = seq.wrapping_add(1);
            sent += chunk.len();
            progress(sent, total);
        }

        self.send_eot()?;

        debug!("XMODEM transfer complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Serial double with separate read/write buffers.
    struct MockSerial {
        read_buf: VecDeque<u8>,
        write_buf: Vec<u8>,
    }

    impl MockSerial {
        fn new(response: &[u8]) -> Self {
            Self {
                read_buf: response
                    .iter()
                    .copied()
                    .collect(),
                write_buf: Vec::new(),
            }
        }
    }

    impl Read for MockSerial {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            match self
                .read_buf
                .pop_front()
            {
                Some(b) => {
                    buf[0] = b;
                    Ok(1)
                },
                None => Err(std::io::Error::new(ErrorKind::TimedOut, "no data")),
            }
        }
    }

    impl Write for MockSerial {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.write_buf
                .extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn fast_config() -> XmodemConfig {
        XmodemConfig {
            char_timeout: Duration::from_millis(20),
            c_timeout: Duration::from_millis(50),
            max_retries: 2,
        }
    }

    #[test]
    fn test_crc16_xmodem_check_value() {
        assert_eq!(crc16_xmodem(b"123456789"), 0x31C3);
    }

    #[test]
    fn test_build_block_pads_with_sub() {
        let block = XmodemTransfer::<MockSerial>::build_block(1, &[0x01, 0x02, 0x03]);

        assert_eq!(block.len(), 3 + BLOCK_SIZE + 2);
        assert_eq!(&block[..3], &[control::SOH, 1, 0xFE]);
        assert_eq!(&block[3..6], &[0x01, 0x02, 0x03]);
        assert!(
            block[6..3 + BLOCK_SIZE]
                .iter()
                .all(|&b| b == control::SUB)
        );
        let crc = crc16_xmodem(&block[3..3 + BLOCK_SIZE]);
        assert_eq!(&block[3 + BLOCK_SIZE..], &crc.to_be_bytes());
    }

    #[test]
    fn test_transfer_multi_block_progress() {
        let data = vec![0xDD; BLOCK_SIZE * 2 + 10];
        let mut response = vec![b'x', control::C];
        response.extend(std::iter::repeat_n(control::ACK, 3));
        response.push(control::ACK);

        let mut port = MockSerial::new(&response);
        let mut calls = Vec::new();
        XmodemTransfer::with_config(&mut port, fast_config())
            .transfer(&data, |sent, total| calls.push((sent, total)))
            .unwrap();

        let total = data.len();
        assert_eq!(
            calls,
            vec![(BLOCK_SIZE, total), (BLOCK_SIZE * 2, total), (total, total)]
        );
        assert_eq!(port.write_buf.len(), 3 * (3 + BLOCK_SIZE + 2) + 1);
        assert_eq!(port.write_buf[3 + BLOCK_SIZE + 2 + 1], 2);
        assert_eq!(port.write_buf.last(), Some(&control::EOT));
    }

    #[test]
    fn test_nak_causes_resend() {
        let response = [control::C, control::NAK, control::ACK, control::ACK];
        let mut port = MockSerial::new(&response);
        XmodemTransfer::with_config(&mut port, fast_config())
            .transfer(&[0x42; 16], |_, _| {})
            .unwrap();

        let block_len = 3 + BLOCK_SIZE + 2;
        assert_eq!(port.write_buf.len(), block_len * 2 + 1);
        assert_eq!(port.write_buf[..block_len], port.write_buf[block_len..block_len * 2]);
    }

    #[test]
    fn test_cancel_aborts_transfer() {
        let response = [control::C, control::CAN];
        let mut port = MockSerial::new(&response);
        let err = XmodemTransfer::with_config(&mut port, fast_config())
            .transfer(&[0x42; 16], |_, _| {})
            .unwrap_err();
        assert!(matches!(err, Error::Xmodem(_)));
    }

    #[test]
    fn test_missing_c_times_out() {
        let mut port = MockSerial::new(&[]);
        let err = XmodemTransfer::with_config(&mut port, fast_config())
            .transfer(&[0x42; 16], |_, _| {})
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }
}
