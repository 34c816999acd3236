//! Serial link abstraction.
//!
//! The engine talks to the adapter through the [`SerialLink`] trait. A link
//! can be reopened at a different baud rate, toggles the DTR/RTS control
//! lines and exposes a one-shot [`DisconnectSignal`] that fires when the USB
//! device goes away.
//!
//! Raw byte exchange goes through a [`RawChannel`], a guard that borrows the
//! link's stream. Dropping the guard releases the stream on every exit path,
//! including errors and interrupts, so no reader or writer stays held after
//! an aborted operation.
//!
//! ```text
//! +---------------------+      +----------------------+
//! | ControllerDriver    |      | bridge entry / reset |
//! |  (owns the link)    |      |  (raw exchange)      |
//! +----------+----------+      +----------+-----------+
//!            |   destroy() hands it back  |
//!            v                            v
//! +----------+----------------------------+-----------+
//! |                  SerialLink                       |
//! +----------+----------------------------+-----------+
//!            |                            |
//!      NativeLink (serialport)      MockLink (tests)
//! ```

#[cfg(feature = "native")]
pub mod native;

pub mod signal;

#[cfg(test)]
pub(crate) mod mock;

use crate::error::{Error, Result};
use log::trace;
use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

pub use signal::DisconnectSignal;

#[cfg(feature = "native")]
pub use native::{NativeLink, NativeLinkConfig};

/// Baud rate the adapter's controller chip and bridge menu run at.
pub const DEFAULT_BAUD: u32 = 115_200;

/// Levels of the two modem control lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControlSignals {
    /// Data Terminal Ready.
    pub dtr: bool,
    /// Request To Send.
    pub rts: bool,
}

impl ControlSignals {
    /// Create a signal pair.
    pub const fn new(dtr: bool, rts: bool) -> Self {
        Self { dtr, rts }
    }
}

/// A bidirectional byte stream.
pub trait ByteStream: Read + Write + Send {}

impl<T: Read + Write + Send> ByteStream for T {}

/// A point-to-point serial link to the adapter.
pub trait SerialLink: Send {
    /// Port name/path (e.g., "/dev/ttyUSB0", "COM3").
    fn name(&self) -> &str;

    /// Open the link at `baud_rate`, closing it first if it is open.
    fn open(&mut self, baud_rate: u32) -> Result<()>;

    /// Close the link. Closing a closed link is a no-op.
    fn close(&mut self) -> Result<()>;

    /// Whether the link is currently open.
    fn is_open(&self) -> bool;

    /// Baud rate of the open link.
    fn baud_rate(&self) -> Option<u32>;

    /// Drive DTR and RTS.
    fn set_signals(&mut self, signals: ControlSignals) -> Result<()>;

    /// The underlying stream, or `None` when it is unavailable.
    fn stream(&mut self) -> Option<&mut dyn ByteStream>;

    /// The link's disconnect notification.
    fn disconnect_signal(&self) -> DisconnectSignal;

    /// Borrow the stream for raw exchange.
    ///
    /// Returns `None` when the handles are gone, typically because the
    /// device reset and dropped off the bus.
    fn raw(&mut self) -> Option<RawChannel<'_>> {
        self.stream()
            .map(RawChannel::new)
    }
}

/// What a single read attempt produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Bytes arrived.
    Data(Vec<u8>),
    /// Nothing arrived within the stream's own timeout.
    Idle,
    /// The stream is gone.
    Closed,
}

/// Scoped raw access to a link's byte stream.
pub struct RawChannel<'a> {
    stream: &'a mut dyn ByteStream,
}

impl<'a> RawChannel<'a> {
    /// Wrap a borrowed stream.
    pub fn new(stream: &'a mut dyn ByteStream) -> Self {
        trace!("Raw channel acquired");
        Self { stream }
    }

    /// Write all bytes and flush.
    pub fn write_all(&mut self, data: &[u8]) -> Result<()> {
        trace!("TX {data:02X?}");
        self.stream
            .write_all(data)?;
        self.stream
            .flush()?;
        Ok(())
    }

    /// Write an ASCII command.
    pub fn write_str(&mut self, text: &str) -> Result<()> {
        self.write_all(text.as_bytes())
    }

    /// Perform one read.
    pub fn read_once(&mut self) -> Result<ReadOutcome> {
        let mut buf = [0u8; 256];
        match self
            .stream
            .read(&mut buf)
        {
            Ok(0) => Ok(ReadOutcome::Idle),
            Ok(n) => {
                trace!("RX {:02X?}", &buf[..n]);
                Ok(ReadOutcome::Data(buf[..n].to_vec()))
            },
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                Ok(ReadOutcome::Idle)
            },
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::NotConnected | ErrorKind::BrokenPipe | ErrorKind::UnexpectedEof
                ) =>
            {
                Ok(ReadOutcome::Closed)
            },
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Accumulate text until `predicate` accepts it or `timeout` elapses.
    ///
    /// Returns `Ok(None)` when the bound elapses or the stream closes first.
    pub fn read_text_until<P>(&mut self, predicate: P, timeout: Duration) -> Result<Option<String>>
    where
        P: Fn(&str) -> bool,
    {
        let (text, matched) = self.accumulate(predicate, timeout)?;
        Ok(matched.then_some(text))
    }

    /// Collect text until `predicate` accepts it or `timeout` elapses, and
    /// return whatever arrived either way.
    pub fn collect_text<P>(&mut self, predicate: P, timeout: Duration) -> Result<String>
    where
        P: Fn(&str) -> bool,
    {
        self.accumulate(predicate, timeout)
            .map(|(text, _)| text)
    }

    fn accumulate<P>(&mut self, predicate: P, timeout: Duration) -> Result<(String, bool)>
    where
        P: Fn(&str) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut text = String::new();

        while Instant::now() < deadline {
            if crate::is_interrupted_requested() {
                return Err(Error::Interrupted);
            }
            match self.read_once()? {
                ReadOutcome::Data(bytes) => {
                    text.push_str(&String::from_utf8_lossy(&bytes));
                    if predicate(&text) {
                        return Ok((text, true));
                    }
                },
                ReadOutcome::Idle => {},
                ReadOutcome::Closed => break,
            }
        }

        Ok((text, false))
    }

    /// Discard input until the line has been quiet for `quiet`.
    pub fn drain(&mut self, quiet: Duration, limit: Duration) -> Result<()> {
        let stop = Instant::now() + limit;
        let mut last_data = Instant::now();
        while Instant::now() < stop && last_data.elapsed() < quiet {
            match self.read_once()? {
                ReadOutcome::Data(_) => last_data = Instant::now(),
                ReadOutcome::Idle => {},
                ReadOutcome::Closed => break,
            }
        }
        Ok(())
    }
}

impl Drop for RawChannel<'_> {
    fn drop(&mut self) {
        let _ = self
            .stream
            .flush();
        trace!("Raw channel released");
    }
}
