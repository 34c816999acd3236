//! Native serial link implementation using the `serialport` crate.
//!
//! Unplug detection polls the system port list from a watcher thread: when
//! the port name disappears, the link's [`DisconnectSignal`] fires.

use {
    crate::{
        error::Result,
        port::{ByteStream, ControlSignals, DisconnectSignal, SerialLink},
    },
    log::{debug, trace},
    std::{
        io::{self, Read, Write},
        sync::{
            Arc,
            atomic::{AtomicBool, Ordering},
        },
        thread::{self, JoinHandle},
        time::Duration,
    },
};

/// Native link settings.
#[derive(Debug, Clone)]
pub struct NativeLinkConfig {
    /// Per-read timeout. Bounded waits are built from many short reads.
    pub read_timeout: Duration,
    /// How often the watcher checks that the port still exists.
    pub watch_interval: Duration,
}

impl Default for NativeLinkConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_millis(50),
            watch_interval: Duration::from_millis(200),
        }
    }
}

impl NativeLinkConfig {
    /// Set the per-read timeout.
    #[must_use]
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }
}

struct PortWatcher {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl PortWatcher {
    fn spawn(name: String, interval: Duration, signal: DisconnectSignal) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let handle = thread::spawn(move || {
            while !stop_flag.load(Ordering::Relaxed) {
                thread::sleep(interval);
                let present = match serialport::available_ports() {
                    Ok(ports) => ports
                        .iter()
                        .any(|p| p.port_name == name),
                    // Enumeration hiccups are not evidence of an unplug.
                    Err(_) => true,
                };
                if !present {
                    debug!("Port {name} disappeared");
                    signal.fire();
                    break;
                }
            }
        });
        Self {
            stop,
            handle: Some(handle),
        }
    }
}

impl Drop for PortWatcher {
    fn drop(&mut self) {
        self.stop
            .store(true, Ordering::Relaxed);
        if let Some(handle) = self
            .handle
            .take()
        {
            let _ = handle.join();
        }
    }
}

/// Open port whose fatal read errors fire the disconnect signal.
struct WatchedPort {
    inner: Box<dyn serialport::SerialPort>,
    signal: DisconnectSignal,
}

impl WatchedPort {
    fn check<T>(&self, result: io::Result<T>) -> io::Result<T> {
        if let Err(ref e) = result {
            if matches!(e.kind(), io::ErrorKind::BrokenPipe | io::ErrorKind::NotConnected) {
                self.signal.fire();
            }
        }
        result
    }
}

impl Read for WatchedPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let result = self
            .inner
            .read(buf);
        self.check(result)
    }
}

impl Write for WatchedPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let result = self
            .inner
            .write(buf);
        self.check(result)
    }

    fn flush(&mut self) -> io::Result<()> {
        let result = self
            .inner
            .flush();
        self.check(result)
    }
}

/// Serial link backed by an OS serial port.
pub struct NativeLink {
    name: String,
    port: Option<WatchedPort>,
    baud_rate: Option<u32>,
    config: NativeLinkConfig,
    signal: DisconnectSignal,
    watcher: Option<PortWatcher>,
}

impl NativeLink {
    /// Create a closed link for `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(name, NativeLinkConfig::default())
    }

    /// Create a closed link with explicit settings.
    pub fn with_config(name: impl Into<String>, config: NativeLinkConfig) -> Self {
        Self {
            name: name.into(),
            port: None,
            baud_rate: None,
            config,
            signal: DisconnectSignal::new(),
            watcher: None,
        }
    }

    /// Create a link and open it at `baud_rate`.
    pub fn open_at(name: impl Into<String>, baud_rate: u32) -> Result<Self> {
        let mut link = Self::new(name);
        link.open(baud_rate)?;
        Ok(link)
    }

    /// Start watching for unplug without opening the port.
    ///
    /// Used for the bridge ROM bootloader port, which an external tool
    /// opens while the engine waits for the power cycle.
    pub fn watch(&mut self) {
        if self
            .watcher
            .is_none()
        {
            self.watcher = Some(PortWatcher::spawn(
                self.name
                    .clone(),
                self.config
                    .watch_interval,
                self.signal
                    .clone(),
            ));
        }
    }
}

impl SerialLink for NativeLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self, baud_rate: u32) -> Result<()> {
        self.close()?;
        trace!("Opening {} at {baud_rate} baud", self.name);
        let port = serialport::new(&self.name, baud_rate)
            .timeout(
                self.config
                    .read_timeout,
            )
            .open()?;
        self.port = Some(WatchedPort {
            inner: port,
            signal: self
                .signal
                .clone(),
        });
        self.baud_rate = Some(baud_rate);
        self.watch();
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self
            .port
            .take()
            .is_some()
        {
            trace!("Closed {}", self.name);
        }
        self.baud_rate = None;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.port
            .is_some()
    }

    fn baud_rate(&self) -> Option<u32> {
        self.baud_rate
    }

    fn set_signals(&mut self, signals: ControlSignals) -> Result<()> {
        trace!("Setting DTR={} RTS={}", signals.dtr, signals.rts);
        if let Some(ref mut p) = self.port {
            p.inner
                .write_data_terminal_ready(signals.dtr)?;
            p.inner
                .write_request_to_send(signals.rts)?;
        }
        Ok(())
    }

    fn stream(&mut self) -> Option<&mut dyn ByteStream> {
        self.port
            .as_mut()
            .map(|p| p as &mut dyn ByteStream)
    }

    fn disconnect_signal(&self) -> DisconnectSignal {
        self.signal
            .clone()
    }
}

impl Drop for NativeLink {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = NativeLinkConfig::default();
        assert_eq!(config.read_timeout, Duration::from_millis(50));
        assert_eq!(config.watch_interval, Duration::from_millis(200));
    }

    #[test]
    fn test_new_link_is_closed() {
        let mut link = NativeLink::new("/dev/does-not-exist");
        assert!(!link.is_open());
        assert!(link.baud_rate().is_none());
        assert!(link.raw().is_none());
        assert!(
            !link
                .disconnect_signal()
                .is_fired()
        );
    }

    #[test]
    fn test_open_missing_port_fails() {
        assert!(NativeLink::open_at("/dev/zwaflash-missing-port", 115200).is_err());
    }
}
