//! Adapter discovery and classification.
//!
//! The adapter shows up as one USB serial port while its bridge chip runs
//! normal firmware, and re-enumerates under a different VID/PID once the
//! bridge drops into its ROM bootloader.

use crate::error::{Error, Result};
use log::{debug, info, trace};
use std::thread;
use std::time::{Duration, Instant};

/// Classification of a discovered serial port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// The adapter running its normal bridge firmware.
    Adapter,
    /// The bridge chip's ROM bootloader.
    EspBootloader,
    /// Anything else.
    Unknown,
}

/// Known USB VID/PID pairs.
const KNOWN_USB_DEVICES: &[(u16, u16, DeviceKind)] = &[
    // CP2102 on early boards
    (0x10C4, 0xEA60, DeviceKind::Adapter),
    // First EVT bridge firmware
    (0x1234, 0x5678, DeviceKind::Adapter),
    (0x303A, 0x4001, DeviceKind::Adapter),
    (0x303A, 0x0009, DeviceKind::EspBootloader),
];

impl DeviceKind {
    /// Classify a VID/PID pair. `extra` lists additional adapter pairs.
    #[must_use]
    pub fn from_vid_pid(vid: u16, pid: u16, extra: &[(u16, u16)]) -> Self {
        if let Some((_, _, kind)) = KNOWN_USB_DEVICES
            .iter()
            .find(|(v, p, _)| *v == vid && *p == pid)
        {
            return *kind;
        }
        if extra.contains(&(vid, pid)) {
            return Self::Adapter;
        }
        Self::Unknown
    }

    /// Human-readable name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Adapter => "ZWA-2",
            Self::EspBootloader => "ESP bootloader",
            Self::Unknown => "Unknown",
        }
    }

    /// Whether this is one of the adapter's own identities.
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

/// Discovered serial port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedPort {
    /// Port name/path (e.g., "/dev/ttyUSB0" or "COM3").
    pub name: String,
    /// Classified device kind.
    pub device: DeviceKind,
    /// USB Vendor ID (if available).
    pub vid: Option<u16>,
    /// USB Product ID (if available).
    pub pid: Option<u16>,
    /// Device manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Device product string (if available).
    pub product: Option<String>,
    /// Serial number (if available).
    pub serial: Option<String>,
}

impl DetectedPort {
    /// Check if this port belongs to the adapter in its normal identity.
    pub fn is_adapter(&self) -> bool {
        self.device == DeviceKind::Adapter
    }
}

/// Detect all available ports with metadata.
#[cfg(feature = "native")]
pub fn detect_ports(extra: &[(u16, u16)]) -> Vec<DetectedPort> {
    let mut result = Vec::new();

    match serialport::available_ports() {
        Ok(ports) => {
            for port_info in ports {
                let mut detected = DetectedPort {
                    name: port_info
                        .port_name
                        .clone(),
                    device: DeviceKind::Unknown,
                    vid: None,
                    pid: None,
                    manufacturer: None,
                    product: None,
                    serial: None,
                };

                if let serialport::SerialPortType::UsbPort(usb_info) = port_info.port_type {
                    detected.vid = Some(usb_info.vid);
                    detected.pid = Some(usb_info.pid);
                    detected.manufacturer = usb_info.manufacturer;
                    detected.product = usb_info.product;
                    detected.serial = usb_info.serial_number;
                    detected.device = DeviceKind::from_vid_pid(usb_info.vid, usb_info.pid, extra);

                    trace!(
                        "Found USB port: {} (VID: {:04X}, PID: {:04X}, Device: {:?})",
                        port_info.port_name, usb_info.vid, usb_info.pid, detected.device
                    );
                }

                result.push(detected);
            }
        },
        Err(e) => {
            debug!("Failed to enumerate serial ports: {e}");
        },
    }

    result
}

/// Without native support there is nothing to enumerate.
#[cfg(not(feature = "native"))]
pub fn detect_ports(_extra: &[(u16, u16)]) -> Vec<DetectedPort> {
    Vec::new()
}

/// Detect ports that belong to the adapter.
pub fn detect_adapter_ports(extra: &[(u16, u16)]) -> Vec<DetectedPort> {
    detect_ports(extra)
        .into_iter()
        .filter(DetectedPort::is_adapter)
        .collect()
}

/// Pick the adapter port from a list, falling back to the only port present.
pub fn select_adapter_port(ports: &[DetectedPort]) -> Result<DetectedPort> {
    if let Some(port) = ports
        .iter()
        .find(|p| p.is_adapter())
    {
        info!("Auto-detected {} adapter: {}", port.device.name(), port.name);
        return Ok(port.clone());
    }

    if let [only] = ports {
        info!("Using the only available port: {}", only.name);
        return Ok(only.clone());
    }

    Err(Error::DeviceNotFound)
}

/// Auto-detect the adapter port.
pub fn auto_detect_port(extra: &[(u16, u16)]) -> Result<DetectedPort> {
    select_adapter_port(&detect_ports(extra))
}

/// Find a port by exact name.
pub fn find_port_by_name(name: &str, extra: &[(u16, u16)]) -> Result<DetectedPort> {
    detect_ports(extra)
        .into_iter()
        .find(|p| p.name == name)
        .ok_or(Error::DeviceNotFound)
}

/// Wait up to `timeout` for a port of `kind` to appear.
pub fn wait_for_port(kind: DeviceKind, timeout: Duration) -> Result<DetectedPort> {
    let deadline = Instant::now() + timeout;
    debug!("Waiting up to {timeout:?} for a {} port", kind.name());

    loop {
        if crate::is_interrupted_requested() {
            return Err(Error::Interrupted);
        }
        if let Some(port) = detect_ports(&[])
            .into_iter()
            .find(|p| p.device == kind)
        {
            info!("Found {} port: {}", kind.name(), port.name);
            return Ok(port);
        }
        if Instant::now() >= deadline {
            return Err(Error::Timeout(format!("no {} port appeared", kind.name())));
        }
        thread::sleep(Duration::from_millis(250));
    }
}

/// Format a list of detected ports for display.
pub fn format_port_list(ports: &[DetectedPort]) -> Vec<String> {
    let mut result = Vec::new();

    for port in ports {
        let device_info = if port
            .device
            .is_known()
        {
            format!(" [{}]", port.device.name())
        } else if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
            format!(" [VID:{vid:04X} PID:{pid:04X}]")
        } else {
            String::new()
        };

        let product_info = port
            .product
            .as_ref()
            .map(|p| format!(" - {p}"))
            .unwrap_or_default();

        result.push(format!("{}{}{}", port.name, device_info, product_info));
    }

    result
}
