//! Serial port discovery and classification.
//!
//! K210 boards sit behind one of a handful of USB-UART bridges. Ports are
//! classified by USB vendor ID, and a board profile can narrow the choice:
//! the FT2232 on goE exposes JTAG first and the UART second, the trainer
//! board the other way around.

use serde::Serialize;

use crate::error::{Error, Result};
use crate::target::board::Board;

#[cfg(feature = "native")]
use log::{debug, trace};
use log::info;

/// USB-UART bridges found on K210 boards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceKind {
    /// WCH CH340/CH341 (Dan, Bit, KD233).
    Ch340,
    /// FTDI FT2232 (Maix Go, trainer).
    Ftdi,
    /// Prolific PL2303.
    Prolific,
    /// Silicon Labs CP210x.
    Cp210x,
    /// CMSIS-DAP probes with a UART bridge.
    CmsisDap,
    /// Anything else.
    Unknown,
}

const KNOWN_VIDS: &[(u16, DeviceKind)] = &[
    (0x1A86, DeviceKind::Ch340),
    (0x0403, DeviceKind::Ftdi),
    (0x067B, DeviceKind::Prolific),
    (0x10C4, DeviceKind::Cp210x),
    (0xC251, DeviceKind::CmsisDap),
];

impl DeviceKind {
    /// Classify by USB vendor ID.
    #[must_use]
    pub fn from_vid(vid: u16) -> Self {
        KNOWN_VIDS
            .iter()
            .find(|(known, _)| *known == vid)
            .map_or(Self::Unknown, |(_, kind)| *kind)
    }

    /// Human-readable name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ch340 => "CH340/CH341",
            Self::Ftdi => "FTDI",
            Self::Prolific => "PL2303",
            Self::Cp210x => "CP210x",
            Self::CmsisDap => "CMSIS-DAP",
            Self::Unknown => "Unknown",
        }
    }

    /// Whether this is one of the known bridges.
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

/// A serial port with whatever USB metadata the OS reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DetectedPort {
    /// Port name/path (e.g., "/dev/ttyUSB0" or "COM3").
    pub name: String,
    /// Classified bridge.
    pub device: DeviceKind,
    /// USB vendor ID.
    pub vid: Option<u16>,
    /// USB product ID.
    pub pid: Option<u16>,
    /// Manufacturer string.
    pub manufacturer: Option<String>,
    /// Product string.
    pub product: Option<String>,
    /// Serial number.
    pub serial: Option<String>,
}

impl DetectedPort {
    /// A port with no USB metadata.
    pub fn bare(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            device: DeviceKind::Unknown,
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
            serial: None,
        }
    }

    /// Whether the port is behind a bridge used by K210 boards.
    pub fn is_likely_k210(&self) -> bool {
        self.device.is_known()
    }
}

/// Enumerate serial ports.
#[cfg(feature = "native")]
pub fn detect_ports() -> Vec<DetectedPort> {
    let ports = match serialport::available_ports() {
        Ok(ports) => ports,
        Err(e) => {
            debug!("Failed to enumerate serial ports: {e}");
            return Vec::new();
        },
    };

    ports
        .into_iter()
        .map(|info| {
            let mut detected = DetectedPort::bare(info.port_name);
            if let serialport::SerialPortType::UsbPort(usb) = info.port_type {
                detected.device = DeviceKind::from_vid(usb.vid);
                detected.vid = Some(usb.vid);
                detected.pid = Some(usb.pid);
                detected.manufacturer = usb.manufacturer;
                detected.product = usb.product;
                detected.serial = usb.serial_number;
                trace!(
                    "Found USB port: {} (VID: {:04X}, PID: {:04X}, {:?})",
                    detected.name, usb.vid, usb.pid, detected.device
                );
            }
            detected
        })
        .collect()
}

/// Enumerate serial ports (no serial backend compiled in).
#[cfg(not(feature = "native"))]
pub fn detect_ports() -> Vec<DetectedPort> {
    Vec::new()
}

/// Ports behind a known bridge.
pub fn detect_k210_ports() -> Vec<DetectedPort> {
    detect_ports()
        .into_iter()
        .filter(DetectedPort::is_likely_k210)
        .collect()
}

/// Pick the port `board` is most likely attached to.
///
/// goE takes the second FTDI port (the first is JTAG) and trainer the
/// first; every other board, including an undetected one, takes the first
/// known bridge in enumeration order.
pub fn select_port(ports: &[DetectedPort], board: Option<Board>) -> Result<DetectedPort> {
    let selected = match board {
        Some(Board::GoE | Board::Trainer) => {
            let mut ftdi: Vec<&DetectedPort> = ports
                .iter()
                .filter(|p| p.device == DeviceKind::Ftdi)
                .collect();
            ftdi.sort_by(|a, b| a.name.cmp(&b.name));
            let index = usize::from(board == Some(Board::GoE) && ftdi.len() > 1);
            ftdi.get(index).copied()
        },
        _ => ports.iter().find(|p| p.is_likely_k210()),
    };

    let port = selected.cloned().ok_or(Error::DeviceNotFound)?;
    info!("COM port auto detected, selected {}", port.name);
    Ok(port)
}

/// Enumerate and pick a port for `board`.
pub fn auto_detect_port(board: Option<Board>) -> Result<DetectedPort> {
    select_port(&detect_ports(), board)
}

/// One display line per port.
pub fn format_port_list(ports: &[DetectedPort]) -> Vec<String> {
    ports
        .iter()
        .map(|port| {
            let device_info = if port.device.is_known() {
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
            format!("{}{device_info}{product_info}", port.name)
        })
        .collect()
}
