//! Serial port discovery for the board under test.
//!
//! The test firmware enumerates as a USB-CDC serial device whose product
//! string carries the board name. Discovery scans the host's serial ports
//! and matches descriptors against the configured substrings; it is
//! stateless and safe to call in a polling loop while the board resets and
//! re-enumerates.

use std::time::{Duration, Instant};

use log::{debug, info, trace};

use crate::error::{Error, Result};

/// One serial port found on the host.
#[derive(Debug, Clone)]
pub struct DiscoveredPort {
    /// Port name/path (e.g. "/dev/ttyACM0" or "COM3").
    pub name: String,
    /// Human-readable descriptor (USB product string when available).
    pub description: String,
    /// USB Vendor ID (if available).
    pub vid: Option<u16>,
    /// USB Product ID (if available).
    pub pid: Option<u16>,
    /// Serial number (if available).
    pub serial: Option<String>,
}

impl DiscoveredPort {
    /// Whether this port's descriptor matches any of the given substrings.
    #[must_use]
    pub fn matches(&self, descriptors: &[String]) -> bool {
        descriptors.iter().any(|d| self.description.contains(d))
    }
}

/// List every serial port on the host.
#[must_use]
pub fn discover_ports() -> Vec<DiscoveredPort> {
    let mut result = Vec::new();

    match serialport::available_ports() {
        Ok(ports) => {
            for port_info in ports {
                let mut discovered = DiscoveredPort {
                    name: port_info.port_name.clone(),
                    description: String::new(),
                    vid: None,
                    pid: None,
                    serial: None,
                };

                if let serialport::SerialPortType::UsbPort(usb_info) = port_info.port_type {
                    discovered.description = usb_info.product.clone().unwrap_or_default();
                    discovered.vid = Some(usb_info.vid);
                    discovered.pid = Some(usb_info.pid);
                    discovered.serial = usb_info.serial_number;

                    trace!(
                        "Found USB port: {} (VID: {:04X}, PID: {:04X}, product: {:?})",
                        port_info.port_name, usb_info.vid, usb_info.pid, usb_info.product
                    );
                }

                result.push(discovered);
            }
        },
        Err(e) => {
            debug!("Failed to enumerate serial ports: {e}");
        },
    }

    result
}

/// Find the first port whose descriptor matches any configured substring.
#[must_use]
pub fn find_board(descriptors: &[String]) -> Option<DiscoveredPort> {
    discover_ports().into_iter().find(|p| p.matches(descriptors))
}

/// Poll for the board until it appears, the deadline passes, or the
/// operator interrupts.
///
/// `timeout_at = None` waits indefinitely, which is the production-line
/// default: the board takes an unbounded operator-dependent time to come up.
pub fn wait_for_board(
    descriptors: &[String],
    poll: Duration,
    timeout_at: Option<Duration>,
) -> Result<DiscoveredPort> {
    let start = Instant::now();

    loop {
        if crate::is_interrupt_requested() {
            return Err(Error::Interrupted);
        }

        if let Some(port) = find_board(descriptors) {
            info!(
                "Found {} [{}:{} - Serial:{}]",
                port.description,
                port.vid.map_or_else(|| "????".to_string(), |v| format!("{v:04x}")),
                port.pid.map_or_else(|| "????".to_string(), |p| format!("{p:04x}")),
                port.serial.as_deref().unwrap_or("?"),
            );
            return Ok(port);
        }

        if let Some(limit) = timeout_at {
            if start.elapsed() >= limit {
                return Err(Error::Timeout(format!(
                    "no matching device after {}s",
                    limit.as_secs()
                )));
            }
        }

        std::thread::sleep(poll);
    }
}

/// Open a discovered port for a telemetry session.
///
/// The short read timeout makes the session loop's idle back-off the
/// pacing mechanism rather than the driver timeout.
pub fn open_port(name: &str) -> Result<Box<dyn serialport::SerialPort>> {
    let port = serialport::new(name, 115_200)
        .timeout(Duration::from_millis(50))
        .open()?;
    Ok(port)
}
