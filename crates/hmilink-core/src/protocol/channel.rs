//! Byte channel abstraction and serial port handling
//!
//! The engine talks to the display through the narrow [`Channel`] trait so the
//! protocol logic can be exercised against scripted channels in tests. The
//! production implementation wraps a `serialport` handle.

use serde::Serialize;
use serialport::{SerialPort, SerialPortInfo, SerialPortType};
use std::collections::HashMap;
#[cfg(target_os = "linux")]
use std::fs;
use std::io;
use std::time::Duration;

use super::{ProtocolError, DEFAULT_BAUD_RATE};

/// Non-blocking byte channel shared by the command protocol and the uploader.
///
/// `read` must never block longer than the underlying port's short poll
/// timeout; callers check `bytes_to_read` first and drain in a loop.
pub trait Channel {
    /// Number of bytes available to read without blocking
    fn bytes_to_read(&mut self) -> io::Result<u32>;

    /// Read into `buf`, returning the number of bytes read
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write all bytes
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;

    /// Flush pending output
    fn flush(&mut self) -> io::Result<()>;

    /// Discard any unread input
    fn clear_input(&mut self) -> io::Result<()>;
}

/// Serial port wrapper implementing [`Channel`]
pub struct SerialChannel {
    port: Box<dyn SerialPort>,
}

impl SerialChannel {
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        Self { port }
    }

    /// Open and configure the named port at the given baud rate
    pub fn open(name: &str, baud_rate: Option<u32>) -> Result<Self, ProtocolError> {
        let mut port = open_port(name, baud_rate)?;
        configure_port(port.as_mut())?;
        Ok(Self { port })
    }
}

impl Channel for SerialChannel {
    fn bytes_to_read(&mut self) -> io::Result<u32> {
        self.port
            .bytes_to_read()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(ref e)
                if e.kind() == io::ErrorKind::TimedOut
                    || e.kind() == io::ErrorKind::WouldBlock =>
            {
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        io::Write::write_all(&mut self.port, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        io::Write::flush(&mut self.port)
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.port
            .clear(serialport::ClearBuffer::Input)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }
}

/// A serial port a display might be attached to
#[derive(Debug, Clone, Serialize)]
pub struct PortInfo {
    /// OS-level port name, `/dev/ttyUSB0` on Linux or `COM3` on Windows
    pub name: String,

    /// USB vendor id, when the port is a USB adapter
    pub vid: Option<u16>,

    /// USB product id, when the port is a USB adapter
    pub pid: Option<u16>,

    /// Adapter manufacturer string, when reported
    pub manufacturer: Option<String>,

    /// Adapter product string, when reported
    pub product: Option<String>,

    /// Adapter serial number, when reported
    pub serial_number: Option<String>,
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        let mut port = PortInfo {
            name: info.port_name,
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
            serial_number: None,
        };
        if let SerialPortType::UsbPort(usb) = info.port_type {
            port.vid = Some(usb.vid);
            port.pid = Some(usb.pid);
            port.manufacturer = usb.manufacturer;
            port.product = usb.product;
            port.serial_number = usb.serial_number;
        }
        port
    }
}

/// Sort key placing the ports a display usually shows up on first:
/// ttyACM* by numeric suffix, then ttyUSB* likewise, then everything else
/// alphabetically.
fn port_sort_key(name: &str) -> (u8, usize, String) {
    let basename = name.rsplit('/').next().unwrap_or(name);
    if let Some(rest) = basename.strip_prefix("ttyACM") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (0, num, basename.to_string());
    }
    if let Some(rest) = basename.strip_prefix("ttyUSB") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (1, num, basename.to_string());
    }
    (2, 0, basename.to_string())
}

/// Enumerate serial ports in a stable, display-friendly order.
///
/// On Linux the `/dev` tree is scanned as well, since `available_ports` can
/// miss adapters the enumeration backend does not know about.
pub fn list_ports() -> Vec<PortInfo> {
    let mut ports: HashMap<String, PortInfo> = HashMap::new();
    for info in serialport::available_ports().unwrap_or_default() {
        let port = PortInfo::from(info);
        ports.entry(port.name.clone()).or_insert(port);
    }

    #[cfg(target_os = "linux")]
    if let Ok(entries) = fs::read_dir("/dev") {
        for entry in entries.flatten() {
            if let Some(fname) = entry.file_name().to_str() {
                if fname.starts_with("ttyACM") || fname.starts_with("ttyUSB") {
                    let full = format!("/dev/{fname}");
                    ports.entry(full.clone()).or_insert_with(|| PortInfo {
                        name: full,
                        vid: None,
                        pid: None,
                        manufacturer: None,
                        product: None,
                        serial_number: None,
                    });
                }
            }
        }
    }

    let mut listed: Vec<PortInfo> = ports.into_values().collect();
    listed.sort_by_key(|p| port_sort_key(&p.name));
    listed
}

/// Open a serial port with default settings
pub fn open_port(name: &str, baud_rate: Option<u32>) -> Result<Box<dyn SerialPort>, ProtocolError> {
    let baud = baud_rate.unwrap_or(DEFAULT_BAUD_RATE);

    // Short timeout so reads behave as polls rather than blocking waits
    serialport::new(name, baud)
        .timeout(Duration::from_millis(20))
        .open()
        .map_err(|e| ProtocolError::SerialError(e.to_string()))
}

/// Configure a serial port for display communication (8N1, no flow control)
pub fn configure_port(port: &mut dyn SerialPort) -> Result<(), ProtocolError> {
    port.set_data_bits(serialport::DataBits::Eight)
        .map_err(|e| ProtocolError::SerialError(e.to_string()))?;
    port.set_parity(serialport::Parity::None)
        .map_err(|e| ProtocolError::SerialError(e.to_string()))?;
    port.set_stop_bits(serialport::StopBits::One)
        .map_err(|e| ProtocolError::SerialError(e.to_string()))?;
    port.set_flow_control(serialport::FlowControl::None)
        .map_err(|e| ProtocolError::SerialError(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_sort_key_ordering() {
        let mut names = vec![
            "/dev/ttyS0".to_string(),
            "/dev/ttyUSB1".to_string(),
            "/dev/ttyACM10".to_string(),
            "/dev/ttyACM2".to_string(),
            "/dev/ttyUSB0".to_string(),
        ];
        names.sort_by_key(|n| port_sort_key(n));
        assert_eq!(
            names,
            vec![
                "/dev/ttyACM2",
                "/dev/ttyACM10",
                "/dev/ttyUSB0",
                "/dev/ttyUSB1",
                "/dev/ttyS0",
            ]
        );
    }
}
