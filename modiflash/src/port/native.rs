//! Native serial port implementation using the `serialport` crate.

use std::io::Read;

use log::trace;

use crate::error::{Error, Result};
use crate::port::{PortInfo, PortProvider, SerialConfig, Transport};

/// Native serial port.
pub struct NativePort {
    port: Option<Box<dyn serialport::SerialPort>>,
    name: String,
}

impl NativePort {
    /// Open a serial port with the given configuration.
    pub fn open(config: &SerialConfig) -> Result<Self> {
        let port = serialport::new(&config.port_name, config.baud_rate)
            .timeout(config.timeout)
            .open()?;

        Ok(Self {
            port: Some(port),
            name: config.port_name.clone(),
        })
    }
}

impl Transport for NativePort {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn write_bytes(&mut self, buf: &[u8]) -> Result<()> {
        let Some(port) = self.port.as_mut() else {
            trace!("write on closed port {} dropped", self.name);
            return Ok(());
        };
        port.write_all(buf)?;
        port.flush()?;
        Ok(())
    }

    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize> {
        let Some(port) = self.port.as_mut() else {
            return Ok(0);
        };
        // A silent line must answer immediately: the reader shares the port
        // with the command path, and a read parked on the OS timeout would
        // hold writes back for its whole duration.
        if port.bytes_to_read()? == 0 {
            return Ok(0);
        }
        match port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn close(&mut self) -> Result<()> {
        // Take ownership of the port and let it drop (close)
        self.port.take();
        Ok(())
    }
}

/// Port provider backed by `serialport` enumeration.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialProvider;

impl SerialProvider {
    /// List ports that look like MODI network modules.
    pub fn list_modi_ports(&self) -> Result<Vec<PortInfo>> {
        Ok(self
            .list_ports()?
            .into_iter()
            .filter(PortInfo::is_likely_modi)
            .collect())
    }
}

impl PortProvider for SerialProvider {
    fn list_ports(&self) -> Result<Vec<PortInfo>> {
        let ports = serialport::available_ports().map_err(Error::Serial)?;

        Ok(ports
            .into_iter()
            .map(|p| {
                let (vid, pid, manufacturer, product, serial_number) = match &p.port_type {
                    serialport::SerialPortType::UsbPort(info) => (
                        Some(info.vid),
                        Some(info.pid),
                        info.manufacturer.clone(),
                        info.product.clone(),
                        info.serial_number.clone(),
                    ),
                    _ => (None, None, None, None, None),
                };

                PortInfo {
                    name: p.port_name,
                    vid,
                    pid,
                    manufacturer,
                    product,
                    serial_number,
                }
            })
            .collect())
    }

    fn open(&self, config: &SerialConfig) -> Result<Box<dyn Transport>> {
        Ok(Box::new(NativePort::open(config)?))
    }
}
