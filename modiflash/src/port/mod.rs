//! Serial transport abstraction.
//!
//! The protocol layer never touches `serialport` directly; it talks to a
//! [`Transport`] and discovers devices through a [`PortProvider`]. Native
//! platforms get both from [`native`]; tests substitute scripted mocks.
//!
//! Writes are fire-and-forget and become no-ops once the port is closed.
//! Reads hand back only what is already buffered and never wait for more,
//! so a silent line keeps the port free for writers.

#[cfg(feature = "native")]
pub mod native;

use std::time::Duration;

use crate::error::Result;

/// Default MODI bus baud rate.
pub const DEFAULT_BAUD: u32 = 921_600;

/// Serial port configuration.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyUSB0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Per-read timeout.
    pub timeout: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: DEFAULT_BAUD,
            timeout: Duration::from_millis(100),
        }
    }
}

impl SerialConfig {
    /// Create a new configuration with a port name.
    pub fn new(port_name: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            ..Default::default()
        }
    }

    /// Set the per-read timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Information about one discovered serial port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    /// Port name/path.
    pub name: String,
    /// USB vendor ID (if available).
    pub vid: Option<u16>,
    /// USB product ID (if available).
    pub pid: Option<u16>,
    /// Manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Product string (if available).
    pub product: Option<String>,
    /// Serial number (if available).
    pub serial_number: Option<String>,
}

impl PortInfo {
    /// Stable key identifying the physical attachment point, used to re-find
    /// a device after it drops off the bus and re-enumerates (possibly under
    /// a different port name). The USB serial number is the most stable key
    /// the `serialport` crate exposes; ports without one fall back to the
    /// port name.
    pub fn location(&self) -> String {
        self.serial_number
            .clone()
            .unwrap_or_else(|| self.name.clone())
    }

    /// Whether this looks like a MODI network module's USB CDC endpoint.
    pub fn is_likely_modi(&self) -> bool {
        let tagged = |field: &Option<String>| {
            field
                .as_deref()
                .is_some_and(|s| s.to_ascii_uppercase().contains("MODI"))
        };
        self.vid == Some(0x2FDE) || tagged(&self.manufacturer) || tagged(&self.product)
    }
}

/// Byte-level serial transport owned by exactly one device driver.
pub trait Transport: Send {
    /// Port name/path.
    fn name(&self) -> &str;

    /// Whether the port is currently open.
    fn is_open(&self) -> bool;

    /// Write raw bytes. Silently does nothing when the port is closed.
    fn write_bytes(&mut self, buf: &[u8]) -> Result<()>;

    /// Read whatever input is already buffered, returning promptly; zero
    /// means the line is currently silent. Implementations must not wait
    /// for data to arrive, or a quiet device would stall writers sharing
    /// the port.
    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Close the port and release resources.
    fn close(&mut self) -> Result<()>;
}

/// Port discovery and opening, shared by drivers and the orchestrator.
///
/// Separated from [`Transport`] so reconnect handling and tests can
/// re-enumerate without holding an open port.
pub trait PortProvider: Send + Sync {
    /// List all available serial ports.
    fn list_ports(&self) -> Result<Vec<PortInfo>>;

    /// Open a transport on the named port.
    fn open(&self, config: &SerialConfig) -> Result<Box<dyn Transport>>;

    /// Re-find a port by its physical location key.
    fn find_by_location(&self, location: &str) -> Result<Option<PortInfo>> {
        Ok(self
            .list_ports()?
            .into_iter()
            .find(|p| p.location() == location))
    }
}

#[cfg(feature = "native")]
pub use native::{NativePort, SerialProvider};
