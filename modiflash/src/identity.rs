//! Module identity: uuid, bus address, type tag and firmware version.

use std::fmt;

use crate::error::{Error, Result};
use crate::protocol::packet::Packet;

/// Hardware type of a MODI module, decoded from the top 16 bits of its
/// 48-bit uuid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleType {
    /// The bus host/bridge module.
    Network,
    /// Environment sensor.
    Env,
    /// Gyroscope sensor.
    Gyro,
    /// Microphone sensor.
    Mic,
    /// Push button.
    Button,
    /// Rotary dial.
    Dial,
    /// Ultrasonic distance sensor.
    Ultrasonic,
    /// Infrared sensor.
    Ir,
    /// Dot-matrix display.
    Display,
    /// Motor driver.
    Motor,
    /// LED.
    Led,
    /// Speaker.
    Speaker,
}

impl ModuleType {
    /// Decode the type tag from a 48-bit module uuid.
    ///
    /// Unknown type codes default to `Network`, matching the bus firmware's
    /// fallback.
    #[allow(clippy::cast_possible_truncation)]
    pub fn from_uuid(uuid: u64) -> Self {
        match ((uuid >> 32) & 0xFFFF) as u16 {
            0x2000 => Self::Env,
            0x2010 => Self::Gyro,
            0x2020 => Self::Mic,
            0x2030 => Self::Button,
            0x2040 => Self::Dial,
            0x2050 => Self::Ultrasonic,
            0x2060 => Self::Ir,
            0x4000 => Self::Display,
            0x4010 => Self::Motor,
            0x4020 => Self::Led,
            0x4030 => Self::Speaker,
            _ => Self::Network,
        }
    }

    /// Lower-case name, also the base name of the module's firmware binary.
    pub fn name(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Env => "env",
            Self::Gyro => "gyro",
            Self::Mic => "mic",
            Self::Button => "button",
            Self::Dial => "dial",
            Self::Ultrasonic => "ultrasonic",
            Self::Ir => "ir",
            Self::Display => "display",
            Self::Motor => "motor",
            Self::Led => "led",
            Self::Speaker => "speaker",
        }
    }
}

impl fmt::Display for ModuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Firmware version packed as 3-bit major, 5-bit minor, 8-bit patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct FirmwareVersion {
    /// Major version (3 bits on the wire).
    pub major: u8,
    /// Minor version (5 bits on the wire).
    pub minor: u8,
    /// Patch version (8 bits on the wire).
    pub patch: u8,
}

impl FirmwareVersion {
    /// Build a version triple.
    pub fn new(major: u8, minor: u8, patch: u8) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Decode the 16-bit wire form: `mmm nnnnn pppppppp`.
    #[allow(clippy::cast_possible_truncation)]
    pub fn from_packed(packed: u16) -> Self {
        Self {
            major: ((packed & 0xE000) >> 13) as u8,
            minor: ((packed & 0x1F00) >> 8) as u8,
            patch: (packed & 0x00FF) as u8,
        }
    }

    /// Pack into the 16-bit wire form, e.g. 2.2.4 -> `0100_0010_0000_0100`.
    pub fn packed(self) -> u16 {
        (u16::from(self.major) << 13) | (u16::from(self.minor) << 8) | u16::from(self.patch)
    }

    /// Parse a `MAJOR.MINOR.PATCH` string, tolerating a leading `v`.
    pub fn parse(text: &str) -> Result<Self> {
        let trimmed = text.trim().trim_start_matches('v');
        let mut digits = trimmed.split('.');
        let mut next = || -> Result<u8> {
            digits
                .next()
                .and_then(|d| d.parse().ok())
                .ok_or_else(|| Error::InvalidFirmware(format!("bad version string {text:?}")))
        };
        Ok(Self {
            major: next()?,
            minor: next()?,
            patch: next()?,
        })
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Identity of one physical module, learned from an identity response or a
/// warning broadcast. Held for the duration of one update session only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleIdentity {
    /// 48-bit unique id.
    pub uuid: u64,
    /// 12-bit bus address, `uuid & 0xFFF`.
    pub module_id: u16,
    /// Hardware type decoded from the uuid.
    pub module_type: ModuleType,
    /// Reported firmware version, when the packet carried one.
    pub version: Option<FirmwareVersion>,
}

impl ModuleIdentity {
    /// Build an identity from a raw uuid.
    #[allow(clippy::cast_possible_truncation)]
    pub fn from_uuid(uuid: u64) -> Self {
        Self {
            uuid,
            module_id: (uuid & 0xFFF) as u16,
            module_type: ModuleType::from_uuid(uuid),
            version: None,
        }
    }

    /// Parse an identity-response payload: 6-byte uuid + 2-byte packed
    /// version.
    #[allow(clippy::cast_possible_truncation)]
    pub fn from_identity_response(packet: &Packet) -> Self {
        let fields = packet.unpack(&[6, 2]);
        let mut identity = Self::from_uuid(fields[0]);
        identity.version = Some(FirmwareVersion::from_packed(fields[1] as u16));
        identity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_type_from_uuid() {
        assert_eq!(ModuleType::from_uuid(0x0000_1234_5678), ModuleType::Network);
        assert_eq!(ModuleType::from_uuid(0x2030_0000_0042), ModuleType::Button);
        assert_eq!(ModuleType::from_uuid(0x4020_0000_0042), ModuleType::Led);
        // Unknown codes fall back to network.
        assert_eq!(ModuleType::from_uuid(0x9999_0000_0000), ModuleType::Network);
    }

    #[test]
    fn test_version_packing() {
        let version = FirmwareVersion::new(2, 2, 4);
        assert_eq!(version.packed(), 0b010_00010_00000100);
        assert_eq!(FirmwareVersion::from_packed(0b010_00010_00000100), version);
    }

    #[test]
    fn test_version_parse_and_ordering() {
        let parsed = FirmwareVersion::parse("v1.2.1\n").unwrap();
        assert_eq!(parsed, FirmwareVersion::new(1, 2, 1));
        assert!(FirmwareVersion::new(1, 2, 2) > FirmwareVersion::new(1, 2, 1));
        assert!(FirmwareVersion::new(2, 0, 0) > FirmwareVersion::new(1, 31, 255));
        assert!(FirmwareVersion::parse("garbage").is_err());
    }

    #[test]
    fn test_identity_from_uuid() {
        let identity = ModuleIdentity::from_uuid(0x2030_0000_0ABC);
        assert_eq!(identity.module_id, 0xABC);
        assert_eq!(identity.module_type, ModuleType::Button);
        assert_eq!(identity.version, None);
    }
}
