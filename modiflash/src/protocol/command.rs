//! MODI command opcodes and message builders.
//!
//! Builders produce ready-to-send [`Packet`]s for every protocol operation
//! the updater performs: identity requests, module/network state changes,
//! the erase/CRC firmware command pair and the 8-byte data bursts.

use byteorder::{LittleEndian, WriteBytesExt};

use crate::protocol::packet::{BROADCAST_ID, MAX_PAYLOAD, Packet};

/// Command opcodes seen on the bus during an update session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Identity response carrying uuid + packed firmware version (0x05).
    IdentityResponse = 0x05,
    /// Module state change request (0x09).
    SetModuleState = 0x09,
    /// Unsolicited readiness broadcast during update mode (0x0A).
    Warning = 0x0A,
    /// 8-byte firmware data burst (0x0B).
    FirmwareData = 0x0B,
    /// Erase/CRC command response (0x0C).
    FirmwareResponse = 0x0C,
    /// Erase/CRC command request (0x0D).
    FirmwareCommand = 0x0D,
    /// Identity request broadcast (0x28).
    IdentityRequest = 0x28,
    /// Network module state change request (0xA4).
    SetNetworkState = 0xA4,
}

/// Module state values carried by [`Opcode::SetModuleState`] /
/// [`Opcode::SetNetworkState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ModuleState {
    /// Normal operation.
    Run = 0,
    /// Warning state.
    Warning = 1,
    /// Paused by the host.
    ForcedPause = 2,
    /// Enter firmware-update mode.
    UpdateFirmware = 4,
    /// Host acknowledges the module is ready for firmware data.
    UpdateFirmwareReady = 5,
    /// Reboot the module.
    Reboot = 6,
}

/// Plug-and-play advertisement state sent along with a state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PnpState {
    /// Modules keep broadcasting their topology.
    On = 1,
    /// Topology broadcasts are silenced for the update.
    Off = 2,
}

/// Outcome of an erase or CRC-verify command, decoded from the state code
/// at byte 4 of a [`Opcode::FirmwareResponse`] payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashAck {
    /// CRC verification failed (state code 4).
    CrcError,
    /// CRC verification passed (state code 5).
    CrcComplete,
    /// Page erase failed (state code 6).
    EraseError,
    /// Page erase succeeded (state code 7).
    EraseComplete,
}

impl FlashAck {
    /// Classify a firmware-response packet; `None` for unrelated state codes.
    pub fn from_packet(packet: &Packet) -> Option<Self> {
        if packet.command != Opcode::FirmwareResponse as u8 {
            return None;
        }
        match packet.unpack(&[4, 1])[1] {
            4 => Some(Self::CrcError),
            5 => Some(Self::CrcComplete),
            6 => Some(Self::EraseError),
            7 => Some(Self::EraseComplete),
            _ => None,
        }
    }

    /// Whether the device reported success.
    pub fn is_success(self) -> bool {
        matches!(self, Self::CrcComplete | Self::EraseComplete)
    }
}

/// Readiness broadcast a module emits while switching into update mode
/// (opcode 0x0A): 6-byte uuid followed by a one-byte warning code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Warning {
    /// 48-bit uuid of the announcing module.
    pub uuid: u64,
    /// Warning code; see [`Warning::WAITING_ACK`] / [`Warning::READY`].
    pub code: u8,
}

impl Warning {
    /// The module is held in its bootloader and waits for the host to
    /// acknowledge with an update-ready state change.
    pub const WAITING_ACK: u8 = 1;

    /// The module entered update mode and accepts firmware data.
    pub const READY: u8 = 2;

    /// Parse a warning packet; `None` for other opcodes or an empty uuid.
    #[allow(clippy::cast_possible_truncation)]
    pub fn from_packet(packet: &Packet) -> Option<Self> {
        if packet.command != Opcode::Warning as u8 {
            return None;
        }
        let fields = packet.unpack(&[6, 1]);
        (fields[0] != 0).then_some(Self {
            uuid: fields[0],
            code: fields[1] as u8,
        })
    }
}

/// The two page-level flash operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashOp {
    /// Erase the page before writing.
    Erase,
    /// Verify the accumulated page checksum.
    Crc,
}

impl FlashOp {
    /// Sub-command nibble packed into the high bits of the source address.
    fn scmd(self) -> u16 {
        match self {
            Self::Erase => 2,
            Self::Crc => 1,
        }
    }
}

/// Identity request broadcast.
///
/// The payload requests uuid and version from every module; the network
/// variant additionally asks for the module's own record.
pub fn request_uuid(network_scope: bool) -> Packet {
    let flags = if network_scope { 0xFF } else { 0x0F };
    Packet::with_values(
        Opcode::IdentityRequest as u8,
        BROADCAST_ID,
        BROADCAST_ID,
        &[0xFF, flags],
    )
}

/// Module state change (opcode 0x09).
pub fn set_module_state(destination: u16, state: ModuleState, pnp: PnpState) -> Packet {
    Packet::new(
        Opcode::SetModuleState as u8,
        0,
        destination,
        vec![state as u8, pnp as u8],
    )
}

/// Network module state change (opcode 0xA4).
pub fn set_network_state(destination: u16, state: ModuleState, pnp: PnpState) -> Packet {
    Packet::new(
        Opcode::SetNetworkState as u8,
        0,
        destination,
        vec![state as u8, pnp as u8],
    )
}

/// Erase or CRC-verify command for one flash page.
///
/// The 12-bit source address is split 4/8: the high nibble carries the
/// sub-command (erase=2, crc=1), the low byte the sub-type (always 1).
/// The payload packs the running CRC-32 in the first four bytes and the
/// absolute page address in the last four, both little-endian.
#[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
pub fn firmware_command(op: FlashOp, module_id: u16, crc: u32, page_addr: u32) -> Packet {
    let source = (op.scmd() << 8) | 1;

    let mut data = Vec::with_capacity(8);
    data.write_u32::<LittleEndian>(crc).unwrap();
    data.write_u32::<LittleEndian>(page_addr).unwrap();

    Packet::new(Opcode::FirmwareCommand as u8, source, module_id, data)
}

/// One 8-byte firmware data burst.
///
/// The source field carries the block sequence number within the page.
pub fn firmware_data(module_id: u16, seq: u16, block: &[u8]) -> Packet {
    let mut data = [0u8; MAX_PAYLOAD];
    let n = block.len().min(MAX_PAYLOAD);
    data[..n].copy_from_slice(&block[..n]);
    Packet::new(Opcode::FirmwareData as u8, seq, module_id, data.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_firmware_command_layout() {
        let packet = firmware_command(FlashOp::Erase, 0x123, 0xDEADBEEF, 0x0800_9000);
        assert_eq!(packet.command, 0x0D);
        assert_eq!(packet.source, 0x201);
        assert_eq!(packet.destination, 0x123);
        assert_eq!(&packet.data[..4], &[0xEF, 0xBE, 0xAD, 0xDE]);
        assert_eq!(&packet.data[4..], &[0x00, 0x90, 0x00, 0x08]);

        let crc = firmware_command(FlashOp::Crc, 0x123, 0, 0);
        assert_eq!(crc.source, 0x101);
    }

    #[test]
    fn test_firmware_data_pads_to_eight() {
        let packet = firmware_data(0x123, 3, &[1, 2, 3]);
        assert_eq!(packet.command, 0x0B);
        assert_eq!(packet.source, 3);
        assert_eq!(packet.data, vec![1, 2, 3, 0, 0, 0, 0, 0]);
        assert_eq!(packet.length, 8);
    }

    #[test]
    fn test_flash_ack_classification() {
        let mut payload = vec![0u8; 5];
        for (code, expected) in [
            (4, FlashAck::CrcError),
            (5, FlashAck::CrcComplete),
            (6, FlashAck::EraseError),
            (7, FlashAck::EraseComplete),
        ] {
            payload[4] = code;
            let packet = Packet::new(0x0C, 0x123, 0, payload.clone());
            assert_eq!(FlashAck::from_packet(&packet), Some(expected));
        }

        // Unrelated state codes and opcodes classify as nothing.
        payload[4] = 1;
        assert_eq!(
            FlashAck::from_packet(&Packet::new(0x0C, 0x123, 0, payload.clone())),
            None
        );
        payload[4] = 5;
        assert_eq!(
            FlashAck::from_packet(&Packet::new(0x0A, 0x123, 0, payload)),
            None
        );
    }

    #[test]
    fn test_warning_parse() {
        let mut payload = vec![0xBC, 0x0A, 0x00, 0x00, 0x30, 0x20, Warning::READY];
        let warning = Warning::from_packet(&Packet::new(0x0A, 0xABC, 0, payload.clone())).unwrap();
        assert_eq!(warning.uuid, 0x2030_0000_0ABC);
        assert_eq!(warning.code, Warning::READY);

        // A warning with no uuid carries nothing actionable.
        payload[..6].fill(0);
        assert_eq!(Warning::from_packet(&Packet::new(0x0A, 0, 0, payload)), None);
    }

    #[test]
    fn test_state_requests() {
        let packet = set_module_state(BROADCAST_ID, ModuleState::Reboot, PnpState::Off);
        assert_eq!(packet.command, 0x09);
        assert_eq!(packet.data, vec![6, 2]);

        let packet = set_network_state(0x456, ModuleState::UpdateFirmware, PnpState::Off);
        assert_eq!(packet.command, 0xA4);
        assert_eq!(packet.source, 0);
        assert_eq!(packet.data, vec![4, 2]);
    }
}
