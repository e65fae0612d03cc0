//! MODI bus protocol: packet envelope, command builders and page checksum.

pub mod command;
pub mod crc;
pub mod packet;

// Re-export common types
pub use command::{FlashAck, FlashOp, ModuleState, Opcode, PnpState, Warning};
pub use packet::{BROADCAST_ID, MAX_PAYLOAD, Packet, encode_values, unpack_bytes};
