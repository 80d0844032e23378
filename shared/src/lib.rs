//! Wire protocol shared by the BrewOS RT-MCU and C-MCU firmwares: message
//! type space, packet framing, CRC, payload layouts, and the reliability
//! layer (`link`) both sides instantiate identically.

#![cfg_attr(not(test), no_std)]

pub mod crc;
pub mod link;
pub mod packet;
pub mod payload;
pub mod types;

pub use packet::{FrameDecoder, FrameError, Packet, MAX_FRAME, MAX_PAYLOAD, SYNC};
pub use types::MessageType;
