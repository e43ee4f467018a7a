//! HCI and L2CAP wire protocol

pub mod commands;
pub mod eir;
pub mod events;
pub mod l2cap;
pub mod opcodes;
pub mod packet;
pub mod params;

pub use eir::{EInfoReport, EirDataType, GapFlags, ManufacturerData};
pub use events::HciEventData;
pub use l2cap::{AclReassembler, L2capFrame};
pub use packet::{AclPacket, HciCommand, HciEvent, HciPacket, HciPacketType, PacketBoundary};
pub use params::{AdvertisingParams, LeConnParams, ScanParams};
