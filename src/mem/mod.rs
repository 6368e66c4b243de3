//! Memory transaction protocol.
//!
//! Packets, the ports they travel through, and the time-ordered transmit
//! lists used by ports that respond asynchronously.

/// Memory commands, requests and packets.
pub mod packet;

/// Port trait, peer binding and status notifications.
pub mod port;

/// Time-ordered response lists.
pub mod transmit;

pub use packet::{Dest, MemCmd, Packet, PacketPtr, PacketResult, Request, NUM_MEM_CMDS};
pub use port::{connect, DeviceRanges, PeerLink, Port, Status};
pub use transmit::{TransmitList, Wakeup};
