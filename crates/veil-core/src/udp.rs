use bytes::Bytes;

use crate::types::TargetAddr;

/// A single datagram moving through the tunnel, never fragmented.
#[derive(Debug, Clone)]
pub struct UdpPacket {
	pub target:  TargetAddr,
	pub payload: Bytes,
}
