use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{FromPrimitive, IntoPrimitive};
use rand::RngCore;
use tokio_util::codec::{Decoder, Encoder};

use crate::{
	error::{Error, ProtocolViolation},
	proto::{Address, AddressCodec},
};

pub const GLOBAL_ID_LEN: usize = 8;

/// Per-tunnel UDP session identity. Always freshly random, never derived
/// from an address.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct GlobalId([u8; GLOBAL_ID_LEN]);

impl GlobalId {
	pub fn fresh() -> Self {
		let mut raw = [0u8; GLOBAL_ID_LEN];
		rand::rng().fill_bytes(&mut raw);
		Self(raw)
	}

	pub fn from_bytes(raw: [u8; GLOBAL_ID_LEN]) -> Self {
		Self(raw)
	}

	pub fn as_bytes(&self) -> &[u8; GLOBAL_ID_LEN] {
		&self.0
	}
}

impl fmt::Debug for GlobalId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "GlobalId({})", hex::encode(self.0))
	}
}

impl fmt::Display for GlobalId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&hex::encode(self.0))
	}
}

#[derive(IntoPrimitive, FromPrimitive, Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum UdpStatus {
	New  = 0,
	Keep = 1,
	End  = 2,
	#[num_enum(catch_all)]
	Other(u8),
}

/// One datagram inside the tunnel stream.
///
/// Wire: `global_id(8) | status(1) | has_target(1) | [address] |
/// payload_len(2 BE) | payload`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpFrame {
	pub global_id: GlobalId,
	pub status:    UdpStatus,
	pub target:    Option<Address>,
	pub payload:   Bytes,
}

#[derive(Debug, Clone, Copy)]
pub struct UdpFrameCodec;

impl Decoder for UdpFrameCodec {
	type Error = Error;
	type Item = UdpFrame;

	fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
		if src.len() < GLOBAL_ID_LEN + 2 {
			return Ok(None);
		}
		let status = UdpStatus::from(src[GLOBAL_ID_LEN]);
		if matches!(status, UdpStatus::Other(_)) {
			return Err(Error::protocol(ProtocolViolation::UnexpectedFrame));
		}
		let has_target = match src[GLOBAL_ID_LEN + 1] {
			0 => false,
			1 => true,
			_ => return Err(Error::protocol(ProtocolViolation::UnexpectedFrame)),
		};

		let mut offset = GLOBAL_ID_LEN + 2;
		let target = if has_target {
			let Some((addr, addr_len)) = Address::peek(&src[offset..])? else {
				return Ok(None);
			};
			offset += addr_len;
			Some(addr)
		} else {
			None
		};

		if src.len() < offset + 2 {
			return Ok(None);
		}
		let payload_len = u16::from_be_bytes([src[offset], src[offset + 1]]) as usize;
		if src.len() < offset + 2 + payload_len {
			return Ok(None);
		}

		let mut raw_id = [0u8; GLOBAL_ID_LEN];
		raw_id.copy_from_slice(&src[..GLOBAL_ID_LEN]);
		src.advance(offset + 2);
		let payload = src.split_to(payload_len).freeze();

		Ok(Some(UdpFrame {
			global_id: GlobalId::from_bytes(raw_id),
			status,
			target,
			payload,
		}))
	}

	fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
		match self.decode(buf) {
			Ok(None) if !buf.is_empty() => Err(Error::BytesRemaining),
			v => v,
		}
	}
}

impl Encoder<UdpFrame> for UdpFrameCodec {
	type Error = Error;

	fn encode(&mut self, item: UdpFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
		let addr_size = item.target.as_ref().map(Address::size).unwrap_or(0);
		dst.reserve(GLOBAL_ID_LEN + 2 + addr_size + 2 + item.payload.len());
		dst.put_slice(item.global_id.as_bytes());
		dst.put_u8(item.status.into());
		match item.target {
			Some(addr) => {
				dst.put_u8(1);
				AddressCodec.encode(addr, dst)?;
			}
			None => dst.put_u8(0),
		}
		dst.put_u16(item.payload.len() as u16);
		dst.put_slice(&item.payload);
		Ok(())
	}
}

#[cfg(test)]
mod test {
	use std::net::Ipv4Addr;

	use bytes::{Bytes, BytesMut};
	use tokio_util::codec::{Decoder as _, Encoder as _};

	use super::*;

	fn sample(status: UdpStatus, target: Option<Address>) -> UdpFrame {
		UdpFrame {
			global_id: GlobalId::from_bytes([1, 2, 3, 4, 5, 6, 7, 8]),
			status,
			target,
			payload: Bytes::from_static(b"datagram"),
		}
	}

	#[test]
	fn roundtrip_with_and_without_target() {
		for frame in [
			sample(UdpStatus::New, Some(Address::IPv4(Ipv4Addr::new(1, 1, 1, 1), 53))),
			sample(UdpStatus::Keep, None),
			sample(UdpStatus::End, None),
		] {
			let mut buf = BytesMut::new();
			UdpFrameCodec.encode(frame.clone(), &mut buf).unwrap();
			let decoded = UdpFrameCodec.decode(&mut buf).unwrap().unwrap();
			assert_eq!(decoded, frame);
			assert!(buf.is_empty());
		}
	}

	#[test]
	fn restartable_across_read_boundaries() {
		let frame = sample(
			UdpStatus::New,
			Some(Address::Domain("dns.example".into(), 53)),
		);
		let mut wire = BytesMut::new();
		UdpFrameCodec.encode(frame.clone(), &mut wire).unwrap();
		let wire = wire.freeze();

		// Feed the frame byte by byte; the decoder must not consume
		// anything until the whole frame is present.
		let mut buf = BytesMut::new();
		for (i, byte) in wire.iter().enumerate() {
			buf.put_u8(*byte);
			let decoded = UdpFrameCodec.decode(&mut buf).unwrap();
			if i + 1 < wire.len() {
				assert!(decoded.is_none(), "decoded early at byte {i}");
			} else {
				assert_eq!(decoded.unwrap(), frame);
			}
		}
	}

	#[test]
	fn back_to_back_frames() {
		let a = sample(UdpStatus::New, Some(Address::IPv4(Ipv4Addr::LOCALHOST, 53)));
		let b = sample(UdpStatus::Keep, None);
		let mut buf = BytesMut::new();
		UdpFrameCodec.encode(a.clone(), &mut buf).unwrap();
		UdpFrameCodec.encode(b.clone(), &mut buf).unwrap();

		assert_eq!(UdpFrameCodec.decode(&mut buf).unwrap().unwrap(), a);
		assert_eq!(UdpFrameCodec.decode(&mut buf).unwrap().unwrap(), b);
		assert!(buf.is_empty());
	}

	#[test]
	fn unknown_status_rejected() {
		let mut buf = BytesMut::from(&[0u8, 0, 0, 0, 0, 0, 0, 0, 9, 0][..]);
		assert!(UdpFrameCodec.decode(&mut buf).is_err());
	}

	#[test]
	fn fresh_ids_are_random() {
		let a = GlobalId::fresh();
		let b = GlobalId::fresh();
		assert_ne!(a.as_bytes(), b.as_bytes());
	}
}
