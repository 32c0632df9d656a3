use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{FromPrimitive, IntoPrimitive};
use sha2::{Digest, Sha224};
use subtle::ConstantTimeEq;
use tokio_util::codec::{Decoder, Encoder};

use crate::{
	error::{Error, HandshakeError},
	proto::{Address, AddressCodec},
};

pub const TROJAN_KEY_LEN: usize = 56;
pub(crate) const CRLF: &[u8] = b"\r\n";

/// SHA-224 password digest in its lower-hex wire form.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct TrojanKey([u8; TROJAN_KEY_LEN]);

impl TrojanKey {
	pub fn from_password(password: &str) -> Self {
		let digest = Sha224::digest(password.as_bytes());
		let hex = hex::encode(digest);
		let mut raw = [0u8; TROJAN_KEY_LEN];
		raw.copy_from_slice(hex.as_bytes());
		Self(raw)
	}

	pub fn as_bytes(&self) -> &[u8; TROJAN_KEY_LEN] {
		&self.0
	}

	pub fn as_str(&self) -> &str {
		// Hex encoding is always valid UTF-8
		std::str::from_utf8(&self.0).expect("hex digest")
	}
}

impl fmt::Debug for TrojanKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("TrojanKey(..)")
	}
}

#[derive(IntoPrimitive, FromPrimitive, Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum TrojanCommand {
	Connect      = 0x01,
	UdpAssociate = 0x03,
	Mux          = 0x7f,
	#[num_enum(catch_all)]
	Other(u8),
}

/// Accepted keys, looked up in constant time.
#[derive(Debug, Default)]
pub struct TrojanKeyring {
	keys: Vec<TrojanKey>,
}

impl TrojanKeyring {
	pub fn from_passwords<'a>(passwords: impl IntoIterator<Item = &'a str>) -> Self {
		Self {
			keys: passwords.into_iter().map(TrojanKey::from_password).collect(),
		}
	}

	pub fn is_empty(&self) -> bool {
		self.keys.is_empty()
	}

	/// Hex key strings, e.g. for `X-Auth-Token` comparisons.
	pub fn key_strings(&self) -> Vec<String> {
		self.keys.iter().map(|key| key.as_str().to_string()).collect()
	}

	/// Compares `candidate` against every key without early exit.
	pub fn verify(&self, candidate: &[u8]) -> Option<TrojanKey> {
		if candidate.len() != TROJAN_KEY_LEN {
			return None;
		}
		let mut matched = None;
		for key in &self.keys {
			if bool::from(key.0.ct_eq(candidate)) && matched.is_none() {
				matched = Some(*key);
			}
		}
		matched
	}
}

/// Trojan request head: `key | CRLF | command | address | CRLF`, followed
/// by the raw payload.
#[derive(Debug, Clone)]
pub struct TrojanRequest {
	pub command: TrojanCommand,
	pub target:  Address,
}

impl TrojanRequest {
	pub fn encode(&self, key: &TrojanKey, payload: &[u8]) -> Result<Bytes, Error> {
		let mut buf = BytesMut::with_capacity(TROJAN_KEY_LEN + 2 + 1 + self.target.size() + 2 + payload.len());
		buf.put_slice(key.as_bytes());
		buf.put_slice(CRLF);
		buf.put_u8(self.command.into());
		AddressCodec.encode(self.target.clone(), &mut buf)?;
		buf.put_slice(CRLF);
		buf.put_slice(payload);
		Ok(buf.freeze())
	}

	/// Server-side parse of the first frame. On success returns the
	/// request, the matched key and the trailing payload; any failure is
	/// `InvalidAuth` so the caller falls back without learning more.
	pub fn decode(frame: &[u8], keyring: &TrojanKeyring) -> Result<(Self, TrojanKey, Bytes), HandshakeError> {
		if frame.len() < TROJAN_KEY_LEN + 2 + 1 + 2 {
			return Err(HandshakeError::InvalidAuth);
		}
		let key = keyring
			.verify(&frame[..TROJAN_KEY_LEN])
			.ok_or(HandshakeError::InvalidAuth)?;
		if &frame[TROJAN_KEY_LEN..TROJAN_KEY_LEN + 2] != CRLF {
			return Err(HandshakeError::InvalidAuth);
		}
		let command = TrojanCommand::from(frame[TROJAN_KEY_LEN + 2]);
		if matches!(command, TrojanCommand::Other(_)) {
			return Err(HandshakeError::InvalidAuth);
		}

		let rest = &frame[TROJAN_KEY_LEN + 3..];
		let (target, addr_len) = Address::peek(rest)
			.map_err(|_| HandshakeError::InvalidAuth)?
			.ok_or(HandshakeError::InvalidAuth)?;
		let rest = &rest[addr_len..];
		if rest.len() < 2 || &rest[..2] != CRLF {
			return Err(HandshakeError::InvalidAuth);
		}

		Ok((
			Self { command, target },
			key,
			Bytes::copy_from_slice(&rest[2..]),
		))
	}
}

/// One datagram inside a Trojan UDP associate stream.
///
/// Wire: `address | length(2 BE) | CRLF | payload`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrojanUdpPacket {
	pub target:  Address,
	pub payload: Bytes,
}

#[derive(Debug, Clone, Copy)]
pub struct TrojanUdpCodec;

impl Decoder for TrojanUdpCodec {
	type Error = Error;
	type Item = TrojanUdpPacket;

	fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
		let Some((target, addr_len)) = Address::peek(src)? else {
			return Ok(None);
		};
		if src.len() < addr_len + 4 {
			return Ok(None);
		}
		let payload_len = u16::from_be_bytes([src[addr_len], src[addr_len + 1]]) as usize;
		if &src[addr_len + 2..addr_len + 4] != CRLF {
			return Err(Error::protocol(crate::error::ProtocolViolation::UnexpectedFrame));
		}
		let total = addr_len + 4 + payload_len;
		if src.len() < total {
			return Ok(None);
		}
		src.advance(addr_len + 4);
		let payload = src.split_to(payload_len).freeze();
		Ok(Some(TrojanUdpPacket { target, payload }))
	}

	fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
		match self.decode(buf) {
			Ok(None) if !buf.is_empty() => Err(Error::BytesRemaining),
			v => v,
		}
	}
}

impl Encoder<TrojanUdpPacket> for TrojanUdpCodec {
	type Error = Error;

	fn encode(&mut self, item: TrojanUdpPacket, dst: &mut BytesMut) -> Result<(), Self::Error> {
		dst.reserve(item.target.size() + 4 + item.payload.len());
		AddressCodec.encode(item.target, dst)?;
		dst.put_u16(item.payload.len() as u16);
		dst.put_slice(CRLF);
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

	#[test]
	fn key_is_hex_sha224() {
		let key = TrojanKey::from_password("correct horse");
		assert_eq!(key.as_bytes().len(), TROJAN_KEY_LEN);
		assert!(key.as_str().bytes().all(|b| b.is_ascii_hexdigit()));
		// Deterministic
		assert_eq!(key, TrojanKey::from_password("correct horse"));
		assert_ne!(key, TrojanKey::from_password("battery staple"));
	}

	#[test]
	fn request_roundtrip() {
		let keyring = TrojanKeyring::from_passwords(["hunter2"]);
		let key = TrojanKey::from_password("hunter2");
		let req = TrojanRequest {
			command: TrojanCommand::Connect,
			target:  Address::Domain("example.com".into(), 443),
		};
		let wire = req.encode(&key, b"GET / HTTP/1.1\r\n").unwrap();

		let (parsed, matched, payload) = TrojanRequest::decode(&wire, &keyring).unwrap();
		assert_eq!(parsed.command, TrojanCommand::Connect);
		assert_eq!(parsed.target, req.target);
		assert_eq!(matched, key);
		assert_eq!(&payload[..], b"GET / HTTP/1.1\r\n");
	}

	#[test]
	fn wrong_password_rejected() {
		let keyring = TrojanKeyring::from_passwords(["hunter2"]);
		let key = TrojanKey::from_password("wrong");
		let req = TrojanRequest {
			command: TrojanCommand::UdpAssociate,
			target:  Address::IPv4(Ipv4Addr::LOCALHOST, 53),
		};
		let wire = req.encode(&key, &[]).unwrap();
		assert!(TrojanRequest::decode(&wire, &keyring).is_err());
	}

	#[test]
	fn udp_codec_roundtrip_and_partial() {
		let packet = TrojanUdpPacket {
			target:  Address::IPv4(Ipv4Addr::new(1, 1, 1, 1), 53),
			payload: Bytes::from_static(b"dns query"),
		};
		let mut buf = BytesMut::new();
		TrojanUdpCodec.encode(packet.clone(), &mut buf).unwrap();

		// Partial reads keep returning None until the frame completes.
		let wire = buf.clone().freeze();
		let mut partial = BytesMut::from(&wire[..5]);
		assert!(TrojanUdpCodec.decode(&mut partial).unwrap().is_none());
		partial.extend_from_slice(&wire[5..]);
		let decoded = TrojanUdpCodec.decode(&mut partial).unwrap().unwrap();
		assert_eq!(decoded, packet);
		assert!(partial.is_empty());
	}
}
