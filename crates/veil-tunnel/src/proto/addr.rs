use std::{
	net::{Ipv4Addr, Ipv6Addr},
	str,
};

use bytes::{Buf, BufMut};
use num_enum::{FromPrimitive, IntoPrimitive};
use snafu::ensure;
use tokio_util::codec::{Decoder, Encoder};
use veil_core::types::TargetAddr;

use crate::error::{AddressSnafu, Error};

//-----------------------------------------------------------------------------
// Type Definitions
//-----------------------------------------------------------------------------

/// Codec for the wire address used by the handshake and UDP frames.
#[derive(Debug, Clone, Copy)]
pub struct AddressCodec;

/// Wire address: tagged host variant followed by a big-endian port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
	/// Domain name and port
	Domain(String, u16),
	/// IPv4 address and port
	IPv4(Ipv4Addr, u16),
	/// IPv6 address and port
	IPv6(Ipv6Addr, u16),
}

/// Address type tags, SOCKS5/Trojan compatible.
#[derive(IntoPrimitive, FromPrimitive, Copy, Clone, Debug, PartialEq)]
#[repr(u8)]
pub enum AddressType {
	IPv4   = 1,
	Domain = 3,
	IPv6   = 4,
	#[num_enum(catch_all)]
	Other(u8),
}

//-----------------------------------------------------------------------------
// Implementations
//-----------------------------------------------------------------------------

impl Address {
	/// Encoded size in bytes, tag and port included.
	pub fn size(&self) -> usize {
		match self {
			Address::Domain(domain, _) => 1 + 1 + domain.len() + 2,
			Address::IPv4(..) => 1 + 4 + 2,
			Address::IPv6(..) => 1 + 16 + 2,
		}
	}

	pub fn port(&self) -> u16 {
		match self {
			Address::Domain(_, port) => *port,
			Address::IPv4(_, port) => *port,
			Address::IPv6(_, port) => *port,
		}
	}

	/// Parses an address from the front of `buf` without consuming it.
	/// Returns the address and its encoded length, `None` when more bytes
	/// are needed.
	pub fn peek(buf: &[u8]) -> Result<Option<(Address, usize)>, Error> {
		if buf.is_empty() {
			return Ok(None);
		}
		let addr_type = AddressType::from(buf[0]);
		ensure!(
			!matches!(addr_type, AddressType::Other(_)),
			AddressSnafu {
				input: format!("unknown address tag {:#04x}", buf[0])
			}
		);

		match addr_type {
			AddressType::IPv4 => {
				if buf.len() < 1 + 4 + 2 {
					return Ok(None);
				}
				let mut octets = [0; 4];
				octets.copy_from_slice(&buf[1..5]);
				let port = u16::from_be_bytes([buf[5], buf[6]]);
				Ok(Some((Address::IPv4(Ipv4Addr::from(octets), port), 7)))
			}
			AddressType::IPv6 => {
				if buf.len() < 1 + 16 + 2 {
					return Ok(None);
				}
				let mut octets = [0; 16];
				octets.copy_from_slice(&buf[1..17]);
				let port = u16::from_be_bytes([buf[17], buf[18]]);
				Ok(Some((Address::IPv6(Ipv6Addr::from(octets), port), 19)))
			}
			AddressType::Domain => {
				if buf.len() < 1 + 1 {
					return Ok(None);
				}
				let domain_len = buf[1] as usize;
				let total = 1 + 1 + domain_len + 2;
				if buf.len() < total {
					return Ok(None);
				}
				let domain = str::from_utf8(&buf[2..2 + domain_len])
					.map_err(|_| {
						AddressSnafu {
							input: hex::encode(&buf[2..2 + domain_len]),
						}
						.build()
					})?
					.to_string();
				let port = u16::from_be_bytes([buf[total - 2], buf[total - 1]]);
				Ok(Some((Address::Domain(domain, port), total)))
			}
			AddressType::Other(_) => unreachable!(),
		}
	}
}

impl From<TargetAddr> for Address {
	fn from(value: TargetAddr) -> Self {
		match value {
			TargetAddr::Domain(s, port) => Self::Domain(s, port),
			TargetAddr::IPv4(addr, port) => Self::IPv4(addr, port),
			TargetAddr::IPv6(addr, port) => Self::IPv6(addr, port),
		}
	}
}

impl From<Address> for TargetAddr {
	fn from(value: Address) -> Self {
		match value {
			Address::Domain(s, port) => Self::Domain(s, port),
			Address::IPv4(addr, port) => Self::IPv4(addr, port),
			Address::IPv6(addr, port) => Self::IPv6(addr, port),
		}
	}
}

impl From<std::net::SocketAddr> for Address {
	fn from(value: std::net::SocketAddr) -> Self {
		match value {
			std::net::SocketAddr::V4(sa) => Address::IPv4(*sa.ip(), sa.port()),
			std::net::SocketAddr::V6(sa) => Address::IPv6(*sa.ip(), sa.port()),
		}
	}
}

impl std::fmt::Display for Address {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Address::Domain(domain, port) => write!(f, "{domain}:{port}"),
			Address::IPv4(ip, port) => write!(f, "{ip}:{port}"),
			Address::IPv6(ip, port) => write!(f, "[{ip}]:{port}"),
		}
	}
}

//-----------------------------------------------------------------------------
// Codec Implementation
//-----------------------------------------------------------------------------

impl Decoder for AddressCodec {
	type Error = Error;
	type Item = Address;

	fn decode(&mut self, src: &mut bytes::BytesMut) -> Result<Option<Self::Item>, Self::Error> {
		match Address::peek(src)? {
			Some((addr, consumed)) => {
				src.advance(consumed);
				Ok(Some(addr))
			}
			None => Ok(None),
		}
	}

	fn decode_eof(&mut self, buf: &mut bytes::BytesMut) -> Result<Option<Self::Item>, Self::Error> {
		match self.decode(buf) {
			Ok(None) if !buf.is_empty() => Err(Error::BytesRemaining),
			v => v,
		}
	}
}

impl Encoder<Address> for AddressCodec {
	type Error = Error;

	fn encode(&mut self, item: Address, dst: &mut bytes::BytesMut) -> Result<(), Self::Error> {
		match item {
			Address::IPv4(ip, port) => {
				// Type (1) + IPv4 (4) + Port (2)
				dst.reserve(1 + 4 + 2);
				dst.put_u8(AddressType::IPv4.into());
				dst.put_slice(&ip.octets());
				dst.put_u16(port);
			}
			Address::IPv6(ip, port) => {
				// Type (1) + IPv6 (16) + Port (2)
				dst.reserve(1 + 16 + 2);
				dst.put_u8(AddressType::IPv6.into());
				dst.put_slice(&ip.octets());
				dst.put_u16(port);
			}
			Address::Domain(domain, port) => {
				// Validate domain length
				if domain.len() > u8::MAX as usize {
					return Err(AddressSnafu { input: domain }.build());
				}

				// Type (1) + Length (1) + Domain + Port (2)
				dst.reserve(1 + 1 + domain.len() + 2);
				dst.put_u8(AddressType::Domain.into());
				dst.put_u8(domain.len() as u8);
				dst.put_slice(domain.as_bytes());
				dst.put_u16(port);
			}
		}
		Ok(())
	}
}

//-----------------------------------------------------------------------------
// Tests
//-----------------------------------------------------------------------------

#[cfg(test)]
mod test {
	use std::net::{Ipv4Addr, Ipv6Addr};

	use futures_util::SinkExt as _;
	use tokio_stream::StreamExt as _;
	use tokio_util::codec::{FramedRead, FramedWrite};

	use super::{Address, AddressCodec};
	use crate::error::Error;

	/// Test complete encoding and decoding cycle for all address types
	#[test_log::test(tokio::test)]
	async fn test_addr_roundtrip() -> eyre::Result<()> {
		let buffer = Vec::with_capacity(128);
		let vars = vec![
			Address::IPv4(Ipv4Addr::LOCALHOST, 80),
			Address::IPv6(Ipv6Addr::UNSPECIFIED, 12),
			Address::Domain(String::from("www.google.com"), 443),
		];

		// Test encoding
		let mut writer = FramedWrite::new(buffer, AddressCodec);
		let mut expect_len = 0;
		for var in &vars {
			expect_len += var.size();
			writer.send(var.clone()).await?;
			assert_eq!(writer.get_ref().len(), expect_len);
		}

		// Test decoding
		let buffer = writer.get_ref();
		let mut reader = FramedRead::new(buffer.as_slice(), AddressCodec);
		for var in vars {
			let frame = reader.next().await.unwrap()?;
			assert_eq!(var, frame);
		}
		Ok(())
	}

	/// Test behavior with partial data (simulating streaming data arrival)
	#[test_log::test(tokio::test)]
	async fn test_addr_partial() -> eyre::Result<()> {
		let vars = vec![
			Address::IPv4(Ipv4Addr::LOCALHOST, 80),
			Address::IPv6(Ipv6Addr::UNSPECIFIED, 12),
			Address::Domain(String::from("www.google.com"), 443),
		];

		for addr in vars {
			// Encode the address
			let buffer = Vec::with_capacity(128);
			let mut writer = FramedWrite::new(buffer, AddressCodec);
			writer.send(addr.clone()).await?;
			let mut buffer = writer.into_inner();

			// Split the encoded data in half to simulate partial data arrival
			let full_len = buffer.len();
			let mut half_b = buffer.split_off(full_len / 2);
			let mut half_a = buffer;

			// First half should report bytes remaining at EOF
			{
				let mut reader = FramedRead::new(half_a.as_slice(), AddressCodec);
				assert!(matches!(
					reader.next().await.unwrap().unwrap_err(),
					Error::BytesRemaining
				));
			}

			// Recombined buffer should decode properly
			half_a.append(&mut half_b);
			let mut reader = FramedRead::new(half_a.as_slice(), AddressCodec);
			assert_eq!(reader.next().await.unwrap()?, addr);
		}

		Ok(())
	}

	#[test_log::test(tokio::test)]
	async fn test_addr_unknown_tag() -> eyre::Result<()> {
		let buffer: &[u8] = &[0x7f, 0, 0, 0, 0];
		let mut reader = FramedRead::new(buffer, AddressCodec);
		assert!(matches!(
			reader.next().await.unwrap().unwrap_err(),
			Error::Address { .. }
		));
		Ok(())
	}
}
