use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chacha20poly1305::{
	ChaCha20Poly1305, Key, Nonce,
	aead::{Aead, KeyInit, Payload},
};
use hmac::{Hmac, Mac};
use num_enum::{FromPrimitive, IntoPrimitive};
use rand::{Rng, RngCore};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tokio_util::codec::{Decoder, Encoder};
use uuid::Uuid;

use crate::{
	error::HandshakeError,
	proto::{Address, AddressCodec},
};

type HmacSha256 = Hmac<Sha256>;

pub const NONCE_LEN: usize = 12;
/// `version | nonce | payload_len`
pub const HEADER_LEN: usize = 1 + NONCE_LEN + 2;
pub const TAG_LEN: usize = 16;
pub const MIN_PAYLOAD_LEN: usize = 64;
pub const MAX_PAYLOAD_LEN: usize = 512;
pub const MIN_PADDING_LEN: usize = 64;
pub const MAX_PADDING_LEN: usize = 255;
/// Accepted clock skew between client and server, seconds.
pub const TIME_WINDOW_SECS: u32 = 120;
/// `version | status | server_time | nonce_echo | tag`
pub const RESPONSE_LEN: usize = 1 + 1 + 4 + NONCE_LEN + 8;

const KEY_CONTEXT: &[u8] = b"EWP-ENC-v1";

#[derive(IntoPrimitive, FromPrimitive, Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
	Tcp = 1,
	Udp = 2,
	#[num_enum(catch_all)]
	Other(u8),
}

#[derive(IntoPrimitive, FromPrimitive, Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum HandshakeStatus {
	Ok    = 0,
	Error = 1,
	#[num_enum(catch_all)]
	Other(u8),
}

/// Client-built handshake. Produced once per dial, consumed once by the
/// server; the nonce lands in the server replay cache afterwards.
#[derive(Debug, Clone)]
pub struct HandshakeRequest {
	pub version: u8,
	pub nonce:   [u8; NONCE_LEN],
	pub uuid:    Uuid,
	pub command: Command,
	pub target:  Address,
	pub options: u8,
}

/// What the server recovered from a valid handshake frame.
#[derive(Debug, Clone)]
pub struct ServerHandshake {
	pub uuid:      Uuid,
	pub version:   u8,
	pub nonce:     [u8; NONCE_LEN],
	pub timestamp: u32,
	pub command:   Command,
	pub target:    Address,
	pub options:   u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResponse {
	pub status:      HandshakeStatus,
	pub server_time: u32,
}

pub fn unix_now() -> u32 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_secs() as u32)
		.unwrap_or(0)
}

fn auth_key(uuid: &Uuid) -> [u8; 32] {
	Sha256::digest(uuid.as_bytes()).into()
}

fn enc_key(uuid: &Uuid, nonce: &[u8; NONCE_LEN]) -> [u8; 32] {
	let mut hasher = Sha256::new();
	hasher.update(uuid.as_bytes());
	hasher.update(nonce);
	hasher.update(KEY_CONTEXT);
	hasher.finalize().into()
}

fn outer_tag(uuid: &Uuid, ad: &[u8], ciphertext: &[u8]) -> [u8; 32] {
	// new_from_slice only fails on oversized keys, ours is always 32 bytes
	let mut mac = <HmacSha256 as Mac>::new_from_slice(&auth_key(uuid)).expect("fixed-size hmac key");
	mac.update(ad);
	mac.update(ciphertext);
	mac.finalize().into_bytes().into()
}

impl HandshakeRequest {
	pub fn new(uuid: Uuid, command: Command, target: Address) -> Self {
		let mut rng = rand::rng();
		let mut nonce = [0u8; NONCE_LEN];
		rng.fill_bytes(&mut nonce);
		Self {
			version: rng.random_range(1..=u8::MAX),
			nonce,
			uuid,
			command,
			target,
			options: 0,
		}
	}

	/// Wire bytes: `AD || ciphertext+tag || hmac[..16]`.
	pub fn encode(&self) -> Result<Bytes, HandshakeError> {
		self.encode_at(unix_now())
	}

	pub(crate) fn encode_at(&self, timestamp: u32) -> Result<Bytes, HandshakeError> {
		let mut rng = rand::rng();

		// Plaintext: ts | uuid | command | address | options | pad_len | padding
		let base_len = 4 + 16 + 1 + self.target.size() + 1 + 1;
		let pad_upper = MAX_PADDING_LEN.min(MAX_PAYLOAD_LEN - base_len);
		if pad_upper < MIN_PADDING_LEN {
			return Err(HandshakeError::InvalidLength);
		}
		let pad_len = rng.random_range(MIN_PADDING_LEN..=pad_upper);

		let mut plaintext = BytesMut::with_capacity(base_len + pad_len);
		plaintext.put_u32(timestamp);
		plaintext.put_slice(self.uuid.as_bytes());
		plaintext.put_u8(self.command.into());
		AddressCodec
			.encode(self.target.clone(), &mut plaintext)
			.map_err(|_| HandshakeError::InvalidAddress)?;
		plaintext.put_u8(self.options);
		plaintext.put_u8(pad_len as u8);
		let mut padding = vec![0u8; pad_len];
		rng.fill_bytes(&mut padding);
		plaintext.put_slice(&padding);

		debug_assert!(plaintext.len() >= MIN_PAYLOAD_LEN && plaintext.len() <= MAX_PAYLOAD_LEN);

		let mut ad = [0u8; HEADER_LEN];
		ad[0] = self.version;
		ad[1..1 + NONCE_LEN].copy_from_slice(&self.nonce);
		ad[HEADER_LEN - 2..].copy_from_slice(&(plaintext.len() as u16).to_be_bytes());

		let key = enc_key(&self.uuid, &self.nonce);
		let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
		let ciphertext = cipher
			.encrypt(
				Nonce::from_slice(&self.nonce),
				Payload {
					msg: &plaintext,
					aad: &ad,
				},
			)
			.map_err(|_| HandshakeError::DecryptFailed)?;

		let tag = outer_tag(&self.uuid, &ad, &ciphertext);

		let mut wire = BytesMut::with_capacity(HEADER_LEN + ciphertext.len() + TAG_LEN);
		wire.put_slice(&ad);
		wire.put_slice(&ciphertext);
		wire.put_slice(&tag[..TAG_LEN]);
		Ok(wire.freeze())
	}

	/// Validates a 26-byte response frame against this request.
	pub fn verify_response(&self, wire: &[u8]) -> Result<HandshakeResponse, HandshakeError> {
		if wire.len() != RESPONSE_LEN {
			return Err(HandshakeError::InvalidLength);
		}
		let body = &wire[..RESPONSE_LEN - 8];
		let tag = &wire[RESPONSE_LEN - 8..];

		let mut mac = <HmacSha256 as Mac>::new_from_slice(&auth_key(&self.uuid)).expect("fixed-size hmac key");
		mac.update(body);
		let expect: [u8; 32] = mac.finalize().into_bytes().into();
		if !bool::from(expect[..8].ct_eq(tag)) {
			return Err(HandshakeError::InvalidAuth);
		}

		if body[0] != self.version {
			return Err(HandshakeError::InvalidVersion);
		}
		if body[6..6 + NONCE_LEN] != self.nonce {
			return Err(HandshakeError::InvalidAuth);
		}

		let server_time = u32::from_be_bytes([body[2], body[3], body[4], body[5]]);
		Ok(HandshakeResponse {
			status:      HandshakeStatus::from(body[1]),
			server_time,
		})
	}
}

/// How many bytes a complete handshake frame occupies given its 15-byte
/// header, or an error when the advertised length is out of bounds.
pub fn request_frame_len(header: &[u8]) -> Result<usize, HandshakeError> {
	if header.len() < HEADER_LEN {
		return Err(HandshakeError::InvalidLength);
	}
	if header[0] == 0 {
		return Err(HandshakeError::InvalidVersion);
	}
	let payload_len = u16::from_be_bytes([header[HEADER_LEN - 2], header[HEADER_LEN - 1]]) as usize;
	if !(MIN_PAYLOAD_LEN..=MAX_PAYLOAD_LEN).contains(&payload_len) {
		return Err(HandshakeError::InvalidLength);
	}
	Ok(HEADER_LEN + payload_len + TAG_LEN + TAG_LEN)
}

/// Server-side decode. Trials every configured UUID without early exit so
/// rejects stay timing-neutral; any failure maps to one of the
/// `HandshakeError` kinds and the caller answers with [`fake_response`].
pub fn decode_request(wire: &[u8], users: &[Uuid], now: u32) -> Result<ServerHandshake, HandshakeError> {
	if wire.len() < HEADER_LEN + MIN_PAYLOAD_LEN + TAG_LEN + TAG_LEN {
		return Err(HandshakeError::InvalidLength);
	}
	let expect_len = request_frame_len(&wire[..HEADER_LEN])?;
	if wire.len() != expect_len {
		return Err(HandshakeError::InvalidLength);
	}

	let version = wire[0];
	let mut nonce = [0u8; NONCE_LEN];
	nonce.copy_from_slice(&wire[1..1 + NONCE_LEN]);
	let ad = &wire[..HEADER_LEN];
	let ciphertext = &wire[HEADER_LEN..wire.len() - TAG_LEN];
	let tag = &wire[wire.len() - TAG_LEN..];

	// Trial every user, constant-time compare, no early break.
	let mut matched: Option<Uuid> = None;
	for uuid in users {
		let expect = outer_tag(uuid, ad, ciphertext);
		if bool::from(expect[..TAG_LEN].ct_eq(tag)) && matched.is_none() {
			matched = Some(*uuid);
		}
	}
	let uuid = matched.ok_or(HandshakeError::InvalidAuth)?;

	let key = enc_key(&uuid, &nonce);
	let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
	let plaintext = cipher
		.decrypt(
			Nonce::from_slice(&nonce),
			Payload {
				msg: ciphertext,
				aad: ad,
			},
		)
		.map_err(|_| HandshakeError::DecryptFailed)?;

	let mut buf = BytesMut::from(&plaintext[..]);
	if buf.len() < 4 + 16 + 1 {
		return Err(HandshakeError::InvalidLength);
	}
	let timestamp = buf.get_u32();
	if now.abs_diff(timestamp) > TIME_WINDOW_SECS {
		return Err(HandshakeError::InvalidTimestamp);
	}

	let mut claimed = [0u8; 16];
	buf.copy_to_slice(&mut claimed);
	if Uuid::from_bytes(claimed) != uuid {
		return Err(HandshakeError::InvalidAuth);
	}

	let command = Command::from(buf.get_u8());
	if matches!(command, Command::Other(_)) {
		return Err(HandshakeError::InvalidAuth);
	}

	let target = AddressCodec
		.decode(&mut buf)
		.map_err(|_| HandshakeError::InvalidAddress)?
		.ok_or(HandshakeError::InvalidAddress)?;

	if buf.len() < 2 {
		return Err(HandshakeError::InvalidLength);
	}
	let options = buf.get_u8();
	let pad_len = buf.get_u8() as usize;
	if pad_len < MIN_PADDING_LEN || buf.len() != pad_len {
		return Err(HandshakeError::InvalidLength);
	}

	Ok(ServerHandshake {
		uuid,
		version,
		nonce,
		timestamp,
		command,
		target,
		options,
	})
}

/// Server response frame for an accepted handshake.
pub fn encode_response(hs: &ServerHandshake, status: HandshakeStatus, server_time: u32) -> [u8; RESPONSE_LEN] {
	let mut wire = [0u8; RESPONSE_LEN];
	wire[0] = hs.version;
	wire[1] = status.into();
	wire[2..6].copy_from_slice(&server_time.to_be_bytes());
	wire[6..6 + NONCE_LEN].copy_from_slice(&hs.nonce);

	let mut mac = <HmacSha256 as Mac>::new_from_slice(&auth_key(&hs.uuid)).expect("fixed-size hmac key");
	mac.update(&wire[..RESPONSE_LEN - 8]);
	let tag: [u8; 32] = mac.finalize().into_bytes().into();
	wire[RESPONSE_LEN - 8..].copy_from_slice(&tag[..8]);
	wire
}

/// 26 uniformly random bytes, length-matching a real response so a reject
/// is indistinguishable from an accept on the wire.
pub fn fake_response() -> [u8; RESPONSE_LEN] {
	let mut wire = [0u8; RESPONSE_LEN];
	rand::rng().fill_bytes(&mut wire);
	wire
}

#[cfg(test)]
mod test {
	use std::net::Ipv4Addr;

	use uuid::Uuid;

	use super::*;

	fn test_uuid() -> Uuid {
		Uuid::parse_str("d342d11e-d424-4583-b36e-524ab1f0afa4").unwrap()
	}

	fn sample_request() -> HandshakeRequest {
		HandshakeRequest::new(
			test_uuid(),
			Command::Tcp,
			Address::Domain("example.com".into(), 443),
		)
	}

	#[test]
	fn roundtrip() {
		let req = sample_request();
		let wire = req.encode().unwrap();
		assert_eq!(wire.len(), request_frame_len(&wire[..HEADER_LEN]).unwrap());

		let hs = decode_request(&wire, &[test_uuid()], unix_now()).unwrap();
		assert_eq!(hs.uuid, req.uuid);
		assert_eq!(hs.version, req.version);
		assert_eq!(hs.nonce, req.nonce);
		assert_eq!(hs.command, Command::Tcp);
		assert_eq!(hs.target, req.target);
	}

	#[test]
	fn unknown_uuid_rejected() {
		let req = sample_request();
		let wire = req.encode().unwrap();
		let stranger = Uuid::new_v4();
		assert_eq!(
			decode_request(&wire, &[stranger], unix_now()),
			Err(HandshakeError::InvalidAuth)
		);
		// Multi-user set containing the right one still matches.
		let hs = decode_request(&wire, &[stranger, test_uuid()], unix_now()).unwrap();
		assert_eq!(hs.uuid, test_uuid());
	}

	#[test]
	fn timestamp_window_enforced() {
		let req = sample_request();
		let now = unix_now();
		let wire = req.encode_at(now - TIME_WINDOW_SECS - 1).unwrap();
		assert_eq!(
			decode_request(&wire, &[test_uuid()], now),
			Err(HandshakeError::InvalidTimestamp)
		);
		// Exactly at the edge is accepted.
		let wire = req.encode_at(now - TIME_WINDOW_SECS).unwrap();
		assert!(decode_request(&wire, &[test_uuid()], now).is_ok());
	}

	#[test]
	fn tampered_frame_rejected() {
		let req = sample_request();
		let mut wire = req.encode().unwrap().to_vec();
		// Flip one ciphertext bit: the outer HMAC no longer verifies under
		// any configured user.
		wire[HEADER_LEN + 3] ^= 0x01;
		assert_eq!(
			decode_request(&wire, &[test_uuid()], unix_now()),
			Err(HandshakeError::InvalidAuth)
		);
	}

	#[test]
	fn bad_lengths_rejected() {
		assert_eq!(request_frame_len(&[0u8; 4]), Err(HandshakeError::InvalidLength));

		// Advertised payload below the minimum
		let mut header = [0u8; HEADER_LEN];
		header[0] = 7;
		header[HEADER_LEN - 1] = (MIN_PAYLOAD_LEN - 1) as u8;
		assert_eq!(request_frame_len(&header), Err(HandshakeError::InvalidLength));

		// Version zero is never produced
		let mut header = [0u8; HEADER_LEN];
		header[HEADER_LEN - 1] = 100;
		assert_eq!(request_frame_len(&header), Err(HandshakeError::InvalidVersion));

		let req = sample_request();
		let wire = req.encode().unwrap();
		assert_eq!(
			decode_request(&wire[..wire.len() - 1], &[test_uuid()], unix_now()),
			Err(HandshakeError::InvalidLength)
		);
	}

	#[test]
	fn payload_len_within_bounds_for_largest_address() {
		let req = HandshakeRequest::new(
			test_uuid(),
			Command::Udp,
			Address::Domain("d".repeat(255), 65535),
		);
		let wire = req.encode().unwrap();
		let payload_len = u16::from_be_bytes([wire[HEADER_LEN - 2], wire[HEADER_LEN - 1]]) as usize;
		assert!(payload_len <= MAX_PAYLOAD_LEN);
		assert!(decode_request(&wire, &[test_uuid()], unix_now()).is_ok());
	}

	#[test]
	fn response_roundtrip_and_tamper() {
		let req = sample_request();
		let wire = req.encode().unwrap();
		let hs = decode_request(&wire, &[test_uuid()], unix_now()).unwrap();

		let now = unix_now();
		let resp = encode_response(&hs, HandshakeStatus::Ok, now);
		let parsed = req.verify_response(&resp).unwrap();
		assert_eq!(parsed.status, HandshakeStatus::Ok);
		assert_eq!(parsed.server_time, now);

		// Any tamper fails closed.
		let mut bad = resp;
		bad[3] ^= 0xff;
		assert_eq!(req.verify_response(&bad), Err(HandshakeError::InvalidAuth));

		// A fake response never verifies.
		assert!(req.verify_response(&fake_response()).is_err());
	}

	#[test]
	fn fake_response_matches_length() {
		assert_eq!(fake_response().len(), RESPONSE_LEN);
	}
}
