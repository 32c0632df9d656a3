//! TLS-aware traffic shaping.
//!
//! While the inner stream is still handshaking, every payload is wrapped in
//! a length-marked padding frame to defeat size/timing fingerprints. Once
//! TLS 1.3 application data is observed the state machine emits a `Direct`
//! marker and yields to plain byte copying; removing the padding is a left
//! inverse of adding it under the same command sequence.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::{Rng, RngCore};
use uuid::Uuid;

use crate::error::{Error, ProtocolViolation};

pub const COMMAND_PADDING_CONTINUE: u8 = 0;
pub const COMMAND_PADDING_END: u8 = 1;
pub const COMMAND_PADDING_DIRECT: u8 = 2;

/// Only the first writes can carry a TLS handshake.
const PACKETS_TO_FILTER: u32 = 8;
/// TLS_AES_128_CCM_8_SHA256, the one TLS 1.3 suite we refuse to splice.
const TLS_CCM_8_CIPHER: u16 = 0x1305;
/// `supported_versions` extension advertising TLS 1.3.
const TLS13_SUPPORTED_VERSIONS: [u8; 6] = [0x00, 0x2b, 0x00, 0x02, 0x03, 0x04];

/// Frame header past the one-time UUID: `command | content_len | padding_len`.
const FRAME_HEADER_LEN: usize = 1 + 2 + 2;
/// Keep `content_len` comfortably inside its u16.
const MAX_CONTENT_LEN: usize = 16 * 1024;

const SHORT_PADDING_RANGE: std::ops::RangeInclusive<usize> = 0..=255;
const LONG_PADDING_RANGE: std::ops::RangeInclusive<usize> = 500..=900;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnpadPhase {
	/// Expecting a frame header (plus the UUID on the very first frame).
	Header,
	Content,
	Padding,
	/// Padding is over, bytes flow untouched.
	Raw,
}

/// Per-connection, per-direction padding state.
pub struct FlowState {
	user:        Uuid,
	allow_xtls:  bool,
	packets_to_filter: u32,
	is_tls:      bool,
	is_tls13_or_above: bool,
	enable_xtls: bool,
	remaining_server_hello: i64,
	cipher:      u16,
	outbound:    PadState,
	inbound:     UnpadState,
}

struct PadState {
	is_padding:  bool,
	first_frame: bool,
	direct_copy: bool,
}

struct UnpadState {
	phase:             UnpadPhase,
	first_frame:       bool,
	direct_copy:       bool,
	current_command:   u8,
	remaining_content: usize,
	remaining_padding: usize,
	buffer:            BytesMut,
}

impl FlowState {
	pub fn new(user: Uuid, allow_xtls: bool) -> Self {
		Self {
			user,
			allow_xtls,
			packets_to_filter: PACKETS_TO_FILTER,
			is_tls: false,
			is_tls13_or_above: false,
			enable_xtls: false,
			remaining_server_hello: 0,
			cipher: 0,
			outbound: PadState {
				is_padding:  true,
				first_frame: true,
				direct_copy: false,
			},
			inbound: UnpadState {
				phase:             UnpadPhase::Header,
				first_frame:       true,
				direct_copy:       false,
				current_command:   COMMAND_PADDING_CONTINUE,
				remaining_content: 0,
				remaining_padding: 0,
				buffer:            BytesMut::new(),
			},
		}
	}

	/// True once this direction switched to untouched byte copying.
	pub fn write_is_direct(&self) -> bool {
		self.outbound.direct_copy
	}

	pub fn read_is_direct(&self) -> bool {
		self.inbound.direct_copy
	}

	/// Feeds the first packets of the inner stream through the TLS
	/// recognizer. Writers call this with outgoing payloads, readers with
	/// recovered content, so both peers converge on the same view.
	pub fn filter_packet(&mut self, p: &[u8]) {
		if self.packets_to_filter == 0 {
			return;
		}
		self.packets_to_filter -= 1;

		if p.len() >= 6 && p[0] == 0x16 && p[1] == 0x03 {
			match p[5] {
				// ClientHello
				0x01 => {
					self.is_tls = true;
				}
				// ServerHello: pull the cipher suite, then scan the
				// handshake window for the TLS 1.3 marker
				0x02 if p[2] == 0x03 => {
					self.is_tls = true;
					self.remaining_server_hello = u16::from_be_bytes([p[3], p[4]]) as i64 + 5;
					if p.len() > 43 {
						let session_id_len = p[43] as usize;
						if p.len() >= 44 + session_id_len + 2 {
							self.cipher =
								u16::from_be_bytes([p[44 + session_id_len], p[45 + session_id_len]]);
						}
					}
				}
				_ => {}
			}
		}

		if self.remaining_server_hello > 0 {
			let window = (self.remaining_server_hello as usize).min(p.len());
			if contains(&p[..window], &TLS13_SUPPORTED_VERSIONS) {
				self.is_tls13_or_above = true;
				if self.allow_xtls && self.cipher != TLS_CCM_8_CIPHER {
					self.enable_xtls = true;
				}
			}
			self.remaining_server_hello -= p.len() as i64;
		}
	}

	/// Wraps one write. Returns the on-wire bytes; after a `Direct` or
	/// `End` marker subsequent writes pass through unchanged.
	pub fn pad(&mut self, data: &[u8]) -> Bytes {
		if self.outbound.direct_copy || !self.outbound.is_padding {
			return Bytes::copy_from_slice(data);
		}

		self.filter_packet(data);

		// ApplicationData means the inner handshake is done.
		let command = if self.is_tls && data.len() >= 3 && data[..3] == [0x17, 0x03, 0x03] {
			if self.enable_xtls {
				COMMAND_PADDING_DIRECT
			} else {
				COMMAND_PADDING_END
			}
		} else if self.packets_to_filter == 0 && !self.is_tls {
			// Plain traffic gains nothing from further shaping.
			COMMAND_PADDING_END
		} else {
			COMMAND_PADDING_CONTINUE
		};

		let mut rng = rand::rng();
		let mut out = BytesMut::new();
		let mut chunks = data.chunks(MAX_CONTENT_LEN).peekable();
		// An empty write still emits one (possibly command-carrying) frame.
		if chunks.peek().is_none() {
			self.encode_frame(&mut out, command, &[], &mut rng);
		}
		while let Some(chunk) = chunks.next() {
			let cmd = if chunks.peek().is_none() {
				command
			} else {
				COMMAND_PADDING_CONTINUE
			};
			self.encode_frame(&mut out, cmd, chunk, &mut rng);
		}

		if command != COMMAND_PADDING_CONTINUE {
			self.outbound.is_padding = false;
			self.outbound.direct_copy = true;
		}
		out.freeze()
	}

	fn encode_frame(&mut self, out: &mut BytesMut, command: u8, content: &[u8], rng: &mut impl RngCore) {
		let range = if self.is_tls13_or_above {
			LONG_PADDING_RANGE
		} else {
			SHORT_PADDING_RANGE
		};
		let padding_len = rng.random_range(range);

		out.reserve(16 + FRAME_HEADER_LEN + content.len() + padding_len);
		if self.outbound.first_frame {
			out.put_slice(self.user.as_bytes());
			self.outbound.first_frame = false;
		}
		out.put_u8(command);
		out.put_u16(content.len() as u16);
		out.put_u16(padding_len as u16);
		out.put_slice(content);
		let mut padding = vec![0u8; padding_len];
		rng.fill_bytes(&mut padding);
		out.put_slice(&padding);
	}

	/// Strips padding from received bytes, buffering partial frames across
	/// reads. Recovered content is fed back through the TLS recognizer.
	pub fn unpad(&mut self, data: &[u8]) -> Result<Bytes, Error> {
		if self.inbound.phase == UnpadPhase::Raw && self.inbound.buffer.is_empty() {
			let out = Bytes::copy_from_slice(data);
			if !self.inbound.direct_copy {
				self.filter_packet(&out);
			}
			return Ok(out);
		}

		self.inbound.buffer.extend_from_slice(data);
		let mut out = BytesMut::new();

		loop {
			match self.inbound.phase {
				UnpadPhase::Raw => {
					out.extend_from_slice(&self.inbound.buffer.split());
					break;
				}
				UnpadPhase::Header => {
					let uuid_len = if self.inbound.first_frame { 16 } else { 0 };
					if self.inbound.buffer.len() < uuid_len + FRAME_HEADER_LEN {
						break;
					}
					if self.inbound.first_frame {
						let claimed = self.inbound.buffer.split_to(16);
						if claimed[..] != self.user.as_bytes()[..] {
							return Err(Error::protocol(ProtocolViolation::BadPadding));
						}
						self.inbound.first_frame = false;
					}
					let header = self.inbound.buffer.split_to(FRAME_HEADER_LEN);
					let command = header[0];
					if command > COMMAND_PADDING_DIRECT {
						return Err(Error::protocol(ProtocolViolation::BadPadding));
					}
					self.inbound.current_command = command;
					self.inbound.remaining_content = u16::from_be_bytes([header[1], header[2]]) as usize;
					self.inbound.remaining_padding = u16::from_be_bytes([header[3], header[4]]) as usize;
					self.inbound.phase = UnpadPhase::Content;
				}
				UnpadPhase::Content => {
					if self.inbound.remaining_content > 0 {
						let take = self.inbound.remaining_content.min(self.inbound.buffer.len());
						if take == 0 {
							break;
						}
						let chunk = self.inbound.buffer.split_to(take);
						self.filter_packet(&chunk);
						out.extend_from_slice(&chunk);
						self.inbound.remaining_content -= take;
						if self.inbound.remaining_content > 0 {
							break;
						}
					}
					self.inbound.phase = UnpadPhase::Padding;
				}
				UnpadPhase::Padding => {
					if self.inbound.remaining_padding > 0 {
						let take = self.inbound.remaining_padding.min(self.inbound.buffer.len());
						if take == 0 {
							break;
						}
						self.inbound.buffer.advance(take);
						self.inbound.remaining_padding -= take;
						if self.inbound.remaining_padding > 0 {
							break;
						}
					}
					// Frame complete, honor its command.
					match self.inbound.current_command {
						COMMAND_PADDING_CONTINUE => self.inbound.phase = UnpadPhase::Header,
						COMMAND_PADDING_END => self.inbound.phase = UnpadPhase::Raw,
						_ => {
							self.inbound.phase = UnpadPhase::Raw;
							self.inbound.direct_copy = true;
						}
					}
				}
			}
		}

		Ok(out.freeze())
	}
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
	haystack.windows(needle.len()).any(|w| w == needle)
}

#[cfg(test)]
mod test {
	use rand::Rng;
	use uuid::Uuid;

	use super::*;

	fn user() -> Uuid {
		Uuid::parse_str("d342d11e-d424-4583-b36e-524ab1f0afa4").unwrap()
	}

	/// A ServerHello record advertising TLS 1.3 with a non-CCM8 cipher.
	fn server_hello() -> Vec<u8> {
		let mut body = vec![
			0x02, 0x00, 0x00, 0x00, // handshake header, length patched below
			0x03, 0x03, // legacy version
		];
		body.extend_from_slice(&[0xab; 32]); // random
		body.push(0); // empty session id
		body.extend_from_slice(&[0x13, 0x01]); // TLS_AES_128_GCM_SHA256
		body.push(0); // compression
		body.extend_from_slice(&[0x00, 0x06]); // extensions length
		body.extend_from_slice(&TLS13_SUPPORTED_VERSIONS);
		let hs_len = (body.len() - 4) as u32;
		body[1..4].copy_from_slice(&hs_len.to_be_bytes()[1..]);

		let mut record = vec![0x16, 0x03, 0x03];
		record.extend_from_slice(&(body.len() as u16).to_be_bytes());
		record.extend_from_slice(&body);
		record
	}

	fn client_hello() -> Vec<u8> {
		let mut record = vec![0x16, 0x03, 0x01, 0x00, 0x10, 0x01];
		record.extend_from_slice(&[0u8; 15]);
		record
	}

	fn app_data(len: usize) -> Vec<u8> {
		let mut record = vec![0x17, 0x03, 0x03];
		record.extend_from_slice(&(len as u16).to_be_bytes());
		record.extend_from_slice(&vec![0x5a; len]);
		record
	}

	/// Drives a writer state and a reader state over the same byte stream
	/// with arbitrary re-chunking, asserting the reader recovers exactly
	/// the written payloads.
	fn roundtrip(payloads: &[Vec<u8>], chunk: usize) {
		let mut writer = FlowState::new(user(), true);
		let mut reader = FlowState::new(user(), true);

		let mut wire = Vec::new();
		let mut expect = Vec::new();
		for p in payloads {
			expect.extend_from_slice(p);
			wire.extend_from_slice(&writer.pad(p));
		}

		let mut got = Vec::new();
		for piece in wire.chunks(chunk) {
			got.extend_from_slice(&reader.unpad(piece).unwrap());
		}
		assert_eq!(got, expect, "chunk size {chunk}");
	}

	#[test]
	fn unpad_is_left_inverse_of_pad() {
		let payloads = vec![
			client_hello(),
			server_hello(),
			b"some change cipher spec".to_vec(),
			app_data(100),
			app_data(64),
			b"after direct copy".to_vec(),
		];
		for chunk in [1, 3, 7, 64, 1024, 65536] {
			roundtrip(&payloads, chunk);
		}
	}

	#[test]
	fn non_tls_traffic_stops_padding_after_filter_window() {
		let mut writer = FlowState::new(user(), true);
		let mut reader = FlowState::new(user(), true);

		let mut wire = Vec::new();
		let mut expect = Vec::new();
		let mut rng = rand::rng();
		for i in 0..12usize {
			let len = rng.random_range(1..900);
			let payload = vec![i as u8; len];
			expect.extend_from_slice(&payload);
			wire.extend_from_slice(&writer.pad(&payload));
		}
		assert!(writer.write_is_direct());

		let mut got = Vec::new();
		for piece in wire.chunks(17) {
			got.extend_from_slice(&reader.unpad(piece).unwrap());
		}
		assert_eq!(got, expect);
	}

	#[test]
	fn tls13_switches_to_direct() {
		let mut writer = FlowState::new(user(), true);
		writer.pad(&client_hello());
		writer.pad(&server_hello());
		assert!(writer.is_tls);
		assert!(writer.is_tls13_or_above);
		assert!(writer.enable_xtls);
		assert!(!writer.write_is_direct());

		let framed = writer.pad(&app_data(32));
		// The Direct marker frame still wraps this payload...
		assert_ne!(&framed[..], &app_data(32)[..]);
		assert!(writer.write_is_direct());

		// ...and everything after it is untouched.
		let raw = writer.pad(b"zero copy now");
		assert_eq!(&raw[..], b"zero copy now");
	}

	#[test]
	fn ccm8_cipher_disables_xtls() {
		let mut hello = server_hello();
		// Patch the cipher suite to TLS_AES_128_CCM_8_SHA256.
		let sid = hello[5 + 38] as usize;
		hello[5 + 39 + sid] = 0x13;
		hello[5 + 40 + sid] = 0x05;

		let mut writer = FlowState::new(user(), true);
		writer.pad(&client_hello());
		writer.pad(&hello);
		assert!(writer.is_tls13_or_above);
		assert!(!writer.enable_xtls);

		// ApplicationData therefore ends padding instead of going direct.
		writer.pad(&app_data(16));
		assert!(writer.write_is_direct());
		assert!(!writer.read_is_direct());
	}

	#[test]
	fn wrong_uuid_rejected() {
		let mut writer = FlowState::new(user(), true);
		let wire = writer.pad(b"hello");

		let mut reader = FlowState::new(Uuid::new_v4(), true);
		assert!(reader.unpad(&wire).is_err());
	}

	#[test]
	fn padding_adds_no_payload_bytes() {
		let mut writer = FlowState::new(user(), true);
		let mut reader = FlowState::new(user(), true);
		let wire = writer.pad(b"exact");
		assert_eq!(&reader.unpad(&wire).unwrap()[..], b"exact");
	}
}
