use std::{backtrace::Backtrace, fmt};

use snafu::prelude::*;
use veil_core::types::TargetAddr;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Reasons a handshake is rejected. The server answers every one of them
/// with the same 26-byte random frame so the reason never crosses the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeError {
	InvalidVersion,
	InvalidLength,
	InvalidTimestamp,
	InvalidAuth,
	InvalidAddress,
	DecryptFailed,
	ReplayDetected,
	RateLimited,
}

impl fmt::Display for HandshakeError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let str = match self {
			HandshakeError::InvalidVersion => "invalid version",
			HandshakeError::InvalidLength => "invalid length",
			HandshakeError::InvalidTimestamp => "timestamp outside window",
			HandshakeError::InvalidAuth => "authentication failed",
			HandshakeError::InvalidAddress => "malformed address",
			HandshakeError::DecryptFailed => "decryption failed",
			HandshakeError::ReplayDetected => "nonce replayed",
			HandshakeError::RateLimited => "rate limited",
		};
		f.write_str(str)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolViolation {
	UnexpectedFrame,
	BadPadding,
}

impl fmt::Display for ProtocolViolation {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let str = match self {
			ProtocolViolation::UnexpectedFrame => "unexpected frame",
			ProtocolViolation::BadPadding => "bad padding",
		};
		f.write_str(str)
	}
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
	#[snafu(display("invalid configuration: {reason}"))]
	Config {
		reason:    String,
		backtrace: Backtrace,
	},

	#[snafu(display("unable to parse address `{input}`"))]
	Address {
		input:     String,
		backtrace: Backtrace,
	},

	#[snafu(display("TLS failure"))]
	Tls {
		source:    rustls::Error,
		backtrace: Backtrace,
	},

	/// The server refused our Encrypted Client Hello. The dialer updates
	/// the ECH manager and retries exactly once.
	#[snafu(display("server rejected ECH"))]
	EchRejected {
		retry_available: bool,
		backtrace:       Backtrace,
	},

	#[snafu(display("transport I/O failure"))]
	Transport {
		source:    std::io::Error,
		backtrace: Backtrace,
	},

	#[snafu(display("handshake rejected: {kind}"))]
	Handshake {
		kind:      HandshakeError,
		backtrace: Backtrace,
	},

	#[snafu(display("protocol violation: {violation}"))]
	Protocol {
		violation: ProtocolViolation,
		backtrace: Backtrace,
	},

	#[snafu(display("unable to reach target {target}"))]
	TargetDial {
		target:    TargetAddr,
		source:    std::io::Error,
		backtrace: Backtrace,
	},

	#[snafu(display("unable to write to target {target}"))]
	TargetWrite {
		target:    TargetAddr,
		source:    std::io::Error,
		backtrace: Backtrace,
	},

	#[snafu(display("connect called twice"))]
	AlreadyConnected,

	#[snafu(display("connection closed"))]
	Closed,

	// Caller should yield
	BytesRemaining,
}

impl Error {
	pub fn handshake(kind: HandshakeError) -> Self {
		HandshakeSnafu { kind }.build()
	}

	pub fn protocol(violation: ProtocolViolation) -> Self {
		ProtocolSnafu { violation }.build()
	}

	/// True for errors that only mean the peer went away.
	pub fn is_benign_close(&self) -> bool {
		match self {
			Error::Closed => true,
			Error::Transport { source, .. } => veil_core::io::is_benign_close(source),
			_ => false,
		}
	}
}

impl From<std::io::Error> for Error {
	#[inline(always)]
	fn from(source: std::io::Error) -> Self {
		use snafu::IntoError as _;
		TransportSnafu.into_error(source)
	}
}

impl From<rustls::Error> for Error {
	#[inline(always)]
	fn from(source: rustls::Error) -> Self {
		use snafu::IntoError as _;
		TlsSnafu.into_error(source)
	}
}
