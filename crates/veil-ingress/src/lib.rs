use std::{backtrace::Backtrace, net::SocketAddr};

use fast_socks5::{
	ReplyError, UdpHeaderError, server::SocksServerError, util::target_addr::TargetAddr as SocksTargetAddr,
};
use snafu::{IntoError, Snafu};
use veil_core::types::TargetAddr;

pub mod forward;
pub mod http;
pub mod inbound;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
	BindSocket {
		socket_addr: SocketAddr,
		source:      std::io::Error,
		backtrace:   Backtrace,
	},
	Io {
		source:    std::io::Error,
		backtrace: Backtrace,
	},
	Socks {
		source:    SocksServerError,
		backtrace: Backtrace,
	},
	SocksReply {
		source:    ReplyError,
		backtrace: Backtrace,
	},
	SocksUdpHeader {
		source:    UdpHeaderError,
		backtrace: Backtrace,
	},
	Tunnel {
		source:    veil_tunnel::Error,
		backtrace: Backtrace,
	},
	#[snafu(display("malformed http request: {reason}"))]
	Http {
		reason:    String,
		backtrace: Backtrace,
	},
}

impl From<SocksServerError> for Error {
	#[inline(always)]
	fn from(value: SocksServerError) -> Self {
		SocksSnafu.into_error(value)
	}
}

impl From<ReplyError> for Error {
	#[inline(always)]
	fn from(value: ReplyError) -> Self {
		SocksReplySnafu.into_error(value)
	}
}

impl From<std::io::Error> for Error {
	#[inline(always)]
	fn from(value: std::io::Error) -> Self {
		IoSnafu.into_error(value)
	}
}

impl From<UdpHeaderError> for Error {
	#[inline(always)]
	fn from(value: UdpHeaderError) -> Self {
		SocksUdpHeaderSnafu.into_error(value)
	}
}

impl From<veil_tunnel::Error> for Error {
	#[inline(always)]
	fn from(value: veil_tunnel::Error) -> Self {
		TunnelSnafu.into_error(value)
	}
}

pub fn convert_addr(addr: &SocksTargetAddr) -> TargetAddr {
	match addr {
		SocksTargetAddr::Domain(domain, port) => TargetAddr::Domain(domain.clone(), *port),
		SocksTargetAddr::Ip(socket_addr) => match socket_addr.ip() {
			std::net::IpAddr::V4(ipv4) => TargetAddr::IPv4(ipv4, socket_addr.port()),
			std::net::IpAddr::V6(ipv6) => TargetAddr::IPv6(ipv6, socket_addr.port()),
		},
	}
}
