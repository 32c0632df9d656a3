use std::{
	fmt,
	net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
};

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TargetAddr {
	Domain(String, u16),
	IPv4(Ipv4Addr, u16),
	IPv6(Ipv6Addr, u16),
}

impl TargetAddr {
	pub fn port(&self) -> u16 {
		match self {
			TargetAddr::Domain(_, port) => *port,
			TargetAddr::IPv4(_, port) => *port,
			TargetAddr::IPv6(_, port) => *port,
		}
	}

	/// Host part without the port, the way it appears in an URL or SNI.
	pub fn host(&self) -> String {
		match self {
			TargetAddr::Domain(domain, _) => domain.clone(),
			TargetAddr::IPv4(ip, _) => ip.to_string(),
			TargetAddr::IPv6(ip, _) => ip.to_string(),
		}
	}

	/// Returns the socket address when no DNS resolution is required.
	pub fn socket_addr(&self) -> Option<SocketAddr> {
		match self {
			TargetAddr::Domain(..) => None,
			TargetAddr::IPv4(ip, port) => Some(SocketAddr::from((*ip, *port))),
			TargetAddr::IPv6(ip, port) => Some(SocketAddr::from((*ip, *port))),
		}
	}

	/// Parses `host:port`, keeping domain names unresolved.
	pub fn parse(input: &str) -> Option<Self> {
		if let Ok(sa) = input.parse::<SocketAddr>() {
			return Some(sa.into());
		}
		let (host, port) = input.rsplit_once(':')?;
		let port = port.parse::<u16>().ok()?;
		if host.is_empty() {
			return None;
		}
		Some(TargetAddr::Domain(host.to_string(), port))
	}
}

impl From<SocketAddr> for TargetAddr {
	fn from(value: SocketAddr) -> Self {
		match value.ip() {
			IpAddr::V4(ip) => TargetAddr::IPv4(ip, value.port()),
			IpAddr::V6(ip) => TargetAddr::IPv6(ip, value.port()),
		}
	}
}

impl fmt::Display for TargetAddr {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			TargetAddr::Domain(domain, port) => write!(f, "{domain}:{port}"),
			TargetAddr::IPv4(ip, port) => write!(f, "{ip}:{port}"),
			TargetAddr::IPv6(ip, port) => write!(f, "[{ip}]:{port}"),
		}
	}
}

#[cfg(test)]
mod test {
	use super::TargetAddr;

	#[test]
	fn parse_variants() {
		assert_eq!(
			TargetAddr::parse("127.0.0.1:443"),
			Some(TargetAddr::IPv4("127.0.0.1".parse().unwrap(), 443))
		);
		assert_eq!(
			TargetAddr::parse("example.com:8443"),
			Some(TargetAddr::Domain("example.com".into(), 8443))
		);
		assert_eq!(
			TargetAddr::parse("[::1]:53"),
			Some(TargetAddr::IPv6("::1".parse().unwrap(), 53))
		);
		assert_eq!(TargetAddr::parse("no-port"), None);
		assert_eq!(TargetAddr::parse(":80"), None);
	}

	#[test]
	fn display_roundtrip() {
		for input in ["10.1.2.3:80", "example.com:443", "[2001:db8::1]:1"] {
			let addr = TargetAddr::parse(input).unwrap();
			assert_eq!(addr.to_string(), input);
		}
	}
}
