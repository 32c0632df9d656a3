//! Pluggable wire carriers behind one [`TunnelConn`] contract.

mod conn;
pub use conn::*;

pub mod ech;
pub mod grpc;
pub mod grpcweb;
pub mod tls;
pub mod ws;
pub mod xhttp;

use std::{net::IpAddr, net::SocketAddr, sync::Arc};

use rustls::pki_types::CertificateDer;
use veil_core::{info, types::TargetAddr};

use crate::error::{AddressSnafu, Error, Result};

pub type StreamBox = Box<dyn veil_core::AbstractTcpStream>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CarrierKind {
	Ws,
	Grpc,
	GrpcWeb,
	XhttpStreamOne,
	XhttpStreamDown,
}

/// Everything a dial needs, carrier-independent.
pub struct TransportOpts {
	/// Server endpoint, `host:port`; the host lands in the TLS SNI.
	pub server: TargetAddr,
	/// Pre-resolved IP for SNI-preserving fronted dialing.
	pub front_ip: Option<IpAddr>,
	/// SNI override, defaults to the server host.
	pub sni_override: Option<String>,
	/// WS / XHTTP path.
	pub path: String,
	/// gRPC service name (`/{service}/Tunnel`).
	pub service_name: String,
	pub auth: TunnelAuth,
	/// Vision-style flow padding on TCP tunnels.
	pub flow: bool,
	/// Prefer the hybrid post-quantum key exchange.
	pub pqc: bool,
	pub insecure_skip_verify: bool,
	/// Extra trust roots (tests, private CAs).
	pub extra_roots: Vec<CertificateDer<'static>>,
	pub ech: Option<Arc<ech::EchManager>>,
	// Anti-DPI knobs
	pub user_agent: Option<String>,
	pub content_type: Option<String>,
	pub host_override: Option<String>,
	pub padding_min: usize,
	pub padding_max: usize,
	/// WebSocket keepalive; QUIC and HTTP/2 ping at the transport layer.
	pub ws_ping_interval: Option<std::time::Duration>,
}

impl TransportOpts {
	pub fn new(server: TargetAddr, auth: TunnelAuth) -> Self {
		Self {
			server,
			front_ip: None,
			sni_override: None,
			path: "/".to_string(),
			service_name: "TunnelService".to_string(),
			auth,
			flow: false,
			pqc: false,
			insecure_skip_verify: false,
			extra_roots: Vec::new(),
			ech: None,
			user_agent: None,
			content_type: None,
			host_override: None,
			padding_min: xhttp::DEFAULT_PADDING_MIN,
			padding_max: xhttp::DEFAULT_PADDING_MAX,
			ws_ping_interval: Some(std::time::Duration::from_secs(30)),
		}
	}

	pub fn authority(&self) -> String {
		self.server.to_string()
	}

	pub fn tls_server_name(&self) -> String {
		self.sni_override.clone().unwrap_or_else(|| self.server.host())
	}
}

/// Owns the dial policy for one configured carrier, including the single
/// ECH-rejection retry. Connections never call back into the transport;
/// the retry lives here.
pub struct Transport {
	kind: CarrierKind,
	opts: TransportOpts,
}

impl Transport {
	pub fn new(kind: CarrierKind, opts: TransportOpts) -> Self {
		Self { kind, opts }
	}

	pub fn kind(&self) -> CarrierKind {
		self.kind
	}

	pub fn opts(&self) -> &TransportOpts {
		&self.opts
	}

	/// Dials a fresh tunnel. On an ECH rejection the manager refreshes its
	/// config list and the dial is repeated exactly once.
	pub async fn dial(&self) -> Result<TunnelConn> {
		match self.dial_once().await {
			Err(Error::EchRejected { .. }) if self.opts.ech.is_some() => {
				let manager = self.opts.ech.as_ref().ok_or(Error::Closed)?;
				info!(target: "[DIAL]", "ECH rejected, refreshing config list and redialing once");
				manager.refresh().await?;
				self.dial_once().await
			}
			other => other,
		}
	}

	async fn dial_once(&self) -> Result<TunnelConn> {
		let server_addr = self.resolve().await?;

		let (writer, reader) = match self.kind {
			CarrierKind::GrpcWeb => {
				let tls = tls::client_config(&self.opts, &[]).await?;
				grpcweb::dial(&self.opts, tls, server_addr).await?
			}
			CarrierKind::Ws => {
				let stream = self.tls_stream(server_addr, &[b"http/1.1"]).await?;
				ws::dial(&self.opts, stream).await?
			}
			CarrierKind::Grpc => {
				let stream = self.tls_stream(server_addr, &[b"h2"]).await?;
				grpc::dial(&self.opts, stream).await?
			}
			CarrierKind::XhttpStreamOne => {
				let stream = self.tls_stream(server_addr, &[b"h2"]).await?;
				xhttp::dial_stream_one(&self.opts, stream).await?
			}
			CarrierKind::XhttpStreamDown => {
				let stream = self.tls_stream(server_addr, &[b"h2"]).await?;
				xhttp::dial_stream_down(&self.opts, stream).await?
			}
		};

		let conn = TunnelConn::new(writer, reader, self.opts.auth.clone(), self.opts.flow);
		if self.kind == CarrierKind::Ws {
			if let Some(interval) = self.opts.ws_ping_interval {
				conn.start_ping(interval);
			}
		}
		Ok(conn)
	}

	async fn tls_stream(&self, server_addr: SocketAddr, alpn: &[&[u8]]) -> Result<StreamBox> {
		let tcp = tls::tcp_dial(server_addr).await?;
		let stream = tls::connect(&self.opts, tcp, alpn).await?;
		Ok(Box::new(stream))
	}

	async fn resolve(&self) -> Result<SocketAddr> {
		let port = self.opts.server.port();
		if let Some(ip) = self.opts.front_ip {
			return Ok(SocketAddr::new(ip, port));
		}
		if let Some(addr) = self.opts.server.socket_addr() {
			return Ok(addr);
		}
		let host = self.opts.server.host();
		let mut addrs = tokio::net::lookup_host((host.as_str(), port)).await?;
		addrs.next().ok_or_else(|| {
			AddressSnafu {
				input: format!("{host}:{port}"),
			}
			.build()
		})
	}
}
