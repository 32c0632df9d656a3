//! Mixed SOCKS5 / HTTP ingress on one local port. The first byte decides
//! the protocol: 0x04/0x05 is SOCKS, anything else goes down the HTTP
//! proxy path.

use std::{future::Future, net::SocketAddr, pin::Pin, sync::Arc, time::Duration};

use fast_socks5::{
	Socks5Command, new_udp_header, parse_udp_request, server::Socks5ServerProtocol,
};
use snafu::IntoError as _;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;
use veil_core::{debug, info, stats::TrafficStats, warn};
use veil_tunnel::transport::Transport;

use crate::{BindSocketSnafu, Error, convert_addr, forward, http};

const DNS_PORT: u16 = 53;
const MAX_DATAGRAM: usize = 65536;

#[derive(Debug, Clone)]
pub enum AuthMode {
	NoAuth,
	Password { username: String, password: String },
}

pub type DnsFuture<'a> = Pin<Box<dyn Future<Output = std::io::Result<Vec<u8>>> + Send + 'a>>;

/// Interface of the DoH client used to short-circuit UDP DNS. The actual
/// bootstrap client lives outside this crate.
pub trait DnsShortcut: Send + Sync {
	fn resolve_raw<'a>(&'a self, query: &'a [u8]) -> DnsFuture<'a>;
}

pub struct IngressOpts {
	pub listen_addr: SocketAddr,
	pub auth:        AuthMode,
	pub allow_udp:   bool,
	/// Idle deadline for a UDP association with no traffic.
	pub udp_idle:    Duration,
}

impl Default for IngressOpts {
	fn default() -> Self {
		Self {
			listen_addr: "127.0.0.1:1080".parse().expect("const addr"),
			auth:        AuthMode::NoAuth,
			allow_udp:   true,
			udp_idle:    Duration::from_secs(5 * 60),
		}
	}
}

pub struct MixedInbound {
	opts:      IngressOpts,
	transport: Arc<Transport>,
	stats:     Arc<TrafficStats>,
	dns:       Option<Arc<dyn DnsShortcut>>,
	token:     CancellationToken,
}

impl MixedInbound {
	pub fn new(
		opts: IngressOpts,
		transport: Arc<Transport>,
		stats: Arc<TrafficStats>,
		dns: Option<Arc<dyn DnsShortcut>>,
		token: CancellationToken,
	) -> Self {
		Self {
			opts,
			transport,
			stats,
			dns,
			token,
		}
	}

	pub async fn listen(&self) -> Result<(), Error> {
		let listener = TcpListener::bind(self.opts.listen_addr)
			.await
			.map_err(|source| {
				BindSocketSnafu {
					socket_addr: self.opts.listen_addr,
				}
				.into_error(source)
			})?;
		info!(target: "[IN]", "ingress listening on {}", self.opts.listen_addr);

		loop {
			tokio::select! {
				_ = self.token.cancelled() => break,
				accepted = listener.accept() => {
					let (stream, peer) = match accepted {
						Ok(v) => v,
						Err(err) => {
							warn!(target: "[IN]", "accept failed: {err}");
							continue;
						}
					};
					let opts_auth = self.opts.auth.clone();
					let allow_udp = self.opts.allow_udp;
					let udp_idle = self.opts.udp_idle;
					let transport = self.transport.clone();
					let stats = self.stats.clone();
					let dns = self.dns.clone();
					tokio::spawn(async move {
						let result = handle_conn(stream, opts_auth, allow_udp, udp_idle, transport, stats, dns).await;
						if let Err(err) = result {
							debug!(target: "[IN]", "connection from {peer} ended: {err}");
						}
					});
				}
			}
		}
		Ok(())
	}
}

async fn handle_conn(
	stream: TcpStream,
	auth: AuthMode,
	allow_udp: bool,
	udp_idle: Duration,
	transport: Arc<Transport>,
	stats: Arc<TrafficStats>,
	dns: Option<Arc<dyn DnsShortcut>>,
) -> Result<(), Error> {
	let mut first = [0u8; 1];
	let n = stream.peek(&mut first).await?;
	if n == 0 {
		return Ok(());
	}
	match first[0] {
		0x04 | 0x05 => serve_socks(stream, auth, allow_udp, udp_idle, transport, stats, dns).await,
		_ => http::serve(stream, transport, stats).await,
	}
}

async fn serve_socks(
	stream: TcpStream,
	auth: AuthMode,
	allow_udp: bool,
	udp_idle: Duration,
	transport: Arc<Transport>,
	stats: Arc<TrafficStats>,
	dns: Option<Arc<dyn DnsShortcut>>,
) -> Result<(), Error> {
	let proto = match &auth {
		AuthMode::NoAuth => Socks5ServerProtocol::accept_no_auth(stream).await?,
		AuthMode::Password { username, password } => {
			Socks5ServerProtocol::accept_password_auth(stream, |user, pass| {
				user == *username && pass == *password
			})
			.await?
			.0
		}
	};

	let (proto, cmd, socks_target) = proto.read_command().await?;
	match cmd {
		Socks5Command::TCPConnect => {
			let target = convert_addr(&socks_target);
			let tunnel = transport.dial().await?;
			if let Err(err) = tunnel.connect(target.clone(), &[]).await {
				debug!(target: "[SOCKS]", "connect {target} failed: {err}");
				proto
					.reply_error(&fast_socks5::ReplyError::HostUnreachable)
					.await?;
				tunnel.close().await;
				return Ok(());
			}
			let bind_addr: SocketAddr = "0.0.0.0:0".parse().expect("const addr");
			let inner = proto.reply_success(bind_addr).await?;
			forward::pipe(inner, tunnel, stats).await
		}
		Socks5Command::UDPAssociate if allow_udp => {
			let relay = UdpSocket::bind("127.0.0.1:0").await?;
			let relay_addr = relay.local_addr()?;
			let control = proto.reply_success(relay_addr).await?;
			serve_udp_associate(control, relay, udp_idle, transport, dns).await
		}
		_ => {
			proto
				.reply_error(&fast_socks5::ReplyError::CommandNotSupported)
				.await?;
			Ok(())
		}
	}
}

/// Local UDP relay bridged over the tunnel's UDP ops. DNS queries may be
/// short-circuited to the configured DoH client. The TCP control
/// connection scopes the association's lifetime.
async fn serve_udp_associate(
	mut control: TcpStream,
	relay: UdpSocket,
	udp_idle: Duration,
	transport: Arc<Transport>,
	dns: Option<Arc<dyn DnsShortcut>>,
) -> Result<(), Error> {
	let tunnel = transport.dial().await?;
	let mut connected = false;
	let mut client_addr: Option<SocketAddr> = None;
	let mut buf = vec![0u8; MAX_DATAGRAM];
	let mut control_buf = [0u8; 512];

	loop {
		tokio::select! {
			// The TCP control connection scopes the association.
			read = tokio::io::AsyncReadExt::read(&mut control, &mut control_buf) => {
				match read {
					Ok(0) | Err(_) => break,
					Ok(_) => continue,
				}
			}
			_ = tokio::time::sleep(udp_idle) => {
				debug!(target: "[SOCKS]", "udp association idle, closing");
				break;
			}
			received = relay.recv_from(&mut buf) => {
				let (n, peer) = match received {
					Ok(v) => v,
					Err(err) => {
						debug!(target: "[SOCKS]", "relay recv failed: {err}");
						break;
					}
				};
				client_addr = Some(peer);
				let (frag, socks_target, payload) = match parse_udp_request(&buf[..n]).await {
					Ok(v) => v,
					Err(err) => {
						debug!(target: "[SOCKS]", "bad udp request: {err}");
						continue;
					}
				};
				if frag != 0 {
					// Fragmented SOCKS datagrams are not supported.
					continue;
				}
				let target = convert_addr(&socks_target);

				// DNS fast path, skipping a tunnel round trip.
				if target.port() == DNS_PORT {
					if let Some(dns) = &dns {
						match dns.resolve_raw(payload).await {
							Ok(answer) => {
								let mut reply = new_udp_header(socks_target.clone())?;
								reply.extend_from_slice(&answer);
								let _ = relay.send_to(&reply, peer).await;
								continue;
							}
							Err(err) => {
								debug!(target: "[SOCKS]", "doh shortcut failed, tunneling: {err}");
							}
						}
					}
				}

				let sent = if !connected {
					connected = true;
					tunnel.connect_udp(target.clone(), payload).await
				} else {
					tunnel.write_udp(&target, payload).await
				};
				if let Err(err) = sent {
					debug!(target: "[SOCKS]", "udp uplink failed: {err}");
					break;
				}
			}
			packet = tunnel.read_udp(), if connected => {
				let packet = match packet {
					Ok(packet) => packet,
					Err(err) => {
						if !err.is_benign_close() {
							debug!(target: "[SOCKS]", "udp downlink failed: {err}");
						}
						break;
					}
				};
				let Some(client) = client_addr else { continue };
				let target = match packet.target.socket_addr() {
					Some(addr) => fast_socks5::util::target_addr::TargetAddr::Ip(addr),
					None => fast_socks5::util::target_addr::TargetAddr::Domain(
						packet.target.host(),
						packet.target.port(),
					),
				};
				let Ok(mut reply) = new_udp_header(target) else { continue };
				reply.extend_from_slice(&packet.payload);
				let _ = relay.send_to(&reply, client).await;
			}
		}
	}

	tunnel.close().await;
	Ok(())
}
