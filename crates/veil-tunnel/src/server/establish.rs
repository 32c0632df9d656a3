//! Server-side tunnel establishment: run the handshake off the first
//! frame, answer (or fake-answer), then hand the stream to the TCP copy
//! loop or the UDP session layer.

use std::{
	net::{IpAddr, SocketAddr},
	sync::Arc,
	time::Duration,
};

use bytes::{Bytes, BytesMut};
use tokio::{
	io::{AsyncReadExt, AsyncWriteExt},
	net::TcpStream,
};
use tokio_util::{codec::Decoder as _, sync::CancellationToken};
use uuid::Uuid;
use veil_core::{debug, info, stats::TrafficStats, warn};

use snafu::IntoError as _;

use crate::{
	error::{HandshakeError, Result, TargetDialSnafu, TargetWriteSnafu},
	proto::{
		Address, Command, HandshakeStatus, TrojanCommand, TrojanKeyring, TrojanRequest,
		TrojanUdpCodec, UdpFrame, UdpFrameCodec, UdpStatus, decode_request, encode_response,
		fake_response, unix_now,
		flow::FlowState,
	},
	server::{
		limiter::{RateLimiter, RateLimiterConfig},
		nonce::{MokaNonceCache, NONCE_TTL, NonceCache},
		udp::{UDP_IDLE_TIMEOUT, UdpSessionManager, UdpWireFormat, resolve_address},
	},
	transport::ServerTunnel,
};

pub struct ServerOpts {
	pub users:            Vec<Uuid>,
	pub trojan_passwords: Vec<String>,
	/// Vision-style flow shaping on EWP TCP tunnels.
	pub flow:             bool,
	/// Where failed Trojan attempts are spliced to.
	pub fallback:         Option<SocketAddr>,
	pub limiter:          RateLimiterConfig,
	pub dial_timeout:     Duration,
	/// Deadline for the first (handshake) frame.
	pub auth_timeout:     Duration,
	pub udp_idle_timeout: Duration,
}

impl Default for ServerOpts {
	fn default() -> Self {
		Self {
			users:            Vec::new(),
			trojan_passwords: Vec::new(),
			flow:             false,
			fallback:         None,
			limiter:          RateLimiterConfig::default(),
			dial_timeout:     Duration::from_secs(10),
			auth_timeout:     Duration::from_secs(10),
			udp_idle_timeout: UDP_IDLE_TIMEOUT,
		}
	}
}

/// Process-wide server state, created once at startup. The replay cache,
/// rate limiter and UDP session manager live here behind their interfaces
/// so tests can substitute fakes.
pub struct ServerState {
	pub users:        Vec<Uuid>,
	pub trojan_keys:  TrojanKeyring,
	pub nonces:       Box<dyn NonceCache>,
	pub limiter:      Arc<RateLimiter>,
	pub udp_sessions: Arc<UdpSessionManager>,
	pub stats:        Arc<TrafficStats>,
	pub flow:         bool,
	pub fallback:     Option<SocketAddr>,
	pub dial_timeout: Duration,
	pub auth_timeout: Duration,
	pub token:        CancellationToken,
}

impl ServerState {
	pub fn new(opts: ServerOpts, token: CancellationToken) -> Arc<Self> {
		let limiter = RateLimiter::new(opts.limiter);
		limiter.spawn_sweeper(token.child_token());
		let udp_sessions = UdpSessionManager::new(opts.udp_idle_timeout, token.child_token());
		Arc::new(Self {
			users: opts.users,
			trojan_keys: TrojanKeyring::from_passwords(opts.trojan_passwords.iter().map(String::as_str)),
			nonces: Box::new(MokaNonceCache::new(NONCE_TTL)),
			limiter,
			udp_sessions,
			stats: Arc::new(TrafficStats::default()),
			flow: opts.flow,
			fallback: opts.fallback,
			dial_timeout: opts.dial_timeout,
			auth_timeout: opts.auth_timeout,
			token,
		})
	}

	/// Every credential accepted in `X-Auth-Token` / WS subprotocols.
	pub fn auth_tokens(&self) -> Vec<String> {
		let mut tokens: Vec<String> = self.users.iter().map(Uuid::to_string).collect();
		tokens.extend(self.trojan_tokens());
		tokens
	}

	fn trojan_tokens(&self) -> Vec<String> {
		self.trojan_keys.key_strings()
	}
}

/// Runs one accepted tunnel to completion. Every exit path closes the
/// carrier; handshake failures never tell the client why.
pub async fn establish_tunnel(state: Arc<ServerState>, mut conn: ServerTunnel, peer: IpAddr) -> Result<()> {
	let _guard = state.stats.conn_opened();

	if !state.limiter.check_request(peer).await {
		debug!(target: "[IN]", "{peer} rate limited");
		let _ = conn.send_frame(Bytes::copy_from_slice(&fake_response())).await;
		conn.close().await;
		return Ok(());
	}

	let first = match tokio::time::timeout(state.auth_timeout, conn.recv_frame()).await {
		Ok(Ok(Some(frame))) => frame,
		Ok(Ok(None)) | Ok(Err(_)) => {
			conn.close().await;
			return Ok(());
		}
		Err(_) => {
			debug!(target: "[IN]", "{peer} sent no handshake within deadline");
			conn.close().await;
			return Ok(());
		}
	};

	// EWP first, then the Trojan alternative.
	let mut ewp_failure: Option<HandshakeError> = None;
	if !state.users.is_empty() {
		match decode_request(&first, &state.users, unix_now()) {
			Ok(handshake) => {
				if !state.nonces.check_and_insert(&handshake.nonce).await {
					warn!(target: "[IN]", "{peer} replayed nonce, rejecting");
					state.limiter.record_failure(peer).await;
					let _ = conn.send_frame(Bytes::copy_from_slice(&fake_response())).await;
					conn.close().await;
					return Ok(());
				}
				state.limiter.record_success(peer).await;

				let response = encode_response(&handshake, HandshakeStatus::Ok, unix_now());
				conn.send_frame(Bytes::copy_from_slice(&response)).await?;

				info!(target: "[IN]", "{peer} tunnel to {} ({:?})", handshake.target, handshake.command);
				return match handshake.command {
					Command::Tcp => {
						run_tcp(state, conn, Some(handshake.uuid), handshake.target, Bytes::new()).await
					}
					Command::Udp => run_udp(state, conn, UdpWireFormat::Ewp, Bytes::new()).await,
					Command::Other(_) => {
						conn.close().await;
						Ok(())
					}
				};
			}
			Err(kind) => ewp_failure = Some(kind),
		}
	}

	if !state.trojan_keys.is_empty() {
		if let Ok((request, _key, payload)) = TrojanRequest::decode(&first, &state.trojan_keys) {
			state.limiter.record_success(peer).await;
			info!(target: "[IN]", "{peer} trojan tunnel to {} ({:?})", request.target, request.command);
			return match request.command {
				TrojanCommand::Connect => run_tcp(state, conn, None, request.target, payload).await,
				TrojanCommand::UdpAssociate => {
					run_udp(state, conn, UdpWireFormat::Trojan, payload).await
				}
				TrojanCommand::Mux | TrojanCommand::Other(_) => {
					debug!(target: "[IN]", "{peer} requested unsupported trojan command");
					conn.close().await;
					Ok(())
				}
			};
		}
	}

	// Authentication failed on every configured path.
	state.limiter.record_failure(peer).await;
	if let Some(kind) = ewp_failure {
		debug!(target: "[IN]", "{peer} handshake rejected: {kind}");
	} else {
		debug!(target: "[IN]", "{peer} handshake rejected");
	}

	if let Some(fallback) = state.fallback {
		return splice_fallback(state, conn, first, fallback).await;
	}
	let _ = conn.send_frame(Bytes::copy_from_slice(&fake_response())).await;
	conn.close().await;
	Ok(())
}

/// Dials the real target and runs the paired copy loop, unpadding the
/// uplink and padding the downlink when flow shaping is on.
async fn run_tcp(
	state: Arc<ServerState>,
	mut conn: ServerTunnel,
	flow_user: Option<Uuid>,
	target: Address,
	initial: Bytes,
) -> Result<()> {
	let target_addr = veil_core::types::TargetAddr::from(target.clone());
	let dialed = async {
		let peer = resolve_address(&target).await?;
		match tokio::time::timeout(state.dial_timeout, TcpStream::connect(peer)).await {
			Ok(result) => result,
			Err(_) => Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "dial timed out")),
		}
	}
	.await;
	let upstream = match dialed {
		Ok(stream) => stream,
		Err(source) => {
			// Never propagated through the tunnel, only logged.
			let err = TargetDialSnafu {
				target: target_addr,
			}
			.into_error(source);
			debug!(target: "[IN]", "{err}");
			conn.close().await;
			return Ok(());
		}
	};
	let _ = upstream.set_nodelay(true);

	let flow = flow_user.filter(|_| state.flow).map(|user| FlowState::new(user, true));
	pipe_tunnel(&state, conn, upstream, flow, initial, target_addr).await
}

/// The two copy tasks of one tunnel: tunnel→target and target→tunnel.
async fn pipe_tunnel(
	state: &Arc<ServerState>,
	mut conn: ServerTunnel,
	upstream: TcpStream,
	flow: Option<FlowState>,
	initial: Bytes,
	target: veil_core::types::TargetAddr,
) -> Result<()> {
	let flow = Arc::new(std::sync::Mutex::new(flow));
	let (mut up_read, mut up_write) = upstream.into_split();

	if !initial.is_empty() {
		let data = {
			let mut guard = flow.lock().expect("flow lock");
			match guard.as_mut() {
				Some(flow) => flow.unpad(&initial)?,
				None => initial,
			}
		};
		if !data.is_empty() {
			up_write
				.write_all(&data)
				.await
				.map_err(|source| TargetWriteSnafu { target }.into_error(source))?;
		}
	}

	let token = state.token.child_token();
	let writer = conn.shared_writer();
	let stats = state.stats.clone();

	let uplink = {
		let token = token.clone();
		let flow = flow.clone();
		let stats = stats.clone();
		tokio::spawn(async move {
			loop {
				tokio::select! {
					_ = token.cancelled() => break,
					frame = conn.recv_frame() => match frame {
						Ok(Some(frame)) => {
							let data = {
								let mut guard = flow.lock().expect("flow lock");
								match guard.as_mut() {
									Some(flow) => match flow.unpad(&frame) {
										Ok(data) => data,
										Err(err) => {
											debug!(target: "[IN]", "uplink unpad failed: {err}");
											break;
										}
									},
									None => frame,
								}
							};
							if data.is_empty() {
								continue;
							}
							stats.add_upload(data.len() as u64);
							if up_write.write_all(&data).await.is_err() {
								break;
							}
						}
						Ok(None) => {
							let _ = up_write.shutdown().await;
							break;
						}
						Err(err) => {
							if !err.is_benign_close() {
								debug!(target: "[IN]", "uplink read failed: {err}");
							}
							break;
						}
					}
				}
			}
			token.cancel();
		})
	};

	let downlink = {
		let token = token.clone();
		tokio::spawn(async move {
			let mut buf = vec![0u8; veil_core::io::BUFFER_SIZE];
			loop {
				tokio::select! {
					_ = token.cancelled() => break,
					read = up_read.read(&mut buf) => match read {
						Ok(0) => break,
						Ok(n) => {
							let frame = {
								let mut guard = flow.lock().expect("flow lock");
								match guard.as_mut() {
									Some(flow) => flow.pad(&buf[..n]),
									None => Bytes::copy_from_slice(&buf[..n]),
								}
							};
							stats.add_download(n as u64);
							if writer.lock().await.send(frame).await.is_err() {
								break;
							}
						}
						Err(err) => {
							if !veil_core::io::is_benign_close(&err) {
								debug!(target: "[IN]", "downlink read failed: {err}");
							}
							break;
						}
					}
				}
			}
			let _ = writer.lock().await.close().await;
			token.cancel();
		})
	};

	let _ = uplink.await;
	let _ = downlink.await;
	Ok(())
}

/// Feeds decoded UDP frames into the session manager until the tunnel
/// ends, then drops this tunnel's sessions.
async fn run_udp(
	state: Arc<ServerState>,
	mut conn: ServerTunnel,
	wire: UdpWireFormat,
	initial: Bytes,
) -> Result<()> {
	let writer = conn.shared_writer();
	// Trojan carries no session id on the wire; the stream is the session.
	let trojan_session = crate::proto::GlobalId::fresh();
	let mut first_packet = true;
	let mut buf = BytesMut::from(&initial[..]);

	'tunnel: loop {
		loop {
			let frame = match wire {
				UdpWireFormat::Ewp => match UdpFrameCodec.decode(&mut buf) {
					Ok(Some(frame)) => frame,
					Ok(None) => break,
					Err(err) => {
						debug!(target: "[IN]", "bad udp frame: {err}");
						break 'tunnel;
					}
				},
				UdpWireFormat::Trojan => match TrojanUdpCodec.decode(&mut buf) {
					Ok(Some(packet)) => {
						let status = if first_packet { UdpStatus::New } else { UdpStatus::Keep };
						UdpFrame {
							global_id: trojan_session,
							status,
							target: Some(packet.target),
							payload: packet.payload,
						}
					}
					Ok(None) => break,
					Err(err) => {
						debug!(target: "[IN]", "bad trojan udp packet: {err}");
						break 'tunnel;
					}
				},
			};
			first_packet = false;
			state.udp_sessions.handle_frame(frame, wire, &writer).await;
		}

		match conn.recv_frame().await {
			Ok(Some(frame)) => buf.extend_from_slice(&frame),
			Ok(None) => break,
			Err(err) => {
				if !err.is_benign_close() {
					debug!(target: "[IN]", "udp tunnel read failed: {err}");
				}
				break;
			}
		}
	}

	state.udp_sessions.close_for_writer(&writer).await;
	conn.close().await;
	Ok(())
}

/// Splices a failed Trojan attempt (prelude included) to the configured
/// plaintext backend, so probes see that backend's behavior.
async fn splice_fallback(
	state: Arc<ServerState>,
	conn: ServerTunnel,
	prelude: Bytes,
	fallback: SocketAddr,
) -> Result<()> {
	info!(target: "[IN]", "splicing unauthenticated connection to fallback {fallback}");
	let upstream = match TcpStream::connect(fallback).await {
		Ok(stream) => stream,
		Err(err) => {
			debug!(target: "[IN]", "fallback dial failed: {err}");
			let mut conn = conn;
			conn.close().await;
			return Ok(());
		}
	};
	pipe_tunnel(&state, conn, upstream, None, prelude, fallback.into()).await
}

#[cfg(test)]
mod test {
	use std::{net::IpAddr, sync::Arc, time::Duration};

	use bytes::Bytes;
	use tokio::{
		io::{AsyncReadExt, AsyncWriteExt},
		net::TcpListener,
		sync::mpsc,
	};
	use tokio_util::sync::CancellationToken;
	use uuid::Uuid;

	use super::{ServerOpts, ServerState, establish_tunnel};
	use crate::{
		proto::{Address, Command, HandshakeRequest, RESPONSE_LEN, TrojanCommand, TrojanKey, TrojanRequest},
		transport::{FrameReader, FrameWriter, ServerTunnel},
	};

	const PEER: IpAddr = IpAddr::V4(std::net::Ipv4Addr::new(203, 0, 113, 9));

	fn test_uuid() -> Uuid {
		Uuid::parse_str("d342d11e-d424-4583-b36e-524ab1f0afa4").unwrap()
	}

	/// Client-side handles of a channel-backed tunnel.
	struct TestClient {
		up:   mpsc::Sender<Bytes>,
		down: mpsc::Receiver<Bytes>,
	}

	fn spawn_tunnel(state: &Arc<ServerState>) -> TestClient {
		let (up_tx, up_rx) = mpsc::channel(16);
		let (down_tx, down_rx) = mpsc::channel(16);
		let conn = ServerTunnel::new(FrameWriter::Channel(down_tx), FrameReader::Channel(up_rx));
		let state = state.clone();
		tokio::spawn(async move {
			let _ = establish_tunnel(state, conn, PEER).await;
		});
		TestClient {
			up:   up_tx,
			down: down_rx,
		}
	}

	async fn recv(client: &mut TestClient) -> Bytes {
		tokio::time::timeout(Duration::from_secs(5), client.down.recv())
			.await
			.expect("frame within deadline")
			.expect("tunnel open")
	}

	async fn tcp_echo_server() -> std::net::SocketAddr {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		tokio::spawn(async move {
			while let Ok((mut stream, _)) = listener.accept().await {
				tokio::spawn(async move {
					let mut buf = [0u8; 4096];
					while let Ok(n) = stream.read(&mut buf).await {
						if n == 0 || stream.write_all(&buf[..n]).await.is_err() {
							break;
						}
					}
				});
			}
		});
		addr
	}

	#[test_log::test(tokio::test)]
	async fn ewp_tcp_echo_roundtrip() {
		let echo = tcp_echo_server().await;
		let state = ServerState::new(
			ServerOpts {
				users: vec![test_uuid()],
				..Default::default()
			},
			CancellationToken::new(),
		);

		let request = HandshakeRequest::new(test_uuid(), Command::Tcp, Address::from(echo));
		let mut client = spawn_tunnel(&state);
		client.up.send(request.encode().unwrap()).await.unwrap();

		let response = recv(&mut client).await;
		assert_eq!(response.len(), RESPONSE_LEN);
		request.verify_response(&response).unwrap();

		client.up.send(Bytes::from_static(b"echo me")).await.unwrap();
		assert_eq!(&recv(&mut client).await[..], b"echo me");
	}

	/// Replaying the exact same handshake bytes yields 26 bytes that no
	/// longer verify, and nothing else.
	#[test_log::test(tokio::test)]
	async fn replayed_handshake_rejected() {
		let echo = tcp_echo_server().await;
		let state = ServerState::new(
			ServerOpts {
				users: vec![test_uuid()],
				..Default::default()
			},
			CancellationToken::new(),
		);

		let request = HandshakeRequest::new(test_uuid(), Command::Tcp, Address::from(echo));
		let wire = request.encode().unwrap();

		let mut first = spawn_tunnel(&state);
		first.up.send(wire.clone()).await.unwrap();
		let response = recv(&mut first).await;
		request.verify_response(&response).unwrap();

		let mut second = spawn_tunnel(&state);
		second.up.send(wire).await.unwrap();
		let response = recv(&mut second).await;
		assert_eq!(response.len(), RESPONSE_LEN);
		assert!(request.verify_response(&response).is_err());
		// The tunnel is closed after the fake response.
		assert!(second.down.recv().await.is_none());
	}

	/// An unknown UUID gets the same 26-byte answer as a replay.
	#[test_log::test(tokio::test)]
	async fn unknown_user_gets_fake_response() {
		let state = ServerState::new(
			ServerOpts {
				users: vec![test_uuid()],
				..Default::default()
			},
			CancellationToken::new(),
		);

		let stranger = HandshakeRequest::new(
			Uuid::new_v4(),
			Command::Tcp,
			Address::Domain("example.com".into(), 443),
		);
		let mut client = spawn_tunnel(&state);
		client.up.send(stranger.encode().unwrap()).await.unwrap();
		let response = recv(&mut client).await;
		assert_eq!(response.len(), RESPONSE_LEN);
		assert!(stranger.verify_response(&response).is_err());
	}

	#[test_log::test(tokio::test)]
	async fn trojan_roundtrip_and_fallback() {
		let echo = tcp_echo_server().await;

		// Fallback backend replies with a fixed HTTP response.
		let fallback_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let fallback_addr = fallback_listener.local_addr().unwrap();
		tokio::spawn(async move {
			while let Ok((mut stream, _)) = fallback_listener.accept().await {
				tokio::spawn(async move {
					let mut buf = [0u8; 1024];
					let _ = stream.read(&mut buf).await;
					let _ = stream
						.write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 8\r\n\r\nfallback")
						.await;
				});
			}
		});

		let state = ServerState::new(
			ServerOpts {
				trojan_passwords: vec!["hunter2".to_string()],
				fallback: Some(fallback_addr),
				..Default::default()
			},
			CancellationToken::new(),
		);

		// Correct password: payload reaches the target, echo comes back.
		let good = TrojanRequest {
			command: TrojanCommand::Connect,
			target:  Address::from(echo),
		};
		let frame = good
			.encode(&TrojanKey::from_password("hunter2"), b"hello trojan")
			.unwrap();
		let mut client = spawn_tunnel(&state);
		client.up.send(frame).await.unwrap();
		assert_eq!(&recv(&mut client).await[..], b"hello trojan");

		// Wrong password: the whole prelude is spliced to the fallback and
		// its response comes back unchanged.
		let bad = TrojanRequest {
			command: TrojanCommand::Connect,
			target:  Address::from(echo),
		};
		let frame = bad.encode(&TrojanKey::from_password("wrong"), b"GET / HTTP/1.1\r\n\r\n").unwrap();
		let mut client = spawn_tunnel(&state);
		client.up.send(frame).await.unwrap();
		let mut collected = Vec::new();
		loop {
			let chunk = tokio::time::timeout(Duration::from_secs(5), client.down.recv())
				.await
				.expect("fallback reply within deadline");
			let Some(chunk) = chunk else { break };
			collected.extend_from_slice(&chunk);
			if collected.ends_with(b"fallback") {
				break;
			}
		}
		let text = String::from_utf8_lossy(&collected);
		assert!(text.starts_with("HTTP/1.1 200 OK"), "got: {text}");
		assert!(text.ends_with("fallback"));
	}
}
