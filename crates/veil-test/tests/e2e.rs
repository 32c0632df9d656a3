//! End-to-end scenarios over the WebSocket carrier: TLS on loopback, real
//! listeners, real copy loops.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use veil_core::types::TargetAddr;
use veil_tunnel::{
	error::Error,
	server::{ServerOpts, ServerState, listen},
	transport::{CarrierKind, Transport, TransportOpts, TunnelAuth, TunnelConn},
};
use veil_test::{free_port, generate_self_signed_cert, tcp_echo_server, udp_echo_server};

const TEST_UUID: &str = "d342d11e-d424-4583-b36e-524ab1f0afa4";
const DEADLINE: Duration = Duration::from_secs(10);

fn test_uuid() -> Uuid {
	Uuid::parse_str(TEST_UUID).unwrap()
}

struct WsFixture {
	transport: Transport,
	#[allow(dead_code)]
	state:     Arc<ServerState>,
	token:     CancellationToken,
}

impl Drop for WsFixture {
	fn drop(&mut self) {
		self.token.cancel();
	}
}

/// Spins up a WS carrier server on loopback and a matching client
/// transport trusting its self-signed certificate.
async fn ws_fixture(flow: bool) -> WsFixture {
	let (certs, key) = generate_self_signed_cert();
	let root = certs[0].clone();
	let tls = Arc::new(veil_tunnel::transport::tls::server_config(certs, key, &[]).unwrap());

	let token = CancellationToken::new();
	let state = ServerState::new(
		ServerOpts {
			users: vec![test_uuid()],
			flow,
			..Default::default()
		},
		token.clone(),
	);

	let port = free_port();
	let listen_addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
	{
		let state = state.clone();
		tokio::spawn(async move {
			let _ = listen::listen_ws(state, listen_addr, tls, "/".to_string()).await;
		});
	}
	// Give the listener a moment to bind.
	tokio::time::sleep(Duration::from_millis(100)).await;

	let mut opts = TransportOpts::new(
		TargetAddr::IPv4("127.0.0.1".parse().unwrap(), port),
		TunnelAuth::Ewp { uuid: test_uuid() },
	);
	opts.sni_override = Some("localhost".to_string());
	opts.extra_roots = vec![root];
	opts.flow = flow;

	WsFixture {
		transport: Transport::new(CarrierKind::Ws, opts),
		state,
		token,
	}
}

async fn dial(fixture: &WsFixture) -> TunnelConn {
	tokio::time::timeout(DEADLINE, fixture.transport.dial())
		.await
		.expect("dial within deadline")
		.expect("dial succeeds")
}

async fn read_exact(tunnel: &TunnelConn, want: usize) -> Vec<u8> {
	let mut out = Vec::with_capacity(want);
	let mut buf = vec![0u8; 8192];
	while out.len() < want {
		let n = tokio::time::timeout(DEADLINE, tunnel.read(&mut buf))
			.await
			.expect("read within deadline")
			.expect("read succeeds");
		assert_ne!(n, 0, "unexpected EOF after {} of {want} bytes", out.len());
		out.extend_from_slice(&buf[..n]);
	}
	out
}

/// The S1 shape: handshake over WSS, request a TCP target, move bytes
/// both ways, byte-identical and in order.
#[test_log::test(tokio::test)]
async fn ws_tcp_tunnel_roundtrip() {
	let fixture = ws_fixture(false).await;
	let echo = tcp_echo_server().await;

	let tunnel = dial(&fixture).await;
	tokio::time::timeout(DEADLINE, tunnel.connect(echo.into(), b"GET / HTTP/1.1\r\n"))
		.await
		.expect("connect within deadline")
		.expect("connect succeeds");

	assert_eq!(read_exact(&tunnel, 16).await, b"GET / HTTP/1.1\r\n");

	// A larger payload survives re-framing.
	let blob: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
	tunnel.write(&blob).await.unwrap();
	assert_eq!(read_exact(&tunnel, blob.len()).await, blob);

	// Close is idempotent; using the tunnel afterwards fails closed.
	tunnel.close().await;
	tunnel.close().await;
	assert!(matches!(tunnel.write(b"late").await, Err(Error::Closed)));
	assert!(matches!(
		tunnel.connect(echo.into(), &[]).await,
		Err(Error::Closed)
	));
}

/// Double connect on a live tunnel is a recognizable error and does not
/// corrupt the stream.
#[test_log::test(tokio::test)]
async fn double_connect_rejected() {
	let fixture = ws_fixture(false).await;
	let echo = tcp_echo_server().await;

	let tunnel = dial(&fixture).await;
	tunnel.connect(echo.into(), &[]).await.unwrap();
	assert!(matches!(
		tunnel.connect(echo.into(), &[]).await,
		Err(Error::AlreadyConnected)
	));

	tunnel.write(b"still works").await.unwrap();
	assert_eq!(read_exact(&tunnel, 11).await, b"still works");
	tunnel.close().await;
}

/// The S5 shape: a UDP session through the tunnel answers repeatedly and
/// never fragments datagrams.
#[test_log::test(tokio::test)]
async fn ws_udp_session_survives_many_queries() {
	let fixture = ws_fixture(false).await;
	let echo = udp_echo_server().await;

	let tunnel = dial(&fixture).await;
	tokio::time::timeout(DEADLINE, tunnel.connect_udp(echo.into(), b"query-0"))
		.await
		.expect("connect within deadline")
		.expect("connect succeeds");

	let first = tokio::time::timeout(DEADLINE, tunnel.read_udp())
		.await
		.expect("reply within deadline")
		.expect("reply");
	assert_eq!(&first.payload[..], b"query-0");

	let target: TargetAddr = echo.into();
	for i in 1..=10 {
		let payload = format!("query-{i}");
		tunnel.write_udp(&target, payload.as_bytes()).await.unwrap();
		let reply = tokio::time::timeout(DEADLINE, tunnel.read_udp())
			.await
			.expect("reply within deadline")
			.expect("reply");
		assert_eq!(&reply.payload[..], payload.as_bytes());
		assert_eq!(reply.target, target);
	}
	tunnel.close().await;
}

/// With flow shaping enabled on both ends the padded stream still
/// reconstructs byte-identically (the unpad∘pad identity, end to end).
#[test_log::test(tokio::test)]
async fn flow_padding_roundtrips_through_stack() {
	let fixture = ws_fixture(true).await;
	let echo = tcp_echo_server().await;

	let tunnel = dial(&fixture).await;
	tunnel.connect(echo.into(), &[]).await.unwrap();

	for len in [1usize, 64, 1500, 40_000] {
		let payload: Vec<u8> = (0..len).map(|i| (i * 31 % 256) as u8).collect();
		tunnel.write(&payload).await.unwrap();
		assert_eq!(read_exact(&tunnel, len).await, payload, "len {len}");
	}
	tunnel.close().await;
}

/// A client with the wrong UUID is rejected with a response that never
/// verifies, carrying no hint of why.
#[test_log::test(tokio::test)]
async fn wrong_uuid_rejected_indistinguishably() {
	let fixture = ws_fixture(false).await;
	let echo = tcp_echo_server().await;

	let mut opts = TransportOpts::new(
		fixture.transport.opts().server.clone(),
		TunnelAuth::Ewp { uuid: Uuid::new_v4() },
	);
	opts.sni_override = Some("localhost".to_string());
	opts.extra_roots = fixture.transport.opts().extra_roots.clone();
	let stranger = Transport::new(CarrierKind::Ws, opts);

	let tunnel = tokio::time::timeout(DEADLINE, stranger.dial())
		.await
		.expect("dial within deadline")
		.expect("dial succeeds");
	let result = tokio::time::timeout(DEADLINE, tunnel.connect(echo.into(), &[]))
		.await
		.expect("connect within deadline");
	assert!(matches!(result, Err(Error::Handshake { .. })));
	tunnel.close().await;
}
