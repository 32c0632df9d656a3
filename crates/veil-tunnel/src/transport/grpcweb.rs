//! gRPC-Web over HTTP/3: a single `POST /{service}/Tunnel` whose request
//! body is fed by writes and whose response body is drained by reads. The
//! server handler is native gRPC-Web and never requires HTTP/2.

use std::{
	future::poll_fn,
	net::{Ipv4Addr, SocketAddr},
	sync::Arc,
	time::Duration,
};

use bytes::{BufMut, Bytes, BytesMut};
use http::{Method, Request, header};
use veil_core::debug;

use crate::{
	error::{ConfigSnafu, Error, Result},
	transport::{
		FrameReader, FrameWriter, TransportOpts,
		grpc::{decode_frame, encode_frame, tunnel_path},
	},
};

pub const GRPC_WEB_CONTENT_TYPE: &str = "application/grpc-web+proto";

const QUIC_KEEPALIVE: Duration = Duration::from_secs(20);
const QUIC_MAX_IDLE: Duration = Duration::from_secs(45);
/// Deadline for the server to acknowledge the tunnel request.
const READY_TIMEOUT: Duration = Duration::from_secs(10);

fn map_h3<E>(err: E) -> Error
where
	E: std::error::Error + Send + Sync + 'static,
{
	std::io::Error::other(err).into()
}

pub struct H3ClientWriter {
	stream: h3::client::RequestStream<h3_quinn::SendStream<Bytes>, Bytes>,
	// Dropping the endpoint would tear the connection down under us.
	_endpoint: quinn::Endpoint,
}

impl H3ClientWriter {
	pub(crate) async fn send(&mut self, frame: Bytes) -> Result<()> {
		let data = encode_frame(frame)?;
		self.stream.send_data(data).await.map_err(map_h3)
	}

	pub(crate) async fn finish(&mut self) -> Result<()> {
		self.stream.finish().await.map_err(map_h3)
	}
}

pub struct H3ClientReader {
	stream: h3::client::RequestStream<h3_quinn::RecvStream, Bytes>,
	buf:    BytesMut,
}

impl H3ClientReader {
	pub(crate) async fn recv(&mut self) -> Result<Option<Bytes>> {
		loop {
			if let Some(content) = decode_frame(&mut self.buf)? {
				return Ok(Some(content));
			}
			match self.stream.recv_data().await.map_err(map_h3)? {
				Some(chunk) => self.buf.put(chunk),
				None => return Ok(None),
			}
		}
	}
}

pub struct H3ServerWriter {
	stream: h3::server::RequestStream<h3_quinn::SendStream<Bytes>, Bytes>,
}

impl H3ServerWriter {
	pub(crate) async fn send(&mut self, frame: Bytes) -> Result<()> {
		let data = encode_frame(frame)?;
		self.stream.send_data(data).await.map_err(map_h3)
	}

	pub(crate) async fn finish(&mut self) -> Result<()> {
		self.stream.finish().await.map_err(map_h3)
	}
}

pub struct H3ServerReader {
	stream: h3::server::RequestStream<h3_quinn::RecvStream, Bytes>,
	buf:    BytesMut,
}

impl H3ServerReader {
	pub(crate) async fn recv(&mut self) -> Result<Option<Bytes>> {
		loop {
			if let Some(content) = decode_frame(&mut self.buf)? {
				return Ok(Some(content));
			}
			match self.stream.recv_data().await.map_err(map_h3)? {
				Some(chunk) => self.buf.put(chunk),
				None => return Ok(None),
			}
		}
	}
}

pub(crate) fn quic_transport_config() -> Result<quinn::TransportConfig> {
	let mut transport = quinn::TransportConfig::default();
	transport
		.keep_alive_interval(Some(QUIC_KEEPALIVE))
		.max_idle_timeout(Some(quinn::IdleTimeout::try_from(QUIC_MAX_IDLE).map_err(|_| {
			ConfigSnafu {
				reason: "idle timeout out of range".to_string(),
			}
			.build()
		})?));
	Ok(transport)
}

/// Client side: own QUIC endpoint, one connection, one request.
pub async fn dial(
	opts: &TransportOpts,
	tls: rustls::ClientConfig,
	server_addr: SocketAddr,
) -> Result<(FrameWriter, FrameReader)> {
	let mut tls = tls;
	tls.alpn_protocols = vec![b"h3".to_vec()];

	let quic_tls = quinn::crypto::rustls::QuicClientConfig::try_from(tls).map_err(|err| {
		ConfigSnafu {
			reason: format!("tls config rejected for quic: {err}"),
		}
		.build()
	})?;
	let mut client_config = quinn::ClientConfig::new(Arc::new(quic_tls));
	client_config.transport_config(Arc::new(quic_transport_config()?));

	let mut endpoint = quinn::Endpoint::client(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))?;
	endpoint.set_default_client_config(client_config);

	let sni = opts.tls_server_name();
	let ech_offered = opts.ech.is_some();
	let connection = endpoint
		.connect(server_addr, &sni)
		.map_err(|err| {
			ConfigSnafu {
				reason: format!("quic connect to {server_addr}: {err}"),
			}
			.build()
		})?
		.await
		.map_err(|err| {
			if ech_offered && crate::transport::ech::is_quic_ech_rejection(&err) {
				crate::error::EchRejectedSnafu {
					retry_available: true,
				}
				.build()
			} else {
				map_h3(err)
			}
		})?;

	let h3_conn = h3_quinn::Connection::new(connection);
	let (mut driver, mut send_request) = h3::client::new(h3_conn).await.map_err(map_h3)?;
	tokio::spawn(async move {
		let err = poll_fn(|cx| driver.poll_close(cx)).await;
		debug!(target: "[H3]", "connection driver ended: {err}");
	});

	let authority = match &opts.host_override {
		Some(host) => host.clone(),
		None => opts.authority(),
	};
	let uri = format!("https://{authority}{}", tunnel_path(&opts.service_name));
	let mut builder = Request::builder().method(Method::POST).uri(uri).header(
		header::CONTENT_TYPE,
		opts.content_type.as_deref().unwrap_or(GRPC_WEB_CONTENT_TYPE),
	);
	if let Some(user_agent) = &opts.user_agent {
		builder = builder.header(header::USER_AGENT, user_agent);
	}
	let request = builder.body(()).expect("static request");

	let mut stream = send_request.send_request(request).await.map_err(map_h3)?;
	let response = tokio::time::timeout(READY_TIMEOUT, stream.recv_response())
		.await
		.map_err(|_| Error::from(std::io::Error::new(std::io::ErrorKind::TimedOut, "h3 tunnel not ready")))?
		.map_err(map_h3)?;
	if !response.status().is_success() {
		return Err(std::io::Error::other(format!("h3 tunnel refused: {}", response.status())).into());
	}

	let (send, recv) = stream.split();
	Ok((
		FrameWriter::H3Client(H3ClientWriter {
			stream:    send,
			_endpoint: endpoint,
		}),
		FrameReader::H3Client(H3ClientReader {
			stream: recv,
			buf:    BytesMut::new(),
		}),
	))
}

/// Server side: drive one QUIC connection's requests, handing tunnel
/// streams to `on_tunnel` and disguising everything else.
#[cfg(feature = "server")]
pub async fn serve_connection<F>(connection: quinn::Connection, service: &str, mut on_tunnel: F) -> Result<()>
where
	F: FnMut(crate::transport::ServerTunnel),
{
	use http::{Response, StatusCode};

	use crate::server::http::{DISGUISE_BODY, HEALTH_PATHS};

	let mut h3_conn = h3::server::builder()
		.build::<_, Bytes>(h3_quinn::Connection::new(connection))
		.await
		.map_err(map_h3)?;

	let path = tunnel_path(service);
	loop {
		match h3_conn.accept().await {
			Ok(Some(resolver)) => {
				let (request, mut stream) = match resolver.resolve_request().await {
					Ok(v) => v,
					Err(err) => {
						debug!(target: "[H3]", "resolve request failed: {err}");
						continue;
					}
				};
				let req_path = request.uri().path();

				if req_path == path && request.method() == Method::POST {
					let response = Response::builder()
						.status(StatusCode::OK)
						.header(header::CONTENT_TYPE, GRPC_WEB_CONTENT_TYPE)
						.body(())
						.expect("static response");
					stream.send_response(response).await.map_err(map_h3)?;
					let (send, recv) = stream.split();
					on_tunnel(crate::transport::ServerTunnel::new(
						FrameWriter::H3Server(H3ServerWriter { stream: send }),
						FrameReader::H3Server(H3ServerReader {
							stream: recv,
							buf:    BytesMut::new(),
						}),
					));
					continue;
				}

				let body: &'static str = if HEALTH_PATHS.contains(&req_path) {
					"OK"
				} else {
					DISGUISE_BODY
				};
				let response = Response::builder()
					.status(StatusCode::OK)
					.header("server", "nginx/1.18.0")
					.header(header::CONTENT_TYPE, "text/html")
					.body(())
					.expect("static response");
				if stream.send_response(response).await.is_ok() {
					let _ = stream.send_data(Bytes::from_static(body.as_bytes())).await;
					let _ = stream.finish().await;
				}
			}
			Ok(None) => break,
			Err(err) => {
				debug!(target: "[H3]", "connection ended: {err}");
				break;
			}
		}
	}
	Ok(())
}
