//! gRPC over HTTP/2 via raw `h2`: a single bidirectional stream named
//! `/{service}/Tunnel` carrying `SocketData` messages.

use std::{future::poll_fn, time::Duration};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use h2::{Ping, PingPong, RecvStream, SendStream, client};
use http::{Method, Request, Version, header};
use prost::Message as _;
use veil_core::debug;

use crate::{
	error::{Error, ProtocolViolation, Result},
	transport::{FrameReader, FrameWriter, StreamBox, TransportOpts},
};

pub const GRPC_CONTENT_TYPE: &str = "application/grpc";

const STREAM_WINDOW: u32 = 4 * 1024 * 1024;
const CONN_WINDOW: u32 = 16 * 1024 * 1024;
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);
const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);

/// The one message crossing the stream, `bytes content = 1`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SocketData {
	#[prost(bytes = "bytes", tag = "1")]
	pub content: Bytes,
}

pub fn tunnel_path(service: &str) -> String {
	format!("/{service}/Tunnel")
}

fn map_h2(err: h2::Error) -> Error {
	// A closing transport surfaces as EOF, not as a hard failure.
	if err.is_reset() || err.is_go_away() {
		return Error::Closed;
	}
	if err.is_io() {
		return err.into_io().map(Error::from).unwrap_or(Error::Closed);
	}
	std::io::Error::other(err).into()
}

/// `flag(1)=0 | len(4 BE) | SocketData` — shared with the gRPC-Web carrier.
pub(crate) fn encode_frame(content: Bytes) -> Result<Bytes> {
	let message = SocketData { content };
	let len = message.encoded_len();
	let mut buf = BytesMut::with_capacity(5 + len);
	buf.put_u8(0);
	buf.put_u32(len as u32);
	message
		.encode(&mut buf)
		.map_err(|_| Error::protocol(ProtocolViolation::UnexpectedFrame))?;
	Ok(buf.freeze())
}

/// Pulls one complete message out of `buf`, or `None` when more bytes are
/// needed.
pub(crate) fn decode_frame(buf: &mut BytesMut) -> Result<Option<Bytes>> {
	if buf.len() < 5 {
		return Ok(None);
	}
	let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
	if buf.len() < 5 + len {
		return Ok(None);
	}
	let mut frame = buf.split_to(5 + len);
	frame.advance(5);
	let message = SocketData::decode(frame.freeze())
		.map_err(|_| Error::protocol(ProtocolViolation::UnexpectedFrame))?;
	Ok(Some(message.content))
}

pub struct GrpcWriter {
	send: SendStream<Bytes>,
}

impl GrpcWriter {
	pub fn new(send: SendStream<Bytes>) -> Self {
		Self { send }
	}

	pub(crate) async fn send(&mut self, frame: Bytes) -> Result<()> {
		let mut data = encode_frame(frame)?;
		self.send.reserve_capacity(data.len());
		while !data.is_empty() {
			let granted = poll_fn(|cx| self.send.poll_capacity(cx))
				.await
				.ok_or(Error::Closed)?
				.map_err(map_h2)?;
			let chunk = data.split_to(granted.min(data.len()));
			self.send.send_data(chunk, false).map_err(map_h2)?;
			if !data.is_empty() {
				self.send.reserve_capacity(data.len());
			}
		}
		Ok(())
	}

	pub(crate) fn finish(&mut self) -> Result<()> {
		self.send.send_data(Bytes::new(), true).map_err(map_h2)
	}
}

pub struct GrpcReader {
	recv: RecvStream,
	buf:  BytesMut,
}

impl GrpcReader {
	pub fn new(recv: RecvStream) -> Self {
		Self {
			recv,
			buf: BytesMut::new(),
		}
	}

	pub(crate) async fn recv(&mut self) -> Result<Option<Bytes>> {
		loop {
			if let Some(content) = decode_frame(&mut self.buf)? {
				return Ok(Some(content));
			}
			match self.recv.data().await {
				Some(Ok(chunk)) => {
					let _ = self.recv.flow_control().release_capacity(chunk.len());
					self.buf.extend_from_slice(&chunk);
				}
				Some(Err(err)) => {
					return match map_h2(err) {
						Error::Closed => Ok(None),
						other => Err(other),
					};
				}
				None => return Ok(None),
			}
		}
	}
}

async fn keepalive(mut ping_pong: PingPong) {
	let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
	ticker.tick().await;
	loop {
		ticker.tick().await;
		match tokio::time::timeout(KEEPALIVE_TIMEOUT, ping_pong.ping(Ping::opaque())).await {
			Ok(Ok(_pong)) => {}
			Ok(Err(err)) => {
				debug!(target: "[GRPC]", "keepalive ping failed: {err}");
				break;
			}
			Err(_) => {
				debug!(target: "[GRPC]", "keepalive ping timed out");
				break;
			}
		}
	}
}

/// Client side: HTTP/2 handshake over an established TLS stream, then one
/// bidirectional `POST /{service}/Tunnel`.
pub async fn dial(opts: &TransportOpts, stream: StreamBox) -> Result<(FrameWriter, FrameReader)> {
	let (send_request, mut connection) = client::Builder::new()
		.initial_window_size(STREAM_WINDOW)
		.initial_connection_window_size(CONN_WINDOW)
		.handshake::<_, Bytes>(stream)
		.await
		.map_err(map_h2)?;

	let ping_pong = connection.ping_pong().ok_or(Error::Closed)?;
	tokio::spawn(async move {
		if let Err(err) = connection.await {
			debug!(target: "[GRPC]", "connection driver ended: {err}");
		}
	});
	tokio::spawn(keepalive(ping_pong));

	let mut send_request = send_request.ready().await.map_err(map_h2)?;

	let authority = match &opts.host_override {
		Some(host) => host.clone(),
		None => opts.authority(),
	};
	let uri = format!("https://{authority}{}", tunnel_path(&opts.service_name));
	let mut builder = Request::builder()
		.method(Method::POST)
		.version(Version::HTTP_2)
		.uri(uri)
		.header(
			header::CONTENT_TYPE,
			opts.content_type.as_deref().unwrap_or(GRPC_CONTENT_TYPE),
		)
		.header("te", "trailers");
	if let Some(user_agent) = &opts.user_agent {
		builder = builder.header(header::USER_AGENT, user_agent);
	}
	let request = builder.body(()).expect("static request");

	let (response, send) = send_request.send_request(request, false).map_err(map_h2)?;
	let response = response.await.map_err(map_h2)?;
	if !response.status().is_success() {
		return Err(std::io::Error::other(format!("grpc tunnel refused: {}", response.status())).into());
	}
	let recv = response.into_body();

	Ok((
		FrameWriter::Grpc(GrpcWriter::new(send)),
		FrameReader::Grpc(GrpcReader::new(recv)),
	))
}

/// Server side: accept streams on one HTTP/2 connection, handing tunnel
/// streams to `on_tunnel` and disguising everything else.
#[cfg(feature = "server")]
pub async fn serve_connection<F>(stream: StreamBox, service: &str, mut on_tunnel: F) -> Result<()>
where
	F: FnMut(crate::transport::ServerTunnel),
{
	use http::{Response, StatusCode};

	use crate::server::http::{DISGUISE_BODY, HEALTH_PATHS};

	let mut conn = h2::server::Builder::new()
		.initial_window_size(STREAM_WINDOW)
		.initial_connection_window_size(CONN_WINDOW)
		.handshake::<_, Bytes>(stream)
		.await
		.map_err(map_h2)?;

	let path = tunnel_path(service);
	while let Some(accepted) = conn.accept().await {
		let (request, mut respond) = accepted.map_err(map_h2)?;
		let req_path = request.uri().path();

		if req_path == path && request.method() == Method::POST {
			let response = Response::builder()
				.status(StatusCode::OK)
				.header(header::CONTENT_TYPE, GRPC_CONTENT_TYPE)
				.body(())
				.expect("static response");
			let recv = request.into_body();
			let send = respond.send_response(response, false).map_err(map_h2)?;
			on_tunnel(crate::transport::ServerTunnel::new(
				FrameWriter::Grpc(GrpcWriter::new(send)),
				FrameReader::Grpc(GrpcReader::new(recv)),
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
		if let Ok(mut send) = respond.send_response(response, false) {
			let _ = send.send_data(Bytes::from_static(body.as_bytes()), true);
		}
	}
	Ok(())
}

#[cfg(test)]
mod test {
	use bytes::{Bytes, BytesMut};

	use super::{decode_frame, encode_frame};

	#[test]
	fn frame_roundtrip() {
		let wire = encode_frame(Bytes::from_static(b"payload")).unwrap();
		assert_eq!(wire[0], 0);
		let mut buf = BytesMut::from(&wire[..]);
		let content = decode_frame(&mut buf).unwrap().unwrap();
		assert_eq!(&content[..], b"payload");
		assert!(buf.is_empty());
	}

	#[test]
	fn partial_frame_waits() {
		let wire = encode_frame(Bytes::from_static(b"partial test")).unwrap();
		let mut buf = BytesMut::from(&wire[..wire.len() - 1]);
		assert!(decode_frame(&mut buf).unwrap().is_none());
		buf.extend_from_slice(&wire[wire.len() - 1..]);
		assert_eq!(
			&decode_frame(&mut buf).unwrap().unwrap()[..],
			b"partial test"
		);
	}
}
