//! WebSocket carrier: one Binary message per logical frame, the auth token
//! rides in `Sec-WebSocket-Protocol` and the server reflects it back.

use bytes::Bytes;
use futures_util::{
	SinkExt, StreamExt,
	stream::{SplitSink, SplitStream},
};
use tokio_tungstenite::{
	WebSocketStream, accept_hdr_async, client_async,
	tungstenite::{
		self,
		client::IntoClientRequest,
		handshake::server::{ErrorResponse, Request, Response},
		http::{HeaderValue, StatusCode, header},
		protocol::Message,
	},
};
use veil_core::debug;

use crate::{
	error::{ConfigSnafu, Error, ProtocolViolation, Result},
	transport::{FrameReader, FrameWriter, StreamBox, TransportOpts},
};

pub type WsSink = SplitSink<WebSocketStream<StreamBox>, Message>;
pub type WsSource = SplitStream<WebSocketStream<StreamBox>>;

/// In-band close signal, kept for CDN paths that swallow Close frames.
const CLOSE_TEXT: &str = "CLOSE";
const ERROR_PREFIX: &str = "ERROR:";

fn map_ws_err(err: tungstenite::Error) -> Error {
	match err {
		tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => Error::Closed,
		tungstenite::Error::Io(io) => io.into(),
		other => std::io::Error::other(other).into(),
	}
}

pub(crate) async fn send_frame(sink: &mut WsSink, frame: Bytes) -> Result<()> {
	sink.send(Message::Binary(frame)).await.map_err(map_ws_err)
}

pub(crate) async fn send_ping(sink: &mut WsSink) -> Result<()> {
	sink.send(Message::Ping(Bytes::new())).await.map_err(map_ws_err)
}

pub(crate) async fn send_close(sink: &mut WsSink) -> Result<()> {
	// Best effort: the text signal first, then a real Close frame.
	let _ = sink.send(Message::Text(CLOSE_TEXT.into())).await;
	sink.send(Message::Close(None)).await.map_err(map_ws_err)
}

pub(crate) async fn recv_frame(source: &mut WsSource) -> Result<Option<Bytes>> {
	loop {
		let Some(message) = source.next().await else {
			return Ok(None);
		};
		match message.map_err(map_ws_err)? {
			Message::Binary(frame) => return Ok(Some(frame)),
			Message::Text(text) if text.as_str() == CLOSE_TEXT => return Ok(None),
			Message::Text(text) if text.as_str().starts_with(ERROR_PREFIX) => {
				return Err(std::io::Error::other(text.as_str().to_string()).into());
			}
			Message::Close(_) => return Ok(None),
			// Pings are answered by the protocol layer, stray text ignored.
			_ => continue,
		}
	}
}

/// Client side: WebSocket handshake over an already-established TLS stream.
pub async fn dial(opts: &TransportOpts, stream: StreamBox) -> Result<(FrameWriter, FrameReader)> {
	let authority = opts.authority();
	let uri = format!("wss://{authority}{}", opts.path);
	let mut request = uri.as_str().into_client_request().map_err(|err| {
		ConfigSnafu {
			reason: format!("bad websocket url {uri}: {err}"),
		}
		.build()
	})?;

	let token = opts.auth.token_string();
	let headers = request.headers_mut();
	headers.insert(
		header::SEC_WEBSOCKET_PROTOCOL,
		HeaderValue::from_str(&token).map_err(|_| {
			ConfigSnafu {
				reason: "auth token is not a valid header value".to_string(),
			}
			.build()
		})?,
	);
	if let Some(user_agent) = &opts.user_agent {
		if let Ok(value) = HeaderValue::from_str(user_agent) {
			headers.insert(header::USER_AGENT, value);
		}
	}
	if let Some(host) = &opts.host_override {
		if let Ok(value) = HeaderValue::from_str(host) {
			headers.insert(header::HOST, value);
		}
	}

	let (ws, response) = client_async(request, stream).await.map_err(map_ws_err)?;

	// The server must reflect our subprotocol.
	let echoed = response
		.headers()
		.get(header::SEC_WEBSOCKET_PROTOCOL)
		.and_then(|v| v.to_str().ok());
	if echoed != Some(token.as_str()) {
		return Err(Error::protocol(ProtocolViolation::UnexpectedFrame));
	}

	let (sink, source) = ws.split();
	Ok((FrameWriter::Ws(sink), FrameReader::Ws(source)))
}

/// Server side: upgrade an accepted TLS stream, checking the path and
/// reflecting the subprotocol. Unknown paths get the disguise page.
#[cfg(feature = "server")]
pub async fn accept(stream: StreamBox, path: &str) -> Result<(FrameWriter, FrameReader, Option<String>)> {
	use crate::server::http::{DISGUISE_BODY, HEALTH_PATHS};

	let mut subprotocol: Option<String> = None;
	let callback = |req: &Request, mut resp: Response| -> std::result::Result<Response, ErrorResponse> {
		let req_path = req.uri().path();
		if HEALTH_PATHS.contains(&req_path) {
			let mut health = ErrorResponse::new(Some("OK".to_string()));
			*health.status_mut() = StatusCode::OK;
			return Err(health);
		}
		if req_path != path {
			debug!(target: "[WS]", "unknown path {req_path}, serving disguise");
			let mut disguise = ErrorResponse::new(Some(DISGUISE_BODY.to_string()));
			*disguise.status_mut() = StatusCode::OK;
			disguise
				.headers_mut()
				.insert("server", HeaderValue::from_static("nginx/1.18.0"));
			return Err(disguise);
		}
		if let Some(proto) = req.headers().get(header::SEC_WEBSOCKET_PROTOCOL) {
			subprotocol = proto.to_str().ok().map(str::to_string);
			resp.headers_mut()
				.insert(header::SEC_WEBSOCKET_PROTOCOL, proto.clone());
		}
		Ok(resp)
	};

	let ws = accept_hdr_async(stream, callback).await.map_err(map_ws_err)?;
	let (sink, source) = ws.split();
	Ok((FrameWriter::Ws(sink), FrameReader::Ws(source), subprotocol))
}
