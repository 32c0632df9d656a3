//! XHTTP carrier.
//!
//! Two shapes: *stream-one* is a single `POST` whose request body carries
//! uplink and whose response body carries downlink; *stream-down* splits
//! the tunnel into one long-lived `GET` (downlink) plus a sequence of
//! numbered `POST`s (uplink) that the server drains strictly in order.
//! Stream directions carry frames behind a 4-byte length prefix since HTTP
//! bodies do not preserve message boundaries.

use std::convert::Infallible;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use http::{Method, Request, header};
use http_body_util::{BodyExt, Full, StreamBody, combinators::BoxBody};
use hyper::body::Frame;
use hyper_util::rt::{TokioExecutor, TokioIo};
use rand::{Rng, RngCore};
use tokio::sync::mpsc;
use tokio_stream::{StreamExt, wrappers::ReceiverStream};
use veil_core::debug;

use crate::{
	error::{Error, Result},
	transport::{FrameReader, FrameWriter, StreamBox, TransportOpts},
};

pub const X_AUTH_TOKEN: &str = "x-auth-token";
pub const X_PADDING: &str = "x_padding";
pub const DEFAULT_PADDING_MIN: usize = 100;
pub const DEFAULT_PADDING_MAX: usize = 1000;

type ClientBody = BoxBody<Bytes, Infallible>;
type FrameBody = BoxBody<Bytes, std::io::Error>;

fn map_hyper(err: hyper::Error) -> Error {
	std::io::Error::other(err).into()
}

/// Cryptographically random query padding, never clock-derived.
pub(crate) fn padding_value(min: usize, max: usize) -> String {
	let mut rng = rand::rng();
	let len = rng.random_range(min..=max.max(min));
	(0..len).map(|_| rng.sample(rand::distr::Alphanumeric) as char).collect()
}

fn empty_body() -> ClientBody {
	http_body_util::Empty::new().boxed()
}

fn full_body(bytes: Bytes) -> ClientBody {
	Full::new(bytes).boxed()
}

/// Length-prefixed frame sink feeding an HTTP body channel. Used by the
/// stream-one client uplink and every server downlink.
pub struct BodyWriter {
	tx: Option<mpsc::Sender<Bytes>>,
}

impl BodyWriter {
	pub fn new(tx: mpsc::Sender<Bytes>) -> Self {
		Self { tx: Some(tx) }
	}

	pub(crate) async fn send(&mut self, frame: Bytes) -> Result<()> {
		let tx = self.tx.as_ref().ok_or(Error::Closed)?;
		let mut buf = BytesMut::with_capacity(4 + frame.len());
		buf.put_u32(frame.len() as u32);
		buf.put_slice(&frame);
		tx.send(buf.freeze()).await.map_err(|_| Error::Closed)
	}

	/// Closing the channel ends the HTTP body, unblocking the peer.
	pub(crate) fn finish(&mut self) {
		self.tx = None;
	}
}

/// Length-prefixed frame source over an HTTP body.
pub struct BodyReader {
	body: FrameBody,
	buf:  BytesMut,
}

impl BodyReader {
	pub fn from_incoming(body: hyper::body::Incoming) -> Self {
		Self::from_body(body.map_err(std::io::Error::other).boxed())
	}

	pub fn from_body(body: FrameBody) -> Self {
		Self {
			body,
			buf: BytesMut::new(),
		}
	}

	pub(crate) async fn recv(&mut self) -> Result<Option<Bytes>> {
		loop {
			if self.buf.len() >= 4 {
				let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
				if self.buf.len() >= 4 + len {
					let mut frame = self.buf.split_to(4 + len);
					frame.advance(4);
					return Ok(Some(frame.freeze()));
				}
			}
			match self.body.frame().await {
				Some(Ok(frame)) => {
					if let Ok(data) = frame.into_data() {
						self.buf.extend_from_slice(&data);
					}
				}
				Some(Err(err)) => {
					if veil_core::io::is_benign_close(&err) {
						return Ok(None);
					}
					return Err(err.into());
				}
				None => {
					if self.buf.is_empty() {
						return Ok(None);
					}
					return Err(Error::BytesRemaining);
				}
			}
		}
	}
}

async fn http2_handshake(stream: StreamBox) -> Result<hyper::client::conn::http2::SendRequest<ClientBody>> {
	let (send_request, connection) =
		hyper::client::conn::http2::handshake(TokioExecutor::new(), TokioIo::new(stream))
			.await
			.map_err(map_hyper)?;
	tokio::spawn(async move {
		if let Err(err) = connection.await {
			debug!(target: "[XHTTP]", "connection driver ended: {err}");
		}
	});
	Ok(send_request)
}

fn apply_common_headers(mut builder: http::request::Builder, opts: &TransportOpts) -> http::request::Builder {
	builder = builder.header(X_AUTH_TOKEN, opts.auth.token_string());
	builder = builder.header(
		header::CONTENT_TYPE,
		opts.content_type.as_deref().unwrap_or("application/octet-stream"),
	);
	if let Some(user_agent) = &opts.user_agent {
		builder = builder.header(header::USER_AGENT, user_agent);
	}
	builder
}

fn client_authority(opts: &TransportOpts) -> String {
	match &opts.host_override {
		Some(host) => host.clone(),
		None => opts.authority(),
	}
}

/// stream-one: one POST carrying both directions.
pub async fn dial_stream_one(opts: &TransportOpts, stream: StreamBox) -> Result<(FrameWriter, FrameReader)> {
	let mut send_request = http2_handshake(stream).await?;

	let (tx, rx) = mpsc::channel::<Bytes>(16);
	let uplink = StreamBody::new(ReceiverStream::new(rx).map(|b| Ok::<_, Infallible>(Frame::data(b))));

	let pad = padding_value(opts.padding_min, opts.padding_max);
	let uri = format!("https://{}{}?{}={}", client_authority(opts), opts.path, X_PADDING, pad);
	let request = apply_common_headers(Request::builder().method(Method::POST).uri(uri), opts)
		.body(uplink.boxed())
		.expect("static request");

	send_request.ready().await.map_err(map_hyper)?;
	let response = send_request.send_request(request).await.map_err(map_hyper)?;
	if !response.status().is_success() {
		return Err(std::io::Error::other(format!("xhttp refused: {}", response.status())).into());
	}

	Ok((
		FrameWriter::Body(BodyWriter::new(tx)),
		FrameReader::Body(BodyReader::from_incoming(response.into_body())),
	))
}

/// stream-down: long-lived GET downlink plus numbered POST uplink.
pub async fn dial_stream_down(opts: &TransportOpts, stream: StreamBox) -> Result<(FrameWriter, FrameReader)> {
	let mut send_request = http2_handshake(stream).await?;

	let mut sid_bytes = [0u8; 8];
	rand::rng().fill_bytes(&mut sid_bytes);
	let session_id = hex::encode(sid_bytes);

	let pad = padding_value(opts.padding_min, opts.padding_max);
	let uri = format!(
		"https://{}{}/{}?{}={}",
		client_authority(opts),
		opts.path,
		session_id,
		X_PADDING,
		pad
	);
	let request = apply_common_headers(Request::builder().method(Method::GET).uri(uri), opts)
		.body(empty_body())
		.expect("static request");

	send_request.ready().await.map_err(map_hyper)?;
	let response = send_request.send_request(request).await.map_err(map_hyper)?;
	if !response.status().is_success() {
		return Err(std::io::Error::other(format!("xhttp downlink refused: {}", response.status())).into());
	}
	let reader = BodyReader::from_incoming(response.into_body());

	let poster = XhttpPoster {
		send_request,
		authority: client_authority(opts),
		path: opts.path.clone(),
		session_id,
		seq: 0,
		token: opts.auth.token_string(),
		content_type: opts.content_type.clone(),
		user_agent: opts.user_agent.clone(),
		padding_min: opts.padding_min,
		padding_max: opts.padding_max,
	};

	Ok((FrameWriter::XhttpPost(poster), FrameReader::Body(reader)))
}

/// Uplink half of stream-down: each frame becomes `POST /path/{sid}/{seq}`,
/// seq strictly monotonic from 0 (the handshake frame).
pub struct XhttpPoster {
	send_request: hyper::client::conn::http2::SendRequest<ClientBody>,
	authority:    String,
	path:         String,
	session_id:   String,
	seq:          u64,
	token:        String,
	content_type: Option<String>,
	user_agent:   Option<String>,
	padding_min:  usize,
	padding_max:  usize,
}

impl XhttpPoster {
	pub(crate) async fn send(&mut self, frame: Bytes) -> Result<()> {
		let seq = self.seq;
		self.seq += 1;

		let pad = padding_value(self.padding_min, self.padding_max);
		let uri = format!(
			"https://{}{}/{}/{}?{}={}",
			self.authority, self.path, self.session_id, seq, X_PADDING, pad
		);
		let mut builder = Request::builder()
			.method(Method::POST)
			.uri(uri)
			.header(X_AUTH_TOKEN, &self.token)
			.header(
				header::CONTENT_TYPE,
				self.content_type.as_deref().unwrap_or("application/octet-stream"),
			);
		if let Some(user_agent) = &self.user_agent {
			builder = builder.header(header::USER_AGENT, user_agent);
		}
		let request = builder.body(full_body(frame)).expect("static request");

		self.send_request.ready().await.map_err(map_hyper)?;
		let response = self.send_request.send_request(request).await.map_err(map_hyper)?;
		if !response.status().is_success() {
			return Err(std::io::Error::other(format!("xhttp upload refused: {}", response.status())).into());
		}
		Ok(())
	}
}

#[cfg(feature = "server")]
pub use server_side::{XhttpServer, XhttpServerOpts};

#[cfg(feature = "server")]
mod server_side {
	use std::{
		cmp::Reverse,
		collections::{BinaryHeap, HashMap},
		net::IpAddr,
		sync::Arc,
		time::{Duration, Instant},
	};

	use bytes::Bytes;
	use http::{Request, Response, StatusCode, header};
	use http_body_util::{BodyExt, Limited};
	use hyper::body::Body;
	use tokio::sync::{Mutex, mpsc};
	use tokio_util::sync::CancellationToken;
	use veil_core::debug;

	use super::{BodyReader, BodyWriter, X_AUTH_TOKEN};
	use crate::{
		server::http::{ServerBody, disguise_response, empty_response, health_response, text_response},
		transport::{FrameReader, FrameWriter, ServerTunnel},
	};

	pub struct XhttpServerOpts {
		pub path:           String,
		pub padding_min:    usize,
		pub padding_max:    usize,
		/// Accepted `X-Auth-Token` values (UUIDs or Trojan keys).
		pub tokens:         Vec<String>,
		/// Sessions not fully connected by then are reaped.
		pub session_ttl:    Duration,
		pub max_post_bytes: usize,
	}

	impl Default for XhttpServerOpts {
		fn default() -> Self {
			Self {
				path:           "/xhttp".to_string(),
				padding_min:    super::DEFAULT_PADDING_MIN,
				padding_max:    super::DEFAULT_PADDING_MAX,
				tokens:         Vec::new(),
				session_ttl:    Duration::from_secs(30),
				max_post_bytes: 2 * 1024 * 1024,
			}
		}
	}

	struct SeqFrame {
		seq:   u64,
		frame: Bytes,
	}

	impl PartialEq for SeqFrame {
		fn eq(&self, other: &Self) -> bool {
			self.seq == other.seq
		}
	}
	impl Eq for SeqFrame {}
	impl PartialOrd for SeqFrame {
		fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
			Some(self.cmp(other))
		}
	}
	impl Ord for SeqFrame {
		fn cmp(&self, other: &Self) -> std::cmp::Ordering {
			self.seq.cmp(&other.seq)
		}
	}

	struct Session {
		uplink:    mpsc::Sender<Bytes>,
		/// Out-of-order uploads parked until their turn (min-heap on seq).
		pending:   BinaryHeap<Reverse<SeqFrame>>,
		next_seq:  u64,
		downlink:  Option<mpsc::Receiver<Bytes>>,
		attached:  bool,
		saw_post:  bool,
		created:   Instant,
	}

	impl Session {
		fn fully_connected(&self) -> bool {
			self.attached && self.saw_post
		}
	}

	/// Session registry for the split shape plus the request handler for
	/// both shapes. Accepted tunnels are handed out through a channel so
	/// the listener owns establishment.
	pub struct XhttpServer {
		opts:     XhttpServerOpts,
		sessions: Mutex<HashMap<String, Session>>,
		tunnels:  mpsc::Sender<(ServerTunnel, IpAddr)>,
	}

	impl XhttpServer {
		pub fn new(opts: XhttpServerOpts, tunnels: mpsc::Sender<(ServerTunnel, IpAddr)>) -> Arc<Self> {
			Arc::new(Self {
				opts,
				sessions: Mutex::new(HashMap::new()),
				tunnels,
			})
		}

		/// Reaps half-open sessions: 30 s after creation unless both the
		/// downlink GET and a first POST arrived.
		pub fn spawn_reaper(self: &Arc<Self>, token: CancellationToken) {
			let this = self.clone();
			tokio::spawn(async move {
				let mut ticker = tokio::time::interval(Duration::from_secs(5));
				loop {
					tokio::select! {
						_ = token.cancelled() => break,
						_ = ticker.tick() => {
							let ttl = this.opts.session_ttl;
							let mut sessions = this.sessions.lock().await;
							sessions.retain(|sid, session| {
								if session.uplink.is_closed() {
									debug!(target: "[XHTTP]", "session {sid} tunnel ended");
									return false;
								}
								if !session.fully_connected() && session.created.elapsed() > ttl {
									debug!(target: "[XHTTP]", "session {sid} reaped half-open");
									return false;
								}
								true
							});
						}
					}
				}
			});
		}

		pub async fn handle<B>(self: &Arc<Self>, req: Request<B>, peer: IpAddr) -> Response<ServerBody>
		where
			B: Body<Data = Bytes> + Send + Sync + 'static,
			B::Error: std::error::Error + Send + Sync + 'static,
		{
			let path = req.uri().path().to_string();
			if crate::server::http::HEALTH_PATHS.contains(&path.as_str()) {
				return health_response();
			}
			if path != self.opts.path && !path.starts_with(&format!("{}/", self.opts.path)) {
				return disguise_response();
			}

			// The padding length proves the client shapes its requests.
			if !padding_ok(&req, self.opts.padding_min, self.opts.padding_max) {
				return text_response(StatusCode::BAD_REQUEST, "Bad Request");
			}
			let token_ok = req
				.headers()
				.get(X_AUTH_TOKEN)
				.and_then(|v| v.to_str().ok())
				.map(|t| self.opts.tokens.iter().any(|k| k == t))
				.unwrap_or(false);
			if !token_ok {
				debug!(target: "[XHTTP]", "bad auth token on {path}");
				return disguise_response();
			}

			let rest = path[self.opts.path.len()..].trim_start_matches('/');
			let segments: Vec<&str> = if rest.is_empty() { Vec::new() } else { rest.split('/').collect() };
			let method = req.method().clone();

			match segments.as_slice() {
				[] if method == http::Method::POST => self.stream_one(req, peer).await,
				[sid] if method == http::Method::GET && valid_session_id(sid) => {
					self.attach_downlink(sid, peer).await
				}
				[sid, seq] if method == http::Method::POST && valid_session_id(sid) => {
					let Ok(seq) = seq.parse::<u64>() else {
						return text_response(StatusCode::BAD_REQUEST, "Bad Request");
					};
					let (sid, seq) = (sid.to_string(), seq);
					let body = match Limited::new(req.into_body(), self.opts.max_post_bytes).collect().await {
						Ok(collected) => collected.to_bytes(),
						Err(_) => return text_response(StatusCode::BAD_REQUEST, "Bad Request"),
					};
					self.push_upload(&sid, seq, body, peer).await
				}
				_ => disguise_response(),
			}
		}

		/// One POST carrying both directions.
		async fn stream_one<B>(self: &Arc<Self>, req: Request<B>, peer: IpAddr) -> Response<ServerBody>
		where
			B: Body<Data = Bytes> + Send + Sync + 'static,
			B::Error: std::error::Error + Send + Sync + 'static,
		{
			let (downlink_tx, downlink_rx) = mpsc::channel::<Bytes>(16);
			let reader = BodyReader::from_body(req.into_body().map_err(std::io::Error::other).boxed());
			let tunnel = ServerTunnel::new(
				FrameWriter::Body(BodyWriter::new(downlink_tx)),
				FrameReader::Body(reader),
			);
			if self.tunnels.send((tunnel, peer)).await.is_err() {
				return text_response(StatusCode::SERVICE_UNAVAILABLE, "unavailable");
			}
			crate::server::http::stream_response(downlink_rx)
		}

		async fn session_entry(self: &Arc<Self>, sid: &str, peer: IpAddr) -> bool {
			let mut sessions = self.sessions.lock().await;
			if sessions.contains_key(sid) {
				return true;
			}
			let (uplink_tx, uplink_rx) = mpsc::channel::<Bytes>(64);
			let (downlink_tx, downlink_rx) = mpsc::channel::<Bytes>(16);
			let tunnel = ServerTunnel::new(
				FrameWriter::Body(BodyWriter::new(downlink_tx)),
				FrameReader::Channel(uplink_rx),
			);
			if self.tunnels.try_send((tunnel, peer)).is_err() {
				return false;
			}
			sessions.insert(
				sid.to_string(),
				Session {
					uplink:    uplink_tx,
					pending:   BinaryHeap::new(),
					next_seq:  0,
					downlink:  Some(downlink_rx),
					attached:  false,
					saw_post:  false,
					created:   Instant::now(),
				},
			);
			true
		}

		async fn attach_downlink(self: &Arc<Self>, sid: &str, peer: IpAddr) -> Response<ServerBody> {
			if !self.session_entry(sid, peer).await {
				return text_response(StatusCode::SERVICE_UNAVAILABLE, "unavailable");
			}
			let mut sessions = self.sessions.lock().await;
			let Some(session) = sessions.get_mut(sid) else {
				return text_response(StatusCode::BAD_REQUEST, "Bad Request");
			};
			let Some(downlink_rx) = session.downlink.take() else {
				// A second GET for the same session is a protocol error.
				return text_response(StatusCode::BAD_REQUEST, "Bad Request");
			};
			session.attached = true;
			crate::server::http::stream_response(downlink_rx)
		}

		/// Queues one upload and drains the heap strictly in seq order. The
		/// registry lock is held across the drain so concurrent posts for
		/// one session cannot interleave their frames.
		async fn push_upload(self: &Arc<Self>, sid: &str, seq: u64, frame: Bytes, peer: IpAddr) -> Response<ServerBody> {
			if !self.session_entry(sid, peer).await {
				return text_response(StatusCode::SERVICE_UNAVAILABLE, "unavailable");
			}
			let mut sessions = self.sessions.lock().await;
			let (uplink, ready) = {
				let Some(session) = sessions.get_mut(sid) else {
					return text_response(StatusCode::BAD_REQUEST, "Bad Request");
				};
				session.saw_post = true;
				if seq < session.next_seq {
					// Duplicate delivery, drop silently.
					return empty_response();
				}
				session.pending.push(Reverse(SeqFrame { seq, frame }));
				let mut ready = Vec::new();
				while session
					.pending
					.peek()
					.is_some_and(|Reverse(head)| head.seq == session.next_seq)
				{
					let Some(Reverse(head)) = session.pending.pop() else {
						break;
					};
					ready.push(head.frame);
					session.next_seq += 1;
				}
				(session.uplink.clone(), ready)
			};
			for frame in ready {
				if uplink.send(frame).await.is_err() {
					sessions.remove(sid);
					return text_response(StatusCode::SERVICE_UNAVAILABLE, "unavailable");
				}
			}
			empty_response()
		}
	}

	fn valid_session_id(sid: &str) -> bool {
		sid.len() == 16 && sid.bytes().all(|b| b.is_ascii_hexdigit())
	}

	fn x_padding_len(query: &str) -> Option<usize> {
		query
			.split('&')
			.find_map(|kv| kv.strip_prefix("x_padding=").map(str::len))
	}

	/// `x_padding` length must lie within bounds, read from the query or,
	/// failing that, from the `Referer` URL.
	fn padding_ok<B>(req: &Request<B>, min: usize, max: usize) -> bool {
		let from_query = req.uri().query().and_then(x_padding_len);
		let len = from_query.or_else(|| {
			req.headers()
				.get(header::REFERER)
				.and_then(|v| v.to_str().ok())
				.and_then(|referer| referer.split_once('?').map(|(_, q)| q))
				.and_then(x_padding_len)
		});
		matches!(len, Some(len) if (min..=max).contains(&len))
	}
}

#[cfg(all(test, feature = "server"))]
mod server_test {
	use std::time::Duration;

	use bytes::Bytes;
	use http::{Method, Request, StatusCode};
	use http_body_util::Full;
	use tokio::sync::mpsc;

	use super::{XhttpServer, XhttpServerOpts};

	const SID: &str = "00112233aabbccdd";
	const TOKEN: &str = "d342d11e-d424-4583-b36e-524ab1f0afa4";

	const PEER: std::net::IpAddr = std::net::IpAddr::V4(std::net::Ipv4Addr::new(198, 51, 100, 7));

	fn server() -> (
		std::sync::Arc<XhttpServer>,
		mpsc::Receiver<(crate::transport::ServerTunnel, std::net::IpAddr)>,
	) {
		let (tx, rx) = mpsc::channel(4);
		let opts = XhttpServerOpts {
			tokens: vec![TOKEN.to_string()],
			session_ttl: Duration::from_secs(30),
			..Default::default()
		};
		(XhttpServer::new(opts, tx), rx)
	}

	fn upload(sid: &str, seq: u64, payload: &str, padding: usize) -> Request<Full<Bytes>> {
		Request::builder()
			.method(Method::POST)
			.uri(format!(
				"https://cdn.example/xhttp/{sid}/{seq}?x_padding={}",
				"p".repeat(padding)
			))
			.header(super::X_AUTH_TOKEN, TOKEN)
			.body(Full::new(Bytes::copy_from_slice(payload.as_bytes())))
			.unwrap()
	}

	/// Out-of-order uploads must reach the tunnel strictly in seq order.
	#[test_log::test(tokio::test)]
	async fn split_uploads_drain_in_order() {
		let (server, mut tunnels) = server();

		// hello world!, posted as 2, 0, 1, 3
		for (seq, payload) in [(2u64, "wor"), (0, "hello"), (1, " "), (3, "ld!")] {
			let resp = server.handle(upload(SID, seq, payload, 150), PEER).await;
			assert_eq!(resp.status(), StatusCode::OK, "seq {seq}");
		}

		let (mut tunnel, peer) = tunnels.recv().await.expect("tunnel created");
		assert_eq!(peer, PEER);
		let mut assembled = Vec::new();
		for _ in 0..4 {
			let frame = tunnel.recv_frame().await.unwrap().expect("frame");
			assembled.extend_from_slice(&frame);
		}
		assert_eq!(assembled, b"hello world!");
	}

	/// `x_padding` outside [min, max] is rejected with 400.
	#[test_log::test(tokio::test)]
	async fn bad_padding_rejected() {
		let (server, _tunnels) = server();

		let resp = server.handle(upload(SID, 0, "x", 3), PEER).await;
		assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

		let resp = server.handle(upload(SID, 0, "x", 2000), PEER).await;
		assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

		// Missing entirely
		let req = Request::builder()
			.method(Method::POST)
			.uri(format!("https://cdn.example/xhttp/{SID}/0"))
			.header(super::X_AUTH_TOKEN, TOKEN)
			.body(Full::new(Bytes::new()))
			.unwrap();
		assert_eq!(server.handle(req, PEER).await.status(), StatusCode::BAD_REQUEST);

		let resp = server.handle(upload(SID, 0, "x", 100), PEER).await;
		assert_eq!(resp.status(), StatusCode::OK);
	}

	/// The padding may also arrive on the Referer URL.
	#[test_log::test(tokio::test)]
	async fn padding_via_referer_accepted() {
		let (server, _tunnels) = server();
		let req = Request::builder()
			.method(Method::POST)
			.uri(format!("https://cdn.example/xhttp/{SID}/0"))
			.header(super::X_AUTH_TOKEN, TOKEN)
			.header(
				http::header::REFERER,
				format!("https://cdn.example/page?x_padding={}", "r".repeat(500)),
			)
			.body(Full::new(Bytes::from_static(b"hi")))
			.unwrap();
		assert_eq!(server.handle(req, PEER).await.status(), StatusCode::OK);
	}

	/// Unknown paths serve the fake nginx page with 200.
	#[test_log::test(tokio::test)]
	async fn unknown_path_disguised() {
		let (server, _tunnels) = server();
		let req = Request::builder()
			.method(Method::GET)
			.uri("https://cdn.example/wp-admin")
			.body(Full::new(Bytes::new()))
			.unwrap();
		let resp = server.handle(req, PEER).await;
		assert_eq!(resp.status(), StatusCode::OK);
		assert_eq!(
			resp.headers().get("server").and_then(|v| v.to_str().ok()),
			Some("nginx/1.18.0")
		);
	}

	/// A second downlink GET for the same session is refused.
	#[test_log::test(tokio::test)]
	async fn duplicate_downlink_rejected() {
		let (server, mut tunnels) = server();
		let get = || {
			Request::builder()
				.method(Method::GET)
				.uri(format!(
					"https://cdn.example/xhttp/{SID}?x_padding={}",
					"p".repeat(200)
				))
				.header(super::X_AUTH_TOKEN, TOKEN)
				.body(Full::new(Bytes::new()))
				.unwrap()
		};
		assert_eq!(server.handle(get(), PEER).await.status(), StatusCode::OK);
		let (_tunnel, _peer) = tunnels.recv().await.expect("tunnel created");
		assert_eq!(server.handle(get(), PEER).await.status(), StatusCode::BAD_REQUEST);
	}
}
