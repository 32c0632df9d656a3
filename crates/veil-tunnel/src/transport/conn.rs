use std::{sync::Arc, time::Duration};

use bytes::{Buf, Bytes, BytesMut};
use tokio::sync::{Mutex, mpsc};
use tokio_util::{codec::Decoder as _, codec::Encoder as _, sync::CancellationToken};
use uuid::Uuid;
use veil_core::{debug, types::TargetAddr, udp::UdpPacket};

use crate::{
	error::{Error, HandshakeError, ProtocolViolation, Result},
	proto::{
		Address, Command, HandshakeRequest, HandshakeStatus, GlobalId, TrojanCommand, TrojanKey,
		TrojanRequest, TrojanUdpCodec, TrojanUdpPacket, UdpFrame, UdpFrameCodec, UdpStatus,
		RESPONSE_LEN,
		flow::FlowState,
	},
	transport::{grpc, grpcweb, ws, xhttp},
};

/// How the client authenticates inside the tunnel.
#[derive(Clone, Debug)]
pub enum TunnelAuth {
	Ewp { uuid: Uuid },
	Trojan { key: TrojanKey },
}

impl TunnelAuth {
	/// The string carried in `Sec-WebSocket-Protocol` / `X-Auth-Token`.
	pub fn token_string(&self) -> String {
		match self {
			TunnelAuth::Ewp { uuid } => uuid.to_string(),
			TunnelAuth::Trojan { key } => key.as_str().to_string(),
		}
	}
}

/// Carrier-specific frame sink. Writes are serialized by the owning
/// connection's mutex; the carrier only has to deliver one frame per call
/// with message boundaries preserved.
pub enum FrameWriter {
	Ws(ws::WsSink),
	Grpc(grpc::GrpcWriter),
	H3Client(grpcweb::H3ClientWriter),
	H3Server(grpcweb::H3ServerWriter),
	Body(xhttp::BodyWriter),
	XhttpPost(xhttp::XhttpPoster),
	Channel(mpsc::Sender<Bytes>),
}

impl FrameWriter {
	pub async fn send(&mut self, frame: Bytes) -> Result<()> {
		match self {
			FrameWriter::Ws(sink) => ws::send_frame(sink, frame).await,
			FrameWriter::Grpc(writer) => writer.send(frame).await,
			FrameWriter::H3Client(writer) => writer.send(frame).await,
			FrameWriter::H3Server(writer) => writer.send(frame).await,
			FrameWriter::Body(writer) => writer.send(frame).await,
			FrameWriter::XhttpPost(poster) => poster.send(frame).await,
			FrameWriter::Channel(tx) => tx.send(frame).await.map_err(|_| Error::Closed),
		}
	}

	/// Keepalive probe. Only the WebSocket carrier needs one; QUIC and
	/// HTTP/2 ping at the transport layer.
	pub async fn ping(&mut self) -> Result<()> {
		match self {
			FrameWriter::Ws(sink) => ws::send_ping(sink).await,
			_ => Ok(()),
		}
	}

	pub async fn close(&mut self) -> Result<()> {
		match self {
			FrameWriter::Ws(sink) => ws::send_close(sink).await,
			FrameWriter::Grpc(writer) => writer.finish(),
			FrameWriter::H3Client(writer) => writer.finish().await,
			FrameWriter::H3Server(writer) => writer.finish().await,
			FrameWriter::Body(writer) => {
				writer.finish();
				Ok(())
			}
			FrameWriter::XhttpPost(_) => Ok(()),
			FrameWriter::Channel(_) => Ok(()),
		}
	}
}

/// Carrier-specific frame source. `None` means a clean EOF.
pub enum FrameReader {
	Ws(ws::WsSource),
	Grpc(grpc::GrpcReader),
	H3Client(grpcweb::H3ClientReader),
	H3Server(grpcweb::H3ServerReader),
	Body(xhttp::BodyReader),
	Channel(mpsc::Receiver<Bytes>),
}

impl FrameReader {
	pub async fn recv(&mut self) -> Result<Option<Bytes>> {
		match self {
			FrameReader::Ws(source) => ws::recv_frame(source).await,
			FrameReader::Grpc(reader) => reader.recv().await,
			FrameReader::H3Client(reader) => reader.recv().await,
			FrameReader::H3Server(reader) => reader.recv().await,
			FrameReader::Body(reader) => reader.recv().await,
			FrameReader::Channel(rx) => Ok(rx.recv().await),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
	Created,
	/// A handshake is in flight; rolled back to `Created` if it fails.
	Connecting,
	OpenTcp,
	OpenUdp,
	Closed,
}

struct ReadHalf {
	frames:   FrameReader,
	leftover: BytesMut,
}

struct UdpClientState {
	started:     bool,
	last_target: Option<Address>,
}

struct ConnInner {
	writer:       Mutex<FrameWriter>,
	reader:       Mutex<ReadHalf>,
	state:        Mutex<ConnState>,
	auth:         TunnelAuth,
	flow_enabled: bool,
	flow:         std::sync::Mutex<Option<FlowState>>,
	global_id:    GlobalId,
	udp:          Mutex<UdpClientState>,
	token:        CancellationToken,
}

/// The one abstraction the forwarder consumes, independent of the wire
/// carrier underneath. State machine: `Created → Open → Closed`; the open
/// states are only entered once the handshake succeeded, so a rejected
/// `connect` can be retried while a second `connect` on an established
/// tunnel fails with [`Error::AlreadyConnected`]. `close` is idempotent
/// and terminal.
#[derive(Clone)]
pub struct TunnelConn(Arc<ConnInner>);

impl TunnelConn {
	pub fn new(writer: FrameWriter, reader: FrameReader, auth: TunnelAuth, flow_enabled: bool) -> Self {
		Self(Arc::new(ConnInner {
			writer: Mutex::new(writer),
			reader: Mutex::new(ReadHalf {
				frames:   reader,
				leftover: BytesMut::new(),
			}),
			state: Mutex::new(ConnState::Created),
			auth,
			flow_enabled,
			flow: std::sync::Mutex::new(None),
			global_id: GlobalId::fresh(),
			udp: Mutex::new(UdpClientState {
				started:     false,
				last_target: None,
			}),
			token: CancellationToken::new(),
		}))
	}

	pub fn cancellation_token(&self) -> CancellationToken {
		self.0.token.clone()
	}

	async fn start_connecting(&self) -> Result<()> {
		let mut state = self.0.state.lock().await;
		match *state {
			ConnState::Created => {
				*state = ConnState::Connecting;
				Ok(())
			}
			ConnState::Closed => Err(Error::Closed),
			_ => Err(Error::AlreadyConnected),
		}
	}

	/// Commits the open state on handshake success, or rolls back to
	/// `Created` so the caller may retry. A concurrent `close` wins either
	/// way.
	async fn finish_connecting(&self, open: ConnState, attempt: Result<()>) -> Result<()> {
		let mut state = self.0.state.lock().await;
		if *state != ConnState::Connecting {
			return Err(Error::Closed);
		}
		match attempt {
			Ok(()) => {
				*state = open;
				Ok(())
			}
			Err(err) => {
				*state = ConnState::Created;
				Err(err)
			}
		}
	}

	async fn expect_state(&self, want: ConnState) -> Result<()> {
		let state = self.0.state.lock().await;
		if *state == ConnState::Closed {
			return Err(Error::Closed);
		}
		if *state != want {
			return Err(Error::protocol(ProtocolViolation::UnexpectedFrame));
		}
		Ok(())
	}

	/// Opens a TCP tunnel to `target`, sending `initial` once established.
	pub async fn connect(&self, target: TargetAddr, initial: &[u8]) -> Result<()> {
		self.start_connecting().await?;
		let attempt = match &self.0.auth {
			TunnelAuth::Ewp { uuid } => self.ewp_handshake(*uuid, Command::Tcp, target.into()).await,
			TunnelAuth::Trojan { key } => {
				// Trojan carries the early payload inside the request frame.
				let request = TrojanRequest {
					command: TrojanCommand::Connect,
					target:  target.into(),
				};
				match request.encode(key, initial) {
					Ok(frame) => self.0.writer.lock().await.send(frame).await,
					Err(err) => Err(err),
				}
			}
		};
		self.finish_connecting(ConnState::OpenTcp, attempt).await?;

		if let TunnelAuth::Ewp { uuid } = &self.0.auth {
			if self.0.flow_enabled {
				let mut flow = self.0.flow.lock().expect("flow lock");
				*flow = Some(FlowState::new(*uuid, true));
			}
			if !initial.is_empty() {
				self.write(initial).await?;
			}
		}
		Ok(())
	}

	/// Opens a UDP tunnel; `initial` rides in the first `New` packet.
	pub async fn connect_udp(&self, target: TargetAddr, initial: &[u8]) -> Result<()> {
		self.start_connecting().await?;
		let target: Address = target.into();
		let attempt = match &self.0.auth {
			TunnelAuth::Ewp { uuid } => self.ewp_handshake(*uuid, Command::Udp, target.clone()).await,
			TunnelAuth::Trojan { key } => {
				let request = TrojanRequest {
					command: TrojanCommand::UdpAssociate,
					target:  target.clone(),
				};
				let encoded = (|| {
					let mut payload = BytesMut::new();
					if !initial.is_empty() {
						TrojanUdpCodec.encode(
							TrojanUdpPacket {
								target:  target.clone(),
								payload: Bytes::copy_from_slice(initial),
							},
							&mut payload,
						)?;
					}
					request.encode(key, &payload)
				})();
				match encoded {
					Ok(frame) => self.0.writer.lock().await.send(frame).await,
					Err(err) => Err(err),
				}
			}
		};
		self.finish_connecting(ConnState::OpenUdp, attempt).await?;

		match &self.0.auth {
			TunnelAuth::Ewp { .. } => {
				self.send_udp_frame(target, Bytes::copy_from_slice(initial)).await?;
			}
			TunnelAuth::Trojan { .. } => {
				// The request frame above already carried the first packet.
				let mut udp = self.0.udp.lock().await;
				udp.started = true;
				udp.last_target = Some(target);
			}
		}
		Ok(())
	}

	async fn ewp_handshake(&self, uuid: Uuid, command: Command, target: Address) -> Result<()> {
		let request = HandshakeRequest::new(uuid, command, target);
		let frame = request.encode().map_err(Error::handshake)?;
		self.0.writer.lock().await.send(frame).await?;

		let mut half = self.0.reader.lock().await;
		let Some(frame) = half.frames.recv().await? else {
			return Err(Error::Closed);
		};
		if frame.len() < RESPONSE_LEN {
			return Err(Error::handshake(HandshakeError::InvalidLength));
		}
		let response = request
			.verify_response(&frame[..RESPONSE_LEN])
			.map_err(Error::handshake)?;
		if response.status != HandshakeStatus::Ok {
			return Err(Error::handshake(HandshakeError::InvalidAuth));
		}
		// Early data glued onto the response belongs to the stream.
		if frame.len() > RESPONSE_LEN {
			half.leftover.extend_from_slice(&frame[RESPONSE_LEN..]);
		}
		Ok(())
	}

	/// Reads stream bytes, unpadding when flow shaping is active.
	/// Returns 0 at EOF.
	pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
		let mut half = self.0.reader.lock().await;
		loop {
			if !half.leftover.is_empty() {
				let n = buf.len().min(half.leftover.len());
				buf[..n].copy_from_slice(&half.leftover[..n]);
				half.leftover.advance(n);
				return Ok(n);
			}
			let Some(frame) = half.frames.recv().await? else {
				return Ok(0);
			};
			let data = {
				let mut flow = self.0.flow.lock().expect("flow lock");
				match flow.as_mut() {
					Some(flow) => flow.unpad(&frame)?,
					None => frame,
				}
			};
			// A frame can be all padding.
			if !data.is_empty() {
				half.leftover.extend_from_slice(&data);
			}
		}
	}

	/// Writes stream bytes, padding when flow shaping is active.
	pub async fn write(&self, data: &[u8]) -> Result<()> {
		self.expect_state(ConnState::OpenTcp).await?;
		let frame = {
			let mut flow = self.0.flow.lock().expect("flow lock");
			match flow.as_mut() {
				Some(flow) => flow.pad(data),
				None => Bytes::copy_from_slice(data),
			}
		};
		self.0.writer.lock().await.send(frame).await
	}

	/// Sends one datagram. The first packet of a session is `New` and
	/// carries the target; later packets repeat it only when it changes
	/// (Full-Cone fan-out).
	pub async fn write_udp(&self, target: &TargetAddr, data: &[u8]) -> Result<()> {
		self.expect_state(ConnState::OpenUdp).await?;
		match &self.0.auth {
			TunnelAuth::Ewp { .. } => {
				self.send_udp_frame(target.clone().into(), Bytes::copy_from_slice(data))
					.await
			}
			TunnelAuth::Trojan { .. } => {
				let mut buf = BytesMut::new();
				TrojanUdpCodec.encode(
					TrojanUdpPacket {
						target:  target.clone().into(),
						payload: Bytes::copy_from_slice(data),
					},
					&mut buf,
				)?;
				self.0.writer.lock().await.send(buf.freeze()).await
			}
		}
	}

	async fn send_udp_frame(&self, target: Address, payload: Bytes) -> Result<()> {
		let frame = {
			let mut udp = self.0.udp.lock().await;
			let (status, wire_target) = if !udp.started {
				udp.started = true;
				udp.last_target = Some(target.clone());
				(UdpStatus::New, Some(target))
			} else if udp.last_target.as_ref() != Some(&target) {
				udp.last_target = Some(target.clone());
				(UdpStatus::Keep, Some(target))
			} else {
				(UdpStatus::Keep, None)
			};
			UdpFrame {
				global_id: self.0.global_id,
				status,
				target: wire_target,
				payload,
			}
		};
		let mut buf = BytesMut::new();
		UdpFrameCodec.encode(frame, &mut buf)?;
		self.0.writer.lock().await.send(buf.freeze()).await
	}

	/// Receives one datagram; never fragments across packets.
	pub async fn read_udp(&self) -> Result<UdpPacket> {
		self.expect_state(ConnState::OpenUdp).await?;
		let mut half = self.0.reader.lock().await;
		loop {
			match &self.0.auth {
				TunnelAuth::Ewp { .. } => {
					if let Some(frame) = UdpFrameCodec.decode(&mut half.leftover)? {
						if frame.status == UdpStatus::End {
							return Err(Error::Closed);
						}
						let target = match frame.target {
							Some(addr) => addr,
							None => {
								let udp = self.0.udp.lock().await;
								match &udp.last_target {
									Some(addr) => addr.clone(),
									None => continue,
								}
							}
						};
						return Ok(UdpPacket {
							target:  target.into(),
							payload: frame.payload,
						});
					}
				}
				TunnelAuth::Trojan { .. } => {
					if let Some(packet) = TrojanUdpCodec.decode(&mut half.leftover)? {
						return Ok(UdpPacket {
							target:  packet.target.into(),
							payload: packet.payload,
						});
					}
				}
			}
			let Some(frame) = half.frames.recv().await? else {
				return Err(Error::Closed);
			};
			half.leftover.extend_from_slice(&frame);
		}
	}

	/// Signals cancellation, closes the carrier and marks the connection
	/// terminal. Safe to call any number of times.
	pub async fn close(&self) {
		{
			let mut state = self.0.state.lock().await;
			if *state == ConnState::Closed {
				return;
			}
			*state = ConnState::Closed;
		}
		self.0.token.cancel();
		let mut writer = self.0.writer.lock().await;
		if let Err(err) = writer.close().await {
			if !err.is_benign_close() {
				debug!(target: "[CONN]", "close: {err}");
			}
		}
	}

	/// Spawns a keepalive pinger; cancel the returned token to stop it.
	pub fn start_ping(&self, interval: Duration) -> CancellationToken {
		let stop = self.0.token.child_token();
		let inner = self.0.clone();
		let stop_task = stop.clone();
		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(interval);
			ticker.tick().await;
			loop {
				tokio::select! {
					_ = stop_task.cancelled() => break,
					_ = ticker.tick() => {
						let mut writer = inner.writer.lock().await;
						if writer.ping().await.is_err() {
							break;
						}
					}
				}
			}
		});
		stop
	}
}

/// Server half of an accepted tunnel. The writer is shared so UDP reader
/// tasks can serialize their frames onto the same stream.
pub struct ServerTunnel {
	writer:   Arc<Mutex<FrameWriter>>,
	reader:   FrameReader,
	leftover: BytesMut,
}

impl ServerTunnel {
	pub fn new(writer: FrameWriter, reader: FrameReader) -> Self {
		Self {
			writer: Arc::new(Mutex::new(writer)),
			reader,
			leftover: BytesMut::new(),
		}
	}

	pub fn shared_writer(&self) -> Arc<Mutex<FrameWriter>> {
		self.writer.clone()
	}

	pub async fn send_frame(&self, frame: Bytes) -> Result<()> {
		self.writer.lock().await.send(frame).await
	}

	pub async fn recv_frame(&mut self) -> Result<Option<Bytes>> {
		if !self.leftover.is_empty() {
			return Ok(Some(self.leftover.split().freeze()));
		}
		self.reader.recv().await
	}

	/// Gives bytes back to the reader, e.g. a prelude that has to be
	/// replayed into a fallback connection.
	pub fn unread(&mut self, bytes: &[u8]) {
		let mut buf = BytesMut::with_capacity(bytes.len() + self.leftover.len());
		buf.extend_from_slice(bytes);
		buf.extend_from_slice(&self.leftover);
		self.leftover = buf;
	}

	pub async fn close(&mut self) {
		let mut writer = self.writer.lock().await;
		if let Err(err) = writer.close().await {
			if !err.is_benign_close() {
				debug!(target: "[CONN]", "server close: {err}");
			}
		}
	}
}

#[cfg(test)]
mod test {
	use std::time::Duration;

	use bytes::Bytes;
	use tokio::sync::mpsc;
	use uuid::Uuid;
	use veil_core::types::TargetAddr;

	use super::{FrameReader, FrameWriter, TunnelAuth, TunnelConn};
	use crate::{
		error::Error,
		proto::{HandshakeStatus, decode_request, encode_response, fake_response, unix_now},
	};

	fn test_uuid() -> Uuid {
		Uuid::parse_str("d342d11e-d424-4583-b36e-524ab1f0afa4").unwrap()
	}

	fn channel_conn() -> (TunnelConn, mpsc::Receiver<Bytes>, mpsc::Sender<Bytes>) {
		let (up_tx, up_rx) = mpsc::channel(8);
		let (down_tx, down_rx) = mpsc::channel(8);
		let conn = TunnelConn::new(
			FrameWriter::Channel(up_tx),
			FrameReader::Channel(down_rx),
			TunnelAuth::Ewp { uuid: test_uuid() },
			false,
		);
		(conn, up_rx, down_tx)
	}

	/// A rejected handshake must not burn the connection: the state rolls
	/// back so the same `TunnelConn` can retry, and only a *successful*
	/// connect makes further connects `AlreadyConnected`.
	#[test_log::test(tokio::test)]
	async fn connect_retries_after_rejected_handshake() {
		let (conn, mut up_rx, down_tx) = channel_conn();

		// Peer rejects the first handshake with the length-matched random
		// frame, then accepts the second.
		tokio::spawn(async move {
			let _first = up_rx.recv().await.expect("first handshake");
			down_tx
				.send(Bytes::copy_from_slice(&fake_response()))
				.await
				.expect("send reject");

			let second = up_rx.recv().await.expect("second handshake");
			let handshake = decode_request(&second, &[test_uuid()], unix_now()).expect("valid retry");
			down_tx
				.send(Bytes::copy_from_slice(&encode_response(
					&handshake,
					HandshakeStatus::Ok,
					unix_now(),
				)))
				.await
				.expect("send accept");

			// Keep the downlink open for the post-connect write below.
			tokio::time::sleep(Duration::from_secs(5)).await;
		});

		let target = TargetAddr::Domain("example.com".into(), 443);

		let rejected = conn.connect(target.clone(), &[]).await.unwrap_err();
		assert!(matches!(rejected, Error::Handshake { .. }));

		// The tunnel never opened, so stream I/O is refused...
		assert!(conn.write(b"too early").await.is_err());

		// ...but a fresh connect on the same connection goes through.
		tokio::time::timeout(Duration::from_secs(5), conn.connect(target.clone(), &[]))
			.await
			.expect("retry within deadline")
			.expect("retry succeeds");
		conn.write(b"now open").await.unwrap();

		// Idempotent-on-success: only now is a further connect refused.
		assert!(matches!(
			conn.connect(target, &[]).await.unwrap_err(),
			Error::AlreadyConnected
		));
	}

	/// Close wins over an in-flight or failed connect; nothing resurrects
	/// a closed connection.
	#[test_log::test(tokio::test)]
	async fn failed_connect_then_close_is_terminal() {
		let (conn, mut up_rx, down_tx) = channel_conn();

		tokio::spawn(async move {
			let _ = up_rx.recv().await;
			let _ = down_tx.send(Bytes::copy_from_slice(&fake_response())).await;
		});

		let target = TargetAddr::Domain("example.com".into(), 443);
		assert!(conn.connect(target.clone(), &[]).await.is_err());

		conn.close().await;
		assert!(matches!(conn.connect(target, &[]).await.unwrap_err(), Error::Closed));
	}
}
