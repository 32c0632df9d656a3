//! Server-side UDP session layer.
//!
//! One [`UdpSessionManager`] per process maps `GlobalID → UdpSession`.
//! A session opens a connected socket per remote peer (Full-Cone: one
//! session fans out to any number of peers) and a reader task per socket
//! forwards return datagrams back through the tunnel, serialized onto the
//! shared frame writer.

use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use bytes::{Bytes, BytesMut};
use tokio::{
	net::UdpSocket,
	sync::{Mutex, RwLock},
	time::Instant,
};
use tokio_util::{codec::Encoder as _, sync::CancellationToken};
use veil_core::{debug, info};

use crate::{
	error::Result,
	proto::{Address, GlobalId, TrojanUdpCodec, TrojanUdpPacket, UdpFrame, UdpFrameCodec, UdpStatus},
	transport::FrameWriter,
};

pub const UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const MAX_DATAGRAM: usize = 65536;

/// How return datagrams are framed onto the tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdpWireFormat {
	Ewp,
	Trojan,
}

pub(crate) async fn resolve_address(addr: &Address) -> std::io::Result<SocketAddr> {
	match addr {
		Address::IPv4(ip, port) => Ok(SocketAddr::from((*ip, *port))),
		Address::IPv6(ip, port) => Ok(SocketAddr::from((*ip, *port))),
		Address::Domain(domain, port) => {
			let mut addrs = tokio::net::lookup_host((domain.as_str(), *port)).await?;
			addrs.next().ok_or_else(|| {
				std::io::Error::new(std::io::ErrorKind::NotFound, format!("no address for {domain}"))
			})
		}
	}
}

struct UdpSession {
	global_id:   GlobalId,
	wire:        UdpWireFormat,
	writer:      Arc<Mutex<FrameWriter>>,
	sockets:     RwLock<HashMap<SocketAddr, Arc<UdpSocket>>>,
	last_target: RwLock<Option<(Address, SocketAddr)>>,
	last_active: RwLock<Instant>,
	cancel:      CancellationToken,
}

impl UdpSession {
	async fn touch(&self) {
		*self.last_active.write().await = Instant::now();
	}

	/// Connected socket for `peer`, opening one (plus its reader task) on
	/// first use.
	async fn socket_for(self: &Arc<Self>, target: Address, peer: SocketAddr) -> std::io::Result<Arc<UdpSocket>> {
		{
			let sockets = self.sockets.read().await;
			if let Some(socket) = sockets.get(&peer) {
				return Ok(socket.clone());
			}
		}

		let bind: SocketAddr = if peer.is_ipv4() {
			"0.0.0.0:0".parse().expect("const addr")
		} else {
			"[::]:0".parse().expect("const addr")
		};
		let socket = Arc::new(UdpSocket::bind(bind).await?);
		socket.connect(peer).await?;

		let mut sockets = self.sockets.write().await;
		// Lost the race, use the winner's socket.
		if let Some(existing) = sockets.get(&peer) {
			return Ok(existing.clone());
		}
		sockets.insert(peer, socket.clone());
		drop(sockets);

		let session = self.clone();
		let reader_socket = socket.clone();
		tokio::spawn(async move {
			session.read_loop(target, peer, reader_socket).await;
		});
		Ok(socket)
	}

	/// Forwards datagrams from one remote peer back through the tunnel.
	async fn read_loop(self: Arc<Self>, target: Address, peer: SocketAddr, socket: Arc<UdpSocket>) {
		let mut buf = vec![0u8; MAX_DATAGRAM];
		loop {
			tokio::select! {
				_ = self.cancel.cancelled() => break,
				received = socket.recv(&mut buf) => {
					let n = match received {
						Ok(n) => n,
						Err(err) => {
							debug!(target: "[UDP]", "socket for {peer} closed: {err}");
							break;
						}
					};
					self.touch().await;
					let payload = Bytes::copy_from_slice(&buf[..n]);
					if self.send_back(target.clone(), payload).await.is_err() {
						break;
					}
				}
			}
		}
		self.sockets.write().await.remove(&peer);
	}

	async fn send_back(&self, target: Address, payload: Bytes) -> Result<()> {
		let mut wire = BytesMut::new();
		match self.wire {
			UdpWireFormat::Ewp => {
				UdpFrameCodec.encode(
					UdpFrame {
						global_id: self.global_id,
						status: UdpStatus::Keep,
						target: Some(target),
						payload,
					},
					&mut wire,
				)?;
			}
			UdpWireFormat::Trojan => {
				TrojanUdpCodec.encode(TrojanUdpPacket { target, payload }, &mut wire)?;
			}
		}
		self.writer.lock().await.send(wire.freeze()).await
	}

	async fn close(&self) {
		self.cancel.cancel();
		self.sockets.write().await.clear();
	}
}

pub struct UdpSessionManager {
	sessions:     RwLock<HashMap<GlobalId, Arc<UdpSession>>>,
	idle_timeout: Duration,
	token:        CancellationToken,
}

impl UdpSessionManager {
	pub fn new(idle_timeout: Duration, token: CancellationToken) -> Arc<Self> {
		let manager = Arc::new(Self {
			sessions: RwLock::new(HashMap::new()),
			idle_timeout,
			token,
		});
		manager.spawn_sweeper();
		manager
	}

	fn spawn_sweeper(self: &Arc<Self>) {
		let this = self.clone();
		let token = self.token.clone();
		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(Duration::from_secs(30));
			loop {
				tokio::select! {
					_ = token.cancelled() => {
						this.close_all().await;
						break;
					}
					_ = ticker.tick() => {
						let now = Instant::now();
						let mut expired = Vec::new();
						{
							let sessions = this.sessions.read().await;
							for (id, session) in sessions.iter() {
								let last = *session.last_active.read().await;
								if now.duration_since(last) > this.idle_timeout {
									expired.push(*id);
								}
							}
						}
						for id in expired {
							info!(target: "[UDP]", "session {id} idle, evicting");
							this.remove(id).await;
						}
					}
				}
			}
		});
	}

	async fn session(
		&self,
		id: GlobalId,
		wire: UdpWireFormat,
		writer: &Arc<Mutex<FrameWriter>>,
	) -> Arc<UdpSession> {
		{
			let sessions = self.sessions.read().await;
			if let Some(session) = sessions.get(&id) {
				return session.clone();
			}
		}
		let mut sessions = self.sessions.write().await;
		sessions
			.entry(id)
			.or_insert_with(|| {
				info!(target: "[UDP]", "session {id} created");
				Arc::new(UdpSession {
					global_id:   id,
					wire,
					writer:      writer.clone(),
					sockets:     RwLock::new(HashMap::new()),
					last_target: RwLock::new(None),
					last_active: RwLock::new(Instant::now()),
					cancel:      self.token.child_token(),
				})
			})
			.clone()
	}

	async fn remove(&self, id: GlobalId) {
		let session = self.sessions.write().await.remove(&id);
		if let Some(session) = session {
			session.close().await;
		}
	}

	/// One decoded frame off a tunnel. Resolve failures drop the packet
	/// but keep the session; send failures close only the peer socket.
	pub async fn handle_frame(
		&self,
		frame: UdpFrame,
		wire: UdpWireFormat,
		writer: &Arc<Mutex<FrameWriter>>,
	) {
		if frame.status == UdpStatus::End {
			self.remove(frame.global_id).await;
			return;
		}

		let session = self.session(frame.global_id, wire, writer).await;
		session.touch().await;

		// Target: explicit on New (and on Full-Cone fan-out), otherwise
		// the session's last one.
		let target = match frame.target {
			Some(target) => target,
			None => match session.last_target.read().await.as_ref() {
				Some((target, _)) => target.clone(),
				None => {
					debug!(target: "[UDP]", "keep frame without a known target, dropping");
					return;
				}
			},
		};

		let peer = {
			let known = session.last_target.read().await;
			match known.as_ref() {
				Some((last, resolved)) if *last == target => Some(*resolved),
				_ => None,
			}
		};
		let peer = match peer {
			Some(peer) => peer,
			None => match resolve_address(&target).await {
				Ok(peer) => {
					*session.last_target.write().await = Some((target.clone(), peer));
					peer
				}
				Err(err) => {
					debug!(target: "[UDP]", "resolve {target} failed, dropping packet: {err}");
					return;
				}
			},
		};

		let socket = match session.socket_for(target.clone(), peer).await {
			Ok(socket) => socket,
			Err(err) => {
				debug!(target: "[UDP]", "open socket for {peer} failed: {err}");
				return;
			}
		};
		if let Err(err) = socket.send(&frame.payload).await {
			debug!(target: "[UDP]", "send to {peer} failed, closing that socket: {err}");
			session.sockets.write().await.remove(&peer);
		}
	}

	/// Tears down every session, e.g. on server shutdown.
	pub async fn close_all(&self) {
		let sessions: Vec<_> = self.sessions.write().await.drain().map(|(_, s)| s).collect();
		for session in sessions {
			session.close().await;
		}
	}

	/// Drops the sessions bound to one tunnel's writer when that tunnel
	/// goes away.
	pub async fn close_for_writer(&self, writer: &Arc<Mutex<FrameWriter>>) {
		let mut sessions = self.sessions.write().await;
		let mut closing = Vec::new();
		sessions.retain(|_, session| {
			if Arc::ptr_eq(&session.writer, writer) {
				closing.push(session.clone());
				false
			} else {
				true
			}
		});
		drop(sessions);
		for session in closing {
			session.close().await;
		}
	}
}

#[cfg(test)]
mod test {
	use std::{sync::Arc, time::Duration};

	use bytes::{Bytes, BytesMut};
	use tokio::{net::UdpSocket, sync::mpsc};
	use tokio_util::{codec::Decoder as _, sync::CancellationToken};

	use super::{UDP_IDLE_TIMEOUT, UdpSessionManager, UdpWireFormat};
	use crate::{
		proto::{Address, GlobalId, UdpFrame, UdpFrameCodec, UdpStatus},
		transport::FrameWriter,
	};

	async fn echo_server() -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
		let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
		let addr = socket.local_addr().unwrap();
		let handle = tokio::spawn(async move {
			let mut buf = [0u8; 2048];
			while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
				let _ = socket.send_to(&buf[..n], peer).await;
			}
		});
		(addr, handle)
	}

	fn frame(id: GlobalId, status: UdpStatus, target: Option<std::net::SocketAddr>, payload: &[u8]) -> UdpFrame {
		UdpFrame {
			global_id: id,
			status,
			target: target.map(Address::from),
			payload: Bytes::copy_from_slice(payload),
		}
	}

	async fn recv_udp_frame(rx: &mut mpsc::Receiver<Bytes>) -> UdpFrame {
		let wire = tokio::time::timeout(Duration::from_secs(5), rx.recv())
			.await
			.expect("frame within deadline")
			.expect("writer open");
		let mut buf = BytesMut::from(&wire[..]);
		UdpFrameCodec.decode(&mut buf).unwrap().expect("whole frame")
	}

	#[test_log::test(tokio::test)]
	async fn echo_roundtrip_and_full_cone() {
		let token = CancellationToken::new();
		let manager = UdpSessionManager::new(UDP_IDLE_TIMEOUT, token.clone());

		let (echo_a, _task_a) = echo_server().await;
		let (echo_b, _task_b) = echo_server().await;

		let (tx, mut rx) = mpsc::channel::<Bytes>(16);
		let writer = Arc::new(tokio::sync::Mutex::new(FrameWriter::Channel(tx)));

		let id = GlobalId::fresh();
		manager
			.handle_frame(frame(id, UdpStatus::New, Some(echo_a), b"ping-a"), UdpWireFormat::Ewp, &writer)
			.await;
		let reply = recv_udp_frame(&mut rx).await;
		assert_eq!(reply.global_id, id);
		assert_eq!(reply.status, UdpStatus::Keep);
		assert_eq!(&reply.payload[..], b"ping-a");
		assert_eq!(reply.target, Some(Address::from(echo_a)));

		// Same target keeps flowing without repeating the address.
		manager
			.handle_frame(frame(id, UdpStatus::Keep, None, b"ping-a2"), UdpWireFormat::Ewp, &writer)
			.await;
		assert_eq!(&recv_udp_frame(&mut rx).await.payload[..], b"ping-a2");

		// Full-Cone: the same session reaches a second peer.
		manager
			.handle_frame(frame(id, UdpStatus::Keep, Some(echo_b), b"ping-b"), UdpWireFormat::Ewp, &writer)
			.await;
		let reply = recv_udp_frame(&mut rx).await;
		assert_eq!(&reply.payload[..], b"ping-b");
		assert_eq!(reply.target, Some(Address::from(echo_b)));

		// End drops the session.
		manager
			.handle_frame(frame(id, UdpStatus::End, None, &[]), UdpWireFormat::Ewp, &writer)
			.await;

		token.cancel();
	}

	#[test_log::test(tokio::test)]
	async fn resolve_failure_keeps_session() {
		let token = CancellationToken::new();
		let manager = UdpSessionManager::new(UDP_IDLE_TIMEOUT, token.clone());
		let (echo, _task) = echo_server().await;

		let (tx, mut rx) = mpsc::channel::<Bytes>(16);
		let writer = Arc::new(tokio::sync::Mutex::new(FrameWriter::Channel(tx)));

		let id = GlobalId::fresh();
		let bad = UdpFrame {
			global_id: id,
			status:    UdpStatus::New,
			target:    Some(Address::Domain("definitely-not-a-real-host.invalid".into(), 53)),
			payload:   Bytes::from_static(b"lost"),
		};
		manager.handle_frame(bad, UdpWireFormat::Ewp, &writer).await;

		// The session survives and works once a resolvable target shows up.
		manager
			.handle_frame(frame(id, UdpStatus::Keep, Some(echo), b"works"), UdpWireFormat::Ewp, &writer)
			.await;
		assert_eq!(&recv_udp_frame(&mut rx).await.payload[..], b"works");

		token.cancel();
	}
}
