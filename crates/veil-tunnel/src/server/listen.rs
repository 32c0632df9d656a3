//! Per-carrier listener loops. Each runs until the server token cancels,
//! spawning one establishment task per accepted tunnel.

use std::{convert::Infallible, net::SocketAddr, sync::Arc};

use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::{net::TcpListener, sync::mpsc};
use veil_core::{debug, info, warn};

use crate::{
	error::{ConfigSnafu, Result},
	server::{ServerState, establish_tunnel},
	transport::{
		ServerTunnel, StreamBox, grpc, grpcweb, ws,
		xhttp::{XhttpServer, XhttpServerOpts},
	},
};

fn tls_with_alpn(base: &rustls::ServerConfig, alpn: &[&[u8]]) -> Arc<rustls::ServerConfig> {
	let mut config = base.clone();
	config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
	Arc::new(config)
}

/// `wss://addr{path}`, subprotocol reflected, one tunnel per connection.
pub async fn listen_ws(
	state: Arc<ServerState>,
	addr: SocketAddr,
	tls: Arc<rustls::ServerConfig>,
	path: String,
) -> Result<()> {
	let listener = TcpListener::bind(addr).await?;
	let acceptor = tokio_rustls::TlsAcceptor::from(tls_with_alpn(&tls, &[b"http/1.1"]));
	info!(target: "[IN]", "websocket carrier on {addr}{path}");

	loop {
		tokio::select! {
			_ = state.token.cancelled() => break,
			accepted = listener.accept() => {
				let (tcp, peer) = match accepted {
					Ok(v) => v,
					Err(err) => {
						warn!(target: "[IN]", "accept failed: {err}");
						continue;
					}
				};
				let acceptor = acceptor.clone();
				let state = state.clone();
				let path = path.clone();
				tokio::spawn(async move {
					let tls_stream = match acceptor.accept(tcp).await {
						Ok(stream) => stream,
						Err(err) => {
							debug!(target: "[IN]", "tls accept from {peer} failed: {err}");
							return;
						}
					};
					let stream: StreamBox = Box::new(tls_stream);
					match ws::accept(stream, &path).await {
						Ok((writer, reader, _subprotocol)) => {
							let conn = ServerTunnel::new(writer, reader);
							let _ = establish_tunnel(state, conn, peer.ip()).await;
						}
						Err(err) => debug!(target: "[IN]", "ws upgrade from {peer} failed: {err}"),
					}
				});
			}
		}
	}
	Ok(())
}

/// gRPC over HTTP/2: many tunnels per connection, one per stream.
pub async fn listen_grpc(
	state: Arc<ServerState>,
	addr: SocketAddr,
	tls: Arc<rustls::ServerConfig>,
	service: String,
) -> Result<()> {
	let listener = TcpListener::bind(addr).await?;
	let acceptor = tokio_rustls::TlsAcceptor::from(tls_with_alpn(&tls, &[b"h2"]));
	info!(target: "[IN]", "grpc carrier on {addr} service {service}");

	loop {
		tokio::select! {
			_ = state.token.cancelled() => break,
			accepted = listener.accept() => {
				let (tcp, peer) = match accepted {
					Ok(v) => v,
					Err(err) => {
						warn!(target: "[IN]", "accept failed: {err}");
						continue;
					}
				};
				let acceptor = acceptor.clone();
				let state = state.clone();
				let service = service.clone();
				tokio::spawn(async move {
					let tls_stream = match acceptor.accept(tcp).await {
						Ok(stream) => stream,
						Err(err) => {
							debug!(target: "[IN]", "tls accept from {peer} failed: {err}");
							return;
						}
					};
					let stream: StreamBox = Box::new(tls_stream);
					let peer_ip = peer.ip();
					let spawner = state.clone();
					let result = grpc::serve_connection(stream, &service, move |conn| {
						let state = spawner.clone();
						tokio::spawn(async move {
							let _ = establish_tunnel(state, conn, peer_ip).await;
						});
					})
					.await;
					if let Err(err) = result {
						debug!(target: "[IN]", "grpc connection from {peer} ended: {err}");
					}
				});
			}
		}
	}
	Ok(())
}

/// gRPC-Web over HTTP/3 on a QUIC endpoint.
pub async fn listen_grpcweb(
	state: Arc<ServerState>,
	addr: SocketAddr,
	tls: Arc<rustls::ServerConfig>,
	service: String,
) -> Result<()> {
	let tls = tls_with_alpn(&tls, &[b"h3"]);
	let quic_tls = quinn::crypto::rustls::QuicServerConfig::try_from((*tls).clone()).map_err(|err| {
		ConfigSnafu {
			reason: format!("tls config rejected for quic: {err}"),
		}
		.build()
	})?;
	let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(quic_tls));
	server_config.transport_config(Arc::new(grpcweb::quic_transport_config()?));

	let endpoint = quinn::Endpoint::server(server_config, addr)?;
	info!(target: "[IN]", "grpc-web/h3 carrier on {addr} service {service}");

	loop {
		tokio::select! {
			_ = state.token.cancelled() => {
				endpoint.close(0u32.into(), b"shutdown");
				break;
			}
			incoming = endpoint.accept() => {
				let Some(incoming) = incoming else { break };
				let state = state.clone();
				let service = service.clone();
				tokio::spawn(async move {
					let connection = match incoming.await {
						Ok(connection) => connection,
						Err(err) => {
							debug!(target: "[IN]", "quic accept failed: {err}");
							return;
						}
					};
					let peer_ip = connection.remote_address().ip();
					let spawner = state.clone();
					let result = grpcweb::serve_connection(connection, &service, move |conn| {
						let state = spawner.clone();
						tokio::spawn(async move {
							let _ = establish_tunnel(state, conn, peer_ip).await;
						});
					})
					.await;
					if let Err(err) = result {
						debug!(target: "[IN]", "h3 connection ended: {err}");
					}
				});
			}
		}
	}
	Ok(())
}

/// XHTTP over hyper (h1 + h2): sessions span requests, so tunnels arrive
/// through the server's channel instead of per-connection.
pub async fn listen_xhttp(
	state: Arc<ServerState>,
	addr: SocketAddr,
	tls: Arc<rustls::ServerConfig>,
	opts: XhttpServerOpts,
) -> Result<()> {
	let (tunnels_tx, mut tunnels_rx) = mpsc::channel(64);
	let server = XhttpServer::new(opts, tunnels_tx);
	server.spawn_reaper(state.token.child_token());

	{
		let state = state.clone();
		tokio::spawn(async move {
			while let Some((conn, peer_ip)) = tunnels_rx.recv().await {
				let state = state.clone();
				tokio::spawn(async move {
					let _ = establish_tunnel(state, conn, peer_ip).await;
				});
			}
		});
	}

	let listener = TcpListener::bind(addr).await?;
	let acceptor = tokio_rustls::TlsAcceptor::from(tls_with_alpn(&tls, &[b"h2", b"http/1.1"]));
	info!(target: "[IN]", "xhttp carrier on {addr}");

	loop {
		tokio::select! {
			_ = state.token.cancelled() => break,
			accepted = listener.accept() => {
				let (tcp, peer) = match accepted {
					Ok(v) => v,
					Err(err) => {
						warn!(target: "[IN]", "accept failed: {err}");
						continue;
					}
				};
				let acceptor = acceptor.clone();
				let server = server.clone();
				tokio::spawn(async move {
					let tls_stream = match acceptor.accept(tcp).await {
						Ok(stream) => stream,
						Err(err) => {
							debug!(target: "[IN]", "tls accept from {peer} failed: {err}");
							return;
						}
					};
					let peer_ip = peer.ip();
					let service = service_fn(move |req| {
						let server = server.clone();
						async move { Ok::<_, Infallible>(server.handle(req, peer_ip).await) }
					});
					let result = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
						.serve_connection(TokioIo::new(tls_stream), service)
						.await;
					if let Err(err) = result {
						debug!(target: "[IN]", "xhttp connection from {peer} ended: {err}");
					}
				});
			}
		}
	}
	Ok(())
}
