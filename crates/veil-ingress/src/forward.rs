//! Client-side forwarder: pairs an accepted downstream socket with an
//! established tunnel and copies both directions until either side ends.

use std::sync::Arc;

use tokio::{
	io::{AsyncReadExt, AsyncWriteExt},
	net::TcpStream,
};
use veil_core::{
	debug,
	io::{BUFFER_SIZE, is_benign_close},
	stats::TrafficStats,
};
use veil_tunnel::transport::TunnelConn;

use crate::Error;

/// Runs the two copy tasks of one proxied connection. Counters update as
/// bytes move; benign closes stay at debug level.
pub async fn pipe(down: TcpStream, tunnel: TunnelConn, stats: Arc<TrafficStats>) -> Result<(), Error> {
	let _guard = stats.conn_opened();
	let (mut down_read, mut down_write) = down.into_split();
	let token = tunnel.cancellation_token().child_token();

	let uplink = {
		let token = token.clone();
		let tunnel = tunnel.clone();
		let stats = stats.clone();
		tokio::spawn(async move {
			let mut buf = vec![0u8; BUFFER_SIZE];
			loop {
				tokio::select! {
					_ = token.cancelled() => break,
					read = down_read.read(&mut buf) => match read {
						Ok(0) => break,
						Ok(n) => {
							stats.add_upload(n as u64);
							if let Err(err) = tunnel.write(&buf[..n]).await {
								if !err.is_benign_close() {
									debug!(target: "[FWD]", "uplink write failed: {err}");
								}
								break;
							}
						}
						Err(err) => {
							if !is_benign_close(&err) {
								debug!(target: "[FWD]", "uplink read failed: {err}");
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
		let tunnel = tunnel.clone();
		tokio::spawn(async move {
			let mut buf = vec![0u8; BUFFER_SIZE];
			loop {
				tokio::select! {
					_ = token.cancelled() => break,
					read = tunnel.read(&mut buf) => match read {
						Ok(0) => break,
						Ok(n) => {
							stats.add_download(n as u64);
							if let Err(err) = down_write.write_all(&buf[..n]).await {
								if !is_benign_close(&err) {
									debug!(target: "[FWD]", "downlink write failed: {err}");
								}
								break;
							}
						}
						Err(err) => {
							if !err.is_benign_close() {
								debug!(target: "[FWD]", "downlink read failed: {err}");
							}
							break;
						}
					}
				}
			}
			let _ = down_write.shutdown().await;
			token.cancel();
		})
	};

	let _ = uplink.await;
	let _ = downlink.await;
	tunnel.close().await;
	Ok(())
}
