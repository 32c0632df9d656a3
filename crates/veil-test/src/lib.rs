//! Shared helpers for the end-to-end scenario tests.

use std::net::SocketAddr;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::{
	io::{AsyncReadExt, AsyncWriteExt},
	net::{TcpListener, UdpSocket},
};

/// Generate a self-signed certificate for testing
pub fn generate_self_signed_cert() -> (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>) {
	let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
	let cert_der = CertificateDer::from(cert.cert);
	let key_der = PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());

	(vec![cert_der], PrivateKeyDer::Pkcs8(key_der))
}

/// Grabs a currently free local port. The tiny window between drop and
/// rebind is fine for tests.
pub fn free_port() -> u16 {
	let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
	listener.local_addr().unwrap().port()
}

pub async fn tcp_echo_server() -> SocketAddr {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	tokio::spawn(async move {
		while let Ok((mut stream, _)) = listener.accept().await {
			tokio::spawn(async move {
				let mut buf = vec![0u8; 8192];
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

pub async fn udp_echo_server() -> SocketAddr {
	let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
	let addr = socket.local_addr().unwrap();
	tokio::spawn(async move {
		let mut buf = vec![0u8; 8192];
		while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
			let _ = socket.send_to(&buf[..n], peer).await;
		}
	});
	addr
}
