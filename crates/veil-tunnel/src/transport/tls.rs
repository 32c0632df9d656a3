//! Client TLS configuration and the common TCP/TLS dial steps: TLS 1.3
//! minimum, SNI kept on the fronted hostname, optional post-quantum key
//! exchange, optional ECH, TCP Fast Open with a plain-dial fallback.

use std::{net::SocketAddr, sync::Arc};

use rustls::{
	ClientConfig,
	client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
	crypto::CryptoProvider,
	pki_types::{CertificateDer, ServerName, UnixTime},
};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use veil_core::debug;

use crate::{
	error::{ConfigSnafu, Result},
	transport::{TransportOpts, ech},
};

fn crypto_provider(pqc: bool) -> CryptoProvider {
	let mut provider = rustls::crypto::aws_lc_rs::default_provider();
	if pqc {
		// Prefer the hybrid post-quantum group, keep classical fallbacks.
		provider.kx_groups = vec![
			rustls::crypto::aws_lc_rs::kx_group::X25519MLKEM768,
			rustls::crypto::aws_lc_rs::kx_group::X25519,
			rustls::crypto::aws_lc_rs::kx_group::SECP256R1,
		];
	}
	provider
}

/// Builds the client config for the TCP carriers. The caller picks ALPN.
pub async fn client_config(opts: &TransportOpts, alpn: &[&[u8]]) -> Result<ClientConfig> {
	let provider = Arc::new(crypto_provider(opts.pqc));

	let ech_list = match &opts.ech {
		Some(manager) => Some(manager.ensure().await?),
		None => None,
	};

	let builder = ClientConfig::builder_with_provider(provider.clone());
	let builder = match ech_list {
		Some(list) => {
			let config = rustls::client::EchConfig::new(
				rustls::pki_types::EchConfigListBytes::from(list.as_ref().clone()),
				rustls::crypto::aws_lc_rs::hpke::ALL_SUPPORTED_SUITES,
			)?;
			builder.with_ech(rustls::client::EchMode::from(config))?
		}
		None => builder.with_protocol_versions(&[&rustls::version::TLS13])?,
	};

	let mut config = if opts.insecure_skip_verify {
		builder
			.dangerous()
			.with_custom_certificate_verifier(Arc::new(NoVerify { provider }))
			.with_no_client_auth()
	} else if !opts.extra_roots.is_empty() {
		let mut roots = rustls::RootCertStore::empty();
		for root in &opts.extra_roots {
			roots.add(root.clone())?;
		}
		builder.with_root_certificates(roots).with_no_client_auth()
	} else {
		use rustls_platform_verifier::BuilderVerifierExt;
		builder.with_platform_verifier()?.with_no_client_auth()
	};

	config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
	Ok(config)
}

/// TLS handshake over an established TCP stream; ECH rejections surface
/// as their own error kind so the dialer can retry once.
pub async fn connect(
	opts: &TransportOpts,
	tcp: TcpStream,
	alpn: &[&[u8]],
) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
	let config = client_config(opts, alpn).await?;
	let ech_offered = opts.ech.is_some();
	let connector = TlsConnector::from(Arc::new(config));
	let server_name = ServerName::try_from(opts.tls_server_name())
		.map_err(|_| {
			ConfigSnafu {
				reason: format!("invalid server name `{}`", opts.tls_server_name()),
			}
			.build()
		})?
		.to_owned();
	connector
		.connect(server_name, tcp)
		.await
		.map_err(|err| ech::classify_tls_dial_error(err, ech_offered))
}

/// TCP dial with Fast Open where the platform supports it; any Fast Open
/// trouble falls back to a plain connect.
pub(crate) async fn tcp_dial(addr: SocketAddr) -> Result<TcpStream> {
	#[cfg(target_os = "linux")]
	match tcp_dial_fastopen(addr).await {
		Ok(stream) => return Ok(stream),
		Err(err) => {
			debug!(target: "[DIAL]", "fast open dial to {addr} failed, plain fallback: {err}");
		}
	}

	let stream = TcpStream::connect(addr).await?;
	stream.set_nodelay(true)?;
	Ok(stream)
}

#[cfg(target_os = "linux")]
async fn tcp_dial_fastopen(addr: SocketAddr) -> std::io::Result<TcpStream> {
	use std::os::fd::AsRawFd;

	use socket2::{Domain, Protocol, Socket, Type};

	let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
	socket.set_nonblocking(true)?;

	// TCP_FASTOPEN_CONNECT defers the SYN until the first write.
	let one: libc::c_int = 1;
	let rc = unsafe {
		libc::setsockopt(
			socket.as_raw_fd(),
			libc::IPPROTO_TCP,
			libc::TCP_FASTOPEN_CONNECT,
			&one as *const _ as *const libc::c_void,
			std::mem::size_of::<libc::c_int>() as libc::socklen_t,
		)
	};
	if rc != 0 {
		return Err(std::io::Error::last_os_error());
	}

	match socket.connect(&addr.into()) {
		Ok(()) => {}
		Err(err) if err.raw_os_error() == Some(libc::EINPROGRESS) => {}
		Err(err) => return Err(err),
	}

	let stream = TcpStream::from_std(socket.into())?;
	stream.writable().await?;
	if let Some(err) = stream.take_error()? {
		return Err(err);
	}
	stream.set_nodelay(true)?;
	Ok(stream)
}

/// Accept-everything verifier for explicitly insecure setups and tests.
#[derive(Debug)]
struct NoVerify {
	provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for NoVerify {
	fn verify_server_cert(
		&self,
		_end_entity: &CertificateDer<'_>,
		_intermediates: &[CertificateDer<'_>],
		_server_name: &ServerName<'_>,
		_ocsp_response: &[u8],
		_now: UnixTime,
	) -> std::result::Result<ServerCertVerified, rustls::Error> {
		Ok(ServerCertVerified::assertion())
	}

	fn verify_tls12_signature(
		&self,
		message: &[u8],
		cert: &CertificateDer<'_>,
		dss: &rustls::DigitallySignedStruct,
	) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
		rustls::crypto::verify_tls12_signature(
			message,
			cert,
			dss,
			&self.provider.signature_verification_algorithms,
		)
	}

	fn verify_tls13_signature(
		&self,
		message: &[u8],
		cert: &CertificateDer<'_>,
		dss: &rustls::DigitallySignedStruct,
	) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
		rustls::crypto::verify_tls13_signature(
			message,
			cert,
			dss,
			&self.provider.signature_verification_algorithms,
		)
	}

	fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
		self.provider.signature_verification_algorithms.supported_schemes()
	}
}

/// Server-side TLS acceptor from PEM chain and key.
#[cfg(feature = "server")]
pub fn server_config(
	certs: Vec<CertificateDer<'static>>,
	key: rustls::pki_types::PrivateKeyDer<'static>,
	alpn: &[&[u8]],
) -> Result<rustls::ServerConfig> {
	let provider = Arc::new(crypto_provider(false));
	let mut config = rustls::ServerConfig::builder_with_provider(provider)
		.with_protocol_versions(&[&rustls::version::TLS13])?
		.with_no_client_auth()
		.with_single_cert(certs, key)?;
	config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
	Ok(config)
}

#[cfg(feature = "server")]
pub fn load_pem(
	cert_pem: &[u8],
	key_pem: &[u8],
) -> Result<(Vec<CertificateDer<'static>>, rustls::pki_types::PrivateKeyDer<'static>)> {
	let certs = rustls_pemfile::certs(&mut std::io::Cursor::new(cert_pem))
		.collect::<std::io::Result<Vec<_>>>()?;
	let key = rustls_pemfile::private_key(&mut std::io::Cursor::new(key_pem))?.ok_or_else(|| {
		ConfigSnafu {
			reason: "no private key found in PEM".to_string(),
		}
		.build()
	})?;
	if certs.is_empty() {
		return Err(ConfigSnafu {
			reason: "no certificates found in PEM".to_string(),
		}
		.build());
	}
	Ok((certs, key))
}
