//! Plain HTTP proxy ingress: CONNECT plus absolute-form forward proxying.

use std::sync::Arc;

use bytes::BytesMut;
use tokio::{
	io::{AsyncReadExt, AsyncWriteExt},
	net::TcpStream,
};
use veil_core::{debug, stats::TrafficStats, types::TargetAddr};
use veil_tunnel::transport::Transport;

use crate::{Error, HttpSnafu, forward};

const MAX_HEADER_BYTES: usize = 64 * 1024;
const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

struct ParsedRequest {
	method:  String,
	uri:     String,
	version: String,
	headers: Vec<(String, String)>,
}

impl ParsedRequest {
	fn header(&self, name: &str) -> Option<&str> {
		self.headers
			.iter()
			.find(|(key, _)| key.eq_ignore_ascii_case(name))
			.map(|(_, value)| value.as_str())
	}

	fn content_length(&self) -> usize {
		self.header("content-length")
			.and_then(|v| v.trim().parse().ok())
			.unwrap_or(0)
	}
}

fn parse_head(head: &str) -> Result<ParsedRequest, Error> {
	let mut lines = head.split("\r\n");
	let request_line = lines.next().unwrap_or_default();
	let mut parts = request_line.split_whitespace();
	let (Some(method), Some(uri), Some(version)) = (parts.next(), parts.next(), parts.next()) else {
		return Err(HttpSnafu {
			reason: format!("bad request line `{request_line}`"),
		}
		.build());
	};

	let mut headers = Vec::new();
	for line in lines {
		if line.is_empty() {
			continue;
		}
		let Some((key, value)) = line.split_once(':') else {
			return Err(HttpSnafu {
				reason: format!("bad header line `{line}`"),
			}
			.build());
		};
		headers.push((key.trim().to_string(), value.trim().to_string()));
	}

	Ok(ParsedRequest {
		method:  method.to_string(),
		uri:     uri.to_string(),
		version: version.to_string(),
		headers,
	})
}

/// `host[:port]` with a scheme-dependent default port.
fn parse_authority(authority: &str, default_port: u16) -> Result<TargetAddr, Error> {
	let target = if authority.contains(':') && !authority.ends_with(']') {
		TargetAddr::parse(authority)
	} else {
		TargetAddr::parse(&format!("{authority}:{default_port}"))
	};
	target.ok_or_else(|| {
		HttpSnafu {
			reason: format!("bad authority `{authority}`"),
		}
		.build()
	})
}

/// Splits `http://host[:port]/path` into target and origin-form path.
fn parse_absolute_uri(uri: &str) -> Result<(TargetAddr, String), Error> {
	let rest = uri.strip_prefix("http://").ok_or_else(|| {
		HttpSnafu {
			reason: format!("unsupported uri `{uri}`"),
		}
		.build()
	})?;
	let (authority, path) = match rest.find('/') {
		Some(idx) => (&rest[..idx], &rest[idx..]),
		None => (rest, "/"),
	};
	Ok((parse_authority(authority, 80)?, path.to_string()))
}

/// Origin-form request bytes with hop-by-hop proxy headers stripped.
fn rebuild_request(request: &ParsedRequest, path: &str) -> Vec<u8> {
	let mut out = Vec::with_capacity(256);
	out.extend_from_slice(format!("{} {} {}\r\n", request.method, path, request.version).as_bytes());
	for (key, value) in &request.headers {
		if key.to_ascii_lowercase().starts_with("proxy-") {
			continue;
		}
		out.extend_from_slice(format!("{key}: {value}\r\n").as_bytes());
	}
	out.extend_from_slice(b"\r\n");
	out
}

pub(crate) async fn serve(
	mut stream: TcpStream,
	transport: Arc<Transport>,
	stats: Arc<TrafficStats>,
) -> Result<(), Error> {
	// Read up to the end of the header block.
	let mut buf = BytesMut::with_capacity(4096);
	let head_end = loop {
		if let Some(pos) = find_head_end(&buf) {
			break pos;
		}
		if buf.len() > MAX_HEADER_BYTES {
			return Err(HttpSnafu {
				reason: "header block too large".to_string(),
			}
			.build());
		}
		let n = stream.read_buf(&mut buf).await?;
		if n == 0 {
			return Ok(());
		}
	};

	let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
	let request = parse_head(&head)?;
	let mut rest = buf.split_off(head_end + 4);

	if request.method.eq_ignore_ascii_case("CONNECT") {
		let target = parse_authority(&request.uri, 443)?;
		let tunnel = transport.dial().await?;
		if let Err(err) = tunnel.connect(target.clone(), &rest).await {
			debug!(target: "[HTTP]", "connect {target} failed: {err}");
			let _ = stream
				.write_all(b"HTTP/1.1 502 Bad Gateway\r\ncontent-length: 0\r\n\r\n")
				.await;
			tunnel.close().await;
			return Ok(());
		}
		stream
			.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
			.await?;
		return forward::pipe(stream, tunnel, stats).await;
	}

	// Forward-proxy plain request: rewrite to origin form and replay it
	// through the tunnel together with a bounded body.
	let (target, path) = parse_absolute_uri(&request.uri)?;
	let mut initial = rebuild_request(&request, &path);

	let body_len = request.content_length();
	if body_len > MAX_BODY_BYTES {
		return Err(HttpSnafu {
			reason: format!("request body of {body_len} bytes exceeds limit"),
		}
		.build());
	}
	while rest.len() < body_len {
		let n = stream.read_buf(&mut rest).await?;
		if n == 0 {
			break;
		}
	}
	initial.extend_from_slice(&rest);

	let tunnel = transport.dial().await?;
	if let Err(err) = tunnel.connect(target.clone(), &initial).await {
		debug!(target: "[HTTP]", "connect {target} failed: {err}");
		let _ = stream
			.write_all(b"HTTP/1.1 502 Bad Gateway\r\ncontent-length: 0\r\n\r\n")
			.await;
		tunnel.close().await;
		return Ok(());
	}
	forward::pipe(stream, tunnel, stats).await
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
	buf.windows(4).position(|w| w == b"\r\n\r\n")
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn parses_request_head() {
		let head = "GET http://example.com/index.html HTTP/1.1\r\nHost: example.com\r\nProxy-Connection: keep-alive\r\nContent-Length: 5";
		let request = parse_head(head).unwrap();
		assert_eq!(request.method, "GET");
		assert_eq!(request.version, "HTTP/1.1");
		assert_eq!(request.header("host"), Some("example.com"));
		assert_eq!(request.content_length(), 5);
	}

	#[test]
	fn rewrites_absolute_uri_and_strips_proxy_headers() {
		let head = "GET http://example.com:8080/a/b?q=1 HTTP/1.1\r\nHost: example.com\r\nProxy-Authorization: Basic xxx";
		let request = parse_head(head).unwrap();
		let (target, path) = parse_absolute_uri(&request.uri).unwrap();
		assert_eq!(target, TargetAddr::Domain("example.com".into(), 8080));
		assert_eq!(path, "/a/b?q=1");

		let rebuilt = String::from_utf8(rebuild_request(&request, &path)).unwrap();
		assert!(rebuilt.starts_with("GET /a/b?q=1 HTTP/1.1\r\n"));
		assert!(rebuilt.contains("Host: example.com\r\n"));
		assert!(!rebuilt.to_ascii_lowercase().contains("proxy-authorization"));
	}

	#[test]
	fn connect_authority_defaults_to_443() {
		assert_eq!(
			parse_authority("example.com:8443", 443).unwrap(),
			TargetAddr::Domain("example.com".into(), 8443)
		);
		assert_eq!(
			parse_authority("example.com", 443).unwrap(),
			TargetAddr::Domain("example.com".into(), 443)
		);
	}

	#[test]
	fn bad_request_line_rejected() {
		assert!(parse_head("GARBAGE").is_err());
		assert!(parse_absolute_uri("ftp://example.com/").is_err());
	}
}
