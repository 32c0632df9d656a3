//! Shared HTTP responses: the fake-nginx disguise served on unknown paths
//! to defeat active probing, plus the health endpoints.

use std::convert::Infallible;

use bytes::Bytes;
use http::{Response, StatusCode, header};
use http_body_util::{BodyExt, Full, StreamBody, combinators::BoxBody};
use hyper::body::Frame;
use tokio::sync::mpsc;
use tokio_stream::{StreamExt, wrappers::ReceiverStream};

pub type ServerBody = BoxBody<Bytes, Infallible>;

pub const HEALTH_PATHS: [&str; 2] = ["/health", "/healthz"];

/// Default nginx 1.18.0 welcome page, byte-for-byte.
pub const DISGUISE_BODY: &str = "<!DOCTYPE html>\n<html>\n<head>\n<title>Welcome to nginx!</title>\n<style>\n    body {\n        width: 35em;\n        margin: 0 auto;\n        font-family: Tahoma, Verdana, Arial, sans-serif;\n    }\n</style>\n</head>\n<body>\n<h1>Welcome to nginx!</h1>\n<p>If you see this page, the nginx web server is successfully installed and\nworking. Further configuration is required.</p>\n\n<p>For online documentation and support please refer to\n<a href=\"http://nginx.org/\">nginx.org</a>.<br/>\nCommercial support is available at\n<a href=\"http://nginx.com/\">nginx.com</a>.</p>\n\n<p><em>Thank you for using nginx.</em></p>\n</body>\n</html>\n";

pub fn disguise_response() -> Response<ServerBody> {
	Response::builder()
		.status(StatusCode::OK)
		.header("server", "nginx/1.18.0")
		.header(header::CONTENT_TYPE, "text/html")
		.body(Full::new(Bytes::from_static(DISGUISE_BODY.as_bytes())).boxed())
		.expect("static response")
}

pub fn health_response() -> Response<ServerBody> {
	text_response(StatusCode::OK, "OK")
}

pub fn text_response(status: StatusCode, body: &'static str) -> Response<ServerBody> {
	Response::builder()
		.status(status)
		.header(header::CONTENT_TYPE, "text/plain")
		.body(Full::new(Bytes::from_static(body.as_bytes())).boxed())
		.expect("static response")
}

pub fn empty_response() -> Response<ServerBody> {
	Response::builder()
		.status(StatusCode::OK)
		.body(http_body_util::Empty::new().boxed())
		.expect("static response")
}

/// Long-lived downlink body fed by a channel of pre-framed chunks.
pub fn stream_response(rx: mpsc::Receiver<Bytes>) -> Response<ServerBody> {
	let body = StreamBody::new(ReceiverStream::new(rx).map(|b| Ok::<_, Infallible>(Frame::data(b))));
	Response::builder()
		.status(StatusCode::OK)
		.header(header::CONTENT_TYPE, "application/octet-stream")
		// Tells fronting proxies to pass chunks through unbuffered.
		.header("x-accel-buffering", "no")
		.body(body.boxed())
		.expect("static response")
}
