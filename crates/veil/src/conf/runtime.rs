use std::sync::Arc;

use uuid::Uuid;
use veil_core::types::TargetAddr;
use veil_ingress::inbound::IngressOpts;
use veil_tunnel::{
	proto::TrojanKey,
	server::{ServerOpts, limiter::RateLimiterConfig},
	transport::{
		CarrierKind, Transport, TransportOpts, TunnelAuth,
		ech::{DohClient, EchManager, HickoryDoh},
		xhttp::XhttpServerOpts,
	},
};

use super::persistent::{ClientConf, DohProvider, ServerConf, TransportKind};

pub fn client_runtime(conf: ClientConf) -> eyre::Result<(IngressOpts, Transport)> {
	let server = TargetAddr::parse(&conf.server_addr)
		.ok_or_else(|| eyre::eyre!("bad server_addr `{}`", conf.server_addr))?;

	let auth = if !conf.uuid.is_empty() {
		TunnelAuth::Ewp {
			uuid: Uuid::parse_str(&conf.uuid)?,
		}
	} else if !conf.password.is_empty() {
		TunnelAuth::Trojan {
			key: TrojanKey::from_password(&conf.password),
		}
	} else {
		return Err(eyre::eyre!("either uuid or password must be set"));
	};

	let ech = if conf.ech.enable {
		let doh: Box<dyn DohClient> = match conf.ech.doh {
			DohProvider::Cloudflare => Box::new(HickoryDoh::cloudflare()),
			DohProvider::Google => Box::new(HickoryDoh::google()),
		};
		let domain = conf.ech.domain.clone().unwrap_or_else(|| server.host());
		Some(EchManager::new(domain, doh))
	} else {
		None
	};

	let mut opts = TransportOpts::new(server, auth);
	opts.front_ip = conf.front_ip;
	opts.sni_override = conf.sni;
	opts.path = conf.path;
	opts.service_name = conf.service_name;
	opts.flow = conf.flow;
	opts.pqc = conf.pqc;
	opts.insecure_skip_verify = conf.insecure_skip_verify;
	opts.ech = ech;
	opts.user_agent = conf.user_agent;
	opts.content_type = conf.content_type;
	opts.host_override = conf.host_override;
	opts.padding_min = conf.padding_min;
	opts.padding_max = conf.padding_max;

	let kind = match conf.transport {
		TransportKind::Ws => CarrierKind::Ws,
		TransportKind::Grpc => CarrierKind::Grpc,
		TransportKind::GrpcWeb => CarrierKind::GrpcWeb,
		TransportKind::XhttpOne => CarrierKind::XhttpStreamOne,
		TransportKind::XhttpSplit => CarrierKind::XhttpStreamDown,
	};

	let ingress = IngressOpts {
		listen_addr: conf.listen_addr,
		auth:        conf.auth.into(),
		allow_udp:   conf.allow_udp,
		..Default::default()
	};

	Ok((ingress, Transport::new(kind, opts)))
}

pub struct ServerRuntime {
	pub opts:       ServerOpts,
	pub tls:        Arc<rustls::ServerConfig>,
	pub ws:         Option<super::persistent::WsListenerConf>,
	pub grpc:       Option<super::persistent::GrpcListenerConf>,
	pub grpc_web:   Option<super::persistent::GrpcListenerConf>,
	pub xhttp:      Option<super::persistent::XhttpListenerConf>,
}

pub fn server_runtime(conf: ServerConf) -> eyre::Result<ServerRuntime> {
	let users = conf
		.users
		.iter()
		.map(|raw| Uuid::parse_str(raw).map_err(|err| eyre::eyre!("bad uuid `{raw}`: {err}")))
		.collect::<eyre::Result<Vec<_>>>()?;
	if users.is_empty() && conf.trojan_passwords.is_empty() {
		return Err(eyre::eyre!("no users and no trojan passwords configured"));
	}
	if conf.ws.is_none() && conf.grpc.is_none() && conf.grpc_web.is_none() && conf.xhttp.is_none() {
		return Err(eyre::eyre!("no carrier listeners configured"));
	}

	let cert_pem = std::fs::read(&conf.cert)
		.map_err(|err| eyre::eyre!("read certificate {}: {err}", conf.cert.display()))?;
	let key_pem = std::fs::read(&conf.key)
		.map_err(|err| eyre::eyre!("read private key {}: {err}", conf.key.display()))?;
	let (certs, key) = veil_tunnel::transport::tls::load_pem(&cert_pem, &key_pem)?;
	let tls = Arc::new(veil_tunnel::transport::tls::server_config(certs, key, &[])?);

	let opts = ServerOpts {
		users,
		trojan_passwords: conf.trojan_passwords,
		flow: conf.flow,
		fallback: conf.fallback,
		limiter: RateLimiterConfig {
			max_requests_per_sec: conf.limiter.max_requests_per_sec,
			failure_threshold:    conf.limiter.failure_threshold,
			ban_time:             conf.limiter.ban_time,
			failure_window:       conf.limiter.failure_window,
		},
		dial_timeout: conf.dial_timeout,
		auth_timeout: conf.auth_timeout,
		udp_idle_timeout: conf.udp_idle_timeout,
	};

	Ok(ServerRuntime {
		opts,
		tls,
		ws: conf.ws,
		grpc: conf.grpc,
		grpc_web: conf.grpc_web,
		xhttp: conf.xhttp,
	})
}

pub fn xhttp_server_opts(conf: &super::persistent::XhttpListenerConf, tokens: Vec<String>) -> XhttpServerOpts {
	XhttpServerOpts {
		path: conf.path.clone(),
		padding_min: conf.padding_min,
		padding_max: conf.padding_max,
		tokens,
		session_ttl: conf.session_ttl,
		..Default::default()
	}
}
