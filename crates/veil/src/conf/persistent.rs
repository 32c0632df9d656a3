use std::{net::SocketAddr, path::PathBuf, time::Duration};

use educe::Educe;
use figment::{
	Figment,
	providers::{Env, Format, Toml, Yaml},
};
use serde::{Deserialize, Serialize};
use veil_ingress::inbound::AuthMode;

#[derive(Debug, Deserialize, Serialize, Educe)]
#[educe(Default)]
pub struct PersistentConfig {
	pub mode:   Mode,
	pub client: ClientConf,
	pub server: ServerConf,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Educe)]
#[educe(Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
	#[educe(Default)]
	Client,
	Server,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Educe)]
#[educe(Default)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
	#[educe(Default)]
	Ws,
	Grpc,
	GrpcWeb,
	XhttpOne,
	XhttpSplit,
}

#[derive(Debug, Deserialize, Serialize, Clone, Educe)]
#[educe(Default)]
pub enum AuthModeConfig {
	#[educe(Default)]
	NoAuth,
	Password {
		username: String,
		password: String,
	},
}

impl From<AuthModeConfig> for AuthMode {
	fn from(config: AuthModeConfig) -> Self {
		match config {
			AuthModeConfig::NoAuth => AuthMode::NoAuth,
			AuthModeConfig::Password { username, password } => {
				AuthMode::Password { username, password }
			}
		}
	}
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Educe)]
#[educe(Default)]
#[serde(rename_all = "lowercase")]
pub enum DohProvider {
	#[educe(Default)]
	Cloudflare,
	Google,
}

#[derive(Debug, Deserialize, Serialize, Educe)]
#[educe(Default)]
pub struct EchConf {
	#[educe(Default = false)]
	pub enable: bool,

	#[educe(Default = DohProvider::Cloudflare)]
	pub doh: DohProvider,

	/// Domain whose HTTPS record carries the ECHConfigList; defaults to
	/// the server host.
	#[educe(Default = None)]
	pub domain: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Educe)]
#[educe(Default)]
pub struct ClientConf {
	#[educe(Default(expression = "127.0.0.1:1080".parse().unwrap()))]
	pub listen_addr: SocketAddr,

	#[educe(Default = AuthModeConfig::NoAuth)]
	pub auth: AuthModeConfig,

	#[educe(Default = true)]
	pub allow_udp: bool,

	#[educe(Default = "example.com:443")]
	pub server_addr: String,

	#[educe(Default = None)]
	pub front_ip: Option<std::net::IpAddr>,

	#[educe(Default = None)]
	pub sni: Option<String>,

	#[educe(Default = TransportKind::Ws)]
	pub transport: TransportKind,

	#[educe(Default = "/")]
	pub path: String,

	#[educe(Default = "TunnelService")]
	pub service_name: String,

	/// EWP identity; leave empty to authenticate with `password`.
	#[educe(Default = "d342d11e-d424-4583-b36e-524ab1f0afa4")]
	pub uuid: String,

	/// Trojan password; used when `uuid` is empty.
	#[educe(Default = "")]
	pub password: String,

	#[educe(Default = false)]
	pub flow: bool,

	#[educe(Default = false)]
	pub pqc: bool,

	#[educe(Default = false)]
	pub insecure_skip_verify: bool,

	pub ech: EchConf,

	#[educe(Default = None)]
	pub user_agent: Option<String>,

	#[educe(Default = None)]
	pub content_type: Option<String>,

	#[educe(Default = None)]
	pub host_override: Option<String>,

	#[educe(Default = 100)]
	pub padding_min: usize,

	#[educe(Default = 1000)]
	pub padding_max: usize,
}

#[derive(Debug, Deserialize, Serialize, Educe)]
#[educe(Default)]
pub struct LimiterConf {
	#[educe(Default = 300)]
	pub max_requests_per_sec: u32,

	#[educe(Default = 5)]
	pub failure_threshold: u32,

	#[serde(with = "humantime_serde")]
	#[educe(Default(expression = Duration::from_secs(5)))]
	pub ban_time: Duration,

	#[serde(with = "humantime_serde")]
	#[educe(Default(expression = Duration::from_secs(60)))]
	pub failure_window: Duration,
}

#[derive(Debug, Deserialize, Serialize, Educe)]
#[educe(Default)]
pub struct WsListenerConf {
	#[educe(Default(expression = "0.0.0.0:8443".parse().unwrap()))]
	pub addr: SocketAddr,

	#[educe(Default = "/")]
	pub path: String,
}

#[derive(Debug, Deserialize, Serialize, Educe)]
#[educe(Default)]
pub struct GrpcListenerConf {
	#[educe(Default(expression = "0.0.0.0:8444".parse().unwrap()))]
	pub addr: SocketAddr,

	#[educe(Default = "TunnelService")]
	pub service_name: String,
}

#[derive(Debug, Deserialize, Serialize, Educe)]
#[educe(Default)]
pub struct XhttpListenerConf {
	#[educe(Default(expression = "0.0.0.0:8445".parse().unwrap()))]
	pub addr: SocketAddr,

	#[educe(Default = "/xhttp")]
	pub path: String,

	#[educe(Default = 100)]
	pub padding_min: usize,

	#[educe(Default = 1000)]
	pub padding_max: usize,

	#[serde(with = "humantime_serde")]
	#[educe(Default(expression = Duration::from_secs(30)))]
	pub session_ttl: Duration,
}

#[derive(Debug, Deserialize, Serialize, Educe)]
#[educe(Default)]
pub struct ServerConf {
	#[educe(Default(expression = PathBuf::from("cert.pem")))]
	pub cert: PathBuf,

	#[educe(Default(expression = PathBuf::from("key.pem")))]
	pub key: PathBuf,

	#[educe(Default(expression = vec![String::from("d342d11e-d424-4583-b36e-524ab1f0afa4")]))]
	pub users: Vec<String>,

	#[educe(Default(expression = Vec::new()))]
	pub trojan_passwords: Vec<String>,

	#[educe(Default = false)]
	pub flow: bool,

	#[educe(Default = None)]
	pub fallback: Option<SocketAddr>,

	#[serde(with = "humantime_serde")]
	#[educe(Default(expression = Duration::from_secs(10)))]
	pub dial_timeout: Duration,

	#[serde(with = "humantime_serde")]
	#[educe(Default(expression = Duration::from_secs(10)))]
	pub auth_timeout: Duration,

	#[serde(with = "humantime_serde")]
	#[educe(Default(expression = Duration::from_secs(300)))]
	pub udp_idle_timeout: Duration,

	pub limiter: LimiterConf,

	#[educe(Default(expression = Some(WsListenerConf::default())))]
	pub ws: Option<WsListenerConf>,

	#[educe(Default = None)]
	pub grpc: Option<GrpcListenerConf>,

	#[educe(Default = None)]
	pub grpc_web: Option<GrpcListenerConf>,

	#[educe(Default = None)]
	pub xhttp: Option<XhttpListenerConf>,
}

/// File names probed, in order, when no config is named explicitly.
const CANDIDATES: [&str; 3] = ["config.yaml", "config.yml", "config.toml"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileFormat {
	Yaml,
	Toml,
}

impl FileFormat {
	/// TOML when the extension says so, YAML otherwise.
	fn of(path: &std::path::Path) -> Self {
		match path.extension().and_then(|ext| ext.to_str()) {
			Some("toml") => FileFormat::Toml,
			_ => FileFormat::Yaml,
		}
	}
}

impl PersistentConfig {
	/// Serializes the config next to where it will be looked up, in the
	/// format implied by the file name.
	pub fn save(&self, path: &std::path::Path) -> eyre::Result<()> {
		let rendered = match FileFormat::of(path) {
			FileFormat::Yaml => serde_yaml::to_string(self)?,
			FileFormat::Toml => toml::to_string_pretty(self)?,
		};
		std::fs::write(path, rendered)?;
		Ok(())
	}

	/// Resolution order: an explicitly named file (which must exist), or
	/// the first candidate found in the config directory (the working
	/// directory by default), or pure defaults. `VEIL_`-prefixed
	/// environment variables overlay whatever was read, with `__`
	/// separating nested keys (`VEIL_CLIENT__LISTEN_ADDR=…`).
	pub fn load(config_path: Option<String>, config_dir: Option<PathBuf>) -> eyre::Result<Self> {
		let file = match config_path {
			Some(path) => {
				let path = PathBuf::from(path);
				if !path.is_file() {
					return Err(eyre::eyre!("config file {} not found", path.display()));
				}
				Some(path)
			}
			None => {
				let dir = config_dir.unwrap_or_else(|| PathBuf::from("."));
				CANDIDATES.iter().map(|name| dir.join(name)).find(|p| p.is_file())
			}
		};

		let mut figment = Figment::new();
		if let Some(path) = file {
			figment = match FileFormat::of(&path) {
				FileFormat::Yaml => figment.merge(Yaml::file(path)),
				FileFormat::Toml => figment.merge(Toml::file(path)),
			};
		}
		let config = figment
			.merge(Env::prefixed("VEIL_").split("__"))
			.extract()?;
		Ok(config)
	}
}
