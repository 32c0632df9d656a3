use std::sync::Arc;

use clap::Parser as _;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use veil_core::{error, info, stats::TrafficStats};
use veil_ingress::inbound::MixedInbound;
use veil_tunnel::server::{ServerState, listen};

use crate::{
	cli::{Cli, Commands, ConfigFormat},
	conf::{
		persistent::{Mode, PersistentConfig},
		runtime,
	},
};

mod cli;
mod conf;
mod log;

const EXIT_OK: i32 = 0;
const EXIT_CONFIG: i32 = 1;
const EXIT_RUNTIME: i32 = 2;

#[tokio::main]
async fn main() {
	std::process::exit(run().await);
}

async fn run() -> i32 {
	if let Err(err) = log::init_log(LevelFilter::DEBUG) {
		eprintln!("{err:#}");
		return EXIT_RUNTIME;
	}

	let cli = match Cli::try_parse() {
		Ok(v) => v,
		Err(err) => {
			println!("{err:#}");
			return EXIT_CONFIG;
		}
	};

	if cli.version {
		const VER: &str = match option_env!("VEIL_OVERRIDE_VERSION") {
			Some(v) => v,
			None => env!("CARGO_PKG_VERSION"),
		};
		println!("veil {VER}");
		return EXIT_OK;
	}

	if let Some(work_dir) = &cli.work_dir {
		if let Err(err) = std::env::set_current_dir(work_dir) {
			eprintln!("cannot enter work dir {}: {err}", work_dir.display());
			return EXIT_CONFIG;
		}
	}

	if let Some(Commands::Init { format }) = &cli.command {
		let file = match format {
			ConfigFormat::Yaml => "config.yaml",
			ConfigFormat::Toml => "config.toml",
		};
		return match PersistentConfig::default().save(std::path::Path::new(file)) {
			Ok(()) => {
				println!("wrote default configuration to {file}");
				EXIT_OK
			}
			Err(err) => {
				eprintln!("{err:#}");
				EXIT_CONFIG
			}
		};
	}

	let config = match PersistentConfig::load(cli.config, cli.config_dir) {
		Ok(config) => config,
		Err(err) => {
			eprintln!("configuration error: {err:#}");
			return EXIT_CONFIG;
		}
	};

	let token = CancellationToken::new();
	{
		let token = token.clone();
		tokio::spawn(async move {
			if tokio::signal::ctrl_c().await.is_ok() {
				info!(target: "[MAIN]", "shutdown requested");
				token.cancel();
			}
		});
	}

	let result = match config.mode {
		Mode::Client => match runtime::client_runtime(config.client) {
			Ok((ingress, transport)) => run_client(ingress, transport, token).await,
			Err(err) => {
				eprintln!("configuration error: {err:#}");
				return EXIT_CONFIG;
			}
		},
		Mode::Server => match runtime::server_runtime(config.server) {
			Ok(server) => run_server(server, token).await,
			Err(err) => {
				eprintln!("configuration error: {err:#}");
				return EXIT_CONFIG;
			}
		},
	};

	match result {
		Ok(()) => EXIT_OK,
		Err(err) => {
			error!(target: "[MAIN]", "fatal: {err:#}");
			EXIT_RUNTIME
		}
	}
}

async fn run_client(
	ingress: veil_ingress::inbound::IngressOpts,
	transport: veil_tunnel::transport::Transport,
	token: CancellationToken,
) -> eyre::Result<()> {
	info!(target: "[MAIN]", "veil client starting");
	let stats = Arc::new(TrafficStats::default());
	let inbound = MixedInbound::new(ingress, Arc::new(transport), stats, None, token);
	inbound.listen().await?;
	Ok(())
}

async fn run_server(server: runtime::ServerRuntime, token: CancellationToken) -> eyre::Result<()> {
	info!(target: "[MAIN]", "veil server starting");
	let state = ServerState::new(server.opts, token.clone());

	let mut set: JoinSet<eyre::Result<()>> = JoinSet::new();

	if let Some(ws) = server.ws {
		let state = state.clone();
		let tls = server.tls.clone();
		set.spawn(async move {
			listen::listen_ws(state, ws.addr, tls, ws.path).await?;
			Ok(())
		});
	}
	if let Some(grpc) = server.grpc {
		let state = state.clone();
		let tls = server.tls.clone();
		set.spawn(async move {
			listen::listen_grpc(state, grpc.addr, tls, grpc.service_name).await?;
			Ok(())
		});
	}
	if let Some(grpc_web) = server.grpc_web {
		let state = state.clone();
		let tls = server.tls.clone();
		set.spawn(async move {
			listen::listen_grpcweb(state, grpc_web.addr, tls, grpc_web.service_name).await?;
			Ok(())
		});
	}
	if let Some(xhttp) = server.xhttp {
		let opts = runtime::xhttp_server_opts(&xhttp, state.auth_tokens());
		let state = state.clone();
		let tls = server.tls.clone();
		set.spawn(async move {
			listen::listen_xhttp(state, xhttp.addr, tls, opts).await?;
			Ok(())
		});
	}

	while let Some(joined) = set.join_next().await {
		match joined {
			Ok(Ok(())) => {}
			Ok(Err(err)) => {
				token.cancel();
				return Err(err);
			}
			Err(err) => {
				token.cancel();
				return Err(eyre::eyre!("listener task panicked: {err}"));
			}
		}
	}
	Ok(())
}
