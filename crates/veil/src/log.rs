use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Our own crates, logged at the requested level; everything else stays
/// at info.
const CRATES: [&str; 4] = ["veil", "veil_core", "veil_tunnel", "veil_ingress"];

/// Console logging. `VEIL_LOG` takes precedence over everything, using
/// the usual directive syntax (`VEIL_LOG=veil_tunnel=trace,info`).
pub fn init_log(level: LevelFilter) -> eyre::Result<()> {
	let mut filter = EnvFilter::builder()
		.with_default_directive(LevelFilter::INFO.into())
		.with_env_var("VEIL_LOG")
		.from_env()?;
	if std::env::var_os("VEIL_LOG").is_none() {
		for name in CRATES {
			filter = filter.add_directive(format!("{name}={level}").parse()?);
		}
	}

	tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_target(true)
		.try_init()
		.map_err(|err| eyre::eyre!("logging already initialized: {err}"))?;

	Ok(())
}
