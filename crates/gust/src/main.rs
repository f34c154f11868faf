use std::sync::Arc;

use clap::Parser as _;
use gust_core::{SessionStats, cmd::Command, info, resolve::SystemResolver};
use gust_oncp::{
	http::TlsTransport,
	session::{Session, SessionHooks},
};
use tracing::Level;

use crate::{
	cli::{Cli, Commands},
	conf::PersistentConfig,
	prompt::ConsolePrompt,
};

mod cli;
mod conf;
mod log;
mod prompt;

struct LogHooks;

impl SessionHooks for LogHooks {
	fn stats(&self, stats: &SessionStats) {
		info!(target: "[STATS]",
			"tx {} pkts / {} bytes, rx {} pkts / {} bytes",
			stats.tx_pkts, stats.tx_bytes, stats.rx_pkts, stats.rx_bytes);
	}

	fn reconnected(&self) {
		info!(target: "[MAIN]", "Reconnected to gateway");
	}
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
	log::init_log(Level::DEBUG)?;
	let cli = match Cli::try_parse() {
		Ok(v) => v,
		Err(err) => {
			println!("{:#}", err);
			return Ok(());
		}
	};

	if cli.version {
		const VER: &str = match option_env!("GUST_OVERRIDE_VERSION") {
			Some(v) => v,
			None => env!("CARGO_PKG_VERSION"),
		};
		println!("gust {VER}");
		return Ok(());
	}

	if let Some(Commands::Init { format }) = &cli.command {
		let format = format!("{format:?}").to_lowercase();
		let path = std::path::PathBuf::from(format!("config.{format}"));
		PersistentConfig::default().export_to_file(&path, &format)?;
		println!("Wrote {}", path.display());
		return Ok(());
	}

	let mut config = PersistentConfig::load(cli.config.clone(), cli.config_dir.clone())?;
	if let Some(gateway) = &cli.gateway {
		match gateway.rsplit_once(':') {
			Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => {
				config.gateway.host = host.to_string();
				config.gateway.port = port.parse()?;
			}
			_ => config.gateway.host = gateway.clone(),
		}
	}

	let cfg = config.session_config()?;
	info!(target: "[MAIN]", "Connecting to https://{}:{}/{}",
		cfg.target.host, cfg.target.port, cfg.urlpath);

	let hooks = Arc::new(LogHooks);
	let transport = TlsTransport::new(cfg.target.clone(), cfg.urlpath.clone(), SystemResolver)?
		.with_hooks(hooks.clone());
	let (handle, mut session) = Session::new(cfg, transport, hooks);

	// Ctrl-C becomes a CANCEL on the command channel; in-flight I/O
	// returns Interrupted promptly.
	let cancel_handle = handle.clone();
	tokio::spawn(async move {
		if tokio::signal::ctrl_c().await.is_ok() {
			cancel_handle.send(Command::Cancel);
		}
	});

	let cookie = session.obtain_cookie(&mut ConsolePrompt).await?;

	if cli.authenticate {
		println!("{cookie}");
		return Ok(());
	}

	info!(target: "[MAIN]", "Authenticated; session cookie obtained");
	println!("{cookie}");
	Ok(())
}
