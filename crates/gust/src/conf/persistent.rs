use std::{path::PathBuf, time::Duration};

use educe::Educe;
use figment::{
	Figment,
	providers::{Env, Format, Toml, Yaml},
};
use gust_core::resolve::{HostPort, PeerTarget};
use gust_oncp::{session::SessionConfig, token::TokenMode};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Educe)]
#[educe(Default)]
pub struct PersistentConfig {
	pub gateway:   GatewayOpt,
	pub token:     TokenOpt,
	pub reconnect: ReconnectOpt,
}

#[derive(Debug, Deserialize, Serialize, Educe)]
#[educe(Default)]
pub struct GatewayOpt {
	#[educe(Default = "")]
	pub host: String,

	#[educe(Default = 443)]
	pub port: u16,

	/// Initial url path on the gateway, without the leading slash.
	#[educe(Default = "")]
	pub urlpath: String,

	/// Optional HTTP proxy, host:port.
	#[educe(Default = None)]
	pub proxy: Option<String>,

	/// Endpoint-compliance helper executable (TNCC).
	#[educe(Default = None)]
	pub tncc_helper: Option<PathBuf>,

	#[educe(Default = true)]
	pub esp: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, Educe)]
#[educe(Default)]
pub enum TokenOpt {
	#[educe(Default)]
	None,
	Totp {
		seed: String,
	},
	Hotp {
		seed:    String,
		counter: u64,
	},
}

impl From<TokenOpt> for TokenMode {
	fn from(opt: TokenOpt) -> Self {
		match opt {
			TokenOpt::None => TokenMode::None,
			TokenOpt::Totp { seed } => TokenMode::Totp { seed },
			TokenOpt::Hotp { seed, counter } => TokenMode::Hotp { seed, counter },
		}
	}
}

#[derive(Debug, Deserialize, Serialize, Educe)]
#[educe(Default)]
pub struct ReconnectOpt {
	#[serde(with = "humantime_serde")]
	#[educe(Default(expression = Duration::from_secs(300)))]
	pub timeout: Duration,

	#[serde(with = "humantime_serde")]
	#[educe(Default(expression = Duration::from_secs(10)))]
	pub interval: Duration,
}

impl PersistentConfig {
	pub fn export_to_file(&self, file_path: &PathBuf, format: &str) -> eyre::Result<()> {
		use std::{fs, io::Write};

		match format.to_lowercase().as_str() {
			"yaml" => {
				let yaml_content = serde_yaml::to_string(&self)?;
				let mut file = fs::File::create(file_path)?;
				file.write_all(yaml_content.as_bytes())?;
			}
			"toml" => {
				let toml_content = toml::to_string_pretty(&self)?;
				let mut file = fs::File::create(file_path)?;
				file.write_all(toml_content.as_bytes())?;
			}
			_ => return Err(eyre::eyre!("Unsupported file format: {}", format)),
		}

		Ok(())
	}

	pub fn load(config_path: Option<String>, config_dir: Option<PathBuf>) -> eyre::Result<Self> {
		let mut figment = Figment::new();

		if let Some(config_dir) = config_dir {
			let config_file = config_dir.join("config.toml");
			if config_file.exists() {
				figment = figment.merge(Toml::file(config_file));
			}

			let config_file = config_dir.join("config.yaml");
			if config_file.exists() {
				figment = figment.merge(Yaml::file(config_file));
			}
		} else {
			let config_toml = std::path::Path::new("config.toml");
			if config_toml.exists() {
				figment = figment.merge(Toml::file(config_toml));
			}

			let config_yaml = std::path::Path::new("config.yaml");
			if config_yaml.exists() {
				figment = figment.merge(Yaml::file(config_yaml));
			}
		}

		if let Some(config_path) = config_path {
			if config_path.ends_with(".yaml") || config_path.ends_with(".yml") {
				figment = figment.merge(Yaml::file(config_path));
			} else {
				figment = figment.merge(Toml::file(config_path));
			}
		}

		// Environment variables can override config files.
		figment = figment.merge(Env::prefixed("GUST_"));

		let config: PersistentConfig = figment.extract()?;

		Ok(config)
	}

	pub fn session_config(&self) -> eyre::Result<SessionConfig> {
		eyre::ensure!(!self.gateway.host.is_empty(), "no gateway host configured");

		let proxy = match &self.gateway.proxy {
			Some(proxy) => Some(match proxy.rsplit_once(':') {
				Some((host, port)) => HostPort {
					host: host.to_string(),
					port: port.parse()?,
				},
				None => HostPort {
					host: proxy.clone(),
					port: 8080,
				},
			}),
			None => None,
		};

		let mut cfg = SessionConfig::new(PeerTarget {
			host: self.gateway.host.clone(),
			port: self.gateway.port,
			proxy,
		});
		cfg.urlpath = self.gateway.urlpath.clone();
		cfg.token = self.token.clone().into();
		cfg.tncc_helper = self.gateway.tncc_helper.clone();
		cfg.esp_enabled = self.gateway.esp;
		cfg.reconnect_timeout = self.reconnect.timeout;
		cfg.reconnect_interval = self.reconnect.interval;
		Ok(cfg)
	}
}
