//! Long-lived session state and the reconnect loop.

use std::{
	path::PathBuf,
	sync::{Arc, Mutex},
	time::Duration,
};

use gust_core::{
	SessionStats,
	cmd::{CancelKind, CommandChannel, CommandHandle, Interrupt},
	debug, error, info,
	resolve::PeerTarget,
};
use snafu::prelude::*;
use tokio::sync::mpsc;

use crate::{
	esp::{DtlsState, EspError, EspSession, Packet},
	http::{HttpError, HttpsTransport},
	token::{TokenGenerator, TokenMode},
};
#[cfg(unix)]
use crate::tncc::TnccAgent;

/// Backoff growth is clamped here.
pub const RECONNECT_INTERVAL_MAX: Duration = Duration::from_secs(300);

const ESP_QUEUE_DEPTH: usize = 128;

/// Injected session callbacks. One object, passed at construction; no
/// process-global state.
pub trait SessionHooks {
	/// Invoked on every freshly connected socket, before TLS.
	fn protect_socket(&self, _stream: &tokio::net::TcpStream) {}
	/// Invoked synchronously when a STATS command arrives.
	fn stats(&self, _stats: &SessionStats) {}
	/// Invoked after a successful reconnect.
	fn reconnected(&self) {}
}

pub struct NoHooks;

impl SessionHooks for NoHooks {}

pub struct SessionConfig {
	pub target:             PeerTarget,
	pub urlpath:            String,
	pub token:              TokenMode,
	pub tncc_helper:        Option<PathBuf>,
	pub esp_enabled:        bool,
	pub reconnect_timeout:  Duration,
	pub reconnect_interval: Duration,
}

impl SessionConfig {
	pub fn new(target: PeerTarget) -> Self {
		Self {
			target,
			urlpath: String::new(),
			token: TokenMode::None,
			tncc_helper: None,
			esp_enabled: true,
			reconnect_timeout: Duration::from_secs(300),
			reconnect_interval: Duration::from_secs(10),
		}
	}
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SessionError {
	#[snafu(display("cookie is no longer valid, ending session"))]
	CookieExpired,
	#[snafu(display("gave up reconnecting"))]
	TimedOut,
	#[snafu(display("session cancelled"))]
	Cancelled { kind: CancelKind },
	#[snafu(transparent)]
	Http { source: HttpError },
}

/// Everything a connection owns, dropped together at session end.
pub struct Session<T: HttpsTransport> {
	pub cfg:       SessionConfig,
	pub cmd:       CommandChannel,
	pub transport: T,
	pub token:     TokenGenerator,
	pub esp:       EspSession,
	pub stats:     Arc<Mutex<SessionStats>>,
	/// Final session cookie, set once authentication succeeds.
	pub cookie:    Option<String>,
	#[cfg(unix)]
	pub tncc:      Option<TnccAgent>,
	esp_rx:        mpsc::Receiver<Packet>,
	hooks:         Arc<dyn SessionHooks + Send + Sync>,
}

impl<T: HttpsTransport> Session<T> {
	pub fn new(
		cfg: SessionConfig,
		transport: T,
		hooks: Arc<dyn SessionHooks + Send + Sync>,
	) -> (CommandHandle, Self) {
		let (handle, mut cmd) = CommandChannel::pair();

		let stats = Arc::new(Mutex::new(SessionStats::default()));
		let stats_for_cmd = stats.clone();
		let hooks_for_cmd = hooks.clone();
		cmd.on_stats(move || {
			let snapshot = *stats_for_cmd.lock().expect("stats lock");
			hooks_for_cmd.stats(&snapshot);
		});

		let token = TokenGenerator::new(cfg.token.clone());
		let (esp, esp_rx) = EspSession::new(cfg.esp_enabled, ESP_QUEUE_DEPTH);

		(handle, Self {
			cfg,
			cmd,
			transport,
			token,
			esp,
			stats,
			cookie: None,
			#[cfg(unix)]
			tncc: None,
			esp_rx,
			hooks,
		})
	}

	pub fn hooks(&self) -> Arc<dyn SessionHooks + Send + Sync> {
		self.hooks.clone()
	}

	/// The tun writer's end of the decrypt queue.
	pub fn packet_queue(&mut self) -> &mut mpsc::Receiver<Packet> {
		&mut self.esp_rx
	}

	/// One round of TCP/TLS setup against the gateway, validating that
	/// the session cookie still works.
	async fn tcp_connect(&mut self) -> Result<(), HttpError> {
		self.transport.get(&mut self.cmd).await.map(drop)
	}

	/// Feed one raw ESP datagram through the inbound datapath. Bad
	/// packets are logged and dropped, never fatal.
	pub async fn process_esp_datagram(&mut self, esp: &[u8]) -> Result<(), EspError> {
		match self.esp.decrypt_and_queue(esp).await {
			Ok(len) => {
				let mut stats = self.stats.lock().expect("stats lock");
				stats.rx_pkts += 1;
				stats.rx_bytes += len as u64;
				Ok(())
			}
			Err(err) if err.is_bad_packet() => {
				debug!(target: "[SESSION]", "Dropped bad ESP packet: {err}");
				Ok(())
			}
			Err(err) => Err(err),
		}
	}

	/// Encrypt one outbound tunnel packet into an ESP datagram.
	pub fn build_esp_datagram(&mut self, payload: &[u8], next_header: u8) -> Result<Vec<u8>, EspError> {
		let datagram = self.esp.encrypt(payload, next_header)?;
		let mut stats = self.stats.lock().expect("stats lock");
		stats.tx_pkts += 1;
		stats.tx_bytes += payload.len() as u64;
		Ok(datagram)
	}

	/// Tear down and re-dial with growing backoff.
	///
	/// Cancel aborts immediately; pause returns success so the caller can
	/// resume later; a 403 means the cookie expired and the session is
	/// over for good.
	pub async fn reconnect(&mut self) -> Result<(), SessionError> {
		// Anything decrypted but not yet consumed belongs to the old
		// connection.
		self.esp.drain_queue(&mut self.esp_rx);
		if self.esp.state() != DtlsState::Disabled {
			self.esp.set_state(DtlsState::Reconnecting);
		}

		let mut remaining = self.cfg.reconnect_timeout.as_secs() as i64;
		let mut interval = self.cfg.reconnect_interval;

		loop {
			match self.tcp_connect().await {
				Ok(()) => break,
				Err(HttpError::PermissionDenied { .. }) => {
					error!(target: "[SESSION]", "Cookie is no longer valid, ending session");
					return CookieExpiredSnafu.fail();
				}
				Err(err) if err.is_interrupted() => {
					return match self.cmd.cancel_kind() {
						Some(kind) => CancelledSnafu { kind }.fail(),
						// Paused mid-connect: not an error, the session
						// will be resumed.
						None => Ok(()),
					};
				}
				Err(err) => {
					if remaining <= 0 {
						error!(target: "[SESSION]", "Reconnect timed out: {err}");
						return TimedOutSnafu.fail();
					}
					info!(target: "[SESSION]",
						"sleep {}s, remaining timeout {}s", interval.as_secs(), remaining);
					match self.cmd.idle_wait(interval).await {
						Some(Interrupt::Cancel(kind)) => return CancelledSnafu { kind }.fail(),
						Some(Interrupt::Pause) => return Ok(()),
						None => {}
					}
					remaining -= interval.as_secs() as i64;
					interval += self.cfg.reconnect_interval;
					if interval > RECONNECT_INTERVAL_MAX {
						interval = RECONNECT_INTERVAL_MAX;
					}
				}
			}
		}

		if self.esp.state() != DtlsState::Disabled {
			self.esp.set_state(DtlsState::Connected);
		}
		self.hooks.reconnected();
		Ok(())
	}
}
