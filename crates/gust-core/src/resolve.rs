//! Peer resolution with sticky-address memory.
//!
//! The last successfully connected address is cached so a reconnect can
//! skip DNS entirely — unless the server declared dynamic DNS and no proxy
//! is in the way. A cached address that stops working is forgotten rather
//! than looped over.

use std::net::{IpAddr, SocketAddr};

use snafu::prelude::*;

use crate::{
	cmd::CommandChannel,
	debug, info,
	io::{self, IoError},
	warn,
};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ResolveError {
	#[snafu(display("name lookup failed for '{host}'"))]
	Lookup {
		host:   String,
		source: std::io::Error,
	},
	#[snafu(display("could not connect to any address of '{host}'"))]
	Exhausted { host: String },
	#[snafu(transparent)]
	Io { source: IoError },
}

/// Injected name resolution, the seam for `getaddrinfo` overrides.
pub trait Resolve: Send + Sync {
	fn resolve(
		&self,
		host: &str,
		port: u16,
	) -> impl Future<Output = std::io::Result<Vec<SocketAddr>>> + Send;
}

/// Default resolver backed by the runtime's lookup.
pub struct SystemResolver;

impl Resolve for SystemResolver {
	async fn resolve(&self, host: &str, port: u16) -> std::io::Result<Vec<SocketAddr>> {
		Ok(tokio::net::lookup_host((host, port)).await?.collect())
	}
}

#[derive(Debug, Clone)]
pub struct HostPort {
	pub host: String,
	pub port: u16,
}

/// Where a session connects: the gateway, or a proxy in front of it.
#[derive(Debug, Clone)]
pub struct PeerTarget {
	pub host:  String,
	pub port:  u16,
	pub proxy: Option<HostPort>,
}

impl PeerTarget {
	fn endpoint(&self) -> (&str, u16) {
		match &self.proxy {
			Some(proxy) => (proxy.host.as_str(), proxy.port),
			None => (self.host.as_str(), self.port),
		}
	}
}

/// Strip `[...]` from an IPv6 literal; the bracketed form never resolves.
fn strip_brackets(host: &str) -> &str {
	host.strip_prefix('[')
		.and_then(|h| h.strip_suffix(']'))
		.unwrap_or(host)
}

/// An IP literal (or bracketed IPv6) must not go through DNS.
pub fn is_hostname(host: &str) -> bool {
	strip_brackets(host).parse::<IpAddr>().is_err()
}

pub struct PeerResolver {
	peer:            Option<SocketAddr>,
	unique_hostname: Option<String>,
	/// Server-declared hint that its DNS flaps; disables the sticky peer
	/// on direct reconnects.
	pub dyndns:      bool,
}

impl PeerResolver {
	pub fn new() -> Self {
		Self {
			peer:            None,
			unique_hostname: None,
			dyndns:          false,
		}
	}

	pub fn peer(&self) -> Option<SocketAddr> {
		self.peer
	}

	/// Textual address of the gateway actually connected to, for
	/// authentication audit fields. `None` when proxied — the true peer
	/// address is unknown then.
	pub fn unique_hostname(&self) -> Option<&str> {
		self.unique_hostname.as_deref()
	}

	pub fn forget_peer(&mut self) {
		self.peer = None;
		self.unique_hostname = None;
	}

	/// Resolve and connect, honoring the cached peer address.
	pub async fn connect<R: Resolve>(
		&mut self,
		cmd: &mut CommandChannel,
		target: &PeerTarget,
		resolver: &R,
	) -> Result<tokio::net::TcpStream, ResolveError> {
		if let Some(peer) = self.peer {
			if !self.dyndns || target.proxy.is_some() {
				debug!(target: "[RESOLVE]", "Reusing cached peer address {peer}");
				return Ok(io::connect(cmd, peer).await?);
			}
		}

		let (raw_host, port) = target.endpoint();
		let host = strip_brackets(raw_host);

		let candidates = if is_hostname(host) {
			resolver.resolve(host, port).await
		} else {
			// IP literal, bracketed or not: never touch DNS for it.
			host.parse::<IpAddr>()
				.map(|ip| vec![SocketAddr::new(ip, port)])
				.map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err))
		};

		let candidates = match candidates {
			Ok(candidates) => candidates,
			Err(source) => {
				// DNS went away but we still know where the server was.
				if let Some(peer) = self.peer {
					warn!(target: "[RESOLVE]",
						"Lookup for '{host}' failed, reconnecting to cached address {peer}");
					return Ok(io::connect(cmd, peer).await?);
				}
				return Err(source).context(LookupSnafu { host });
			}
		};

		for addr in candidates {
			debug!(target: "[RESOLVE]", "Attempting to connect to {addr}");
			match io::connect(cmd, addr).await {
				Ok(stream) => {
					info!(target: "[RESOLVE]", "Connected to {addr}");
					self.peer = Some(addr);
					self.unique_hostname = if target.proxy.is_some() {
						None
					} else {
						Some(match addr.ip() {
							IpAddr::V6(ip) => format!("[{ip}]"),
							IpAddr::V4(ip) => ip.to_string(),
						})
					};
					return Ok(stream);
				}
				Err(err) if err.is_interrupted() => return Err(err.into()),
				Err(err) => {
					info!(target: "[RESOLVE]", "Failed to connect to {addr}: {err}");
					// Lookup handed the dead cached address right back;
					// forget it so reconnects stop looping over it.
					if self.peer == Some(addr) {
						debug!(target: "[RESOLVE]", "Forgetting non-functional previous peer address");
						self.forget_peer();
					}
				}
			}
		}

		if let Some(peer) = self.peer {
			warn!(target: "[RESOLVE]",
				"All resolved addresses failed, reconnecting to cached address {peer}");
			return Ok(io::connect(cmd, peer).await?);
		}

		ExhaustedSnafu { host }.fail()
	}
}

impl Default for PeerResolver {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod test {
	use super::*;

	struct FixedResolver(Vec<SocketAddr>);

	impl Resolve for FixedResolver {
		async fn resolve(&self, _host: &str, _port: u16) -> std::io::Result<Vec<SocketAddr>> {
			Ok(self.0.clone())
		}
	}

	struct FailingResolver;

	impl Resolve for FailingResolver {
		async fn resolve(&self, _host: &str, _port: u16) -> std::io::Result<Vec<SocketAddr>> {
			Err(std::io::Error::other("no such host"))
		}
	}

	fn target() -> PeerTarget {
		PeerTarget {
			host:  "gateway.test".into(),
			port:  443,
			proxy: None,
		}
	}

	fn dead_addr() -> SocketAddr {
		let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
		let addr = listener.local_addr().unwrap();
		drop(listener);
		addr
	}

	#[test]
	fn hostname_detection() {
		assert!(is_hostname("vpn.example.com"));
		assert!(!is_hostname("192.0.2.1"));
		assert!(!is_hostname("[::1]"));
		assert!(!is_hostname("::1"));
	}

	#[test_log::test(tokio::test)]
	async fn connect_caches_sticky_peer() -> eyre::Result<()> {
		let (_handle, mut cmd) = CommandChannel::pair();
		let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
		let addr = listener.local_addr()?;

		let mut resolver = PeerResolver::new();
		let _stream = resolver
			.connect(&mut cmd, &target(), &FixedResolver(vec![addr]))
			.await?;
		assert_eq!(resolver.peer(), Some(addr));
		assert_eq!(resolver.unique_hostname(), Some("127.0.0.1"));

		// Second connect must not consult the resolver at all.
		let _stream = resolver
			.connect(&mut cmd, &target(), &FailingResolver)
			.await?;
		assert_eq!(resolver.peer(), Some(addr));
		Ok(())
	}

	#[test_log::test(tokio::test)]
	async fn lookup_failure_falls_back_to_cached_peer() -> eyre::Result<()> {
		let (_handle, mut cmd) = CommandChannel::pair();
		let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
		let addr = listener.local_addr()?;

		let mut resolver = PeerResolver::new();
		resolver.dyndns = true;
		let _stream = resolver
			.connect(&mut cmd, &target(), &FixedResolver(vec![addr]))
			.await?;

		// DynDNS forces a fresh lookup; when that fails, the cached
		// address is still good enough.
		let _stream = resolver
			.connect(&mut cmd, &target(), &FailingResolver)
			.await?;
		assert_eq!(resolver.peer(), Some(addr));
		Ok(())
	}

	#[test_log::test(tokio::test)]
	async fn dead_cached_peer_is_forgotten() -> eyre::Result<()> {
		let (_handle, mut cmd) = CommandChannel::pair();
		let gone = dead_addr();

		let mut resolver = PeerResolver::new();
		resolver.dyndns = true;
		resolver.peer = Some(gone);

		// The lookup returns the same dead address; after it fails the
		// cache must be empty instead of looping.
		let err = resolver
			.connect(&mut cmd, &target(), &FixedResolver(vec![gone]))
			.await
			.unwrap_err();
		assert!(matches!(err, ResolveError::Exhausted { .. }));
		assert_eq!(resolver.peer(), None);
		Ok(())
	}
}
