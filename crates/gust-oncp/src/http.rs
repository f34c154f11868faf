//! HTTPS request/response plumbing for the login flow.
//!
//! The gateway speaks plain HTTP/1.1 over TLS; each request runs on a
//! fresh connection established through the cancellable connect path.
//! Everything the auth controller needs is behind [`HttpsTransport`], so
//! tests drive the state machine with a scripted transport.

use std::sync::Arc;

use gust_core::{
	cmd::CommandChannel,
	debug, info,
	io::{self, IoError},
	resolve::{PeerResolver, PeerTarget, Resolve, ResolveError, SystemResolver},
};
use snafu::prelude::*;
use tokio_rustls::TlsConnector;

use crate::session::SessionHooks;

const MAX_REDIRECTS: usize = 10;
const LINE_BUF: usize = 4096;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum HttpError {
	#[snafu(transparent)]
	Io { source: IoError },
	#[snafu(transparent)]
	Resolve { source: ResolveError },
	#[snafu(display("TLS handshake with '{host}' failed"))]
	Tls {
		host:   String,
		source: std::io::Error,
	},
	#[snafu(display("malformed HTTP response: {reason}"))]
	Protocol { reason: String },
	#[snafu(display("unexpected HTTP status {status}"))]
	Status { status: u16 },
	#[snafu(display("access forbidden; the session cookie is no longer valid"))]
	PermissionDenied,
	#[snafu(display("too many redirects"))]
	TooManyRedirects,
	#[snafu(display("invalid server name '{host}'"))]
	ServerName { host: String },
	#[snafu(display("could not initialize the platform certificate verifier"))]
	Verifier { source: rustls::Error },
}

impl HttpError {
	pub fn is_interrupted(&self) -> bool {
		matches!(self, HttpError::Io { source } if source.is_interrupted())
			|| matches!(self, HttpError::Resolve { source: ResolveError::Io { source } } if source.is_interrupted())
	}
}

#[derive(Debug, Clone)]
pub struct Cookie {
	pub name:   String,
	pub value:  String,
	pub secure: bool,
}

/// Ordered cookie store. Setting an existing name updates it in place, so
/// insertion order is preserved and lookup by name returns the last
/// assignment.
#[derive(Debug, Default)]
pub struct CookieJar {
	cookies: Vec<Cookie>,
}

impl CookieJar {
	pub fn set(&mut self, name: &str, value: &str) {
		self.set_secure(name, value, false);
	}

	pub fn set_secure(&mut self, name: &str, value: &str, secure: bool) {
		if let Some(cookie) = self.cookies.iter_mut().rev().find(|c| c.name == name) {
			cookie.value = value.to_string();
			cookie.secure |= secure;
		} else {
			self.cookies.push(Cookie {
				name: name.to_string(),
				value: value.to_string(),
				secure,
			});
		}
	}

	pub fn get(&self, name: &str) -> Option<&str> {
		self.cookies
			.iter()
			.rev()
			.find(|c| c.name == name)
			.map(|c| c.value.as_str())
	}

	/// `Cookie:` header value, in insertion order.
	pub fn header(&self) -> Option<String> {
		if self.cookies.is_empty() {
			return None;
		}
		Some(
			self.cookies
				.iter()
				.map(|c| format!("{}={}", c.name, c.value))
				.collect::<Vec<_>>()
				.join("; "),
		)
	}

	pub fn clear(&mut self) {
		self.cookies.clear();
	}
}

/// The HTTPS surface the auth controller drives.
pub trait HttpsTransport {
	/// GET the current urlpath, following redirects; cookies from the
	/// response are in the jar before this returns.
	fn get(&mut self, cmd: &mut CommandChannel) -> impl Future<Output = Result<String, HttpError>>;

	/// POST a urlencoded body to the current urlpath.
	fn post(
		&mut self,
		cmd: &mut CommandChannel,
		body: &str,
	) -> impl Future<Output = Result<String, HttpError>>;

	fn jar(&self) -> &CookieJar;
	fn jar_mut(&mut self) -> &mut CookieJar;

	/// Point the next fetch at `url` (absolute, or a path on the current
	/// host).
	fn handle_redirect(&mut self, url: &str);

	/// Base URL of the current target, for logging and DOM context.
	fn base_url(&self) -> String;
}

/// Production transport: one TLS connection per request over the
/// cancellable connect path, with the sticky-peer resolver underneath.
pub struct TlsTransport<R: Resolve = SystemResolver> {
	target:    PeerTarget,
	urlpath:   String,
	jar:       CookieJar,
	resolver:  R,
	peers:     PeerResolver,
	connector: TlsConnector,
	hooks:     Option<Arc<dyn SessionHooks + Send + Sync>>,
}

impl<R: Resolve> TlsTransport<R> {
	pub fn new(target: PeerTarget, urlpath: impl Into<String>, resolver: R) -> Result<Self, HttpError> {
		let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
		let config = {
			use rustls_platform_verifier::BuilderVerifierExt;
			rustls::ClientConfig::builder()
				.with_platform_verifier()
				.context(VerifierSnafu)?
				.with_no_client_auth()
		};
		Ok(Self {
			target,
			urlpath: urlpath.into(),
			jar: CookieJar::default(),
			resolver,
			peers: PeerResolver::new(),
			connector: TlsConnector::from(Arc::new(config)),
			hooks: None,
		})
	}

	pub fn with_hooks(mut self, hooks: Arc<dyn SessionHooks + Send + Sync>) -> Self {
		self.hooks = Some(hooks);
		self
	}

	pub fn peers_mut(&mut self) -> &mut PeerResolver {
		&mut self.peers
	}

	async fn request(
		&mut self,
		cmd: &mut CommandChannel,
		method: &str,
		body: Option<&str>,
	) -> Result<String, HttpError> {
		for _ in 0..MAX_REDIRECTS {
			let mut stream = self.peers.connect(cmd, &self.target, &self.resolver).await?;
			if let Some(hooks) = &self.hooks {
				hooks.protect_socket(&stream);
			}
			if self.target.proxy.is_some() {
				self.proxy_connect(cmd, &mut stream).await?;
			}

			let host = self.target.host.clone();
			let server_name = rustls::pki_types::ServerName::try_from(host.clone())
				.ok()
				.context(ServerNameSnafu { host: host.clone() })?;
			let mut tls = tokio::select! {
				biased;
				interrupt = cmd.interrupted() => {
					return Err(IoError::Interrupted { interrupt }.into());
				}
				res = self.connector.connect(server_name, stream) => {
					res.context(TlsSnafu { host: host.clone() })?
				}
			};

			let head = self.request_head(method, body);
			debug!(target: "[HTTP]", "{method} {} (https://{host})", self.urlpath_abs());
			io::send(cmd, &mut tls, head.as_bytes()).await?;
			if let Some(body) = body {
				io::send(cmd, &mut tls, body.as_bytes()).await?;
			}

			match self.read_response(cmd, &mut tls).await? {
				Reply::Body(body) => return Ok(body),
				Reply::Redirect(location) => {
					debug!(target: "[HTTP]", "Redirected to {location}");
					self.handle_redirect(&location);
				}
			}
		}
		TooManyRedirectsSnafu.fail()
	}

	fn urlpath_abs(&self) -> String {
		format!("/{}", self.urlpath)
	}

	/// Open a tunnel through the HTTP proxy the TCP connection actually
	/// went to.
	async fn proxy_connect(
		&mut self,
		cmd: &mut CommandChannel,
		stream: &mut tokio::net::TcpStream,
	) -> Result<(), HttpError> {
		let request = format!(
			"CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n\r\n",
			host = self.target.host,
			port = self.target.port,
		);
		io::send(cmd, stream, request.as_bytes()).await?;

		let mut line = vec![0u8; LINE_BUF];
		let len = io::gets(cmd, stream, &mut line).await?;
		let status_line = String::from_utf8_lossy(&line[..len]).to_string();
		let ok = status_line
			.split_whitespace()
			.nth(1)
			.is_some_and(|code| code.starts_with('2'));
		ensure!(ok, ProtocolSnafu {
			reason: format!("proxy refused CONNECT: '{status_line}'"),
		});

		// Swallow the rest of the proxy's response head.
		loop {
			let len = io::gets(cmd, stream, &mut line).await?;
			if len == 0 {
				return Ok(());
			}
		}
	}

	fn request_head(&self, method: &str, body: Option<&str>) -> String {
		let mut head = format!(
			"{method} {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: gust\r\nAccept: */*\r\nNCP-Version: 3\r\nConnection: close\r\n",
			self.urlpath_abs(),
			self.target.host,
		);
		if let Some(cookies) = self.jar.header() {
			head.push_str(&format!("Cookie: {cookies}\r\n"));
		}
		if let Some(body) = body {
			head.push_str("Content-Type: application/x-www-form-urlencoded\r\n");
			head.push_str(&format!("Content-Length: {}\r\n", body.len()));
		}
		head.push_str("\r\n");
		head
	}

	async fn read_response<S>(&mut self, cmd: &mut CommandChannel, stream: &mut S) -> Result<Reply, HttpError>
	where
		S: tokio::io::AsyncRead + Unpin,
	{
		let mut line = vec![0u8; LINE_BUF];

		let len = io::gets(cmd, stream, &mut line).await?;
		let status_line = String::from_utf8_lossy(&line[..len]).to_string();
		let status: u16 = status_line
			.split_whitespace()
			.nth(1)
			.and_then(|s| s.parse().ok())
			.context(ProtocolSnafu {
				reason: format!("bad status line '{status_line}'"),
			})?;

		let mut location = None;
		let mut content_length = None;
		loop {
			let len = io::gets(cmd, stream, &mut line).await?;
			if len == 0 {
				break;
			}
			let header = String::from_utf8_lossy(&line[..len]).to_string();
			let Some((name, value)) = header.split_once(':') else {
				return ProtocolSnafu {
					reason: format!("bad header line '{header}'"),
				}
				.fail();
			};
			let value = value.trim();
			if name.eq_ignore_ascii_case("set-cookie") {
				self.apply_set_cookie(value);
			} else if name.eq_ignore_ascii_case("location") {
				location = Some(value.to_string());
			} else if name.eq_ignore_ascii_case("content-length") {
				content_length = value.parse::<usize>().ok();
			}
		}

		let body = match content_length {
			Some(len) => {
				let mut body = vec![0u8; len];
				if len > 0 {
					io::recv(cmd, stream, &mut body).await?;
				}
				body
			}
			None => {
				// Connection: close — read until the peer finishes.
				let mut body = Vec::new();
				let mut chunk = [0u8; 4096];
				loop {
					match io::recv_some(cmd, stream, &mut chunk).await? {
						0 => break,
						n => body.extend_from_slice(&chunk[..n]),
					}
				}
				body
			}
		};

		match status {
			200 => Ok(Reply::Body(String::from_utf8_lossy(&body).to_string())),
			301 | 302 | 303 | 307 => {
				let location = location.context(ProtocolSnafu {
					reason: "redirect without Location",
				})?;
				Ok(Reply::Redirect(location))
			}
			403 => PermissionDeniedSnafu.fail(),
			status => StatusSnafu { status }.fail(),
		}
	}

	/// `Set-Cookie: name=value; attrs...` — attributes other than Secure
	/// are irrelevant to this client.
	fn apply_set_cookie(&mut self, value: &str) {
		let mut parts = value.split(';');
		let Some(pair) = parts.next() else { return };
		let Some((name, value)) = pair.split_once('=') else {
			return;
		};
		let secure = parts.any(|a| a.trim().eq_ignore_ascii_case("secure"));
		debug!(target: "[HTTP]", "Set cookie '{}'", name.trim());
		self.jar.set_secure(name.trim(), value.trim(), secure);
	}
}

enum Reply {
	Body(String),
	Redirect(String),
}

impl<R: Resolve> HttpsTransport for TlsTransport<R> {
	async fn get(&mut self, cmd: &mut CommandChannel) -> Result<String, HttpError> {
		self.request(cmd, "GET", None).await
	}

	async fn post(&mut self, cmd: &mut CommandChannel, body: &str) -> Result<String, HttpError> {
		self.request(cmd, "POST", Some(body)).await
	}

	fn jar(&self) -> &CookieJar {
		&self.jar
	}

	fn jar_mut(&mut self) -> &mut CookieJar {
		&mut self.jar
	}

	fn handle_redirect(&mut self, url: &str) {
		if let Some(rest) = url.strip_prefix("https://") {
			let (hostport, path) = match rest.split_once('/') {
				Some((hostport, path)) => (hostport, path.to_string()),
				None => (rest, String::new()),
			};
			// Keep bracketed IPv6 literals intact when splitting the port.
			let (host, port) = match hostport.rsplit_once(':') {
				Some((host, port)) if !host.ends_with(']') || hostport.starts_with('[') => {
					match port.parse::<u16>() {
						Ok(port) => (host.to_string(), port),
						Err(_) => (hostport.to_string(), 443),
					}
				}
				_ => (hostport.to_string(), 443),
			};
			if host != self.target.host {
				info!(target: "[HTTP]", "Redirect to new host {host}");
				self.peers.forget_peer();
			}
			self.target.host = host;
			self.target.port = port;
			self.urlpath = path;
		} else {
			self.urlpath = url.trim_start_matches('/').to_string();
		}
	}

	fn base_url(&self) -> String {
		let mut url = format!("https://{}", self.target.host);
		if self.target.port != 443 {
			url.push_str(&format!(":{}", self.target.port));
		}
		url.push('/');
		url.push_str(&self.urlpath);
		url
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn jar_preserves_order_and_returns_last_assignment() {
		let mut jar = CookieJar::default();
		jar.set("DSSIGNIN", "url1");
		jar.set("DSPREAUTH", "a");
		jar.set("DSPREAUTH", "b");
		assert_eq!(jar.get("DSPREAUTH"), Some("b"));
		assert_eq!(jar.header().as_deref(), Some("DSSIGNIN=url1; DSPREAUTH=b"));
	}

	#[test]
	fn missing_cookie_is_none() {
		let jar = CookieJar::default();
		assert_eq!(jar.get("DSID"), None);
		assert_eq!(jar.header(), None);
	}

	#[test]
	fn redirects_rewrite_the_target() {
		let mut transport = TlsTransport::new(
			PeerTarget {
				host:  "vpn.example.com".into(),
				port:  443,
				proxy: None,
			},
			"",
			SystemResolver,
		)
		.unwrap();

		transport.handle_redirect("/dana-na/auth/url_default/welcome.cgi");
		assert_eq!(
			transport.base_url(),
			"https://vpn.example.com/dana-na/auth/url_default/welcome.cgi"
		);

		transport.handle_redirect("https://other.example.com:8443/login");
		assert_eq!(transport.base_url(), "https://other.example.com:8443/login");

		transport.handle_redirect("https://third.example.com");
		assert_eq!(transport.base_url(), "https://third.example.com/");
	}
}
