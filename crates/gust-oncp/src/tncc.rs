//! Trusted Network Connect preauth helper.
//!
//! The gateway may require an endpoint-compliance check before it shows a
//! login form. A helper executable performs it, talking a line protocol on
//! a socket handed to it as stdin. The helper stays alive for the whole
//! session so the controller can push cookie updates to it.

use std::{
	os::fd::{AsFd, OwnedFd},
	path::Path,
	process::Stdio,
};

use gust_core::{
	cmd::CommandChannel,
	debug, error,
	io::{self, IoError},
	warn,
};
use snafu::prelude::*;
use tokio::{net::UnixStream, process::Command};

use crate::http::CookieJar;

/// Non-empty lines tolerated after the DSPREAUTH reply before we assume
/// the helper is misbehaving.
const MAX_TRAILING_LINES: usize = 10;

const LINE_BUF: usize = 1024;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum TnccError {
	#[snafu(display("no DSPREAUTH cookie; not attempting TNCC"))]
	NoPreauthCookie,
	#[snafu(display("failed to launch TNCC helper '{path}'"))]
	Spawn {
		path:   String,
		source: std::io::Error,
	},
	#[snafu(display("failed to create socket pair for TNCC"))]
	SocketPair { source: std::io::Error },
	#[snafu(display("received unsuccessful '{status}' response from TNCC"))]
	BadStatus { status: String },
	#[snafu(display("too many non-empty lines from TNCC after DSPREAUTH cookie"))]
	TooManyLines,
	#[snafu(transparent)]
	Io { source: IoError },
}

pub struct TnccAgent {
	stream: UnixStream,
}

impl TnccAgent {
	/// Run the preauth handshake: spawn the helper and exchange the start
	/// message. The replacement DSPREAUTH cookie lands in the jar before
	/// this returns.
	pub async fn preauth(
		cmd: &mut CommandChannel,
		helper: &Path,
		hostname: &str,
		jar: &mut CookieJar,
	) -> Result<Self, TnccError> {
		ensure!(jar.get("DSPREAUTH").is_some(), NoPreauthCookieSnafu);

		let (ours, theirs) = std::os::unix::net::UnixStream::pair().context(SocketPairSnafu)?;
		ours.set_nonblocking(true).context(SocketPairSnafu)?;
		let stream = UnixStream::from_std(ours).context(SocketPairSnafu)?;

		// The helper's stdout must not pollute ours; route it to stderr.
		let stderr_copy = std::io::stderr()
			.as_fd()
			.try_clone_to_owned()
			.context(SocketPairSnafu)?;

		// Spawning clears close-on-exec only on the descriptor handed over
		// as stdin; the runtime reaps the child when it exits.
		let child = Command::new(helper)
			.arg(hostname)
			.stdin(Stdio::from(OwnedFd::from(theirs)))
			.stdout(Stdio::from(stderr_copy))
			.stderr(Stdio::inherit())
			.spawn()
			.context(SpawnSnafu {
				path: helper.display().to_string(),
			})?;
		drop(child);

		let mut agent = Self { stream };
		agent.handshake(cmd, hostname, jar).await?;
		Ok(agent)
	}

	/// The start-message exchange, separated from process spawning so it
	/// can be driven against a scripted stream.
	async fn handshake(
		&mut self,
		cmd: &mut CommandChannel,
		hostname: &str,
		jar: &mut CookieJar,
	) -> Result<(), TnccError> {
		let dspreauth = jar.get("DSPREAUTH").context(NoPreauthCookieSnafu)?;
		let dssignin = jar.get("DSSIGNIN").unwrap_or("null");

		let start = format!("start\nIC={hostname}\nCookie={dspreauth}\nDSSIGNIN={dssignin}\n");
		io::send(cmd, &mut self.stream, start.as_bytes()).await?;
		debug!(target: "[TNCC]", "Sent start; waiting for response from TNCC");

		let mut line = vec![0u8; LINE_BUF];

		// First line: HTTP-like response code.
		let len = io::gets(cmd, &mut self.stream, &mut line).await?;
		let status = String::from_utf8_lossy(&line[..len]).to_string();
		if status != "200" {
			error!(target: "[TNCC]", "Received unsuccessful {status} response from TNCC");
			return BadStatusSnafu { status }.fail();
		}

		// Second line is informational only.
		let len = io::gets(cmd, &mut self.stream, &mut line).await?;
		debug!(target: "[TNCC]", "Second line of TNCC response: '{}'", String::from_utf8_lossy(&line[..len]));

		// Third line is the replacement DSPREAUTH cookie.
		let len = io::gets(cmd, &mut self.stream, &mut line).await?;
		let new_cookie = String::from_utf8_lossy(&line[..len]).to_string();
		debug!(target: "[TNCC]", "Got new DSPREAUTH cookie from TNCC");
		jar.set_secure("DSPREAUTH", &new_cookie, true);

		let mut count = 0;
		loop {
			let len = io::gets(cmd, &mut self.stream, &mut line).await?;
			if len == 0 {
				break;
			}
			warn!(target: "[TNCC]",
				"Unexpected non-empty line from TNCC after DSPREAUTH cookie: '{}'",
				String::from_utf8_lossy(&line[..len]));
			count += 1;
			if count > MAX_TRAILING_LINES {
				return TooManyLinesSnafu.fail();
			}
		}

		Ok(())
	}

	/// Keep the helper's view of the session cookie in sync.
	pub async fn set_cookie(&mut self, cmd: &mut CommandChannel, value: &str) -> Result<(), TnccError> {
		let message = format!("setcookie\nCookie={value}\n");
		io::send(cmd, &mut self.stream, message.as_bytes()).await?;
		Ok(())
	}
}

#[cfg(test)]
mod test {
	use super::*;

	async fn scripted_agent(reply: &str) -> (TnccAgent, UnixStream) {
		let (ours, theirs) = UnixStream::pair().unwrap();
		let agent = TnccAgent { stream: ours };
		use tokio::io::AsyncWriteExt;
		let mut theirs = theirs;
		theirs.write_all(reply.as_bytes()).await.unwrap();
		(agent, theirs)
	}

	fn preauth_jar() -> CookieJar {
		let mut jar = CookieJar::default();
		jar.set("DSPREAUTH", "cookieA");
		jar
	}

	#[test_log::test(tokio::test)]
	async fn handshake_replaces_dspreauth() {
		let (_handle, mut cmd) = CommandChannel::pair();
		let (mut agent, mut helper) = scripted_agent("200\nignored\ncookieB\n\n").await;
		let mut jar = preauth_jar();

		agent.handshake(&mut cmd, "vpn.example.com", &mut jar).await.unwrap();
		assert_eq!(jar.get("DSPREAUTH"), Some("cookieB"));

		// The helper saw the framed start message.
		use tokio::io::AsyncReadExt;
		let mut buf = vec![0u8; 256];
		let n = helper.read(&mut buf).await.unwrap();
		assert_eq!(
			String::from_utf8_lossy(&buf[..n]),
			"start\nIC=vpn.example.com\nCookie=cookieA\nDSSIGNIN=null\n"
		);
	}

	#[test_log::test(tokio::test)]
	async fn non_200_status_fails() {
		let (_handle, mut cmd) = CommandChannel::pair();
		let (mut agent, _helper) = scripted_agent("500\noops\nx\n\n").await;
		let mut jar = preauth_jar();

		let err = agent.handshake(&mut cmd, "host", &mut jar).await.unwrap_err();
		assert!(matches!(err, TnccError::BadStatus { .. }));
		assert_eq!(jar.get("DSPREAUTH"), Some("cookieA"));
	}

	#[test_log::test(tokio::test)]
	async fn tolerates_up_to_ten_trailing_lines() {
		let (_handle, mut cmd) = CommandChannel::pair();
		let trailing = "extra\n".repeat(10);
		let (mut agent, _helper) = scripted_agent(&format!("200\ninfo\ncookieB\n{trailing}\n")).await;
		let mut jar = preauth_jar();

		agent.handshake(&mut cmd, "host", &mut jar).await.unwrap();
		assert_eq!(jar.get("DSPREAUTH"), Some("cookieB"));
	}

	#[test_log::test(tokio::test)]
	async fn rejects_more_than_ten_trailing_lines() {
		let (_handle, mut cmd) = CommandChannel::pair();
		let trailing = "extra\n".repeat(11);
		let (mut agent, _helper) = scripted_agent(&format!("200\ninfo\ncookieB\n{trailing}\n")).await;
		let mut jar = preauth_jar();

		let err = agent.handshake(&mut cmd, "host", &mut jar).await.unwrap_err();
		assert!(matches!(err, TnccError::TooManyLines));
	}

	#[test_log::test(tokio::test)]
	async fn setcookie_frames_the_value() {
		let (_handle, mut cmd) = CommandChannel::pair();
		let (mut agent, mut helper) = scripted_agent("").await;

		agent.set_cookie(&mut cmd, "DSID=abcd").await.unwrap();

		use tokio::io::AsyncReadExt;
		let mut buf = vec![0u8; 64];
		let n = helper.read(&mut buf).await.unwrap();
		assert_eq!(String::from_utf8_lossy(&buf[..n]), "setcookie\nCookie=DSID=abcd\n");
	}
}
