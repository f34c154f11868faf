//! Cancellable socket operations.
//!
//! Every operation races the session's [`CommandChannel`]; a CANCEL or
//! PAUSE arriving mid-operation fails it with the distinct
//! [`IoError::Interrupted`] and the caller discards any partial result.

use std::{backtrace::Backtrace, net::SocketAddr};

use snafu::prelude::*;
use tokio::{
	io::{AsyncReadExt, AsyncWriteExt},
	net::{TcpSocket, TcpStream},
};

use crate::cmd::{CommandChannel, Interrupt};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum IoError {
	#[snafu(display("operation interrupted by {interrupt:?}"))]
	Interrupted { interrupt: Interrupt },
	#[snafu(display("connection closed by peer"))]
	Closed,
	#[snafu(display("invalid argument: {reason}"))]
	InvalidArg { reason: &'static str },
	Io {
		source:    std::io::Error,
		backtrace: Backtrace,
	},
}

impl IoError {
	pub fn is_interrupted(&self) -> bool {
		matches!(self, IoError::Interrupted { .. })
	}
}

/// Non-blocking connect, interruptible by the command channel.
///
/// Once the connect future resolves we confirm with `peer_addr()` — a
/// successful getpeername is authoritative regardless of how the wakeup
/// was signalled. On failure the pending socket error is read back.
pub async fn connect(cmd: &mut CommandChannel, addr: SocketAddr) -> Result<TcpStream, IoError> {
	if let Some(interrupt) = cmd.pending_interrupt() {
		return InterruptedSnafu { interrupt }.fail();
	}

	let socket = match addr {
		SocketAddr::V4(_) => TcpSocket::new_v4(),
		SocketAddr::V6(_) => TcpSocket::new_v6(),
	}
	.context(IoSnafu)?;

	let stream = tokio::select! {
		biased;
		interrupt = cmd.interrupted() => {
			return InterruptedSnafu { interrupt }.fail();
		}
		res = socket.connect(addr) => res.context(IoSnafu)?,
	};

	match stream.peer_addr() {
		Ok(_) => Ok(stream),
		Err(peer_err) => {
			// Fall back to the queued socket error when getpeername cannot
			// tell us why the connect failed.
			let std_stream = stream.into_std().context(IoSnafu)?;
			let err = match std_stream.take_error() {
				Ok(Some(sock_err)) => sock_err,
				_ => peer_err,
			};
			Err(err).context(IoSnafu)
		}
	}
}

/// Write all of `buf`, returning the byte count. Interruption discards the
/// transfer; the peer may have observed a prefix of it.
pub async fn send<S>(cmd: &mut CommandChannel, stream: &mut S, buf: &[u8]) -> Result<usize, IoError>
where
	S: tokio::io::AsyncWrite + Unpin,
{
	let mut count = 0;
	while count < buf.len() {
		if let Some(interrupt) = cmd.pending_interrupt() {
			return InterruptedSnafu { interrupt }.fail();
		}
		let written = tokio::select! {
			biased;
			interrupt = cmd.interrupted() => {
				return InterruptedSnafu { interrupt }.fail();
			}
			res = stream.write(&buf[count..]) => res.context(IoSnafu)?,
		};
		ensure!(written > 0, ClosedSnafu);
		count += written;
	}
	Ok(count)
}

/// Read exactly `buf.len()` bytes. A clean EOF maps to [`IoError::Closed`].
pub async fn recv<S>(cmd: &mut CommandChannel, stream: &mut S, buf: &mut [u8]) -> Result<usize, IoError>
where
	S: tokio::io::AsyncRead + Unpin,
{
	let mut count = 0;
	while count < buf.len() {
		if let Some(interrupt) = cmd.pending_interrupt() {
			return InterruptedSnafu { interrupt }.fail();
		}
		let read = tokio::select! {
			biased;
			interrupt = cmd.interrupted() => {
				return InterruptedSnafu { interrupt }.fail();
			}
			res = stream.read(&mut buf[count..]) => res.context(IoSnafu)?,
		};
		ensure!(read > 0, ClosedSnafu);
		count += read;
	}
	Ok(count)
}

/// Read whatever is available, up to `buf.len()` bytes. Returns 0 on a
/// clean EOF; used to drain connection-close response bodies.
pub async fn recv_some<S>(cmd: &mut CommandChannel, stream: &mut S, buf: &mut [u8]) -> Result<usize, IoError>
where
	S: tokio::io::AsyncRead + Unpin,
{
	if let Some(interrupt) = cmd.pending_interrupt() {
		return InterruptedSnafu { interrupt }.fail();
	}
	tokio::select! {
		biased;
		interrupt = cmd.interrupted() => InterruptedSnafu { interrupt }.fail(),
		res = stream.read(buf) => res.context(IoSnafu),
	}
}

/// Read one `\n`-terminated line into `buf`, a byte at a time.
///
/// Returns the line length excluding the terminator; a single preceding
/// `\r` is stripped. When `buf` fills, the truncated line is returned
/// without a terminator having been seen. EOF mid-line yields the partial
/// line; interruption always propagates.
pub async fn gets<S>(cmd: &mut CommandChannel, stream: &mut S, buf: &mut [u8]) -> Result<usize, IoError>
where
	S: tokio::io::AsyncRead + Unpin,
{
	ensure!(buf.len() >= 2, InvalidArgSnafu { reason: "line buffer too small" });

	let mut i = 0;
	loop {
		let mut byte = [0u8; 1];
		match recv(cmd, stream, &mut byte).await {
			Ok(_) => {}
			Err(err @ IoError::Interrupted { .. }) => return Err(err),
			Err(err) => {
				if i > 0 {
					return Ok(i);
				}
				return Err(err);
			}
		}

		if byte[0] == b'\n' {
			if i > 0 && buf[i - 1] == b'\r' {
				i -= 1;
			}
			return Ok(i);
		}

		buf[i] = byte[0];
		i += 1;
		if i >= buf.len() - 1 {
			return Ok(i);
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::cmd::{CancelKind, Command};

	#[test_log::test(tokio::test)]
	async fn gets_strips_crlf() -> Result<(), IoError> {
		let (_handle, mut cmd) = CommandChannel::pair();
		let (mut a, mut b) = tokio::io::duplex(64);
		a.write_all(b"200\r\nsecond\n").await.unwrap();

		let mut buf = [0u8; 32];
		let len = gets(&mut cmd, &mut b, &mut buf).await?;
		assert_eq!(&buf[..len], b"200");
		let len = gets(&mut cmd, &mut b, &mut buf).await?;
		assert_eq!(&buf[..len], b"second");
		Ok(())
	}

	#[test_log::test(tokio::test)]
	async fn gets_truncates_on_full_buffer() -> Result<(), IoError> {
		let (_handle, mut cmd) = CommandChannel::pair();
		let (mut a, mut b) = tokio::io::duplex(64);
		a.write_all(b"abcdefgh\n").await.unwrap();

		let mut buf = [0u8; 5];
		let len = gets(&mut cmd, &mut b, &mut buf).await?;
		assert_eq!(len, 4);
		assert_eq!(&buf[..len], b"abcd");
		Ok(())
	}

	#[test_log::test(tokio::test)]
	async fn gets_returns_partial_line_on_eof() -> Result<(), IoError> {
		let (_handle, mut cmd) = CommandChannel::pair();
		let (mut a, mut b) = tokio::io::duplex(64);
		a.write_all(b"partial").await.unwrap();
		drop(a);

		let mut buf = [0u8; 32];
		let len = gets(&mut cmd, &mut b, &mut buf).await?;
		assert_eq!(&buf[..len], b"partial");

		let err = gets(&mut cmd, &mut b, &mut buf).await.unwrap_err();
		assert!(matches!(err, IoError::Closed));
		Ok(())
	}

	#[test_log::test(tokio::test)]
	async fn recv_maps_eof_to_closed() {
		let (_handle, mut cmd) = CommandChannel::pair();
		let (a, mut b) = tokio::io::duplex(64);
		drop(a);

		let mut buf = [0u8; 4];
		let err = recv(&mut cmd, &mut b, &mut buf).await.unwrap_err();
		assert!(matches!(err, IoError::Closed));
	}

	#[test_log::test(tokio::test)]
	async fn pending_cancel_interrupts_before_io() {
		let (handle, mut cmd) = CommandChannel::pair();
		let (_a, mut b) = tokio::io::duplex(64);
		handle.send(Command::Cancel);

		let mut buf = [0u8; 4];
		let err = recv(&mut cmd, &mut b, &mut buf).await.unwrap_err();
		assert!(matches!(
			err,
			IoError::Interrupted {
				interrupt: Interrupt::Cancel(CancelKind::Cancel)
			}
		));
	}

	#[test_log::test(tokio::test)]
	async fn cancel_interrupts_blocked_read() {
		let (handle, mut cmd) = CommandChannel::pair();
		let (_a, mut b) = tokio::io::duplex(64);

		tokio::spawn(async move {
			tokio::time::sleep(std::time::Duration::from_millis(10)).await;
			handle.send(Command::Cancel);
		});

		let mut buf = [0u8; 4];
		let err = recv(&mut cmd, &mut b, &mut buf).await.unwrap_err();
		assert!(err.is_interrupted());
	}

	#[test_log::test(tokio::test)]
	async fn connect_confirms_with_getpeername() -> Result<(), IoError> {
		let (_handle, mut cmd) = CommandChannel::pair();
		let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();

		let stream = connect(&mut cmd, addr).await?;
		assert_eq!(stream.peer_addr().unwrap(), addr);
		Ok(())
	}

	#[test_log::test(tokio::test)]
	async fn connect_reports_refused() {
		let (_handle, mut cmd) = CommandChannel::pair();
		// Bind then drop to find a port nothing is listening on.
		let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
		let addr = listener.local_addr().unwrap();
		drop(listener);

		let err = connect(&mut cmd, addr).await.unwrap_err();
		assert!(matches!(err, IoError::Io { .. }));
	}
}
