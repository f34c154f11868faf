//! External control channel.
//!
//! A session is steered from outside through single-byte commands. The
//! write half ([`CommandHandle`]) is cheap to clone and can be driven from
//! a signal handler task or another thread; the read half lives inside the
//! session and is polled by every cancellable operation.

use num_enum::{FromPrimitive, IntoPrimitive};
use tokio::sync::mpsc;

use crate::debug;

/// Single-byte command protocol. No response is ever written back.
#[derive(IntoPrimitive, FromPrimitive, Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
	Cancel = b'x',
	Pause  = b'p',
	Detach = b'd',
	Stats  = b's',
	#[num_enum(catch_all)]
	Other(u8),
}

/// How a cancellation was requested. DETACH leaves the gateway session
/// alive for later re-attachment; CANCEL logs out.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CancelKind {
	Cancel,
	Detach,
}

/// A latched interruption observed by a waiting operation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Interrupt {
	Cancel(CancelKind),
	Pause,
}

/// Write half of the command channel.
#[derive(Clone)]
pub struct CommandHandle {
	tx: mpsc::UnboundedSender<u8>,
}

impl CommandHandle {
	pub fn send(&self, cmd: Command) {
		let _ = self.tx.send(cmd.into());
	}

	/// Raw byte entry point for callers bridging an actual pipe.
	pub fn send_byte(&self, byte: u8) {
		let _ = self.tx.send(byte);
	}
}

/// Read half of the command channel, owned by the session.
///
/// CANCEL and DETACH latch until the session ends; PAUSE latches until
/// [`clear_pause`](Self::clear_pause). STATS is handled synchronously by
/// invoking the installed handler and latches nothing.
pub struct CommandChannel {
	rx:            mpsc::UnboundedReceiver<u8>,
	got_cancel:    Option<CancelKind>,
	got_pause:     bool,
	stats_handler: Option<Box<dyn FnMut() + Send>>,
}

impl CommandChannel {
	pub fn pair() -> (CommandHandle, Self) {
		let (tx, rx) = mpsc::unbounded_channel();
		(CommandHandle { tx }, Self {
			rx,
			got_cancel: None,
			got_pause: false,
			stats_handler: None,
		})
	}

	/// Install the callback run on STATS. The callback reads the live
	/// counters; the channel itself does not know about them.
	pub fn on_stats(&mut self, handler: impl FnMut() + Send + 'static) {
		self.stats_handler = Some(Box::new(handler));
	}

	fn apply(&mut self, byte: u8) {
		match Command::from(byte) {
			Command::Cancel => {
				self.got_cancel.get_or_insert(CancelKind::Cancel);
			}
			Command::Detach => {
				self.got_cancel.get_or_insert(CancelKind::Detach);
			}
			Command::Pause => self.got_pause = true,
			Command::Stats => {
				if let Some(handler) = self.stats_handler.as_mut() {
					handler();
				}
			}
			Command::Other(value) => {
				debug!(target: "[CMD]", "Ignoring unknown command byte {value:#04x}");
			}
		}
	}

	/// Drain without blocking, latching whatever has arrived.
	pub fn poll_pending(&mut self) {
		while let Ok(byte) = self.rx.try_recv() {
			self.apply(byte);
		}
	}

	/// Latched cancel/pause state. Cancel outranks pause.
	pub fn pending_interrupt(&mut self) -> Option<Interrupt> {
		self.poll_pending();
		if let Some(kind) = self.got_cancel {
			return Some(Interrupt::Cancel(kind));
		}
		if self.got_pause {
			return Some(Interrupt::Pause);
		}
		None
	}

	/// Resolves once a cancel or pause arrives. Intended as one arm of a
	/// `select!` racing an I/O future; it is cancel-safe.
	pub async fn interrupted(&mut self) -> Interrupt {
		loop {
			if let Some(interrupt) = self.pending_interrupt() {
				return interrupt;
			}
			match self.rx.recv().await {
				Some(byte) => self.apply(byte),
				// All handles dropped: no interruption can ever arrive.
				None => std::future::pending::<()>().await,
			}
		}
	}

	/// Sleep for `duration`, still servicing commands. Returns early with
	/// the interrupt if one arrives. Used by the reconnect backoff.
	pub async fn idle_wait(&mut self, duration: std::time::Duration) -> Option<Interrupt> {
		tokio::select! {
			interrupt = self.interrupted() => Some(interrupt),
			_ = tokio::time::sleep(duration) => None,
		}
	}

	pub fn clear_pause(&mut self) {
		self.got_pause = false;
	}

	pub fn cancel_kind(&self) -> Option<CancelKind> {
		self.got_cancel
	}
}

#[cfg(test)]
mod test {
	use std::time::Duration;

	use super::*;

	#[test_log::test(tokio::test)]
	async fn cancel_outranks_pause() {
		let (handle, mut chan) = CommandChannel::pair();
		handle.send(Command::Pause);
		handle.send(Command::Cancel);
		assert_eq!(
			chan.pending_interrupt(),
			Some(Interrupt::Cancel(CancelKind::Cancel))
		);
	}

	#[test_log::test(tokio::test)]
	async fn detach_latches_its_kind() {
		let (handle, mut chan) = CommandChannel::pair();
		handle.send_byte(b'd');
		assert_eq!(chan.interrupted().await, Interrupt::Cancel(CancelKind::Detach));
		assert_eq!(chan.cancel_kind(), Some(CancelKind::Detach));
	}

	#[test_log::test(tokio::test)]
	async fn stats_invokes_handler_without_latching() {
		let (handle, mut chan) = CommandChannel::pair();
		let hits = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
		let hits_in = hits.clone();
		chan.on_stats(move || {
			hits_in.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
		});
		handle.send(Command::Stats);
		handle.send(Command::Stats);
		chan.poll_pending();
		assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 2);
		assert_eq!(chan.pending_interrupt(), None);
	}

	#[test_log::test(tokio::test)]
	async fn idle_wait_returns_early_on_command() {
		let (handle, mut chan) = CommandChannel::pair();
		handle.send(Command::Pause);
		let interrupt = chan.idle_wait(Duration::from_secs(60)).await;
		assert_eq!(interrupt, Some(Interrupt::Pause));
		chan.clear_pause();
		assert_eq!(chan.idle_wait(Duration::from_millis(5)).await, None);
	}
}
