pub mod cmd;
pub mod io;
pub mod log;
pub mod resolve;
pub mod secret;

pub use cmd::{CancelKind, Command, CommandChannel, CommandHandle, Interrupt};
pub use io::IoError;
pub use resolve::{PeerResolver, Resolve, SystemResolver};
pub use secret::{KeyMaterial, SecretValue};

/// Byte counters reported through the STATS command.
#[derive(Debug, Default, Clone, Copy)]
pub struct SessionStats {
	pub tx_pkts:  u64,
	pub tx_bytes: u64,
	pub rx_pkts:  u64,
	pub rx_bytes: u64,
}
