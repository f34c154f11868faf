//! Secret-bearing values with wipe-on-release semantics.
//!
//! Passwords, token codes and ESP key material must not linger in freed
//! memory. Both wrappers overwrite their contents before release on every
//! exit path, including unwind.

use std::fmt;

use secrecy::{ExposeSecret, SecretString};
use zeroize::Zeroizing;

/// Raw key bytes, zeroed when dropped.
pub type KeyMaterial = Zeroizing<Vec<u8>>;

/// A secret form value (password or generated token code).
///
/// The backing string is wiped when the value is cleared, replaced or
/// dropped. `Debug` never prints the contents.
#[derive(Default)]
pub struct SecretValue(Option<SecretString>);

impl SecretValue {
	pub fn new() -> Self {
		Self(None)
	}

	pub fn set(&mut self, value: impl Into<String>) {
		self.0 = Some(SecretString::from(value.into()));
	}

	pub fn expose(&self) -> &str {
		self.0.as_ref().map(|s| s.expose_secret()).unwrap_or("")
	}

	pub fn is_empty(&self) -> bool {
		self.0.as_ref().is_none_or(|s| s.expose_secret().is_empty())
	}

	pub fn clear(&mut self) {
		self.0 = None;
	}
}

impl From<&str> for SecretValue {
	fn from(value: &str) -> Self {
		let mut secret = Self::new();
		secret.set(value);
		secret
	}
}

impl fmt::Debug for SecretValue {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if self.is_empty() {
			f.write_str("SecretValue(empty)")
		} else {
			f.write_str("SecretValue(***)")
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn debug_never_prints_contents() {
		let secret = SecretValue::from("hunter2");
		assert_eq!(format!("{secret:?}"), "SecretValue(***)");
	}

	#[test]
	fn expose_and_clear() {
		let mut secret = SecretValue::new();
		assert!(secret.is_empty());
		secret.set("hunter2");
		assert_eq!(secret.expose(), "hunter2");
		secret.clear();
		assert!(secret.is_empty());
		assert_eq!(secret.expose(), "");
	}
}
