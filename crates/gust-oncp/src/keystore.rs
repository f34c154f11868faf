//! Secret-store collaborator and key-file passphrase derivation.
//!
//! Platform keychains are behind [`SecretStore`]; the client only ever
//! needs add/find/remove. The fsid passphrase trick derives a stable
//! secret from the filesystem holding the TLS key, for gateways that
//! insist on an encrypted key but have nobody to type a passphrase.

use std::collections::HashMap;

use gust_core::SecretValue;
use snafu::prelude::*;
use zeroize::Zeroize;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum KeystoreError {
	#[snafu(display("keystore item {service}/{account} not found"))]
	NotFound { service: String, account: String },
	#[snafu(display("passphrase from fsid is not supported on this platform"))]
	Unsupported,
	#[snafu(display("could not stat '{path}'"))]
	Fsid {
		path:   String,
		source: std::io::Error,
	},
}

/// Keychain item name, `user@domain`.
pub fn keychain_name(user: &str, domain: &str) -> String {
	format!("{user}@{domain}")
}

/// The opaque keychain surface. Implementations wrap an OS keychain; the
/// in-memory one backs tests and keychain-less systems.
pub trait SecretStore {
	fn add(&mut self, service: &str, account: &str, secret: &str) -> Result<(), KeystoreError>;
	fn find(&self, service: &str, account: &str) -> Result<Option<SecretValue>, KeystoreError>;
	fn remove(&mut self, service: &str, account: &str) -> Result<(), KeystoreError>;
}

#[derive(Default)]
pub struct MemoryStore {
	items: HashMap<(String, String), String>,
}

impl SecretStore for MemoryStore {
	fn add(&mut self, service: &str, account: &str, secret: &str) -> Result<(), KeystoreError> {
		self.items
			.insert((service.to_string(), account.to_string()), secret.to_string());
		Ok(())
	}

	fn find(&self, service: &str, account: &str) -> Result<Option<SecretValue>, KeystoreError> {
		Ok(self
			.items
			.get(&(service.to_string(), account.to_string()))
			.map(|secret| SecretValue::from(secret.as_str())))
	}

	fn remove(&mut self, service: &str, account: &str) -> Result<(), KeystoreError> {
		let mut removed = self
			.items
			.remove(&(service.to_string(), account.to_string()))
			.context(NotFoundSnafu { service, account })?;
		removed.zeroize();
		Ok(())
	}
}

/// Derive a hex passphrase from the id of the filesystem containing the
/// TLS key file.
#[cfg(unix)]
pub fn passphrase_from_fsid(path: &std::path::Path) -> Result<String, KeystoreError> {
	use std::os::unix::ffi::OsStrExt;

	let cpath = std::ffi::CString::new(path.as_os_str().as_bytes()).map_err(|_| {
		KeystoreError::Fsid {
			path:   path.display().to_string(),
			source: std::io::Error::from(std::io::ErrorKind::InvalidInput),
		}
	})?;

	let mut buf: libc::statvfs = unsafe { std::mem::zeroed() };
	// SAFETY: cpath is a valid NUL-terminated path and buf is a zeroed
	// out-parameter of the right type.
	let rc = unsafe { libc::statvfs(cpath.as_ptr(), &mut buf) };
	if rc != 0 {
		return Err(KeystoreError::Fsid {
			path:   path.display().to_string(),
			source: std::io::Error::last_os_error(),
		});
	}
	Ok(format!("{:x}", buf.f_fsid))
}

#[cfg(not(unix))]
pub fn passphrase_from_fsid(_path: &std::path::Path) -> Result<String, KeystoreError> {
	UnsupportedSnafu.fail()
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn memory_store_round_trip() {
		let mut store = MemoryStore::default();
		let account = keychain_name("alice", "vpn.example.com");
		assert_eq!(account, "alice@vpn.example.com");

		store.add("gust", &account, "hunter2").unwrap();
		let found = store.find("gust", &account).unwrap().unwrap();
		assert_eq!(found.expose(), "hunter2");

		store.remove("gust", &account).unwrap();
		assert!(store.find("gust", &account).unwrap().is_none());
		assert!(matches!(
			store.remove("gust", &account),
			Err(KeystoreError::NotFound { .. })
		));
	}

	#[cfg(unix)]
	#[test]
	fn fsid_passphrase_is_stable_hex() {
		let a = passphrase_from_fsid(std::path::Path::new("/")).unwrap();
		let b = passphrase_from_fsid(std::path::Path::new("/")).unwrap();
		assert_eq!(a, b);
		assert!(!a.is_empty());
		assert!(a.chars().all(|c| c.is_ascii_hexdigit()));

		assert!(passphrase_from_fsid(std::path::Path::new("/definitely/not/here")).is_err());
	}
}
