//! One-time-token generation for challenge forms.
//!
//! TOTP (RFC 6238) and HOTP (RFC 4226) are computed in-process from a
//! base32 seed. The vendor softtoken and smart-card modes exist as
//! selectable modes but have no backing implementation built in; choosing
//! them fails generation, which bypasses the token so the user can type
//! the code by hand on the next attempt.

use std::time::{SystemTime, UNIX_EPOCH};

use gust_core::debug;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use snafu::prelude::*;

use crate::form::AuthForm;

const TOTP_STEP_SECS: u64 = 30;
const OTP_DIGITS: u32 = 6;

/// Form ids that may carry a token challenge.
const TOKEN_FORM_IDS: [&str; 3] = ["frmDefender", "frmNextToken", "frmTotpToken"];

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum TokenError {
	#[snafu(display("token seed is not valid base32"))]
	BadSeed,
	#[snafu(display("no token generator configured"))]
	NotConfigured,
	#[snafu(display("token mode requires an external token engine that is not built in"))]
	Unsupported,
	#[snafu(display("system clock is before the epoch"))]
	Clock,
}

#[derive(Debug, Clone)]
pub enum TokenMode {
	None,
	Totp { seed: String },
	Hotp { seed: String, counter: u64 },
	/// RSA SecurID-style softtoken; needs an external engine.
	Stoken,
	/// OATH applet on a smart card; needs an external engine.
	Yubikey,
}

pub struct TokenGenerator {
	mode:         TokenMode,
	/// Set after a generation failure; the controller aborts the attempt
	/// and subsequent forms fall back to manual entry.
	pub bypassed: bool,
}

impl TokenGenerator {
	pub fn new(mode: TokenMode) -> Self {
		Self { mode, bypassed: false }
	}

	pub fn disabled() -> Self {
		Self::new(TokenMode::None)
	}

	/// Whether a password input on the form `auth_id` should be re-typed
	/// as a token field.
	pub fn can_generate(&self, auth_id: &str) -> bool {
		if matches!(self.mode, TokenMode::None) || self.bypassed {
			return false;
		}
		TOKEN_FORM_IDS.contains(&auth_id)
	}

	/// Generate a code into the form's TOKEN opt, if it has one.
	pub fn fill_form(&mut self, form: &mut AuthForm) -> Result<(), TokenError> {
		let auth_id = form.auth_id.clone();
		let Some(opt) = form.token_opt_mut() else {
			// This form has nothing for us to do.
			return Ok(());
		};
		let code = self.generate_at(SystemTime::now())?;
		debug!(target: "[TOKEN]", "Generated tokencode for form '{}'", auth_id);
		opt.set_value(&code);
		Ok(())
	}

	pub fn generate_at(&mut self, now: SystemTime) -> Result<String, TokenError> {
		match &mut self.mode {
			TokenMode::None => NotConfiguredSnafu.fail(),
			TokenMode::Totp { seed } => {
				let key = decode_seed(seed)?;
				let step = now
					.duration_since(UNIX_EPOCH)
					.ok()
					.context(ClockSnafu)?
					.as_secs() / TOTP_STEP_SECS;
				Ok(hotp_sha1(&key, step))
			}
			TokenMode::Hotp { seed, counter } => {
				let key = decode_seed(seed)?;
				let code = hotp_sha1(&key, *counter);
				*counter += 1;
				Ok(code)
			}
			TokenMode::Stoken | TokenMode::Yubikey => UnsupportedSnafu.fail(),
		}
	}
}

fn decode_seed(seed: &str) -> Result<Vec<u8>, TokenError> {
	let normalized = seed.trim().to_ascii_uppercase().replace(' ', "");
	base32::decode(base32::Alphabet::Rfc4648 { padding: false }, &normalized).context(BadSeedSnafu)
}

/// RFC 4226 dynamic truncation over HMAC-SHA1.
fn hotp_sha1(key: &[u8], counter: u64) -> String {
	let mut mac = Hmac::<Sha1>::new_from_slice(key).expect("HMAC accepts any key length");
	mac.update(&counter.to_be_bytes());
	let digest = mac.finalize().into_bytes();

	let offset = (digest[digest.len() - 1] & 0x0f) as usize;
	let binary = u32::from_be_bytes([
		digest[offset] & 0x7f,
		digest[offset + 1],
		digest[offset + 2],
		digest[offset + 3],
	]);
	format!("{:01$}", binary % 10u32.pow(OTP_DIGITS), OTP_DIGITS as usize)
}

#[cfg(test)]
mod test {
	use std::time::Duration;

	use super::*;

	// RFC 4226 appendix D secret, "12345678901234567890" in base32.
	const RFC_SEED: &str = "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ";

	#[test]
	fn hotp_matches_rfc4226_vectors() {
		let mut generator = TokenGenerator::new(TokenMode::Hotp {
			seed:    RFC_SEED.into(),
			counter: 0,
		});
		let expected = ["755224", "287082", "359152", "969429", "338314"];
		for code in expected {
			assert_eq!(generator.generate_at(SystemTime::now()).unwrap(), code);
		}
	}

	#[test]
	fn totp_matches_rfc6238_vector() {
		let mut generator = TokenGenerator::new(TokenMode::Totp { seed: RFC_SEED.into() });
		// RFC 6238 appendix B, T = 59 (step 1): 94287082, last six digits.
		let at = UNIX_EPOCH + Duration::from_secs(59);
		assert_eq!(generator.generate_at(at).unwrap(), "287082");
	}

	#[test]
	fn can_generate_is_gated_by_form_id_and_mode() {
		let generator = TokenGenerator::new(TokenMode::Totp { seed: RFC_SEED.into() });
		assert!(generator.can_generate("frmTotpToken"));
		assert!(generator.can_generate("frmDefender"));
		assert!(!generator.can_generate("frmLogin"));

		let mut bypassed = TokenGenerator::new(TokenMode::Totp { seed: RFC_SEED.into() });
		bypassed.bypassed = true;
		assert!(!bypassed.can_generate("frmTotpToken"));
		assert!(!TokenGenerator::disabled().can_generate("frmTotpToken"));
	}

	#[test]
	fn vendor_modes_report_unsupported() {
		let mut generator = TokenGenerator::new(TokenMode::Stoken);
		assert!(matches!(
			generator.generate_at(SystemTime::now()),
			Err(TokenError::Unsupported)
		));
	}

	#[test]
	fn garbage_seed_is_rejected() {
		let mut generator = TokenGenerator::new(TokenMode::Totp { seed: "not base32!".into() });
		assert!(matches!(
			generator.generate_at(SystemTime::now()),
			Err(TokenError::BadSeed)
		));
	}
}
