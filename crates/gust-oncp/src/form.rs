//! In-memory model of a gateway login form.
//!
//! A form lives for exactly one prompt round-trip: parsed from a response,
//! filled in by the prompt callback (and the token generator), encoded
//! into a POST body, then dropped — at which point the secret-bearing
//! values are wiped.

use gust_core::{SecretValue, debug};

/// Outcome of the prompt callback.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FormResult {
	/// Values are filled in, submit the form.
	Filled,
	/// The user changed the authgroup selection; re-fetch the form and
	/// restart classification.
	NewGroup,
	/// The user gave up.
	Cancelled,
}

/// Caller-supplied prompt. Invoked once per form; fills values in place.
pub trait AuthPrompt {
	fn process_auth_form(&mut self, form: &mut AuthForm) -> FormResult;
}

/// One entry of a SELECT option.
#[derive(Debug, Default, Clone)]
pub struct Choice {
	pub name:           String,
	pub label:          String,
	pub auth_type:      Option<String>,
	pub override_name:  Option<String>,
	pub override_label: Option<String>,
}

/// A single form field. Variants share `name`/`label` accessors; PASSWORD
/// and TOKEN values are secret-bearing. A SELECT stores its selection as
/// an index into `choices` — the selected "value" is borrowed, never
/// aliased.
#[derive(Debug)]
pub enum FormOpt {
	Hidden {
		name:  String,
		value: String,
	},
	Text {
		name:  String,
		label: String,
		value: String,
	},
	Password {
		name:  String,
		label: String,
		value: SecretValue,
	},
	Token {
		name:  String,
		label: String,
		value: SecretValue,
	},
	Select {
		name:     String,
		label:    String,
		choices:  Vec<Choice>,
		selected: Option<usize>,
	},
}

impl FormOpt {
	pub fn name(&self) -> &str {
		match self {
			FormOpt::Hidden { name, .. }
			| FormOpt::Text { name, .. }
			| FormOpt::Password { name, .. }
			| FormOpt::Token { name, .. }
			| FormOpt::Select { name, .. } => name,
		}
	}

	pub fn label(&self) -> &str {
		match self {
			FormOpt::Hidden { name, .. } => name,
			FormOpt::Text { label, .. }
			| FormOpt::Password { label, .. }
			| FormOpt::Token { label, .. }
			| FormOpt::Select { label, .. } => label,
		}
	}

	/// Current submit value. For a SELECT this borrows the selected
	/// choice's name; unset values read as empty.
	pub fn value(&self) -> &str {
		match self {
			FormOpt::Hidden { value, .. } => value,
			FormOpt::Text { value, .. } => value,
			FormOpt::Password { value, .. } | FormOpt::Token { value, .. } => value.expose(),
			FormOpt::Select { choices, selected, .. } => selected
				.and_then(|i| choices.get(i))
				.map(|c| c.name.as_str())
				.unwrap_or(""),
		}
	}

	/// Fill in a submit value. Selecting on a SELECT matches by choice
	/// name.
	pub fn set_value(&mut self, new: &str) {
		match self {
			FormOpt::Hidden { value, .. } | FormOpt::Text { value, .. } => *value = new.to_string(),
			FormOpt::Password { value, .. } | FormOpt::Token { value, .. } => value.set(new),
			FormOpt::Select { choices, selected, .. } => {
				*selected = choices.iter().position(|c| c.name == new);
			}
		}
	}

	pub fn is_secret(&self) -> bool {
		matches!(self, FormOpt::Password { .. } | FormOpt::Token { .. })
	}

	/// Re-type a PASSWORD opt as TOKEN when a generator will fill it.
	pub fn into_token(self) -> FormOpt {
		match self {
			FormOpt::Password { name, label, value } => FormOpt::Token { name, label, value },
			other => other,
		}
	}
}

/// A parsed login form, consumed by one prompt round-trip.
#[derive(Debug, Default)]
pub struct AuthForm {
	pub method:    String,
	pub action:    String,
	pub auth_id:   String,
	pub banner:    String,
	pub message:   Option<String>,
	pub error:     Option<String>,
	pub opts:      Vec<FormOpt>,
	/// Index of the realm SELECT, when present.
	pub authgroup: Option<usize>,
}

impl AuthForm {
	/// Append an option, discarding duplicates by name (first wins).
	/// Returns whether the option was actually appended.
	pub fn push_opt(&mut self, opt: FormOpt) -> bool {
		if self.opts.iter().any(|o| o.name() == opt.name()) {
			debug!(target: "[FORM]", "Discarding duplicate option '{}'", opt.name());
			return false;
		}
		self.opts.push(opt);
		true
	}

	pub fn opt(&self, name: &str) -> Option<&FormOpt> {
		self.opts.iter().find(|o| o.name() == name)
	}

	pub fn opt_mut(&mut self, name: &str) -> Option<&mut FormOpt> {
		self.opts.iter_mut().find(|o| o.name() == name)
	}

	pub fn authgroup_opt(&self) -> Option<&FormOpt> {
		self.authgroup.and_then(|i| self.opts.get(i))
	}

	pub fn token_opt_mut(&mut self) -> Option<&mut FormOpt> {
		self.opts.iter_mut().find(|o| matches!(o, FormOpt::Token { .. }))
	}

	/// URL-encode all options into a POST body. Unset values post as
	/// empty; a form with no options posts an empty body.
	pub fn encode_body(&self) -> String {
		let mut body = String::new();
		for opt in &self.opts {
			if !body.is_empty() {
				body.push('&');
			}
			body.push_str(&urlencode(opt.name()));
			body.push('=');
			body.push_str(&urlencode(opt.value()));
		}
		body
	}
}

/// Percent-encode a form name or value.
pub fn urlencode(input: &str) -> String {
	let mut out = String::with_capacity(input.len());
	for byte in input.bytes() {
		match byte {
			b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
				out.push(byte as char);
			}
			_ => out.push_str(&format!("%{byte:02x}")),
		}
	}
	out
}

/// Inverse of [`urlencode`]; `None` on malformed escapes.
pub fn urldecode(input: &str) -> Option<String> {
	let bytes = input.as_bytes();
	let mut out = Vec::with_capacity(bytes.len());
	let mut i = 0;
	while i < bytes.len() {
		match bytes[i] {
			b'%' => {
				let hi = bytes.get(i + 1)?;
				let lo = bytes.get(i + 2)?;
				let hex = [*hi, *lo];
				let hex = std::str::from_utf8(&hex).ok()?;
				out.push(u8::from_str_radix(hex, 16).ok()?);
				i += 3;
			}
			b => {
				out.push(b);
				i += 1;
			}
		}
	}
	String::from_utf8(out).ok()
}

#[cfg(test)]
mod test {
	use super::*;

	fn two_field_form() -> AuthForm {
		let mut form = AuthForm {
			method: "POST".into(),
			action: "/auth".into(),
			auth_id: "frmLogin".into(),
			banner: "frmLogin".into(),
			..Default::default()
		};
		form.push_opt(FormOpt::Text {
			name:  "username".into(),
			label: "username:".into(),
			value: String::new(),
		});
		form.push_opt(FormOpt::Password {
			name:  "password".into(),
			label: "password:".into(),
			value: SecretValue::new(),
		});
		form
	}

	#[test]
	fn duplicate_names_are_discarded() {
		let mut form = two_field_form();
		form.push_opt(FormOpt::Hidden {
			name:  "username".into(),
			value: "sneaky".into(),
		});
		assert_eq!(form.opts.len(), 2);
		assert!(matches!(form.opt("username"), Some(FormOpt::Text { .. })));
	}

	#[test]
	fn body_encoding_joins_with_ampersand() {
		let mut form = two_field_form();
		form.opt_mut("username").unwrap().set_value("alice");
		form.opt_mut("password").unwrap().set_value("hunter2");
		assert_eq!(form.encode_body(), "username=alice&password=hunter2");
	}

	#[test]
	fn empty_form_posts_empty_body() {
		let form = AuthForm::default();
		assert_eq!(form.encode_body(), "");
	}

	#[test]
	fn select_value_borrows_selected_choice() {
		let mut opt = FormOpt::Select {
			name:     "realm".into(),
			label:    "realm".into(),
			choices:  vec![
				Choice { name: "Staff".into(), label: "Staff".into(), ..Default::default() },
				Choice { name: "Guest".into(), label: "Guest".into(), ..Default::default() },
			],
			selected: None,
		};
		assert_eq!(opt.value(), "");
		opt.set_value("Guest");
		assert_eq!(opt.value(), "Guest");
		opt.set_value("NoSuchRealm");
		assert_eq!(opt.value(), "");
	}

	#[test]
	fn urlencode_round_trips() {
		for value in ["alice", "p@ss word&x=1", "100%", "héllo/世界", ""] {
			assert_eq!(urldecode(&urlencode(value)).as_deref(), Some(value));
		}
		assert_eq!(urlencode("a b&c"), "a%20b%26c");
	}
}
