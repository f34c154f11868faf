//! The login state machine.
//!
//! Authentication is a browser impersonation: fetch a page, find the
//! form, classify it by its `name`, let the prompt (or the token
//! generator) fill it, post it, follow the redirect, and watch the cookie
//! jar for `DSID`. Role-selection pages short-circuit into a redirect,
//! and a missing form on the first page triggers the TNCC compliance
//! helper when one is configured.

use gust_core::{SecretValue, error, info};
use scraper::Html;
use snafu::prelude::*;

use crate::{
	form::{AuthForm, AuthPrompt, FormOpt, FormResult},
	html::{self, HtmlError},
	http::{HttpError, HttpsTransport},
	session::Session,
	token::{TokenError, TokenGenerator},
};
#[cfg(unix)]
use crate::tncc::{TnccAgent, TnccError};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum AuthError {
	#[snafu(display("authentication failed: {reason}"))]
	Failed { reason: String },
	#[snafu(display("login cancelled"))]
	Cancelled,
	#[snafu(display("failed to generate OTP tokencode"))]
	Token { source: TokenError },
	#[snafu(transparent)]
	Form { source: HtmlError },
	#[snafu(transparent)]
	Http { source: HttpError },
	#[cfg(unix)]
	#[snafu(transparent)]
	Tncc { source: TnccError },
}

enum Classified {
	NoForm,
	Form {
		form:        AuthForm,
		/// `frmSelectRoles`: the selected choice is a redirect URL, not a
		/// form submission.
		role_select: bool,
		/// `frmConfirmation` is submitted without prompting.
		auto_submit: bool,
	},
}

/// Find and classify the login form on a page. All DOM work happens
/// here; the result owns its data.
fn classify_page(page: &str, token: &TokenGenerator) -> Result<Classified, AuthError> {
	let doc = Html::parse_document(page);
	let Some(form_el) = html::find_form(&doc) else {
		return Ok(Classified::NoForm);
	};
	let Some(id) = html::form_id(form_el) else {
		error!(target: "[AUTH]", "Encountered form with no ID");
		error!(target: "[AUTH]", "Dumping unknown HTML form:\n{}", html::dump_form(form_el));
		return FailedSnafu { reason: "form with no ID" }.fail();
	};

	let classified = match id {
		"frmLogin" => Classified::Form {
			form:        html::parse_form(form_el, "btnSubmit", token)?,
			role_select: false,
			auto_submit: false,
		},
		"frmDefender" | "frmNextToken" => Classified::Form {
			form:        html::parse_form(form_el, "btnAction", token)?,
			role_select: false,
			auto_submit: false,
		},
		"frmTotpToken" => Classified::Form {
			form:        html::parse_form(form_el, "totpactionEnter", token)?,
			role_select: false,
			auto_submit: false,
		},
		"frmConfirmation" => Classified::Form {
			form:        html::parse_form(form_el, "btnContinue", token)?,
			role_select: false,
			auto_submit: true,
		},
		"frmSelectRoles" => Classified::Form {
			form:        html::parse_roles_form(form_el)?,
			role_select: true,
			auto_submit: false,
		},
		other => {
			error!(target: "[AUTH]", "Unknown form ID '{other}'");
			error!(target: "[AUTH]", "Dumping unknown HTML form:\n{}", html::dump_form(form_el));
			return FailedSnafu {
				reason: format!("unknown form ID '{other}'"),
			}
			.fail();
		}
	};
	Ok(classified)
}

impl<T: HttpsTransport> Session<T> {
	/// Drive the login flow until the gateway hands over a `DSID`.
	/// Returns the synthesized session cookie.
	pub async fn obtain_cookie<P: AuthPrompt>(&mut self, prompt: &mut P) -> Result<String, AuthError> {
		let mut body: Option<String> = None;
		#[cfg(unix)]
		let mut try_tncc = self.cfg.tncc_helper.is_some();

		loop {
			let page = match body.take() {
				Some(encoded) => self.transport.post(&mut self.cmd, &encoded).await?,
				None => self.transport.get(&mut self.cmd).await?,
			};

			if let Some(cookie) = self.check_cookie_success().await? {
				self.cookie = Some(cookie.clone());
				return Ok(cookie);
			}

			let (mut form, role_select, auto_submit) = match classify_page(&page, &self.token)? {
				Classified::Form { form, role_select, auto_submit } => (form, role_select, auto_submit),
				Classified::NoForm => {
					#[cfg(unix)]
					if try_tncc && let Some(helper) = self.cfg.tncc_helper.clone() {
						try_tncc = false;
						let agent = TnccAgent::preauth(
							&mut self.cmd,
							&helper,
							&self.cfg.target.host,
							self.transport.jar_mut(),
						)
						.await?;
						self.tncc = Some(agent);
						continue;
					}
					error!(target: "[AUTH]", "Failed to find or parse web form in login page");
					return FailedSnafu { reason: "no login form in page" }.fail();
				}
			};

			if !auto_submit {
				match prompt.process_auth_form(&mut form) {
					FormResult::Filled => {}
					// Authgroup changed: fetch the group's own form and
					// classify from scratch.
					FormResult::NewGroup => continue,
					FormResult::Cancelled => return CancelledSnafu.fail(),
				}
			}

			if let Err(source) = self.token.fill_form(&mut form) {
				error!(target: "[AUTH]", "Failed to generate OTP tokencode; disabling token");
				self.token.bypassed = true;
				return Err(AuthError::Token { source });
			}

			if role_select {
				// The chosen "value" already is the next URL.
				let url = form
					.opts
					.first()
					.map(|opt| opt.value().to_string())
					.unwrap_or_default();
				ensure!(!url.is_empty(), FailedSnafu { reason: "no role selected" });
				self.transport.handle_redirect(&url);
			} else {
				let encoded = form.encode_body();
				self.transport.handle_redirect(&form.action);
				body = Some(encoded);
			}
			// `form` drops here; secret values are wiped.
		}
	}

	/// `DSID` in the jar means we are in. Synthesize the session cookie
	/// and let a live TNCC helper know.
	async fn check_cookie_success(&mut self) -> Result<Option<String>, AuthError> {
		let jar = self.transport.jar();
		let Some(dsid) = jar.get("DSID") else {
			return Ok(None);
		};

		let mut cookie = format!("DSID={dsid}");
		if let Some(first) = jar.get("DSFirstAccess") {
			cookie.push_str(&format!("; DSFirst={first}"));
		}
		if let Some(last) = jar.get("DSLastAccess") {
			cookie.push_str(&format!("; DSLast={last}"));
		}
		if let Some(url) = jar.get("DSSignInUrl") {
			cookie.push_str(&format!("; DSSignInUrl={url}"));
		}

		#[cfg(unix)]
		if let Some(tncc) = self.tncc.as_mut() {
			let dspreauth = self
				.transport
				.jar()
				.get("DSPREAUTH")
				.unwrap_or_default()
				.to_string();
			// Best effort; a helper that went away does not fail login.
			let _ = tncc.set_cookie(&mut self.cmd, &dspreauth).await;
		}

		info!(target: "[AUTH]", "Authenticated; session established");
		Ok(Some(cookie))
	}
}

/// One-off passphrase request (key decryption and the like), routed
/// through the same prompt as login forms.
pub fn request_passphrase<P: AuthPrompt>(
	prompt: &mut P,
	label: &str,
	message: &str,
) -> Result<SecretValue, AuthError> {
	let mut form = AuthForm {
		method: "POST".into(),
		auth_id: label.to_string(),
		banner: label.to_string(),
		message: Some(message.to_string()),
		..Default::default()
	};
	form.push_opt(FormOpt::Password {
		name:  label.to_string(),
		label: message.to_string(),
		value: SecretValue::new(),
	});

	match prompt.process_auth_form(&mut form) {
		FormResult::Filled => match form.opts.pop() {
			Some(FormOpt::Password { value, .. }) => Ok(value),
			_ => FailedSnafu { reason: "passphrase form lost its option" }.fail(),
		},
		_ => CancelledSnafu.fail(),
	}
}
