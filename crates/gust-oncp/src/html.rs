//! Extraction of login forms from gateway HTML.
//!
//! The gateway drives authentication with ordinary web forms; this module
//! walks the parsed document and produces an [`AuthForm`]. Role-selection
//! pages use a different structure (a table of links) and get their own
//! parser.

use gust_core::{SecretValue, debug, error};
use scraper::{ElementRef, Html, Selector};
use snafu::prelude::*;

use crate::{
	form::{AuthForm, Choice, FormOpt},
	token::TokenGenerator,
};

/// Submit buttons accepted on any form, in addition to the one expected
/// for the current form kind.
const PROCEED_BUTTONS: [&str; 2] = ["sn-postauth-proceed", "sn-preauth-proceed"];

/// Role tables are identified by this element id.
const ROLE_TABLE_ID: &str = "TABLE_SelectRole_1";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum HtmlError {
	#[snafu(display("cannot handle form method='{method}', action='{action}'"))]
	UnsupportedForm { method: String, action: String },
	#[snafu(display("no role table in role selection page"))]
	NoRoleTable,
}

/// First `<form>` in document order, if any.
pub fn find_form(doc: &Html) -> Option<ElementRef<'_>> {
	let selector = Selector::parse("form").expect("static selector");
	doc.select(&selector).next()
}

/// The form's `name` attribute, keying the controller's state machine.
pub fn form_id(form: ElementRef<'_>) -> Option<&str> {
	form.attr("name")
}

/// Serialized form markup, for diagnosing unknown forms.
pub fn dump_form(form: ElementRef<'_>) -> String {
	form.html()
}

fn node_text(el: ElementRef<'_>) -> String {
	el.text().collect()
}

/// Parse a regular POST form into an [`AuthForm`].
///
/// `submit_button` is the button expected for this form kind; its value is
/// folded into a hidden option so it posts like any other field.
pub fn parse_form(
	form_el: ElementRef<'_>,
	submit_button: &str,
	token: &TokenGenerator,
) -> Result<AuthForm, HtmlError> {
	let method = form_el.attr("method").unwrap_or("").to_string();
	let action = form_el.attr("action").unwrap_or("").to_string();
	if !method.eq_ignore_ascii_case("post") || action.is_empty() {
		error!(target: "[HTML]", "Cannot handle form method='{method}', action='{action}'");
		return UnsupportedFormSnafu { method, action }.fail();
	}

	let auth_id = form_el.attr("name").unwrap_or("").to_string();
	let mut form = AuthForm {
		method,
		action,
		banner: auth_id.clone(),
		auth_id,
		..Default::default()
	};

	for node in form_el.descendants().skip(1) {
		let Some(child) = ElementRef::wrap(node) else {
			continue;
		};
		match child.value().name() {
			"input" => parse_input(&mut form, child, submit_button, token),
			// Its <option> children carry no tag we react to, so the walk
			// skips through them naturally.
			"select" => parse_select(&mut form, child),
			"textarea" => {
				let fieldname = child.attr("name").unwrap_or("");
				if fieldname == "sn-postauth-text" || fieldname == "sn-preauth-text" {
					form.banner = node_text(child);
				} else {
					error!(target: "[HTML]", "Unknown textarea field: '{fieldname}'");
				}
			}
			_ => {}
		}
	}
	Ok(form)
}

fn parse_input(form: &mut AuthForm, input: ElementRef<'_>, submit_button: &str, token: &TokenGenerator) {
	let Some(input_type) = input.attr("type") else {
		return;
	};
	let name = input.attr("name").unwrap_or("").to_string();
	if name.is_empty() {
		debug!(target: "[HTML]", "Ignoring nameless form input of type '{input_type}'");
		return;
	}
	let value = input.attr("value").unwrap_or("").to_string();

	let opt = match input_type.to_ascii_lowercase().as_str() {
		"hidden" | "checkbox" => FormOpt::Hidden { name, value },
		"text" | "username" => FormOpt::Text {
			label: format!("{name}:"),
			name,
			value: String::new(),
		},
		"password" => {
			let opt = FormOpt::Password {
				label: format!("{name}:"),
				name,
				value: SecretValue::new(),
			};
			if token.can_generate(&form.auth_id) {
				opt.into_token()
			} else {
				opt
			}
		}
		"submit" => {
			if name == submit_button || PROCEED_BUTTONS.contains(&name.as_str()) {
				// Fold the chosen submit action in as a hidden option.
				FormOpt::Hidden { name, value }
			} else {
				debug!(target: "[HTML]", "Ignoring unknown form submit item '{name}'");
				return;
			}
		}
		other => {
			debug!(target: "[HTML]", "Ignoring unknown form input type '{other}'");
			return;
		}
	};
	form.push_opt(opt);
}

fn parse_select(form: &mut AuthForm, select: ElementRef<'_>) {
	let name = select.attr("name").unwrap_or("").to_string();
	let mut choices = Vec::new();

	for child in select.child_elements() {
		if child.value().name() != "option" {
			continue;
		}
		let label = node_text(child);
		// The choice name is deliberately the visible text, not the
		// value= attribute; known gateways key their realm handling off
		// the text. Flagged upstream, do not "fix" silently.
		choices.push(Choice {
			name: label.clone(),
			label,
			..Default::default()
		});
	}

	let is_realm = name == "realm";
	let appended = form.push_opt(FormOpt::Select {
		label: name.clone(),
		name,
		choices,
		selected: None,
	});
	if is_realm && appended {
		form.authgroup = Some(form.opts.len() - 1);
	}
}

/// Parse a `frmSelectRoles` page. The "form" is really a table of links;
/// the produced SELECT's choice names are redirect URLs, so this form is
/// never body-encoded.
pub fn parse_roles_form(form_el: ElementRef<'_>) -> Result<AuthForm, HtmlError> {
	let table_sel = Selector::parse("table").expect("static selector");
	let row_sel = Selector::parse("tr").expect("static selector");
	let link_sel = Selector::parse("td a").expect("static selector");

	let table = form_el
		.select(&table_sel)
		.find(|t| t.attr("id") == Some(ROLE_TABLE_ID))
		.context(NoRoleTableSnafu)?;

	let mut choices = Vec::new();
	for row in table.select(&row_sel) {
		for link in row.select(&link_sel) {
			let Some(href) = link.attr("href") else {
				continue;
			};
			let label = node_text(link);
			if label.is_empty() {
				continue;
			}
			choices.push(Choice {
				name: href.to_string(),
				label,
				..Default::default()
			});
		}
	}

	let mut form = AuthForm {
		method: "POST".into(),
		auth_id: "frmSelectRoles".into(),
		banner: "frmSelectRoles".into(),
		..Default::default()
	};
	form.push_opt(FormOpt::Select {
		name:     "frmSelectRoles".into(),
		label:    "frmSelectRoles".into(),
		choices,
		selected: None,
	});
	Ok(form)
}
