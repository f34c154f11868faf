use std::io::{BufRead, Write};

use gust_oncp::form::{AuthForm, AuthPrompt, FormOpt, FormResult};

/// Minimal console prompt: banner, one line per visible field, hidden
/// echo for secrets.
pub struct ConsolePrompt;

impl ConsolePrompt {
	fn read_line() -> Option<String> {
		let mut line = String::new();
		std::io::stdin().lock().read_line(&mut line).ok()?;
		Some(line.trim_end_matches(['\r', '\n']).to_string())
	}
}

impl AuthPrompt for ConsolePrompt {
	fn process_auth_form(&mut self, form: &mut AuthForm) -> FormResult {
		if !form.banner.is_empty() {
			println!("{}", form.banner);
		}
		if let Some(message) = &form.message {
			println!("{message}");
		}
		if let Some(error) = &form.error {
			eprintln!("{error}");
		}

		for opt in &mut form.opts {
			match opt {
				// Nothing to ask: posted as-is, or filled by the token
				// generator.
				FormOpt::Hidden { .. } | FormOpt::Token { .. } => {}
				FormOpt::Text { label, value, .. } => {
					print!("{label} ");
					let _ = std::io::stdout().flush();
					let Some(line) = Self::read_line() else {
						return FormResult::Cancelled;
					};
					*value = line;
				}
				FormOpt::Password { label, value, .. } => {
					print!("{label} ");
					let _ = std::io::stdout().flush();
					let Ok(secret) = passterm::prompt_password_stdin(None, passterm::Stream::Stdout) else {
						return FormResult::Cancelled;
					};
					value.set(secret);
				}
				FormOpt::Select { label, choices, selected, .. } => {
					println!("{label}");
					for (index, choice) in choices.iter().enumerate() {
						println!("  [{index}] {}", choice.label);
					}
					print!("Selection: ");
					let _ = std::io::stdout().flush();
					let Some(line) = Self::read_line() else {
						return FormResult::Cancelled;
					};
					match line.parse::<usize>() {
						Ok(index) if index < choices.len() => *selected = Some(index),
						_ => return FormResult::Cancelled,
					}
				}
			}
		}
		FormResult::Filled
	}
}
