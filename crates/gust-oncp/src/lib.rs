pub mod auth;
pub mod esp;
pub mod form;
pub mod html;
pub mod http;
pub mod keystore;
pub mod session;
pub mod token;

#[cfg(unix)]
pub mod tncc;
