//! Authentication module for site accounts.
//!
//! This module provides:
//! - `Session`: per-site account metadata persisted as JSON
//! - `CredentialStore`: web service tokens in the OS keychain via keyring
//!
//! Tokens do not expire on their own; a server answer of `invalidtoken` ends the session.

pub mod credentials;
pub mod session;

pub use credentials::{CredentialStore, TokenStore};
pub use session::{site_id_for, Session, SessionData};
