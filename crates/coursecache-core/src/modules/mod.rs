//! Feature modules built on the site session.

pub mod assign;
pub mod messages;
