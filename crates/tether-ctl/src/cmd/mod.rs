//! CLI command modules.

pub mod http;
pub mod push;
pub mod sessions;
pub mod status;
