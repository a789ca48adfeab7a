//! CLI command modules.

pub mod capture;
pub mod emulate;
pub mod http;
pub mod status;
