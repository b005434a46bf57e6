//! CLI command handlers
//!
//! Each subcommand is implemented in its own module.

pub mod config;
pub mod keywords;
pub mod run;
pub mod script;
