//! Command-line surface of pack

pub mod args;
pub mod commands;

pub use args::{Cli, Commands, LogFormat};
