//! CLI module for the NLQ deployment tool.
//!
//! This module provides the command-line interface for planning,
//! applying and destroying the NLQ stacks.

mod commands;
mod output;

pub use commands::{Cli, Commands, LogFormat, OutputFormat, StateCommands};
pub use output::OutputFormatter;
