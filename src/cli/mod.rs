//! CLI module for the bundle deployment tool.
//!
//! This module provides the command-line interface: argument parsing,
//! output formatting and interactive prompts.

mod commands;
mod output;
mod prompt;

pub use commands::{Cli, Commands, LogFormat, OutputFormat, StateCommands};
pub use output::OutputFormatter;
pub use prompt::{Prompter, TerminalPrompter};
