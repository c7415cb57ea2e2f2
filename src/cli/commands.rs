//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// bundle - Declarative deployment of workspace resources.
#[derive(Parser, Debug)]
#[command(name = "bundle")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, global = true, env = "BUNDLE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Target to operate on.
    #[arg(short, long, global = true, env = "BUNDLE_TARGET")]
    pub target: Option<String>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Log format (text, json).
    #[arg(long, global = true, default_value = "text", env = "BUNDLE_LOG_FORMAT")]
    pub log_format: LogFormat,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate the bundle configuration.
    Validate {
        /// Show all warnings, not just errors.
        #[arg(short, long)]
        warnings: bool,
    },

    /// Show what a deploy would change.
    Plan,

    /// Deploy the bundle's resources to the target.
    Deploy {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },

    /// Destroy every resource deployed to the target.
    Destroy {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },

    /// Inspect and manage deployment state.
    State {
        /// State subcommand.
        #[command(subcommand)]
        command: StateCommands,
    },
}

/// State management subcommands.
#[derive(Subcommand, Debug)]
pub enum StateCommands {
    /// Show current state.
    Show,

    /// Replace the local cache with the remote state.
    Pull,

    /// Show or remove the deployment lock.
    Unlock {
        /// Remove the lock even if another deployer holds it (dangerous).
        #[arg(long)]
        force: bool,
    },
}

/// Output format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for scripting.
    Json,
}

/// Log format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    /// Human-readable log lines.
    #[default]
    Text,
    /// One JSON object per log event.
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "bundle", "deploy", "--yes", "--target", "prod", "--output", "json", "-v",
        ])
        .expect("valid arguments");

        assert!(matches!(cli.command, Commands::Deploy { yes: true }));
        assert_eq!(cli.target.as_deref(), Some("prod"));
        assert_eq!(cli.output, OutputFormat::Json);
        assert!(cli.verbose);
    }

    #[test]
    fn test_state_subcommands() {
        let cli = Cli::try_parse_from(["bundle", "state", "unlock", "--force"]).expect("valid");
        assert!(matches!(
            cli.command,
            Commands::State {
                command: StateCommands::Unlock { force: true }
            }
        ));

        assert!(Cli::try_parse_from(["bundle", "state", "push"]).is_err());
    }

    #[test]
    fn test_cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
