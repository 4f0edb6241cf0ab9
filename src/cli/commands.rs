//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// nlq-deploy - Dependency-ordered deployment of the NLQ demo stacks.
#[derive(Parser, Debug)]
#[command(name = "nlq-deploy")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the descriptor file.
    #[arg(short, long, global = true, env = "NLQ_DEPLOY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Log line format (text, json).
    #[arg(long, global = true, default_value = "text", env = "NLQ_DEPLOY_LOG_FORMAT")]
    pub log_format: LogFormat,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write a descriptor template for the NLQ stacks.
    Init {
        /// Directory to initialize (defaults to current directory).
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Force overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },

    /// Validate the descriptor.
    Validate {
        /// Show all warnings, not just errors.
        #[arg(short, long)]
        warnings: bool,
    },

    /// Show stack waves and the node order of every stack.
    Graph,

    /// Preview what apply would do.
    Plan {
        /// Stacks to plan (all when omitted).
        #[arg(short, long = "stack")]
        stacks: Vec<String>,

        /// Show predecessors and gates of every operation.
        #[arg(short, long)]
        detailed: bool,
    },

    /// Deploy stacks in dependency order.
    Apply {
        /// Stacks to deploy (all when omitted).
        #[arg(short, long = "stack")]
        stacks: Vec<String>,

        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,

        /// Keep running independent branches and stacks after a failure.
        #[arg(long)]
        continue_on_error: bool,

        /// Operations in flight per stack.
        #[arg(long)]
        max_parallelism: Option<usize>,
    },

    /// Tear stacks down, dependents first.
    Destroy {
        /// Stacks to destroy (all recorded stacks when omitted).
        #[arg(short, long = "stack")]
        stacks: Vec<String>,

        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },

    /// Show published stack outputs.
    Outputs {
        /// Only this stack.
        stack: Option<String>,
    },

    /// Manage state backend.
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

    /// Lock the state.
    Lock {
        /// Lock holder identifier.
        #[arg(long)]
        holder: Option<String>,
    },

    /// Unlock the state.
    Unlock {
        /// Lock ID to unlock.
        #[arg(long)]
        lock_id: Option<String>,

        /// Force unlock (dangerous).
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

/// Log line format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    /// Human-readable log lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

impl Cli {
    /// Parses CLI arguments from the command line.
    #[must_use]
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_apply_arguments() {
        let cli = Cli::try_parse_from([
            "nlq-deploy",
            "--output",
            "json",
            "apply",
            "--stack",
            "AuthStack",
            "--stack",
            "DataStack",
            "--yes",
            "--max-parallelism",
            "4",
        ])
        .unwrap();

        assert_eq!(cli.output, OutputFormat::Json);
        match cli.command {
            Commands::Apply {
                stacks,
                yes,
                continue_on_error,
                max_parallelism,
            } => {
                assert_eq!(stacks, vec!["AuthStack", "DataStack"]);
                assert!(yes);
                assert!(!continue_on_error);
                assert_eq!(max_parallelism, Some(4));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
