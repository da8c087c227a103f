//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::ResourceAddress;

/// Stackwright - desired-state infrastructure reconciliation.
#[derive(Parser, Debug)]
#[command(name = "stackwright")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, global = true, env = "STACKWRIGHT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Variable assignments shared by planning commands.
#[derive(Args, Debug, Clone, Default)]
pub struct VarArgs {
    /// Set a variable (NAME=VALUE), may be repeated.
    #[arg(long = "var", value_name = "NAME=VALUE")]
    pub vars: Vec<String>,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a new Stackwright project.
    Init {
        /// Directory to initialize (defaults to current directory).
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Force overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },

    /// Validate the configuration.
    Validate {
        /// Show all warnings, not just errors.
        #[arg(short, long)]
        warnings: bool,
    },

    /// Print the apply order with each resource's dependencies.
    Graph {
        /// Emit Graphviz DOT instead of a table.
        #[arg(long)]
        dot: bool,
    },

    /// Compute and display the plan.
    Plan {
        /// Variable assignments.
        #[command(flatten)]
        vars: VarArgs,

        /// Also write the plan as JSON to this file.
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Apply the plan.
    Apply {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,

        /// Variable assignments.
        #[command(flatten)]
        vars: VarArgs,

        /// Stop scheduling new work after the first failure.
        #[arg(long)]
        fail_fast: bool,

        /// Maximum number of provider calls in flight.
        #[arg(long)]
        max_concurrency: Option<usize>,
    },

    /// Destroy every managed resource.
    Destroy {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,

        /// Variable assignments.
        #[command(flatten)]
        vars: VarArgs,

        /// Maximum number of provider calls in flight.
        #[arg(long)]
        max_concurrency: Option<usize>,
    },

    /// Check for drift between configuration and remote state.
    Drift {
        /// Variable assignments.
        #[command(flatten)]
        vars: VarArgs,
    },

    /// Inspect and manage the state backend.
    State {
        /// State subcommand.
        #[command(subcommand)]
        command: StateCommands,
    },
}

/// State management subcommands.
#[derive(Subcommand, Debug)]
pub enum StateCommands {
    /// Show a summary of the current state.
    Show,

    /// List managed resources.
    List,

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

    /// Stop managing a resource without deleting it.
    Rm {
        /// Address of the resource, `TYPE.NAME`.
        address: ResourceAddress,
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
