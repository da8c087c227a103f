//! CLI module for the Stackwright engine.
//!
//! This module provides the command-line interface for planning, applying
//! and inspecting reconciliations.

mod commands;
mod output;

pub use commands::{Cli, Commands, OutputFormat, StateCommands, VarArgs};
pub use output::OutputFormatter;
