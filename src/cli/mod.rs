//! CLI module for the transcoder
//!
//! This module handles command-line argument parsing and command execution.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub mod args;
pub mod commands;

pub use args::{InspectArgs, TrimArgs};

/// Stream-copy trimming through the transcode orchestrator
#[derive(Parser, Debug)]
#[command(name = "transcoder")]
#[command(about = "Trim media files by stream copy with trim-aware timestamp rebasing")]
#[command(version)]
#[command(long_about = None)]
pub struct Cli {
    /// Logging level (error, warn, info, debug, trace); overrides config and environment
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Configuration file (.toml, .yaml or .yml)
    #[arg(long, global = true, env = "TRANSCODER_CONFIG")]
    pub config: Option<PathBuf>,

    /// The command to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Copy a time range of the input into a new file
    Trim(TrimArgs),
    /// Print the stream table of a media file
    Inspect(InspectArgs),
}
