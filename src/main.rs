//! TrimX Transcoder CLI
//!
//! Stream-copy trimming through the transcode orchestrator.
//!
//! # Usage
//!
//! ```bash
//! transcoder trim --input video.mkv --output clip.mkv --start 00:01:00 --duration 30
//! transcoder inspect --input video.mkv --json
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use trimx_transcoder::cli::{commands, Cli, Commands};
use trimx_transcoder::utils::logging::{init_logging, log_system_info, LogLevel};
use trimx_transcoder::TranscoderConfig;

fn main() -> Result<()> {
    let cli = Cli::parse();

    // CLI > environment > file > defaults
    let mut config = TranscoderConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(level) = cli.log_level.as_deref() {
        config.logging.level = level.parse::<LogLevel>()?;
    }

    init_logging(&config.logging)?;
    log_system_info(&config.logging);

    match cli.command {
        Commands::Trim(args) => {
            info!("Executing trim command");
            commands::trim(args, &config)?;
        }
        Commands::Inspect(args) => {
            info!("Executing inspect command");
            commands::inspect(args)?;
        }
    }

    info!("Transcoder completed successfully");
    Ok(())
}
