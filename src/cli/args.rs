//! Command-line argument definitions

use clap::Args;
use clap_num::number_range;

/// Arguments for the trim command
#[derive(Args, Debug)]
pub struct TrimArgs {
    /// Input media file path
    #[arg(short, long)]
    pub input: String,

    /// Output file path; the container is chosen from its extension
    #[arg(short, long)]
    pub output: String,

    /// Start time (HH:MM:SS.ms, MM:SS.ms, or seconds)
    #[arg(short, long)]
    pub start: Option<String>,

    /// Length of the kept range (same formats); omitted keeps everything after the start
    #[arg(short, long)]
    pub duration: Option<String>,

    /// Remove audio streams
    #[arg(long)]
    pub no_audio: bool,

    /// Remove subtitle streams
    #[arg(long)]
    pub no_subs: bool,

    /// Minimum milliseconds between preview updates; -1 disables preview decoding
    #[arg(long, allow_negative_numbers = true, value_parser = preview_interval)]
    pub preview_interval_ms: Option<i64>,
}

/// Arguments for the inspect command
#[derive(Args, Debug)]
pub struct InspectArgs {
    /// Input media file path
    #[arg(short, long)]
    pub input: String,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

fn preview_interval(s: &str) -> Result<i64, String> {
    number_range(s, -1, 3_600_000)
}
