//! Command implementations

use anyhow::Result;

use crate::cli::args::{InspectArgs, TrimArgs};
use crate::config::TranscoderConfig;

#[cfg(not(feature = "libav"))]
const NO_NATIVE_SUPPORT: &str = "native container support is not compiled in (enable the `libav` feature)";

/// Execute the trim command
#[cfg(not(feature = "libav"))]
pub fn trim(_args: TrimArgs, _config: &TranscoderConfig) -> Result<()> {
    anyhow::bail!(NO_NATIVE_SUPPORT)
}

/// Execute the inspect command
#[cfg(not(feature = "libav"))]
pub fn inspect(_args: InspectArgs) -> Result<()> {
    anyhow::bail!(NO_NATIVE_SUPPORT)
}

#[cfg(feature = "libav")]
pub use native::{inspect, trim};

#[cfg(feature = "libav")]
mod native {
    use std::path::Path;
    use std::time::Duration;

    use anyhow::{bail, Context, Result};
    use serde::Serialize;
    use tracing::{info, warn};

    use crate::adapters::libav::{CopyOnlyCodecs, LibavDemuxer, LibavMuxer};
    use crate::cli::args::{InspectArgs, TrimArgs};
    use crate::config::TranscoderConfig;
    use crate::domain::model::StreamInfo;
    use crate::engine::{RunOutcome, RunReport, TranscodeWorker, Transcoder};
    use crate::ports::Demuxer;
    use crate::streams::StreamMapper;
    use crate::utils::time::{format_duration, TimeParser};

    /// Execute the trim command
    pub fn trim(args: TrimArgs, config: &TranscoderConfig) -> Result<()> {
        let parser = TimeParser::new();
        let start = parser
            .parse_or_zero(args.start.as_deref())
            .context("Invalid start time")?;
        let duration = parser
            .parse_or_zero(args.duration.as_deref())
            .context("Invalid duration")?;

        let mut config = config.clone();
        if let Some(interval) = args.preview_interval_ms {
            config.preview_interval_ms = interval;
        }

        let input = Path::new(&args.input);
        if !input.exists() {
            bail!("Input file does not exist: {}", args.input);
        }
        info!("Input: {}", args.input);
        info!("Output: {}", args.output);
        info!("Start: {}, duration: {}", format_duration(start), format_duration(duration));

        let demuxer = LibavDemuxer::open(input).context("Failed to open input file")?;
        let plan = StreamMapper::new(args.no_audio, args.no_subs).copy_plan(demuxer.streams());
        if plan.is_empty() {
            bail!("No streams left to copy from {}", args.input);
        }
        let muxer = LibavMuxer::create(Path::new(&args.output))
            .context("Failed to create output file")?
            .with_source_parameters(demuxer.source_parameters());

        let mut transcoder = Transcoder::new(
            Box::new(demuxer),
            Box::new(muxer),
            Box::new(CopyOnlyCodecs),
            Box::new(CopyOnlyCodecs),
            &config,
        );
        for source_index in plan {
            transcoder.map_stream(source_index, None, None)?;
        }
        transcoder.write_header(start, duration)?;

        let runtime = tokio::runtime::Runtime::new().context("Failed to start the async runtime")?;
        let report = runtime.block_on(run_worker(transcoder))?;

        match report.outcome {
            RunOutcome::Completed => {
                info!(
                    "Trim completed in {} ms: {} packets written",
                    report.elapsed().num_milliseconds(),
                    report.stats.packets_written
                );
                Ok(())
            }
            RunOutcome::Cancelled => bail!("Trim cancelled; the output is incomplete"),
            RunOutcome::Failed => bail!(
                "Trim failed: {}",
                report.error.unwrap_or_else(|| "unknown error".to_string())
            ),
        }
    }

    async fn run_worker(transcoder: Transcoder) -> Result<RunReport> {
        let mut worker = TranscodeWorker::new(transcoder);
        let mut status = worker.subscribe();
        worker.start()?;

        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                changed = status.changed() => {
                    if changed.is_err() || !status.borrow().is_active() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    info!("Position: {}", format_duration(worker.preview().current_timestamp()));
                }
                _ = tokio::signal::ctrl_c() => {
                    warn!("Interrupted, stopping");
                    worker.stop();
                }
            }
        }

        let report = worker.wait().await?;
        worker.shutdown().await?;
        Ok(report)
    }

    #[derive(Serialize)]
    struct InspectReport<'a> {
        input: &'a str,
        format: String,
        duration_us: Option<i64>,
        streams: &'a [StreamInfo],
    }

    /// Execute the inspect command
    pub fn inspect(args: InspectArgs) -> Result<()> {
        let demuxer = LibavDemuxer::open(Path::new(&args.input)).context("Failed to open input file")?;
        let report = InspectReport {
            input: &args.input,
            format: demuxer.format_name(),
            duration_us: demuxer.duration_us(),
            streams: demuxer.streams(),
        };

        if args.json {
            println!("{}", serde_json::to_string_pretty(&report)?);
            return Ok(());
        }

        println!("Input: {} ({})", report.input, report.format);
        if let Some(duration) = report.duration_us {
            println!("Duration: {}", format_duration(Duration::from_micros(duration.max(0) as u64)));
        }
        for stream in report.streams {
            let params = &stream.params;
            let detail = match stream.kind {
                crate::domain::model::MediaKind::Video => format!("{}x{}", params.width, params.height),
                crate::domain::model::MediaKind::Audio => format!("{} Hz", params.sample_rate),
                _ => String::new(),
            };
            println!(
                "  #{} {:<10} {:<12} tb={} {}",
                stream.index,
                stream.kind.to_string(),
                params.codec,
                stream.time_base,
                detail
            );
        }
        Ok(())
    }
}
