//! Core transcoding engine module
//!
//! `Transcoder` drives packets from the demuxer through decode, filter,
//! conversion and encode into the muxer; `TranscodeWorker` runs it in the
//! background.

pub mod convert;
pub mod drain;
pub mod preview;
pub mod timestamps;
pub mod transcoder;
pub mod worker;

pub use convert::ConverterCache;
pub use drain::{DecoderDrainPolicy, DrainPhase, DrainState};
pub use preview::PreviewTracker;
pub use transcoder::{DrainStatus, Phase, PumpStats, PumpStatus, StepStatus, Transcoder};
pub use worker::{RunOutcome, RunReport, TranscodeWorker, WorkerStatus};
