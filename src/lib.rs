//! TrimX Transcoder Library
//!
//! Orchestration core for media transcoding: maps source streams onto sink
//! streams, pumps packets through decode, filter, conversion and encode (or
//! copies them untouched), rebases timestamps onto a trimmed timeline and
//! drains every stage in order at end of input.
//!
//! # Usage
//!
//! ```no_run
//! use std::time::Duration;
//! use trimx_transcoder::adapters::memory::{MemoryDemuxer, MemoryMuxer, ScriptedDecoderFactory, StampingConverterFactory};
//! use trimx_transcoder::{Transcoder, TranscoderConfig};
//!
//! # fn main() -> trimx_transcoder::TranscodeResult<()> {
//! let mut transcoder = Transcoder::new(
//!     Box::new(MemoryDemuxer::new(Vec::new())),
//!     Box::new(MemoryMuxer::new()),
//!     Box::new(ScriptedDecoderFactory::new(0)),
//!     Box::new(StampingConverterFactory::new()),
//!     &TranscoderConfig::default(),
//! );
//! transcoder.write_header(Duration::from_secs(2), Duration::from_secs(5))?;
//! transcoder.run_to_end()?;
//! # Ok(())
//! # }
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod filters;
pub mod ports;
pub mod streams;
pub mod utils;

// Re-export commonly used types
pub use config::TranscoderConfig;
pub use domain::model::{Frame, MediaKind, Packet, Step, StreamInfo, Timebase, Trim};
pub use engine::{DecoderDrainPolicy, DrainState, PreviewTracker, TranscodeWorker, Transcoder, WorkerStatus};
pub use error::{TranscodeError, TranscodeResult};
pub use filters::{FilterArena, FilterHandle, FilterLink};
pub use streams::{EncoderSpec, MappingTable, StreamMapping};
