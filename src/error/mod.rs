//! Error handling module for the transcoder

use thiserror::Error;

/// Main error type for transcoding operations
#[derive(Error, Debug)]
pub enum TranscodeError {
    /// A sink stream index is already owned by another mapping
    #[error("Sink stream {sink_index} is already mapped")]
    DuplicateSinkMapping { sink_index: usize },

    /// The worker was started while a previous run is still active
    #[error("Transcoder is already running")]
    AlreadyRunning,

    /// Source stream does not exist in the input
    #[error("Source stream {index} not found")]
    StreamNotFound { index: usize },

    /// The requested mapping cannot be built for this stream
    #[error("Invalid mapping for source stream {source_index}: {message}")]
    InvalidMapping { source_index: usize, message: String },

    /// Operation called in the wrong lifecycle phase
    #[error("{operation} is not allowed while the transcoder is {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    /// Drain state machine asked to skip or repeat a phase
    #[error("Invalid drain transition from {from} to {to}")]
    InvalidDrainTransition { from: String, to: String },

    /// Container read or seek failure
    #[error("Demux error: {message}")]
    DemuxError { message: String },

    /// Decoder failure
    #[error("Decode error on stream {stream_index}: {message}")]
    DecodeError { stream_index: usize, message: String },

    /// Filter graph failure
    #[error("Filter error: {message}")]
    FilterError { message: String },

    /// Scaler or resampler failure
    #[error("Conversion error on sink stream {sink_index}: {message}")]
    ConvertError { sink_index: usize, message: String },

    /// Encoder failure
    #[error("Encode error on sink stream {sink_index}: {message}")]
    EncodeError { sink_index: usize, message: String },

    /// Container write failure
    #[error("Mux error: {message}")]
    MuxError { message: String },

    /// Invalid time format
    #[error("Invalid time format: {time}. Expected HH:MM:SS.ms, MM:SS.ms, or seconds")]
    InvalidTimeFormat { time: String },

    /// Timebase with a zero denominator
    #[error("Invalid timebase {num}/{den}")]
    InvalidTimebase { num: i32, den: i32 },

    /// Configuration loading or validation error
    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    /// Background worker failure (panic, poisoned lock, join error)
    #[error("Worker error: {message}")]
    WorkerError { message: String },

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// FFmpeg error
    #[cfg(feature = "libav")]
    #[error("FFmpeg error: {0}")]
    FFmpegError(#[from] ffmpeg_next::Error),
}

impl TranscodeError {
    /// Shorthand for a demuxer failure
    pub fn demux(message: impl Into<String>) -> Self {
        Self::DemuxError {
            message: message.into(),
        }
    }

    /// Shorthand for a muxer failure
    pub fn mux(message: impl Into<String>) -> Self {
        Self::MuxError {
            message: message.into(),
        }
    }

    /// Shorthand for a filter graph failure
    pub fn filter(message: impl Into<String>) -> Self {
        Self::FilterError {
            message: message.into(),
        }
    }

    pub(crate) fn invalid_state(operation: &'static str, state: impl std::fmt::Debug) -> Self {
        Self::InvalidState {
            operation,
            state: format!("{:?}", state),
        }
    }
}

/// Result type alias for transcoding operations
pub type TranscodeResult<T> = std::result::Result<T, TranscodeError>;
