// Domain models - Core types and data structures shared by every pipeline stage

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{TranscodeError, TranscodeResult};

/// Outcome of a single collaborator call that did not fail.
///
/// `TryAgain` means the stage has nothing to hand out yet but is not
/// finished; `EndOfFile` means it is definitively exhausted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step<T> {
    Ready(T),
    TryAgain,
    EndOfFile,
}

impl<T> Step<T> {
    /// Take the value, discarding the non-ready variants
    pub fn ready(self) -> Option<T> {
        match self {
            Step::Ready(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Step::Ready(_))
    }

    pub fn is_end_of_file(&self) -> bool {
        matches!(self, Step::EndOfFile)
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Step<U> {
        match self {
            Step::Ready(value) => Step::Ready(f(value)),
            Step::TryAgain => Step::TryAgain,
            Step::EndOfFile => Step::EndOfFile,
        }
    }
}

/// Timebase for timestamp calculations - the duration of one tick in seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Timebase {
    pub num: i32,
    pub den: i32,
}

impl Timebase {
    /// Microsecond ticks, the unit used for seeking and trim arithmetic
    pub const MICROSECONDS: Timebase = Timebase { num: 1, den: 1_000_000 };

    /// Millisecond ticks
    pub const MILLISECONDS: Timebase = Timebase { num: 1, den: 1_000 };

    /// MPEG 90kHz clock
    pub const MPEG: Timebase = Timebase { num: 1, den: 90_000 };

    /// Create a new timebase; both terms must be positive
    pub fn new(num: i32, den: i32) -> TranscodeResult<Self> {
        if num <= 0 || den <= 0 {
            return Err(TranscodeError::InvalidTimebase { num, den });
        }
        Ok(Self { num, den })
    }

    /// Rescale a timestamp from this timebase into `target`, rounding to the
    /// nearest tick with halves away from zero.
    pub fn rescale(&self, ts: i64, target: Timebase) -> i64 {
        if *self == target {
            return ts;
        }
        let num = ts as i128 * self.num as i128 * target.den as i128;
        let den = self.den as i128 * target.num as i128;
        round_div(num, den) as i64
    }

    /// Express a wall-clock duration in ticks of this timebase
    pub fn from_duration(&self, duration: Duration) -> i64 {
        let micros = i64::try_from(duration.as_micros()).unwrap_or(i64::MAX);
        Timebase::MICROSECONDS.rescale(micros, *self)
    }

    /// Convert ticks of this timebase into a duration; negative values clamp to zero
    pub fn to_duration(&self, ts: i64) -> Duration {
        let micros = self.rescale(ts, Timebase::MICROSECONDS);
        Duration::from_micros(micros.max(0) as u64)
    }

    /// Convert ticks to floating point seconds
    pub fn to_seconds(&self, ts: i64) -> f64 {
        ts as f64 * self.num as f64 / self.den as f64
    }
}

impl fmt::Display for Timebase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

fn round_div(num: i128, den: i128) -> i128 {
    if den == 0 {
        return 0;
    }
    let (num, den) = if den < 0 { (-num, -den) } else { (num, den) };
    if num >= 0 {
        (num + den / 2) / den
    } else {
        (num - den / 2) / den
    }
}

/// Plain ratio used for frame rates and sample aspect ratios; `0/1` means unknown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rational {
    pub num: i32,
    pub den: i32,
}

impl Rational {
    pub const UNKNOWN: Rational = Rational { num: 0, den: 1 };

    pub fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    pub fn is_unknown(&self) -> bool {
        self.num == 0 || self.den == 0
    }

    /// The tick length of one frame at this rate, when the rate is known
    pub fn to_frame_timebase(&self) -> Option<Timebase> {
        Timebase::new(self.den, self.num).ok()
    }
}

impl Default for Rational {
    fn default() -> Self {
        Self::UNKNOWN
    }
}

/// Media kind of a container stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
    Subtitle,
    Data,
    Attachment,
}

impl MediaKind {
    /// Kinds that flow through the decode -> filter -> convert -> encode path
    pub fn is_decodable(&self) -> bool {
        matches!(self, MediaKind::Video | MediaKind::Audio)
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
            MediaKind::Subtitle => "subtitle",
            MediaKind::Data => "data",
            MediaKind::Attachment => "attachment",
        };
        f.write_str(name)
    }
}

/// Pixel layouts understood by the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Yuv420p,
    Yuv422p,
    Yuv444p,
    Nv12,
    Rgb24,
    Rgba,
    Gray8,
}

/// Audio sample layouts; the `p` suffix marks planar storage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleFormat {
    U8,
    S16,
    S32,
    Flt,
    Dbl,
    S16p,
    S32p,
    Fltp,
    Dblp,
}

/// Speaker arrangement of an audio stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelLayout {
    Mono,
    Stereo,
    Surround51,
    Surround71,
    /// Channel count without a known speaker assignment
    Unordered(u16),
}

impl ChannelLayout {
    pub fn channels(&self) -> u16 {
        match self {
            ChannelLayout::Mono => 1,
            ChannelLayout::Stereo => 2,
            ChannelLayout::Surround51 => 6,
            ChannelLayout::Surround71 => 8,
            ChannelLayout::Unordered(count) => *count,
        }
    }

    /// Default layout for a channel count
    pub fn default_for(channels: u16) -> Self {
        match channels {
            1 => ChannelLayout::Mono,
            2 => ChannelLayout::Stereo,
            6 => ChannelLayout::Surround51,
            8 => ChannelLayout::Surround71,
            other => ChannelLayout::Unordered(other),
        }
    }
}

/// Picture geometry and layout of decoded video
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoFormat {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub frame_rate: Option<Rational>,
    pub sample_aspect_ratio: Rational,
}

impl VideoFormat {
    pub fn new(width: u32, height: u32, pixel_format: PixelFormat) -> Self {
        Self {
            width,
            height,
            pixel_format,
            frame_rate: None,
            sample_aspect_ratio: Rational::new(1, 1),
        }
    }

    pub fn with_frame_rate(mut self, frame_rate: Rational) -> Self {
        self.frame_rate = Some(frame_rate);
        self
    }

    /// True when a scaler is needed to go from `self` to `other`
    pub fn needs_scaling_to(&self, other: &VideoFormat) -> bool {
        self.width != other.width
            || self.height != other.height
            || self.pixel_format != other.pixel_format
    }
}

/// Sample layout of decoded audio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub sample_format: SampleFormat,
    pub channel_layout: ChannelLayout,
}

impl AudioFormat {
    pub fn new(sample_rate: u32, sample_format: SampleFormat, channel_layout: ChannelLayout) -> Self {
        Self {
            sample_rate,
            sample_format,
            channel_layout,
        }
    }

    /// True when a resampler is needed to go from `self` to `other`
    pub fn needs_resampling_to(&self, other: &AudioFormat) -> bool {
        self.sample_rate != other.sample_rate
            || self.sample_format != other.sample_format
            || self.channel_layout != other.channel_layout
    }
}

/// Format of a decoded or filtered frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum FrameFormat {
    Video(VideoFormat),
    Audio(AudioFormat),
    Subtitle,
}

impl FrameFormat {
    pub fn kind(&self) -> MediaKind {
        match self {
            FrameFormat::Video(_) => MediaKind::Video,
            FrameFormat::Audio(_) => MediaKind::Audio,
            FrameFormat::Subtitle => MediaKind::Subtitle,
        }
    }
}

/// Working geometry of a mapping: what frames look like before conversion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamGeometry {
    pub time_base: Timebase,
    pub format: FrameFormat,
}

/// Container-level codec parameters of a stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodecParameters {
    pub kind: MediaKind,
    pub codec: String,
    pub width: u32,
    pub height: u32,
    pub pixel_format: Option<PixelFormat>,
    pub sample_rate: u32,
    pub sample_format: Option<SampleFormat>,
    pub channel_layout: Option<ChannelLayout>,
    pub bit_rate: Option<u64>,
    #[serde(skip)]
    pub extradata: Bytes,
}

impl CodecParameters {
    /// Parameters with only the codec identity filled in
    pub fn new(kind: MediaKind, codec: impl Into<String>) -> Self {
        Self {
            kind,
            codec: codec.into(),
            width: 0,
            height: 0,
            pixel_format: None,
            sample_rate: 0,
            sample_format: None,
            channel_layout: None,
            bit_rate: None,
            extradata: Bytes::new(),
        }
    }
}

/// Source stream as reported by the demuxer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub index: usize,
    pub kind: MediaKind,
    pub time_base: Timebase,
    /// First timestamp of the stream in `time_base` ticks
    pub start_time: Option<i64>,
    /// Stream length in `time_base` ticks
    pub duration: Option<i64>,
    pub params: CodecParameters,
}

impl StreamInfo {
    pub fn new(index: usize, time_base: Timebase, params: CodecParameters) -> Self {
        Self {
            index,
            kind: params.kind,
            time_base,
            start_time: None,
            duration: None,
            params,
        }
    }

    pub fn with_start_time(mut self, start_time: i64) -> Self {
        self.start_time = Some(start_time);
        self
    }

    pub fn with_duration(mut self, duration: i64) -> Self {
        self.duration = Some(duration);
        self
    }
}

/// Compressed unit read from or written to a container
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub stream_index: usize,
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    pub duration: i64,
    pub time_base: Timebase,
    pub key: bool,
    pub data: Bytes,
}

impl Packet {
    pub fn new(stream_index: usize, time_base: Timebase, data: impl Into<Bytes>) -> Self {
        Self {
            stream_index,
            pts: None,
            dts: None,
            duration: 0,
            time_base,
            key: false,
            data: data.into(),
        }
    }

    /// Set both presentation and decode timestamps
    pub fn with_ts(mut self, ts: i64) -> Self {
        self.pts = Some(ts);
        self.dts = Some(ts);
        self
    }

    pub fn with_pts(mut self, pts: i64) -> Self {
        self.pts = Some(pts);
        self
    }

    pub fn with_dts(mut self, dts: i64) -> Self {
        self.dts = Some(dts);
        self
    }

    pub fn with_duration(mut self, duration: i64) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_key(mut self, key: bool) -> Self {
        self.key = key;
        self
    }

    /// Decode timestamp, falling back to the presentation timestamp
    pub fn decode_ts(&self) -> Option<i64> {
        self.dts.or(self.pts)
    }
}

/// Decoded or filtered unit. Cloning shares the payload buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub format: FrameFormat,
    pub pts: Option<i64>,
    pub time_base: Timebase,
    /// Samples per channel for audio, zero otherwise
    pub samples: u32,
    pub data: Bytes,
}

impl Frame {
    pub fn new(format: FrameFormat, time_base: Timebase, data: impl Into<Bytes>) -> Self {
        Self {
            format,
            pts: None,
            time_base,
            samples: 0,
            data: data.into(),
        }
    }

    pub fn with_pts(mut self, pts: i64) -> Self {
        self.pts = Some(pts);
        self
    }

    pub fn with_samples(mut self, samples: u32) -> Self {
        self.samples = samples;
        self
    }

    /// True when both frames reference the same payload allocation
    pub fn shares_buffer_with(&self, other: &Frame) -> bool {
        self.data.len() == other.data.len() && self.data.as_ptr() == other.data.as_ptr()
    }
}

/// Processed time range `[start, start + duration)`; a zero duration is unbounded
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trim {
    pub start: Duration,
    pub duration: Duration,
}

impl Trim {
    pub fn new(start: Duration, duration: Duration) -> Self {
        Self { start, duration }
    }

    pub fn is_bounded(&self) -> bool {
        !self.duration.is_zero()
    }

    /// Absolute end of the range, when bounded
    pub fn end(&self) -> Option<Duration> {
        self.is_bounded().then(|| self.start + self.duration)
    }

    /// Trim start expressed in ticks of `time_base`
    pub fn start_in(&self, time_base: Timebase) -> i64 {
        time_base.from_duration(self.start)
    }

    /// Trim end expressed in ticks of `time_base`, when bounded
    pub fn end_in(&self, time_base: Timebase) -> Option<i64> {
        self.end().map(|end| time_base.from_duration(end))
    }
}

#[cfg(test)]
mod tests;
