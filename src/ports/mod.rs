// Ports - Interface definitions (contracts) for the collaborators the
// orchestrator sequences: container I/O, codecs, filters and converters.
//
// Every call returns either a hard error or a `Step`; none of them may block
// waiting for more input, the orchestrator loops on `TryAgain` itself.

use crate::domain::model::*;
use crate::error::TranscodeResult;
use crate::filters::FilterHandle;

/// Port for reading packets out of a container
pub trait Demuxer: Send {
    /// All source streams, indexed by their position
    fn streams(&self) -> &[StreamInfo];

    /// Read the next packet in container order
    fn read_packet(&mut self) -> TranscodeResult<Step<Packet>>;

    /// Seek so that the next packets start at or before `timestamp_us`
    fn seek(&mut self, timestamp_us: i64) -> TranscodeResult<()>;

    /// Hint that packets of `stream_index` will be dropped by the caller
    fn discard(&mut self, _stream_index: usize) {}

    /// Preferred stream of a kind, used for picking the preview stream
    fn best_stream(&self, kind: MediaKind) -> Option<usize> {
        self.streams()
            .iter()
            .find(|stream| stream.kind == kind)
            .map(|stream| stream.index)
    }
}

/// Port for a single-stream decoder
pub trait Decoder: Send {
    /// Format of the frames this decoder produces
    fn output_format(&self) -> FrameFormat;

    /// Feed one packet and try to get a frame back
    fn decode(&mut self, packet: &Packet) -> TranscodeResult<Step<Frame>>;

    /// Pull a frame that is already buffered inside the decoder
    fn receive_buffered_frame(&mut self) -> TranscodeResult<Step<Frame>>;

    /// Signal that no more packets will follow
    fn flush(&mut self) -> TranscodeResult<()>;
}

/// Port for opening decoders on demand
pub trait DecoderFactory: Send {
    fn open(&self, stream: &StreamInfo) -> TranscodeResult<Box<dyn Decoder>>;
}

/// Port for a filter graph whose endpoints are addressed by handle
pub trait FilterGraph: Send {
    /// Time base and frame format produced at an output endpoint
    fn output_geometry(&self, output: FilterHandle) -> TranscodeResult<StreamGeometry>;

    /// Push a frame into an input endpoint; `None` signals end of stream
    fn send_frame(&mut self, input: FilterHandle, frame: Option<&Frame>) -> TranscodeResult<Step<()>>;

    /// Pull a filtered frame from an output endpoint
    fn receive_frame(&mut self, output: FilterHandle) -> TranscodeResult<Step<Frame>>;
}

/// Settings an encoder is opened with, after inference back-fill
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderSettings {
    pub codec: String,
    pub time_base: Timebase,
    pub format: FrameFormat,
    pub bit_rate: Option<u64>,
}

/// Port for a single-stream encoder
pub trait Encoder: Send {
    /// Time base of produced packets, when it differs from the frame time base
    fn packet_time_base(&self) -> Option<Timebase> {
        None
    }

    /// Codec-private data to put into the container, available after `open`
    fn extradata(&self) -> bytes::Bytes {
        bytes::Bytes::new()
    }

    /// Open the encoder with fully resolved settings
    fn open(&mut self, settings: &EncoderSettings) -> TranscodeResult<()>;

    /// Feed one frame; `None` signals end of stream
    fn send_frame(&mut self, frame: Option<&Frame>) -> TranscodeResult<Step<()>>;

    /// Pull one encoded packet
    fn receive_packet(&mut self) -> TranscodeResult<Step<Packet>>;
}

/// Port for writing packets into a container
pub trait Muxer: Send {
    /// Allocate a new output stream and return its index
    fn add_stream(&mut self) -> TranscodeResult<usize>;

    /// Describe an allocated stream; called once per stream before the header
    fn set_stream_parameters(&mut self, index: usize, stream: &SinkStream) -> TranscodeResult<()>;

    fn write_header(&mut self) -> TranscodeResult<()>;

    /// Write one packet; interleaving is the muxer's responsibility
    fn write_packet(&mut self, packet: &Packet) -> TranscodeResult<()>;

    fn write_trailer(&mut self) -> TranscodeResult<()>;
}

/// Output stream description handed to the muxer
#[derive(Debug, Clone, PartialEq)]
pub struct SinkStream {
    pub params: CodecParameters,
    /// Source stream whose container parameters are copied as they are;
    /// set for copy mappings only
    pub copy_of: Option<usize>,
    pub time_base: Timebase,
    pub start_time: i64,
    pub duration: i64,
}

/// Port for a pixel-format scaler or audio resampler bound to one mapping
pub trait Converter: Send {
    fn convert(&mut self, source: &Frame) -> TranscodeResult<Frame>;
}

/// Port for creating converters
pub trait ConverterFactory: Send {
    fn image_scaler(&self, from: &VideoFormat, to: &VideoFormat) -> TranscodeResult<Box<dyn Converter>>;

    fn audio_resampler(&self, from: &AudioFormat, to: &AudioFormat) -> TranscodeResult<Box<dyn Converter>>;
}
