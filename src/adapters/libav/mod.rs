//! Container adapters backed by libavformat
//!
//! Only container I/O is provided: the CLI runs stream-copy sessions, so
//! decoding and conversion requests are refused with an error.

use std::path::Path;
use std::sync::Once;

use bytes::Bytes;
use ffmpeg_next as ffmpeg;
use ffmpeg_next::ffi;
use tracing::{debug, error, info, warn};

use crate::domain::model::*;
use crate::error::{TranscodeError, TranscodeResult};
use crate::ports::*;

static INIT: Once = Once::new();

/// Initialize libav once per process
pub fn init_ffmpeg() {
    INIT.call_once(|| {
        if let Err(e) = ffmpeg::init() {
            error!("FFmpeg initialization failed: {}", e);
        }
        ffmpeg::util::log::set_level(ffmpeg::util::log::Level::Error);
    });
}

fn timebase_of(rational: ffmpeg::Rational) -> Timebase {
    Timebase::new(rational.numerator(), rational.denominator()).unwrap_or(Timebase::MICROSECONDS)
}

fn rational_of(time_base: Timebase) -> ffmpeg::Rational {
    ffmpeg::Rational::new(time_base.num, time_base.den)
}

fn known(ts: i64) -> Option<i64> {
    (ts != ffi::AV_NOPTS_VALUE).then_some(ts)
}

fn media_kind(medium: ffmpeg::media::Type) -> MediaKind {
    match medium {
        ffmpeg::media::Type::Video => MediaKind::Video,
        ffmpeg::media::Type::Audio => MediaKind::Audio,
        ffmpeg::media::Type::Subtitle => MediaKind::Subtitle,
        ffmpeg::media::Type::Attachment => MediaKind::Attachment,
        _ => MediaKind::Data,
    }
}

fn pixel_format(raw: i32) -> Option<PixelFormat> {
    [
        PixelFormat::Yuv420p,
        PixelFormat::Yuv422p,
        PixelFormat::Yuv444p,
        PixelFormat::Nv12,
        PixelFormat::Rgb24,
        PixelFormat::Rgba,
        PixelFormat::Gray8,
    ]
    .into_iter()
    .find(|format| {
        let native: ffi::AVPixelFormat = native_pixel_format(*format).into();
        native as i32 == raw
    })
}

fn native_pixel_format(format: PixelFormat) -> ffmpeg::format::Pixel {
    use ffmpeg::format::Pixel;
    match format {
        PixelFormat::Yuv420p => Pixel::YUV420P,
        PixelFormat::Yuv422p => Pixel::YUV422P,
        PixelFormat::Yuv444p => Pixel::YUV444P,
        PixelFormat::Nv12 => Pixel::NV12,
        PixelFormat::Rgb24 => Pixel::RGB24,
        PixelFormat::Rgba => Pixel::RGBA,
        PixelFormat::Gray8 => Pixel::GRAY8,
    }
}

fn sample_format(raw: i32) -> Option<SampleFormat> {
    [
        SampleFormat::U8,
        SampleFormat::S16,
        SampleFormat::S32,
        SampleFormat::Flt,
        SampleFormat::Dbl,
        SampleFormat::S16p,
        SampleFormat::S32p,
        SampleFormat::Fltp,
        SampleFormat::Dblp,
    ]
    .into_iter()
    .find(|format| {
        let native: ffi::AVSampleFormat = native_sample_format(*format).into();
        native as i32 == raw
    })
}

fn native_sample_format(format: SampleFormat) -> ffmpeg::format::Sample {
    use ffmpeg::format::sample::{Sample, Type};
    match format {
        SampleFormat::U8 => Sample::U8(Type::Packed),
        SampleFormat::S16 => Sample::I16(Type::Packed),
        SampleFormat::S32 => Sample::I32(Type::Packed),
        SampleFormat::Flt => Sample::F32(Type::Packed),
        SampleFormat::Dbl => Sample::F64(Type::Packed),
        SampleFormat::S16p => Sample::I16(Type::Planar),
        SampleFormat::S32p => Sample::I32(Type::Planar),
        SampleFormat::Fltp => Sample::F32(Type::Planar),
        SampleFormat::Dblp => Sample::F64(Type::Planar),
    }
}

fn stream_info(index: usize, stream: &ffmpeg::format::stream::Stream) -> StreamInfo {
    let native = stream.parameters();
    let kind = media_kind(native.medium());
    let mut params = CodecParameters::new(kind, native.id().name());

    // SAFETY: the parameters pointer is owned by the stream and outlives this borrow
    unsafe {
        let raw = &*native.as_ptr();
        params.width = raw.width.max(0) as u32;
        params.height = raw.height.max(0) as u32;
        params.sample_rate = raw.sample_rate.max(0) as u32;
        params.bit_rate = (raw.bit_rate > 0).then_some(raw.bit_rate as u64);
        match kind {
            MediaKind::Video => params.pixel_format = pixel_format(raw.format),
            MediaKind::Audio => {
                params.sample_format = sample_format(raw.format);
                if raw.ch_layout.nb_channels > 0 {
                    params.channel_layout = Some(ChannelLayout::default_for(raw.ch_layout.nb_channels as u16));
                }
            }
            _ => {}
        }
        if !raw.extradata.is_null() && raw.extradata_size > 0 {
            let extradata = std::slice::from_raw_parts(raw.extradata, raw.extradata_size as usize);
            params.extradata = Bytes::copy_from_slice(extradata);
        }
    }

    let mut info = StreamInfo::new(index, timebase_of(stream.time_base()), params);
    info.start_time = known(stream.start_time());
    info.duration = known(stream.duration()).filter(|duration| *duration > 0);
    info
}

/// Demuxer over a libavformat input context
pub struct LibavDemuxer {
    input: ffmpeg::format::context::Input,
    streams: Vec<StreamInfo>,
    parameters: Vec<ffmpeg::codec::Parameters>,
}

impl LibavDemuxer {
    pub fn open(path: &Path) -> TranscodeResult<Self> {
        init_ffmpeg();
        let input = ffmpeg::format::input(&path).map_err(|e| {
            TranscodeError::demux(format!("Failed to open input file {}: {}", path.display(), e))
        })?;
        let streams: Vec<StreamInfo> = input
            .streams()
            .enumerate()
            .map(|(index, stream)| stream_info(index, &stream))
            .collect();
        let parameters = input.streams().map(|stream| stream.parameters().clone()).collect();
        info!("Opened {} with {} streams", path.display(), streams.len());
        Ok(Self {
            input,
            streams,
            parameters,
        })
    }

    /// Native codec parameters of every input stream, for copying into an output
    pub fn source_parameters(&self) -> Vec<ffmpeg::codec::Parameters> {
        self.parameters.clone()
    }

    /// Container duration, when the format reports one
    pub fn duration_us(&self) -> Option<i64> {
        known(self.input.duration()).filter(|duration| *duration > 0)
    }

    pub fn format_name(&self) -> String {
        self.input.format().name().to_string()
    }
}

impl Demuxer for LibavDemuxer {
    fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }

    fn read_packet(&mut self) -> TranscodeResult<Step<Packet>> {
        let mut native = ffmpeg::Packet::empty();
        match native.read(&mut self.input) {
            Ok(()) => {}
            Err(ffmpeg::Error::Eof) => return Ok(Step::EndOfFile),
            Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::util::error::EAGAIN => {
                return Ok(Step::TryAgain)
            }
            Err(e) => return Err(TranscodeError::demux(format!("Failed to read packet: {}", e))),
        }

        let stream_index = native.stream();
        let time_base = self
            .streams
            .get(stream_index)
            .map(|stream| stream.time_base)
            .ok_or(TranscodeError::StreamNotFound { index: stream_index })?;
        Ok(Step::Ready(Packet {
            stream_index,
            pts: native.pts(),
            dts: native.dts(),
            duration: native.duration(),
            time_base,
            key: native.is_key(),
            data: Bytes::copy_from_slice(native.data().unwrap_or(&[])),
        }))
    }

    fn seek(&mut self, timestamp_us: i64) -> TranscodeResult<()> {
        self.input
            .seek(timestamp_us, ..timestamp_us)
            .map_err(|e| TranscodeError::demux(format!("Failed to seek to {} us: {}", timestamp_us, e)))
    }

    fn best_stream(&self, kind: MediaKind) -> Option<usize> {
        let medium = match kind {
            MediaKind::Video => ffmpeg::media::Type::Video,
            MediaKind::Audio => ffmpeg::media::Type::Audio,
            MediaKind::Subtitle => ffmpeg::media::Type::Subtitle,
            _ => return self.streams.iter().find(|s| s.kind == kind).map(|s| s.index),
        };
        self.input.streams().best(medium).map(|stream| stream.index())
    }
}

/// Muxer over a libavformat output context
pub struct LibavMuxer {
    output: ffmpeg::format::context::Output,
    sources: Vec<ffmpeg::codec::Parameters>,
    time_bases: Vec<Timebase>,
    header_written: bool,
}

impl LibavMuxer {
    /// Create the output file; the container is guessed from the extension
    pub fn create(path: &Path) -> TranscodeResult<Self> {
        init_ffmpeg();
        let output = ffmpeg::format::output(&path).map_err(|e| {
            TranscodeError::mux(format!("Failed to create output file {}: {}", path.display(), e))
        })?;
        Ok(Self {
            output,
            sources: Vec::new(),
            time_bases: Vec::new(),
            header_written: false,
        })
    }

    /// Parameters of the input streams; copy mappings take theirs verbatim
    pub fn with_source_parameters(mut self, sources: Vec<ffmpeg::codec::Parameters>) -> Self {
        self.sources = sources;
        self
    }

    fn codec_id(name: &str) -> TranscodeResult<ffmpeg::codec::Id> {
        ffmpeg::codec::encoder::find_by_name(name)
            .or_else(|| ffmpeg::codec::decoder::find_by_name(name))
            .map(|codec| codec.id())
            .ok_or_else(|| TranscodeError::mux(format!("Unknown codec '{}'", name)))
    }

    fn native_parameters(stream: &SinkStream) -> TranscodeResult<ffmpeg::codec::Parameters> {
        let params = &stream.params;
        let id = Self::codec_id(&params.codec)?;

        let mut native = ffmpeg::codec::Parameters::new();
        // SAFETY: `native` owns a freshly allocated AVCodecParameters; the
        // extradata buffer is allocated with av_mallocz so libav can free it
        unsafe {
            let raw = &mut *native.as_mut_ptr();
            raw.codec_id = id.into();
            raw.codec_tag = 0;
            raw.bit_rate = params.bit_rate.unwrap_or(0) as i64;
            match params.kind {
                MediaKind::Video => {
                    raw.codec_type = ffi::AVMediaType::AVMEDIA_TYPE_VIDEO;
                    raw.width = params.width as i32;
                    raw.height = params.height as i32;
                    if let Some(format) = params.pixel_format {
                        let format: ffi::AVPixelFormat = native_pixel_format(format).into();
                        raw.format = format as i32;
                    }
                }
                MediaKind::Audio => {
                    raw.codec_type = ffi::AVMediaType::AVMEDIA_TYPE_AUDIO;
                    raw.sample_rate = params.sample_rate as i32;
                    if let Some(format) = params.sample_format {
                        let format: ffi::AVSampleFormat = native_sample_format(format).into();
                        raw.format = format as i32;
                    }
                    if let Some(layout) = params.channel_layout {
                        ffi::av_channel_layout_default(&mut raw.ch_layout, layout.channels() as i32);
                    }
                }
                MediaKind::Subtitle => raw.codec_type = ffi::AVMediaType::AVMEDIA_TYPE_SUBTITLE,
                MediaKind::Attachment => raw.codec_type = ffi::AVMediaType::AVMEDIA_TYPE_ATTACHMENT,
                MediaKind::Data => raw.codec_type = ffi::AVMediaType::AVMEDIA_TYPE_DATA,
            }
            if !params.extradata.is_empty() {
                let size = params.extradata.len();
                let buffer = ffi::av_mallocz(size + ffi::AV_INPUT_BUFFER_PADDING_SIZE as usize) as *mut u8;
                if buffer.is_null() {
                    return Err(TranscodeError::mux("Failed to allocate extradata"));
                }
                std::ptr::copy_nonoverlapping(params.extradata.as_ptr(), buffer, size);
                raw.extradata = buffer;
                raw.extradata_size = size as i32;
            }
        }
        Ok(native)
    }
}

impl Muxer for LibavMuxer {
    fn add_stream(&mut self) -> TranscodeResult<usize> {
        let stream = self
            .output
            .add_stream(ffmpeg::codec::encoder::find(ffmpeg::codec::Id::None))
            .map_err(|e| TranscodeError::mux(format!("Failed to add output stream: {}", e)))?;
        self.time_bases.push(Timebase::MICROSECONDS);
        Ok(stream.index())
    }

    fn set_stream_parameters(&mut self, index: usize, stream: &SinkStream) -> TranscodeResult<()> {
        let native = match stream.copy_of.and_then(|source| self.sources.get(source)) {
            Some(source) => source.clone(),
            None => Self::native_parameters(stream)?,
        };
        let mut output_stream = self
            .output
            .stream_mut(index)
            .ok_or_else(|| TranscodeError::mux(format!("No output stream {}", index)))?;
        output_stream.set_parameters(native);
        // SAFETY: the stream owns its parameters; the tag is reset so the
        // output container picks its own
        unsafe {
            (*output_stream.parameters().as_mut_ptr()).codec_tag = 0;
        }
        output_stream.set_time_base(rational_of(stream.time_base));
        if let Some(slot) = self.time_bases.get_mut(index) {
            *slot = stream.time_base;
        }
        debug!("Output stream {}: {} in {}", index, stream.params.codec, stream.time_base);
        Ok(())
    }

    fn write_header(&mut self) -> TranscodeResult<()> {
        self.output
            .write_header()
            .map_err(|e| TranscodeError::mux(format!("Failed to write header: {}", e)))?;
        self.header_written = true;
        Ok(())
    }

    fn write_packet(&mut self, packet: &Packet) -> TranscodeResult<()> {
        if !self.header_written {
            return Err(TranscodeError::mux("Packet written before the header"));
        }
        let container_time_base = self
            .output
            .stream(packet.stream_index)
            .map(|stream| stream.time_base())
            .ok_or_else(|| TranscodeError::mux(format!("No output stream {}", packet.stream_index)))?;

        let mut native = ffmpeg::Packet::copy(&packet.data);
        native.set_stream(packet.stream_index);
        native.set_pts(packet.pts);
        native.set_dts(packet.dts);
        native.set_duration(packet.duration);
        if packet.key {
            native.set_flags(ffmpeg::codec::packet::Flags::KEY);
        }
        // The container may pick its own time base when the header is written
        native.rescale_ts(rational_of(packet.time_base), container_time_base);
        native
            .write_interleaved(&mut self.output)
            .map_err(|e| TranscodeError::mux(format!("Failed to write packet: {}", e)))
    }

    fn write_trailer(&mut self) -> TranscodeResult<()> {
        self.output
            .write_trailer()
            .map_err(|e| TranscodeError::mux(format!("Failed to write trailer: {}", e)))
    }
}

/// Codec factories for stream-copy sessions; every request is refused
pub struct CopyOnlyCodecs;

impl DecoderFactory for CopyOnlyCodecs {
    fn open(&self, stream: &StreamInfo) -> TranscodeResult<Box<dyn Decoder>> {
        warn!("No decoder available for source stream {}", stream.index);
        Err(TranscodeError::DecodeError {
            stream_index: stream.index,
            message: "decoding is not available in stream-copy sessions".to_string(),
        })
    }
}

impl ConverterFactory for CopyOnlyCodecs {
    fn image_scaler(&self, _from: &VideoFormat, _to: &VideoFormat) -> TranscodeResult<Box<dyn Converter>> {
        Err(TranscodeError::ConvertError {
            sink_index: 0,
            message: "image scaling is not available in stream-copy sessions".to_string(),
        })
    }

    fn audio_resampler(&self, _from: &AudioFormat, _to: &AudioFormat) -> TranscodeResult<Box<dyn Converter>> {
        Err(TranscodeError::ConvertError {
            sink_index: 0,
            message: "audio resampling is not available in stream-copy sessions".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copied_stream_keeps_source_parameters() {
        init_ffmpeg();
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("out.mkv");

        // A timecode-style data stream: no codec that libav can decode
        let mut source = ffmpeg::codec::Parameters::new();
        unsafe {
            let raw = &mut *source.as_mut_ptr();
            raw.codec_type = ffi::AVMediaType::AVMEDIA_TYPE_DATA;
            raw.codec_tag = 0x64636d74;
        }

        let mut muxer = LibavMuxer::create(&path).unwrap().with_source_parameters(vec![source]);
        let index = muxer.add_stream().unwrap();
        let sink = SinkStream {
            params: CodecParameters::new(MediaKind::Data, "none"),
            copy_of: Some(0),
            time_base: Timebase::MILLISECONDS,
            start_time: 0,
            duration: 0,
        };
        muxer.set_stream_parameters(index, &sink).unwrap();

        let stream = muxer.output.stream(index).unwrap();
        let params = stream.parameters();
        assert_eq!(params.medium(), ffmpeg::media::Type::Data);
        assert_eq!(params.id(), ffmpeg::codec::Id::None);
        assert_eq!(unsafe { (*params.as_ptr()).codec_tag }, 0);

        // Without a source to copy, the name must resolve to a codec
        let unnamed = SinkStream { copy_of: None, ..sink };
        assert!(muxer.set_stream_parameters(index, &unnamed).is_err());
    }
}
