//! Stream mapping utilities

use tracing::debug;

use crate::domain::model::{
    AudioFormat, ChannelLayout, FrameFormat, MediaKind, PixelFormat, SampleFormat, StreamGeometry,
    StreamInfo, Timebase, VideoFormat,
};
use crate::ports::{Encoder, EncoderSettings};
use crate::streams::MappedEncoder;

/// Encoder requested for a mapping. Fields left unset are inferred from the
/// mapping's working geometry when the stream is mapped.
pub struct EncoderSpec {
    pub encoder: Box<dyn Encoder>,
    pub codec: String,
    pub time_base: Option<Timebase>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub pixel_format: Option<PixelFormat>,
    pub sample_rate: Option<u32>,
    pub sample_format: Option<SampleFormat>,
    pub channel_layout: Option<ChannelLayout>,
    pub bit_rate: Option<u64>,
}

impl EncoderSpec {
    /// Spec with every setting left to inference
    pub fn new(codec: impl Into<String>, encoder: Box<dyn Encoder>) -> Self {
        Self {
            encoder,
            codec: codec.into(),
            time_base: None,
            width: None,
            height: None,
            pixel_format: None,
            sample_rate: None,
            sample_format: None,
            channel_layout: None,
            bit_rate: None,
        }
    }

    pub fn with_time_base(mut self, time_base: Timebase) -> Self {
        self.time_base = Some(time_base);
        self
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }

    pub fn with_pixel_format(mut self, pixel_format: PixelFormat) -> Self {
        self.pixel_format = Some(pixel_format);
        self
    }

    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = Some(sample_rate);
        self
    }

    pub fn with_sample_format(mut self, sample_format: SampleFormat) -> Self {
        self.sample_format = Some(sample_format);
        self
    }

    pub fn with_channel_layout(mut self, channel_layout: ChannelLayout) -> Self {
        self.channel_layout = Some(channel_layout);
        self
    }

    pub fn with_bit_rate(mut self, bit_rate: u64) -> Self {
        self.bit_rate = Some(bit_rate);
        self
    }

    /// Back-fill unset fields from `geometry`; explicit values win.
    /// Zero sizes and rates count as unset.
    pub fn resolve(self, geometry: &StreamGeometry) -> MappedEncoder {
        let format = match geometry.format {
            FrameFormat::Video(working) => FrameFormat::Video(VideoFormat {
                width: self.width.filter(|w| *w > 0).unwrap_or(working.width),
                height: self.height.filter(|h| *h > 0).unwrap_or(working.height),
                pixel_format: self.pixel_format.unwrap_or(working.pixel_format),
                frame_rate: working.frame_rate,
                sample_aspect_ratio: working.sample_aspect_ratio,
            }),
            FrameFormat::Audio(working) => FrameFormat::Audio(AudioFormat {
                sample_rate: self.sample_rate.filter(|r| *r > 0).unwrap_or(working.sample_rate),
                sample_format: self.sample_format.unwrap_or(working.sample_format),
                channel_layout: self.channel_layout.unwrap_or(working.channel_layout),
            }),
            FrameFormat::Subtitle => FrameFormat::Subtitle,
        };

        let settings = EncoderSettings {
            codec: self.codec,
            time_base: self.time_base.unwrap_or(geometry.time_base),
            format,
            bit_rate: self.bit_rate,
        };
        debug!("Resolved encoder settings: {:?}", settings);

        MappedEncoder {
            encoder: self.encoder,
            settings,
        }
    }
}

/// Picks which source streams a stream-copy trim should keep
pub struct StreamMapper {
    no_audio: bool,
    no_subs: bool,
}

impl StreamMapper {
    /// Create a new stream mapper
    pub fn new(no_audio: bool, no_subs: bool) -> Self {
        Self { no_audio, no_subs }
    }

    /// Source indices to map as copies, in container order. Data and
    /// attachment streams are always kept.
    pub fn copy_plan(&self, streams: &[StreamInfo]) -> Vec<usize> {
        streams
            .iter()
            .filter(|stream| match stream.kind {
                MediaKind::Audio => !self.no_audio,
                MediaKind::Subtitle => !self.no_subs,
                _ => true,
            })
            .map(|stream| stream.index)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::{CodecParameters, Frame, Packet, Rational, Step};
    use crate::error::TranscodeResult;

    struct NoopEncoder;

    impl Encoder for NoopEncoder {
        fn open(&mut self, _settings: &EncoderSettings) -> TranscodeResult<()> {
            Ok(())
        }

        fn send_frame(&mut self, _frame: Option<&Frame>) -> TranscodeResult<Step<()>> {
            Ok(Step::Ready(()))
        }

        fn receive_packet(&mut self) -> TranscodeResult<Step<Packet>> {
            Ok(Step::EndOfFile)
        }
    }

    fn video_geometry() -> StreamGeometry {
        StreamGeometry {
            time_base: Timebase::new(1, 30).unwrap(),
            format: FrameFormat::Video(
                VideoFormat::new(1920, 1080, PixelFormat::Yuv420p).with_frame_rate(Rational::new(30, 1)),
            ),
        }
    }

    #[test]
    fn test_unset_fields_are_inferred() {
        let mapped = EncoderSpec::new("h264", Box::new(NoopEncoder)).resolve(&video_geometry());
        assert_eq!(mapped.settings.time_base, Timebase::new(1, 30).unwrap());
        assert_eq!(mapped.settings.format, video_geometry().format);
    }

    #[test]
    fn test_explicit_values_win() {
        let mapped = EncoderSpec::new("h264", Box::new(NoopEncoder))
            .with_size(1280, 720)
            .with_time_base(Timebase::MPEG)
            .with_bit_rate(2_000_000)
            .resolve(&video_geometry());
        let FrameFormat::Video(video) = mapped.settings.format else {
            panic!("expected video settings");
        };
        assert_eq!((video.width, video.height), (1280, 720));
        assert_eq!(video.pixel_format, PixelFormat::Yuv420p);
        assert_eq!(video.frame_rate, Some(Rational::new(30, 1)));
        assert_eq!(mapped.settings.time_base, Timebase::MPEG);
        assert_eq!(mapped.settings.bit_rate, Some(2_000_000));
    }

    #[test]
    fn test_zero_size_counts_as_unset() {
        let mapped = EncoderSpec::new("h264", Box::new(NoopEncoder))
            .with_size(0, 0)
            .resolve(&video_geometry());
        let FrameFormat::Video(video) = mapped.settings.format else {
            panic!("expected video settings");
        };
        assert_eq!((video.width, video.height), (1920, 1080));
    }

    #[test]
    fn test_audio_back_fill_and_codec_parameters() {
        let geometry = StreamGeometry {
            time_base: Timebase::new(1, 48_000).unwrap(),
            format: FrameFormat::Audio(AudioFormat::new(48_000, SampleFormat::Fltp, ChannelLayout::Stereo)),
        };
        let mapped = EncoderSpec::new("aac", Box::new(NoopEncoder))
            .with_sample_format(SampleFormat::S16)
            .resolve(&geometry);
        let params = mapped.codec_parameters(MediaKind::Audio);
        assert_eq!(params.codec, "aac");
        assert_eq!(params.sample_rate, 48_000);
        assert_eq!(params.sample_format, Some(SampleFormat::S16));
        assert_eq!(params.channel_layout, Some(ChannelLayout::Stereo));
    }

    #[test]
    fn test_copy_plan_honours_exclusions() {
        let tb = Timebase::MPEG;
        let streams = vec![
            StreamInfo::new(0, tb, CodecParameters::new(MediaKind::Video, "h264")),
            StreamInfo::new(1, tb, CodecParameters::new(MediaKind::Audio, "aac")),
            StreamInfo::new(2, tb, CodecParameters::new(MediaKind::Subtitle, "mov_text")),
            StreamInfo::new(3, tb, CodecParameters::new(MediaKind::Data, "tmcd")),
        ];
        assert_eq!(StreamMapper::new(false, false).copy_plan(&streams), vec![0, 1, 2, 3]);
        assert_eq!(StreamMapper::new(true, true).copy_plan(&streams), vec![0, 3]);
    }
}
