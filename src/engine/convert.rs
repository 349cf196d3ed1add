//! Per-mapping format conversion

use tracing::debug;

use crate::domain::model::{AudioFormat, Frame, FrameFormat, VideoFormat};
use crate::error::{TranscodeError, TranscodeResult};
use crate::ports::{Converter, ConverterFactory};

struct CachedConverter<F> {
    from: F,
    converter: Box<dyn Converter>,
}

/// Lazily created scaler and resampler of one mapping.
///
/// A converter is kept for as long as incoming frames keep the format it
/// was built for, and replaced when that format changes.
#[derive(Default)]
pub struct ConverterCache {
    image: Option<CachedConverter<VideoFormat>>,
    audio: Option<CachedConverter<AudioFormat>>,
    created: u32,
}

impl ConverterCache {
    /// Bring `frame` into `target`. Frames that already match come back
    /// sharing the input buffer.
    pub fn convert(
        &mut self,
        frame: &Frame,
        target: &FrameFormat,
        factory: &dyn ConverterFactory,
        sink_index: usize,
    ) -> TranscodeResult<Frame> {
        match (&frame.format, target) {
            (FrameFormat::Video(from), FrameFormat::Video(to)) => {
                if !from.needs_scaling_to(to) {
                    return Ok(frame.clone());
                }
                let cached = match self.image.take() {
                    Some(cached) if !cached.from.needs_scaling_to(from) => cached,
                    _ => {
                        debug!(
                            "Creating image scaler for sink stream {}: {}x{} {:?} -> {}x{} {:?}",
                            sink_index, from.width, from.height, from.pixel_format, to.width, to.height, to.pixel_format
                        );
                        self.created += 1;
                        CachedConverter {
                            from: *from,
                            converter: factory.image_scaler(from, to)?,
                        }
                    }
                };
                self.image.insert(cached).converter.convert(frame)
            }
            (FrameFormat::Audio(from), FrameFormat::Audio(to)) => {
                if !from.needs_resampling_to(to) {
                    return Ok(frame.clone());
                }
                let cached = match self.audio.take() {
                    Some(cached) if !cached.from.needs_resampling_to(from) => cached,
                    _ => {
                        debug!(
                            "Creating audio resampler for sink stream {}: {} Hz {:?} -> {} Hz {:?}",
                            sink_index, from.sample_rate, from.sample_format, to.sample_rate, to.sample_format
                        );
                        self.created += 1;
                        CachedConverter {
                            from: *from,
                            converter: factory.audio_resampler(from, to)?,
                        }
                    }
                };
                self.audio.insert(cached).converter.convert(frame)
            }
            (FrameFormat::Subtitle, FrameFormat::Subtitle) => Ok(frame.clone()),
            (from, to) => Err(TranscodeError::ConvertError {
                sink_index,
                message: format!("Cannot convert a {} frame for a {} encoder", from.kind(), to.kind()),
            }),
        }
    }

    pub fn has_image_scaler(&self) -> bool {
        self.image.is_some()
    }

    pub fn has_audio_resampler(&self) -> bool {
        self.audio.is_some()
    }

    /// Number of converters built over the cache's lifetime
    pub fn created(&self) -> u32 {
        self.created
    }

    pub fn clear(&mut self) {
        self.image = None;
        self.audio = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::{ChannelLayout, PixelFormat, SampleFormat, Timebase};

    struct Stamp(FrameFormat);

    impl Converter for Stamp {
        fn convert(&mut self, source: &Frame) -> TranscodeResult<Frame> {
            Ok(Frame {
                format: self.0,
                data: bytes::Bytes::copy_from_slice(&source.data),
                ..source.clone()
            })
        }
    }

    struct StampFactory;

    impl ConverterFactory for StampFactory {
        fn image_scaler(&self, _from: &VideoFormat, to: &VideoFormat) -> TranscodeResult<Box<dyn Converter>> {
            Ok(Box::new(Stamp(FrameFormat::Video(*to))))
        }

        fn audio_resampler(&self, _from: &AudioFormat, to: &AudioFormat) -> TranscodeResult<Box<dyn Converter>> {
            Ok(Box::new(Stamp(FrameFormat::Audio(*to))))
        }
    }

    fn video(width: u32, height: u32) -> FrameFormat {
        FrameFormat::Video(VideoFormat::new(width, height, PixelFormat::Yuv420p))
    }

    fn frame(format: FrameFormat) -> Frame {
        Frame::new(format, Timebase::MPEG, vec![3u8; 16]).with_pts(1)
    }

    #[test]
    fn test_matching_format_shares_buffer() {
        let mut cache = ConverterCache::default();
        let input = frame(video(640, 360));
        let output = cache.convert(&input, &video(640, 360), &StampFactory, 0).unwrap();
        assert!(output.shares_buffer_with(&input));
        assert!(!cache.has_image_scaler());
        assert_eq!(cache.created(), 0);
    }

    #[test]
    fn test_scaler_is_created_once_and_reused() {
        let mut cache = ConverterCache::default();
        let target = video(320, 180);
        for _ in 0..3 {
            let input = frame(video(640, 360));
            let output = cache.convert(&input, &target, &StampFactory, 0).unwrap();
            assert_eq!(output.format, target);
            assert!(!output.shares_buffer_with(&input));
        }
        assert!(cache.has_image_scaler());
        assert_eq!(cache.created(), 1);
    }

    #[test]
    fn test_input_format_change_rebuilds_scaler() {
        let mut cache = ConverterCache::default();
        let target = video(320, 180);
        cache.convert(&frame(video(640, 360)), &target, &StampFactory, 0).unwrap();
        cache.convert(&frame(video(1280, 720)), &target, &StampFactory, 0).unwrap();
        assert_eq!(cache.created(), 2);
    }

    #[test]
    fn test_audio_resampler() {
        let mut cache = ConverterCache::default();
        let from = FrameFormat::Audio(AudioFormat::new(44_100, SampleFormat::S16, ChannelLayout::Stereo));
        let to = FrameFormat::Audio(AudioFormat::new(48_000, SampleFormat::Fltp, ChannelLayout::Stereo));
        let output = cache.convert(&frame(from), &to, &StampFactory, 1).unwrap();
        assert_eq!(output.format, to);
        assert!(cache.has_audio_resampler());
        cache.clear();
        assert!(!cache.has_audio_resampler());
    }

    #[test]
    fn test_kind_mismatch_is_an_error() {
        let mut cache = ConverterCache::default();
        let audio = FrameFormat::Audio(AudioFormat::new(48_000, SampleFormat::Fltp, ChannelLayout::Mono));
        let result = cache.convert(&frame(video(2, 2)), &audio, &StampFactory, 4);
        assert!(matches!(result, Err(TranscodeError::ConvertError { sink_index: 4, .. })));
    }
}
