// Unit tests for domain models

use super::*;

#[test]
fn test_timebase_creation() {
    let timebase = Timebase::new(1, 30).unwrap();
    assert_eq!(timebase.num, 1);
    assert_eq!(timebase.den, 30);
    assert_eq!(timebase.to_seconds(30), 1.0);
}

#[test]
fn test_timebase_invalid() {
    assert!(Timebase::new(1, 0).is_err());
    assert!(Timebase::new(0, 25).is_err());
    assert!(Timebase::new(-1, 25).is_err());
}

#[test]
fn test_timebase_rescale_exact() {
    let video = Timebase::new(1, 30).unwrap();
    assert_eq!(video.rescale(150, Timebase::MPEG), 450_000);
    assert_eq!(Timebase::MPEG.rescale(450_000, video), 150);
    assert_eq!(video.rescale(42, video), 42);
}

#[test]
fn test_timebase_rescale_rounds_to_nearest() {
    let audio = Timebase::new(1, 44_100).unwrap();
    // 1 tick of 1/44100 is ~22.68us
    assert_eq!(audio.rescale(1, Timebase::MICROSECONDS), 23);
    assert_eq!(audio.rescale(-1, Timebase::MICROSECONDS), -23);
    // halfway rounds away from zero
    let half = Timebase::new(1, 2).unwrap();
    assert_eq!(half.rescale(1, Timebase::new(1, 1).unwrap()), 1);
    assert_eq!(half.rescale(-1, Timebase::new(1, 1).unwrap()), -1);
}

#[test]
fn test_timebase_duration_conversion() {
    let video = Timebase::new(1, 30).unwrap();
    assert_eq!(video.from_duration(Duration::from_secs(2)), 60);
    assert_eq!(video.to_duration(60), Duration::from_secs(2));
    assert_eq!(video.to_duration(-5), Duration::ZERO);
}

#[test]
fn test_rational_frame_timebase() {
    let ntsc = Rational::new(30_000, 1_001);
    assert_eq!(ntsc.to_frame_timebase(), Some(Timebase { num: 1_001, den: 30_000 }));
    assert!(Rational::UNKNOWN.is_unknown());
    assert_eq!(Rational::UNKNOWN.to_frame_timebase(), None);
}

#[test]
fn test_trim_bounds() {
    let unbounded = Trim::new(Duration::from_secs(3), Duration::ZERO);
    assert!(!unbounded.is_bounded());
    assert_eq!(unbounded.end(), None);

    let bounded = Trim::new(Duration::from_secs(2), Duration::from_secs(5));
    assert_eq!(bounded.end(), Some(Duration::from_secs(7)));
    let ms = Timebase::MILLISECONDS;
    assert_eq!(bounded.start_in(ms), 2_000);
    assert_eq!(bounded.end_in(ms), Some(7_000));
}

#[test]
fn test_format_change_detection() {
    let hd = VideoFormat::new(1920, 1080, PixelFormat::Yuv420p);
    let sd = VideoFormat::new(640, 360, PixelFormat::Yuv420p);
    let hd_rgb = VideoFormat::new(1920, 1080, PixelFormat::Rgb24);
    assert!(!hd.needs_scaling_to(&hd));
    assert!(hd.needs_scaling_to(&sd));
    assert!(hd.needs_scaling_to(&hd_rgb));

    let cd = AudioFormat::new(44_100, SampleFormat::S16, ChannelLayout::Stereo);
    let dvd = AudioFormat::new(48_000, SampleFormat::S16, ChannelLayout::Stereo);
    let mono = AudioFormat::new(44_100, SampleFormat::S16, ChannelLayout::Mono);
    assert!(!cd.needs_resampling_to(&cd));
    assert!(cd.needs_resampling_to(&dvd));
    assert!(cd.needs_resampling_to(&mono));
}

#[test]
fn test_channel_layout_counts() {
    assert_eq!(ChannelLayout::default_for(2), ChannelLayout::Stereo);
    assert_eq!(ChannelLayout::default_for(3), ChannelLayout::Unordered(3));
    assert_eq!(ChannelLayout::Surround51.channels(), 6);
}

#[test]
fn test_frame_clone_shares_payload() {
    let format = FrameFormat::Video(VideoFormat::new(2, 2, PixelFormat::Gray8));
    let frame = Frame::new(format, Timebase::MPEG, vec![1u8, 2, 3, 4]).with_pts(9);
    let shared = frame.clone();
    assert!(frame.shares_buffer_with(&shared));

    let copied = Frame::new(format, Timebase::MPEG, vec![1u8, 2, 3, 4]);
    assert!(!frame.shares_buffer_with(&copied));
}

#[test]
fn test_packet_decode_ts_fallback() {
    let packet = Packet::new(0, Timebase::MPEG, vec![0u8; 4]).with_pts(10);
    assert_eq!(packet.decode_ts(), Some(10));
    let packet = packet.with_dts(7);
    assert_eq!(packet.decode_ts(), Some(7));
}

#[test]
fn test_step_helpers() {
    let ready: Step<u32> = Step::Ready(3);
    assert!(ready.is_ready());
    assert_eq!(ready.map(|v| v * 2), Step::Ready(6));
    assert_eq!(Step::<u32>::TryAgain.ready(), None);
    assert!(Step::<u32>::EndOfFile.is_end_of_file());
}
