//! Timestamp rebasing and trim arithmetic
//!
//! Every packet that reaches the sink is expressed in the sink time base and
//! shifted so that the requested trim start lands on zero.

use crate::domain::model::{Frame, Packet, StreamInfo, Timebase, Trim};

/// Rescale a packet into `sink_time_base`, shift it by the trim start and
/// retarget it at `sink_index`. The payload is shared, never copied.
pub fn rebase_packet(packet: &Packet, sink_index: usize, sink_time_base: Timebase, trim: &Trim) -> Packet {
    let from = packet.time_base;
    let offset = trim.start_in(sink_time_base);
    Packet {
        stream_index: sink_index,
        pts: packet.pts.map(|pts| from.rescale(pts, sink_time_base) - offset),
        dts: packet.dts.map(|dts| from.rescale(dts, sink_time_base) - offset),
        duration: from.rescale(packet.duration, sink_time_base),
        time_base: sink_time_base,
        key: packet.key,
        data: packet.data.clone(),
    }
}

/// Express a frame in `time_base`, leaving it untouched when it already is
pub fn rescale_frame(mut frame: Frame, time_base: Timebase) -> Frame {
    if frame.time_base != time_base {
        frame.pts = frame.pts.map(|pts| frame.time_base.rescale(pts, time_base));
        frame.time_base = time_base;
    }
    frame
}

/// True when a packet lies past the trim end and its stream must stop
pub fn is_past_end(packet: &Packet, trim: &Trim) -> bool {
    match (trim.end_in(packet.time_base), packet.decode_ts()) {
        (Some(end), Some(ts)) => ts > end,
        _ => false,
    }
}

/// Start time and duration of a sink stream, in `sink_time_base` ticks.
///
/// The source start is shifted down by the trim start and floored at zero;
/// whatever part of the shift falls below zero is taken off the duration. A
/// bounded trim replaces the duration when it ends earlier. Zero duration
/// means unknown.
pub fn sink_window(stream: &StreamInfo, sink_time_base: Timebase, trim: &Trim) -> (i64, i64) {
    let mut start = stream
        .start_time
        .map(|ts| stream.time_base.rescale(ts, sink_time_base))
        .unwrap_or(0);
    let mut duration = stream
        .duration
        .map(|ts| stream.time_base.rescale(ts, sink_time_base))
        .unwrap_or(0);

    let trim_start = trim.start_in(sink_time_base);
    if trim_start > 0 {
        let shifted = start - trim_start;
        if shifted < 0 {
            duration = (duration + shifted).max(0);
            start = 0;
        } else {
            start = shifted;
        }
    }

    if trim.is_bounded() {
        let limit = sink_time_base.from_duration(trim.duration);
        if duration == 0 || limit < duration {
            duration = limit;
        }
    }

    (start, duration)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::{CodecParameters, FrameFormat, MediaKind};
    use std::time::Duration;

    fn trim(start_ms: u64, duration_ms: u64) -> Trim {
        Trim::new(Duration::from_millis(start_ms), Duration::from_millis(duration_ms))
    }

    #[test]
    fn test_rebase_subtracts_start_in_sink_time_base() {
        let source = Timebase::new(1, 1_000).unwrap();
        let sink = Timebase::MPEG;
        let packet = Packet::new(3, source, vec![7u8; 3])
            .with_pts(2_500)
            .with_dts(2_400)
            .with_duration(40);

        let out = rebase_packet(&packet, 1, sink, &trim(2_000, 0));
        assert_eq!(out.stream_index, 1);
        assert_eq!(out.time_base, sink);
        assert_eq!(out.pts, Some(225_000 - 180_000));
        assert_eq!(out.dts, Some(216_000 - 180_000));
        assert_eq!(out.duration, 3_600);
        assert_eq!(out.data, packet.data);
        assert_eq!(out.data.as_ptr(), packet.data.as_ptr());
    }

    #[test]
    fn test_rebase_keeps_missing_timestamps() {
        let packet = Packet::new(0, Timebase::MPEG, vec![1u8]);
        let out = rebase_packet(&packet, 0, Timebase::MPEG, &trim(1_000, 0));
        assert_eq!(out.pts, None);
        assert_eq!(out.dts, None);
    }

    #[test]
    fn test_past_end_detection() {
        let tb = Timebase::new(1, 30).unwrap();
        let bounded = trim(2_000, 5_000);
        assert!(!is_past_end(&Packet::new(0, tb, vec![0u8]).with_ts(210), &bounded));
        assert!(is_past_end(&Packet::new(0, tb, vec![0u8]).with_ts(211), &bounded));
        assert!(!is_past_end(&Packet::new(0, tb, vec![0u8]).with_ts(10_000), &trim(2_000, 0)));
        // dts wins over pts
        let reordered = Packet::new(0, tb, vec![0u8]).with_pts(215).with_dts(209);
        assert!(!is_past_end(&reordered, &bounded));
    }

    #[test]
    fn test_frame_rescale() {
        let frame = Frame::new(FrameFormat::Subtitle, Timebase::MILLISECONDS, vec![0u8]).with_pts(1_500);
        let rescaled = rescale_frame(frame, Timebase::MPEG);
        assert_eq!(rescaled.pts, Some(135_000));
        assert_eq!(rescaled.time_base, Timebase::MPEG);
    }

    fn ten_second_video() -> StreamInfo {
        let tb = Timebase::new(1, 30).unwrap();
        StreamInfo::new(0, tb, CodecParameters::new(MediaKind::Video, "h264"))
            .with_start_time(0)
            .with_duration(300)
    }

    #[test]
    fn test_sink_window_with_start_and_duration() {
        let stream = ten_second_video();
        assert_eq!(sink_window(&stream, stream.time_base, &trim(2_000, 5_000)), (0, 150));
        assert_eq!(sink_window(&stream, stream.time_base, &trim(2_000, 0)), (0, 240));
        assert_eq!(sink_window(&stream, stream.time_base, &trim(0, 0)), (0, 300));
    }

    #[test]
    fn test_sink_window_late_starting_stream() {
        let stream = ten_second_video().with_start_time(90);
        // starts 3s in, trim at 2s keeps 1s of lead-in
        assert_eq!(sink_window(&stream, stream.time_base, &trim(2_000, 0)), (30, 300));
    }

    #[test]
    fn test_sink_window_longer_trim_keeps_natural_end() {
        let stream = ten_second_video();
        assert_eq!(sink_window(&stream, stream.time_base, &trim(8_000, 60_000)), (0, 60));
    }

    #[test]
    fn test_sink_window_unknown_duration() {
        let tb = Timebase::new(1, 48_000).unwrap();
        let stream = StreamInfo::new(1, tb, CodecParameters::new(MediaKind::Audio, "aac"));
        assert_eq!(sink_window(&stream, tb, &trim(2_000, 5_000)), (0, 240_000));
        assert_eq!(sink_window(&stream, tb, &trim(2_000, 0)), (0, 0));
    }
}
