//! Preview side-channel for monitoring a running transcode

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::domain::model::{Frame, MediaKind, Packet};

/// Latest frame and output position of one designated sink stream.
///
/// Cloning the tracker yields another handle on the same state, so a UI
/// thread can read while the worker publishes. A published frame shares its
/// payload with the pipeline; whichever side drops its handle last frees it.
#[derive(Clone)]
pub struct PreviewTracker {
    inner: Arc<Mutex<PreviewTrackerInner>>,
}

struct PreviewTrackerInner {
    stream_index: Option<usize>,
    explicit: bool,
    frame: Option<Frame>,
    current_timestamp: Duration,
    update_interval: Option<Duration>,
    last_decode: Option<Instant>,
    frames_published: u64,
}

impl PreviewTracker {
    /// Create a tracker; a negative interval disables decoding for copy streams
    pub fn new(update_interval_ms: i64) -> Self {
        let update_interval = u64::try_from(update_interval_ms).ok().map(Duration::from_millis);
        Self {
            inner: Arc::new(Mutex::new(PreviewTrackerInner {
                stream_index: None,
                explicit: false,
                frame: None,
                current_timestamp: Duration::ZERO,
                update_interval,
                last_decode: None,
                frames_published: 0,
            })),
        }
    }

    /// Sink stream being previewed
    pub fn stream_index(&self) -> Option<usize> {
        self.inner.lock().ok().and_then(|inner| inner.stream_index)
    }

    /// Choose the previewed sink stream explicitly
    pub fn set_stream_index(&self, stream_index: usize) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.stream_index = Some(stream_index);
            inner.explicit = true;
        }
    }

    /// Fill in the stream index unless one was chosen explicitly
    pub(crate) fn set_default_stream_index(&self, stream_index: Option<usize>) {
        if let Ok(mut inner) = self.inner.lock() {
            if !inner.explicit {
                inner.stream_index = stream_index;
            }
        }
    }

    pub(crate) fn is_preview_stream(&self, sink_index: usize) -> bool {
        self.stream_index() == Some(sink_index)
    }

    /// Minimum time between preview decodes of a copied stream
    pub fn update_interval(&self) -> Option<Duration> {
        self.inner.lock().ok().and_then(|inner| inner.update_interval)
    }

    /// Most recent frame, sharing its payload with the producer
    pub fn frame(&self) -> Option<Frame> {
        self.inner.lock().ok().and_then(|inner| inner.frame.clone())
    }

    /// Output timeline position of the last packet written to the preview stream
    pub fn current_timestamp(&self) -> Duration {
        self.inner
            .lock()
            .map(|inner| inner.current_timestamp)
            .unwrap_or_default()
    }

    pub fn frames_published(&self) -> u64 {
        self.inner.lock().map(|inner| inner.frames_published).unwrap_or(0)
    }

    pub(crate) fn publish(&self, frame: &Frame) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.frame = Some(frame.clone());
            inner.frames_published += 1;
        }
    }

    pub(crate) fn set_position(&self, position: Duration) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.current_timestamp = position;
        }
    }

    /// Whether a copied packet should be decoded for the preview now.
    /// Video is only decoded from key packets.
    pub(crate) fn should_decode(&self, packet: &Packet, kind: MediaKind) -> bool {
        if !kind.is_decodable() || (kind == MediaKind::Video && !packet.key) {
            return false;
        }
        match self.inner.lock() {
            Ok(inner) => match inner.update_interval {
                None => false,
                Some(interval) => inner.last_decode.map_or(true, |last| last.elapsed() >= interval),
            },
            Err(_) => false,
        }
    }

    pub(crate) fn mark_decoded(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.last_decode = Some(Instant::now());
        }
    }

    /// Forget the held frame and position
    pub(crate) fn reset(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.frame = None;
            inner.current_timestamp = Duration::ZERO;
            inner.last_decode = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::{FrameFormat, Timebase};

    fn key_packet() -> Packet {
        Packet::new(0, Timebase::MPEG, vec![0u8]).with_key(true)
    }

    #[test]
    fn test_negative_interval_disables_decoding() {
        let tracker = PreviewTracker::new(-1);
        assert_eq!(tracker.update_interval(), None);
        assert!(!tracker.should_decode(&key_packet(), MediaKind::Video));
    }

    #[test]
    fn test_decode_is_throttled() {
        let tracker = PreviewTracker::new(60_000);
        assert!(tracker.should_decode(&key_packet(), MediaKind::Video));
        tracker.mark_decoded();
        assert!(!tracker.should_decode(&key_packet(), MediaKind::Video));
    }

    #[test]
    fn test_zero_interval_decodes_every_key_packet() {
        let tracker = PreviewTracker::new(0);
        tracker.mark_decoded();
        assert!(tracker.should_decode(&key_packet(), MediaKind::Video));
        assert!(!tracker.should_decode(&key_packet().with_key(false), MediaKind::Video));
        assert!(tracker.should_decode(&key_packet().with_key(false), MediaKind::Audio));
        assert!(!tracker.should_decode(&key_packet(), MediaKind::Subtitle));
    }

    #[test]
    fn test_published_frame_shares_payload() {
        let tracker = PreviewTracker::new(1_000);
        let frame = Frame::new(FrameFormat::Subtitle, Timebase::MPEG, vec![1u8, 2, 3]);
        tracker.publish(&frame);
        let seen = tracker.frame().unwrap();
        assert!(seen.shares_buffer_with(&frame));
        assert_eq!(tracker.frames_published(), 1);

        // the tracker's handle keeps the payload alive after the producer drops it
        drop(frame);
        assert_eq!(tracker.frame().unwrap().data.as_ref(), &[1u8, 2, 3]);
    }

    #[test]
    fn test_explicit_stream_index_wins_over_default() {
        let tracker = PreviewTracker::new(1_000);
        tracker.set_default_stream_index(Some(2));
        assert_eq!(tracker.stream_index(), Some(2));

        tracker.set_stream_index(5);
        tracker.set_default_stream_index(Some(1));
        assert_eq!(tracker.stream_index(), Some(5));
        assert!(tracker.is_preview_stream(5));
    }

    #[test]
    fn test_shared_handles_see_updates() {
        let tracker = PreviewTracker::new(1_000);
        let observer = tracker.clone();
        tracker.set_position(Duration::from_millis(1_500));
        assert_eq!(observer.current_timestamp(), Duration::from_millis(1_500));
        tracker.reset();
        assert_eq!(observer.current_timestamp(), Duration::ZERO);
    }
}
