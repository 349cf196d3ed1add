// Memory adapters - In-process collaborators for exercising the pipeline
// without native libraries. Every adapter can share an `EventLog` so tests
// can check the order in which the orchestrator talks to them.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tracing::trace;

use crate::domain::model::*;
use crate::error::{TranscodeError, TranscodeResult};
use crate::ports::*;

/// Shared, ordered record of collaborator calls
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<String>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, event: impl Into<String>) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.into());
        }
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().map(|events| events.clone()).unwrap_or_default()
    }

    /// Number of events equal to `event`
    pub fn count(&self, event: &str) -> usize {
        self.events().iter().filter(|e| e.as_str() == event).count()
    }

    /// Index of the first event equal to `event`
    pub fn first(&self, event: &str) -> Option<usize> {
        self.events().iter().position(|e| e == event)
    }

    /// Index of the last event equal to `event`
    pub fn last(&self, event: &str) -> Option<usize> {
        self.events().iter().rposition(|e| e == event)
    }
}

/// Demuxer over a scripted packet list
pub struct MemoryDemuxer {
    streams: Vec<StreamInfo>,
    packets: Vec<Packet>,
    position: usize,
    pace: Option<Duration>,
    endless: bool,
    generated: i64,
    log: EventLog,
}

impl MemoryDemuxer {
    pub fn new(streams: Vec<StreamInfo>) -> Self {
        Self {
            streams,
            packets: Vec::new(),
            position: 0,
            pace: None,
            endless: false,
            generated: 0,
            log: EventLog::new(),
        }
    }

    /// Never reach end of file: once the script runs out, keep producing
    /// key packets on stream 0, one tick apart
    pub fn endless(mut self) -> Self {
        self.endless = true;
        self
    }

    /// Sleep before every read
    pub fn with_pace(mut self, pace: Duration) -> Self {
        self.pace = Some(pace);
        self
    }

    pub fn with_log(mut self, log: EventLog) -> Self {
        self.log = log;
        self
    }

    pub fn with_packets(mut self, packets: Vec<Packet>) -> Self {
        self.packets.extend(packets);
        self
    }

    /// Append `count` packets of `ticks` each to `stream_index`, with a key
    /// packet every `key_interval` packets, then re-sort into decode order
    pub fn with_generated(mut self, stream_index: usize, count: i64, ticks: i64, key_interval: i64) -> Self {
        let time_base = self
            .streams
            .get(stream_index)
            .map(|stream| stream.time_base)
            .unwrap_or(Timebase::MICROSECONDS);
        for n in 0..count {
            let payload = Bytes::from(format!("s{}p{}", stream_index, n));
            let packet = Packet::new(stream_index, time_base, payload)
                .with_ts(n * ticks)
                .with_duration(ticks)
                .with_key(key_interval <= 1 || n % key_interval == 0);
            self.packets.push(packet);
        }
        self.interleave();
        self
    }

    fn interleave(&mut self) {
        self.packets.sort_by_key(|packet| {
            let ts = packet.decode_ts().unwrap_or(0);
            (packet.time_base.rescale(ts, Timebase::MICROSECONDS), packet.stream_index)
        });
    }

    fn packet_micros(packet: &Packet) -> i64 {
        packet
            .time_base
            .rescale(packet.decode_ts().unwrap_or(0), Timebase::MICROSECONDS)
    }
}

impl Demuxer for MemoryDemuxer {
    fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }

    fn read_packet(&mut self) -> TranscodeResult<Step<Packet>> {
        if let Some(pace) = self.pace {
            std::thread::sleep(pace);
        }
        if let Some(packet) = self.packets.get(self.position) {
            self.position += 1;
            return Ok(Step::Ready(packet.clone()));
        }
        if self.endless {
            let time_base = self
                .streams
                .first()
                .map(|stream| stream.time_base)
                .ok_or_else(|| TranscodeError::demux("endless demuxer has no streams"))?;
            let packet = Packet::new(0, time_base, vec![0u8; 4])
                .with_ts(self.generated)
                .with_duration(1)
                .with_key(true);
            self.generated += 1;
            return Ok(Step::Ready(packet));
        }
        Ok(Step::EndOfFile)
    }

    /// Position at the first packet at or after `timestamp_us`
    fn seek(&mut self, timestamp_us: i64) -> TranscodeResult<()> {
        self.log.record(format!("demuxer:seek:{}", timestamp_us));
        self.position = self
            .packets
            .iter()
            .position(|packet| Self::packet_micros(packet) >= timestamp_us)
            .unwrap_or(self.packets.len());
        Ok(())
    }

    fn discard(&mut self, stream_index: usize) {
        self.log.record(format!("demuxer:discard:{}", stream_index));
    }
}

/// What a `MemoryMuxer` received
#[derive(Debug, Clone, Default)]
pub struct MuxedOutput {
    pub streams: Vec<Option<SinkStream>>,
    pub packets: Vec<Packet>,
    pub header_written: bool,
    pub trailer_writes: usize,
}

impl MuxedOutput {
    /// Packets written to one sink stream, in write order
    pub fn packets_for(&self, sink_index: usize) -> Vec<Packet> {
        self.packets
            .iter()
            .filter(|packet| packet.stream_index == sink_index)
            .cloned()
            .collect()
    }
}

/// Muxer that keeps everything in memory and validates call order
#[derive(Default)]
pub struct MemoryMuxer {
    output: Arc<Mutex<MuxedOutput>>,
    log: EventLog,
}

impl MemoryMuxer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_log(mut self, log: EventLog) -> Self {
        self.log = log;
        self
    }

    /// Handle for inspecting the output after the muxer has been moved
    pub fn recorder(&self) -> MuxRecorder {
        MuxRecorder {
            output: Arc::clone(&self.output),
        }
    }

    fn with_output<R>(&self, f: impl FnOnce(&mut MuxedOutput) -> TranscodeResult<R>) -> TranscodeResult<R> {
        let mut output = self
            .output
            .lock()
            .map_err(|_| TranscodeError::mux("output lock poisoned"))?;
        f(&mut output)
    }
}

/// Read side of a `MemoryMuxer`
#[derive(Clone)]
pub struct MuxRecorder {
    output: Arc<Mutex<MuxedOutput>>,
}

impl MuxRecorder {
    pub fn snapshot(&self) -> MuxedOutput {
        self.output.lock().map(|output| output.clone()).unwrap_or_default()
    }

    pub fn packets_for(&self, sink_index: usize) -> Vec<Packet> {
        self.snapshot().packets_for(sink_index)
    }

    pub fn stream(&self, sink_index: usize) -> Option<SinkStream> {
        self.snapshot().streams.get(sink_index).cloned().flatten()
    }
}

impl Muxer for MemoryMuxer {
    fn add_stream(&mut self) -> TranscodeResult<usize> {
        self.with_output(|output| {
            if output.header_written {
                return Err(TranscodeError::mux("cannot add streams after the header"));
            }
            output.streams.push(None);
            Ok(output.streams.len() - 1)
        })
    }

    fn set_stream_parameters(&mut self, index: usize, stream: &SinkStream) -> TranscodeResult<()> {
        self.with_output(|output| {
            let slot = output
                .streams
                .get_mut(index)
                .ok_or_else(|| TranscodeError::mux(format!("no sink stream {}", index)))?;
            *slot = Some(stream.clone());
            Ok(())
        })
    }

    fn write_header(&mut self) -> TranscodeResult<()> {
        self.log.record("muxer:header");
        self.with_output(|output| {
            if let Some(index) = output.streams.iter().position(Option::is_none) {
                return Err(TranscodeError::mux(format!("sink stream {} was never described", index)));
            }
            output.header_written = true;
            Ok(())
        })
    }

    fn write_packet(&mut self, packet: &Packet) -> TranscodeResult<()> {
        self.with_output(|output| {
            if !output.header_written || output.trailer_writes > 0 {
                return Err(TranscodeError::mux("packet written outside header/trailer"));
            }
            match output.streams.get(packet.stream_index) {
                Some(Some(stream)) if stream.time_base == packet.time_base => {}
                Some(Some(_)) => {
                    return Err(TranscodeError::mux(format!(
                        "packet for sink stream {} is not in the stream time base",
                        packet.stream_index
                    )))
                }
                _ => return Err(TranscodeError::mux(format!("no sink stream {}", packet.stream_index))),
            }
            trace!("Muxed packet on sink stream {}", packet.stream_index);
            output.packets.push(packet.clone());
            Ok(())
        })
    }

    fn write_trailer(&mut self) -> TranscodeResult<()> {
        self.log.record("muxer:trailer");
        self.with_output(|output| {
            output.trailer_writes += 1;
            Ok(())
        })
    }
}

/// Frame format a scripted decoder produces for a stream
pub fn decoded_format(stream: &StreamInfo) -> TranscodeResult<FrameFormat> {
    let params = &stream.params;
    match stream.kind {
        MediaKind::Video => Ok(FrameFormat::Video(VideoFormat::new(
            params.width,
            params.height,
            params.pixel_format.unwrap_or(PixelFormat::Yuv420p),
        ))),
        MediaKind::Audio => Ok(FrameFormat::Audio(AudioFormat::new(
            params.sample_rate,
            params.sample_format.unwrap_or(SampleFormat::Fltp),
            params.channel_layout.unwrap_or(ChannelLayout::Stereo),
        ))),
        MediaKind::Subtitle => Ok(FrameFormat::Subtitle),
        other => Err(TranscodeError::DecodeError {
            stream_index: stream.index,
            message: format!("{} streams cannot be decoded", other),
        }),
    }
}

/// Opens `ScriptedDecoder`s
pub struct ScriptedDecoderFactory {
    delay: usize,
    log: EventLog,
}

impl ScriptedDecoderFactory {
    /// Decoders that hold back `delay` frames until flushed
    pub fn new(delay: usize) -> Self {
        Self {
            delay,
            log: EventLog::new(),
        }
    }

    pub fn with_log(mut self, log: EventLog) -> Self {
        self.log = log;
        self
    }
}

impl DecoderFactory for ScriptedDecoderFactory {
    fn open(&self, stream: &StreamInfo) -> TranscodeResult<Box<dyn Decoder>> {
        let format = decoded_format(stream)?;
        self.log.record(format!("decoder[{}]:open", stream.index));
        Ok(Box::new(ScriptedDecoder {
            stream_index: stream.index,
            format,
            delay: self.delay,
            pending: VecDeque::new(),
            flushing: false,
            log: self.log.clone(),
        }))
    }
}

/// Decoder that turns every packet into one frame sharing its payload,
/// with a fixed reorder delay
pub struct ScriptedDecoder {
    stream_index: usize,
    format: FrameFormat,
    delay: usize,
    pending: VecDeque<Frame>,
    flushing: bool,
    log: EventLog,
}

impl ScriptedDecoder {
    fn pop_ready(&mut self) -> Step<Frame> {
        if self.pending.len() > self.delay || (self.flushing && !self.pending.is_empty()) {
            match self.pending.pop_front() {
                Some(frame) => Step::Ready(frame),
                None => Step::TryAgain,
            }
        } else if self.flushing {
            Step::EndOfFile
        } else {
            Step::TryAgain
        }
    }
}

impl Decoder for ScriptedDecoder {
    fn output_format(&self) -> FrameFormat {
        self.format
    }

    fn decode(&mut self, packet: &Packet) -> TranscodeResult<Step<Frame>> {
        if self.flushing {
            return Err(TranscodeError::DecodeError {
                stream_index: self.stream_index,
                message: "packet sent after flush".to_string(),
            });
        }
        self.log.record(format!("decoder[{}]:decode", self.stream_index));
        let mut frame = Frame::new(self.format, packet.time_base, packet.data.clone());
        if let Some(pts) = packet.pts.or(packet.dts) {
            frame = frame.with_pts(pts);
        }
        if let FrameFormat::Audio(_) = self.format {
            frame = frame.with_samples(1_024);
        }
        self.pending.push_back(frame);
        Ok(self.pop_ready())
    }

    fn receive_buffered_frame(&mut self) -> TranscodeResult<Step<Frame>> {
        Ok(self.pop_ready())
    }

    fn flush(&mut self) -> TranscodeResult<()> {
        self.log.record(format!("decoder[{}]:flush", self.stream_index));
        self.flushing = true;
        Ok(())
    }
}

/// Encoder that wraps every frame into one packet, with a fixed delay
pub struct ScriptedEncoder {
    label: String,
    delay: usize,
    packet_time_base: Option<Timebase>,
    settings: Option<EncoderSettings>,
    pending: VecDeque<Packet>,
    flushing: bool,
    deferred_flushes: usize,
    log: EventLog,
}

impl ScriptedEncoder {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            delay: 0,
            packet_time_base: None,
            settings: None,
            pending: VecDeque::new(),
            flushing: false,
            deferred_flushes: 0,
            log: EventLog::new(),
        }
    }

    /// Answer `TryAgain` to the first `count` end-of-stream signals
    pub fn with_deferred_flush(mut self, count: usize) -> Self {
        self.deferred_flushes = count;
        self
    }

    /// Hold back `delay` packets until flushed
    pub fn with_delay(mut self, delay: usize) -> Self {
        self.delay = delay;
        self
    }

    /// Emit packets in a time base other than the frame time base
    pub fn with_packet_time_base(mut self, time_base: Timebase) -> Self {
        self.packet_time_base = Some(time_base);
        self
    }

    pub fn with_log(mut self, log: EventLog) -> Self {
        self.log = log;
        self
    }

    fn event(&self, what: &str) -> String {
        format!("encoder[{}]:{}", self.label, what)
    }
}

impl Encoder for ScriptedEncoder {
    fn packet_time_base(&self) -> Option<Timebase> {
        self.packet_time_base
    }

    fn extradata(&self) -> Bytes {
        Bytes::from_static(b"scripted")
    }

    fn open(&mut self, settings: &EncoderSettings) -> TranscodeResult<()> {
        self.log.record(self.event("open"));
        self.settings = Some(settings.clone());
        Ok(())
    }

    fn send_frame(&mut self, frame: Option<&Frame>) -> TranscodeResult<Step<()>> {
        let settings = self.settings.as_ref().ok_or_else(|| TranscodeError::EncodeError {
            sink_index: 0,
            message: format!("encoder {} used before open", self.label),
        })?;
        let Some(frame) = frame else {
            if self.deferred_flushes > 0 {
                self.deferred_flushes -= 1;
                self.log.record(self.event("flush-deferred"));
                return Ok(Step::TryAgain);
            }
            self.log.record(self.event("flush"));
            self.flushing = true;
            return Ok(Step::Ready(()));
        };
        if self.flushing {
            return Ok(Step::EndOfFile);
        }
        if frame.format != settings.format || frame.time_base != settings.time_base {
            return Err(TranscodeError::EncodeError {
                sink_index: 0,
                message: format!(
                    "encoder {} expects {:?} in {}, got {:?} in {}",
                    self.label, settings.format, settings.time_base, frame.format, frame.time_base
                ),
            });
        }

        let packet_time_base = self.packet_time_base.unwrap_or(settings.time_base);
        let pts = frame.pts.map(|pts| frame.time_base.rescale(pts, packet_time_base));
        let mut packet = Packet::new(0, packet_time_base, frame.data.clone()).with_key(true);
        packet.pts = pts;
        packet.dts = pts;
        self.pending.push_back(packet);
        self.log.record(self.event("frame"));
        Ok(Step::Ready(()))
    }

    fn receive_packet(&mut self) -> TranscodeResult<Step<Packet>> {
        if self.pending.len() > self.delay || (self.flushing && !self.pending.is_empty()) {
            if let Some(packet) = self.pending.pop_front() {
                return Ok(Step::Ready(packet));
            }
        }
        if self.flushing {
            Ok(Step::EndOfFile)
        } else {
            Ok(Step::TryAgain)
        }
    }
}

/// Converters that relabel frames with the target format and copy the payload
pub struct StampingConverterFactory {
    log: EventLog,
}

impl StampingConverterFactory {
    pub fn new() -> Self {
        Self { log: EventLog::new() }
    }

    pub fn with_log(mut self, log: EventLog) -> Self {
        self.log = log;
        self
    }
}

impl Default for StampingConverterFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ConverterFactory for StampingConverterFactory {
    fn image_scaler(&self, _from: &VideoFormat, to: &VideoFormat) -> TranscodeResult<Box<dyn Converter>> {
        self.log.record("converter:scaler");
        Ok(Box::new(StampingConverter(FrameFormat::Video(*to))))
    }

    fn audio_resampler(&self, _from: &AudioFormat, to: &AudioFormat) -> TranscodeResult<Box<dyn Converter>> {
        self.log.record("converter:resampler");
        Ok(Box::new(StampingConverter(FrameFormat::Audio(*to))))
    }
}

struct StampingConverter(FrameFormat);

impl Converter for StampingConverter {
    fn convert(&mut self, source: &Frame) -> TranscodeResult<Frame> {
        Ok(Frame {
            format: self.0,
            pts: source.pts,
            time_base: source.time_base,
            samples: source.samples,
            data: Bytes::copy_from_slice(&source.data),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video_stream() -> StreamInfo {
        let mut params = CodecParameters::new(MediaKind::Video, "h264");
        params.width = 64;
        params.height = 48;
        StreamInfo::new(0, Timebase::new(1, 30).unwrap(), params)
    }

    #[test]
    fn test_demuxer_seek_and_eof() {
        let mut demuxer = MemoryDemuxer::new(vec![video_stream()]).with_generated(0, 90, 1, 30);
        demuxer.seek(2_000_000).unwrap();
        let packet = demuxer.read_packet().unwrap().ready().unwrap();
        assert_eq!(packet.pts, Some(60));
        assert!(packet.key);
        for _ in 61..90 {
            assert!(demuxer.read_packet().unwrap().is_ready());
        }
        assert!(demuxer.read_packet().unwrap().is_end_of_file());
    }

    #[test]
    fn test_decoder_delay_and_flush() {
        let factory = ScriptedDecoderFactory::new(1);
        let mut decoder = factory.open(&video_stream()).unwrap();
        let tb = Timebase::new(1, 30).unwrap();
        assert_eq!(decoder.decode(&Packet::new(0, tb, vec![1u8]).with_ts(0)).unwrap(), Step::TryAgain);
        let frame = decoder.decode(&Packet::new(0, tb, vec![2u8]).with_ts(1)).unwrap().ready().unwrap();
        assert_eq!(frame.pts, Some(0));
        assert_eq!(decoder.receive_buffered_frame().unwrap(), Step::TryAgain);

        decoder.flush().unwrap();
        assert_eq!(decoder.receive_buffered_frame().unwrap().ready().unwrap().pts, Some(1));
        assert_eq!(decoder.receive_buffered_frame().unwrap(), Step::EndOfFile);
    }

    #[test]
    fn test_muxer_rejects_undescribed_streams() {
        let mut muxer = MemoryMuxer::new();
        muxer.add_stream().unwrap();
        assert!(muxer.write_header().is_err());
    }

    #[test]
    fn test_encoder_checks_format() {
        let log = EventLog::new();
        let mut encoder = ScriptedEncoder::new("v").with_log(log.clone());
        let format = FrameFormat::Video(VideoFormat::new(64, 48, PixelFormat::Yuv420p));
        let tb = Timebase::new(1, 30).unwrap();
        encoder
            .open(&EncoderSettings {
                codec: "raw".to_string(),
                time_base: tb,
                format,
                bit_rate: None,
            })
            .unwrap();

        let wrong = Frame::new(FrameFormat::Subtitle, tb, vec![0u8]);
        assert!(encoder.send_frame(Some(&wrong)).is_err());

        let frame = Frame::new(format, tb, vec![0u8]).with_pts(5);
        encoder.send_frame(Some(&frame)).unwrap();
        assert_eq!(encoder.receive_packet().unwrap().ready().unwrap().pts, Some(5));
        encoder.send_frame(None).unwrap();
        assert_eq!(encoder.receive_packet().unwrap(), Step::EndOfFile);
        assert_eq!(log.count("encoder[v]:flush"), 1);
    }
}
