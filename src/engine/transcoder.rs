//! Transcode orchestrator
//!
//! Sequences demuxer, decoders, filters, converters, encoders and muxer for
//! a set of stream mappings. All collaborator calls happen on the caller's
//! thread; `TranscodeWorker` moves the whole object onto a background task.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::config::TranscoderConfig;
use crate::domain::model::{Frame, MediaKind, Packet, Step, StreamGeometry, StreamInfo, Timebase, Trim};
use crate::engine::drain::{DrainMachine, DrainState, PassOutcome};
use crate::engine::preview::PreviewTracker;
use crate::engine::timestamps;
use crate::error::{TranscodeError, TranscodeResult};
use crate::filters::FilterLink;
use crate::ports::{ConverterFactory, Decoder, DecoderFactory, Demuxer, FilterGraph, Muxer, SinkStream};
use crate::streams::{EncoderSpec, MappingSummary, MappingTable, StreamMapping};

/// Lifecycle phase of a transcoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Mappings may be added
    Setup,
    /// Header written, packets flowing
    Running,
    /// Trailer written
    Finished,
    /// Resources released
    Closed,
}

/// Result of `process_next_packet`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpStatus {
    /// One packet was read and processed
    Processed,
    /// Input is exhausted; continue with `drain_step`
    EndOfFile,
}

/// Result of `drain_step`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainStatus {
    /// A buffered frame or packet was pushed further down the pipeline
    Progressed,
    /// Every stage is empty
    EndOfStream,
}

/// Result of `step`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Processed,
    Draining,
    EndOfStream,
}

/// Counters collected while pumping; reset when the header is written
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PumpStats {
    pub packets_read: u64,
    pub packets_written: u64,
    pub packets_copied: u64,
    pub frames_decoded: u64,
    pub frames_encoded: u64,
    /// Streams stopped because they ran past the trim end
    pub streams_cut: u64,
}

/// The orchestrator
pub struct Transcoder {
    demuxer: Box<dyn Demuxer>,
    muxer: Box<dyn Muxer>,
    decoder_factory: Box<dyn DecoderFactory>,
    converter_factory: Box<dyn ConverterFactory>,
    filter_graph: Option<Box<dyn FilterGraph>>,
    mappings: MappingTable,
    decoders: BTreeMap<usize, Box<dyn Decoder>>,
    preview_decoder: Option<Box<dyn Decoder>>,
    /// Key packet position the preview decoder is catching up to
    preview_target: Option<(i64, Timebase)>,
    discarded: Vec<bool>,
    trim: Trim,
    phase: Phase,
    input_ended: bool,
    drain: DrainMachine,
    preview: PreviewTracker,
    stats: PumpStats,
}

impl Transcoder {
    pub fn new(
        demuxer: Box<dyn Demuxer>,
        muxer: Box<dyn Muxer>,
        decoder_factory: Box<dyn DecoderFactory>,
        converter_factory: Box<dyn ConverterFactory>,
        config: &TranscoderConfig,
    ) -> Self {
        let stream_count = demuxer.streams().len();
        Self {
            demuxer,
            muxer,
            decoder_factory,
            converter_factory,
            filter_graph: None,
            mappings: MappingTable::new(),
            decoders: BTreeMap::new(),
            preview_decoder: None,
            preview_target: None,
            discarded: vec![false; stream_count],
            trim: Trim::default(),
            phase: Phase::Setup,
            input_ended: false,
            drain: DrainMachine::new(config.decoder_drain, config.max_idle_drain_passes),
            preview: PreviewTracker::new(config.preview_interval_ms),
            stats: PumpStats::default(),
        }
    }

    /// Attach the filter graph that mapping filter links refer to
    pub fn set_filter_graph(&mut self, graph: Box<dyn FilterGraph>) -> TranscodeResult<()> {
        self.expect_phase(Phase::Setup, "set_filter_graph")?;
        self.filter_graph = Some(graph);
        Ok(())
    }

    pub fn streams(&self) -> &[StreamInfo] {
        self.demuxer.streams()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.phase, Phase::Finished | Phase::Closed)
    }

    pub fn drain_state(&self) -> DrainState {
        self.drain.state()
    }

    pub fn stats(&self) -> &PumpStats {
        &self.stats
    }

    pub fn mappings(&self) -> Vec<MappingSummary> {
        self.mappings.summaries()
    }

    pub fn trim(&self) -> Trim {
        self.trim
    }

    /// Shared handle on the preview side-channel
    pub fn preview(&self) -> &PreviewTracker {
        &self.preview
    }

    /// True when packets of `source_index` are skipped
    pub fn is_discarded(&self, source_index: usize) -> bool {
        self.discarded.get(source_index).copied().unwrap_or(true)
    }

    /// Map a source stream to a newly allocated sink stream.
    ///
    /// Without an encoder the mapping copies packets. With an encoder, unset
    /// encoder settings are inferred from the filter output (when a filter
    /// is given) or from the source decoder's output.
    pub fn map_stream(
        &mut self,
        source_index: usize,
        encoder: Option<EncoderSpec>,
        filter: Option<FilterLink>,
    ) -> TranscodeResult<usize> {
        self.expect_phase(Phase::Setup, "map_stream")?;
        let stream = self.stream_info(source_index)?;

        let invalid = |message: &str| TranscodeError::InvalidMapping {
            source_index,
            message: message.to_string(),
        };
        if filter.is_some() && encoder.is_none() {
            return Err(invalid("a filter requires an encoder"));
        }
        if filter.is_some() && !stream.kind.is_decodable() {
            return Err(invalid(&format!("{} streams cannot be filtered", stream.kind)));
        }
        if encoder.is_some() && matches!(stream.kind, MediaKind::Data | MediaKind::Attachment) {
            return Err(invalid(&format!("{} streams can only be copied", stream.kind)));
        }

        let encoder = match encoder {
            Some(spec) => {
                let geometry = match filter {
                    Some(link) => self
                        .filter_graph
                        .as_ref()
                        .ok_or_else(|| invalid("no filter graph attached"))?
                        .output_geometry(link.output)?,
                    None => StreamGeometry {
                        time_base: stream.time_base,
                        format: self.decoder_for(source_index)?.output_format(),
                    },
                };
                Some(spec.resolve(&geometry))
            }
            None => None,
        };

        let sink_index = self.muxer.add_stream()?;
        let mapping = StreamMapping::new(source_index, sink_index, stream.kind, stream.time_base, filter, encoder);
        let summary = mapping.summary();
        self.mappings.insert(mapping)?;

        debug!(
            "Mapped source stream {} ({}) to sink stream {} as {:?}",
            source_index, stream.kind, sink_index, summary.mode
        );
        Ok(sink_index)
    }

    /// Finish setup: describe sink streams, open encoders, write the
    /// container header and seek the input to the trim start.
    pub fn write_header(&mut self, start: Duration, duration: Duration) -> TranscodeResult<()> {
        self.expect_phase(Phase::Setup, "write_header")?;
        self.trim = Trim::new(start, duration);
        let streams = self.demuxer.streams().to_vec();

        for stream in &streams {
            if !self.mappings.is_mapped(stream.index) {
                debug!("Discarding unmapped source stream {}", stream.index);
                self.discard(stream.index);
            }
        }

        for mapping in self.mappings.iter_mut() {
            let stream = streams
                .get(mapping.source_index)
                .ok_or(TranscodeError::StreamNotFound {
                    index: mapping.source_index,
                })?;

            let (params, time_base) = match mapping.encoder.as_mut() {
                Some(mapped) => {
                    mapped.encoder.open(&mapped.settings)?;
                    let time_base = mapped.encoder.packet_time_base().unwrap_or(mapped.settings.time_base);
                    (mapped.codec_parameters(stream.kind), time_base)
                }
                None => (stream.params.clone(), stream.time_base),
            };
            mapping.sink_time_base = time_base;

            let (start_time, duration) = timestamps::sink_window(stream, time_base, &self.trim);
            debug!(
                "Sink stream {}: time base {}, start {}, duration {}",
                mapping.sink_index, time_base, start_time, duration
            );
            self.muxer.set_stream_parameters(
                mapping.sink_index,
                &SinkStream {
                    params,
                    copy_of: mapping.is_copy().then_some(mapping.source_index),
                    time_base,
                    start_time,
                    duration,
                },
            )?;
        }

        self.preview.set_default_stream_index(self.default_preview_stream());
        self.open_preview_decoder()?;

        self.muxer.write_header()?;
        if !start.is_zero() {
            let target = Timebase::MICROSECONDS.from_duration(start);
            debug!("Seeking input to {} us", target);
            self.demuxer.seek(target)?;
        }

        self.stats = PumpStats::default();
        self.drain.reset();
        self.input_ended = false;
        self.phase = Phase::Running;
        info!(
            "Header written: {} mappings, start {:?}, duration {:?}",
            self.mappings.len(),
            start,
            duration
        );
        Ok(())
    }

    /// Read and process one packet.
    ///
    /// Packets that produce nothing yet (a decoder still filling its delay)
    /// do not count; the next packet is read until something moves.
    pub fn process_next_packet(&mut self) -> TranscodeResult<PumpStatus> {
        self.expect_phase(Phase::Running, "process_next_packet")?;
        if self.input_ended {
            return Ok(PumpStatus::EndOfFile);
        }

        loop {
            let Some(packet) = self.read_next_packet()? else {
                info!("Input exhausted after {} packets", self.stats.packets_read);
                self.input_ended = true;
                return Ok(PumpStatus::EndOfFile);
            };
            self.stats.packets_read += 1;
            trace!(
                "Read packet: stream {}, pts {:?}, dts {:?}",
                packet.stream_index,
                packet.pts,
                packet.dts
            );
            if self.dispatch(&packet)? {
                return Ok(PumpStatus::Processed);
            }
        }
    }

    /// Advance the drain sequence by one unit of output
    pub fn drain_step(&mut self) -> TranscodeResult<DrainStatus> {
        self.expect_phase(Phase::Running, "drain_step")?;
        if !self.input_ended {
            return Err(TranscodeError::InvalidState {
                operation: "drain_step",
                state: "still reading input".to_string(),
            });
        }

        loop {
            match self.drain.state() {
                DrainState::None => {
                    // Subtitle decoders hand out every event with its packet
                    let streams = self.demuxer.streams();
                    for (source_index, decoder) in self.decoders.iter_mut() {
                        if !streams.get(*source_index).is_some_and(|stream| stream.kind.is_decodable()) {
                            continue;
                        }
                        debug!("Flushing decoder of source stream {}", source_index);
                        decoder.flush()?;
                    }
                    self.drain.advance(DrainState::DecoderDraining)?;
                }
                DrainState::DecoderDraining => {
                    if self.drain_pass(Self::decoder_pass)? {
                        return Ok(DrainStatus::Progressed);
                    }
                    self.drain.advance(DrainState::DecoderDrained)?;
                }
                DrainState::DecoderDrained => {
                    if self.drain_pass(Self::filter_close_pass)? {
                        return Ok(DrainStatus::Progressed);
                    }
                    self.drain.advance(DrainState::FilterDraining)?;
                }
                DrainState::FilterDraining => {
                    if self.drain_pass(Self::filter_pass)? {
                        return Ok(DrainStatus::Progressed);
                    }
                    self.drain.advance(DrainState::FilterDrained)?;
                }
                DrainState::FilterDrained => {
                    if self.drain_pass(Self::encoder_close_pass)? {
                        return Ok(DrainStatus::Progressed);
                    }
                    self.drain.advance(DrainState::EncoderDraining)?;
                }
                DrainState::EncoderDraining => {
                    if self.drain_pass(Self::encoder_pass)? {
                        return Ok(DrainStatus::Progressed);
                    }
                    self.drain.advance(DrainState::EncoderDrained)?;
                    info!(
                        "Drain complete: {} packets written, {} frames encoded",
                        self.stats.packets_written, self.stats.frames_encoded
                    );
                }
                DrainState::EncoderDrained => return Ok(DrainStatus::EndOfStream),
            }
        }
    }

    /// Pump one packet, or one drain unit once input has ended
    pub fn step(&mut self) -> TranscodeResult<StepStatus> {
        if !self.input_ended {
            if let PumpStatus::Processed = self.process_next_packet()? {
                return Ok(StepStatus::Processed);
            }
        }
        match self.drain_step()? {
            DrainStatus::Progressed => Ok(StepStatus::Draining),
            DrainStatus::EndOfStream => Ok(StepStatus::EndOfStream),
        }
    }

    /// Run `step` until everything is drained, then write the trailer
    pub fn run_to_end(&mut self) -> TranscodeResult<&PumpStats> {
        while self.step()? != StepStatus::EndOfStream {}
        self.write_trailer()?;
        Ok(&self.stats)
    }

    /// Write the container trailer; later calls do nothing
    pub fn write_trailer(&mut self) -> TranscodeResult<()> {
        match self.phase {
            Phase::Running => {
                self.muxer.write_trailer()?;
                self.phase = Phase::Finished;
                info!("Trailer written");
                Ok(())
            }
            Phase::Finished => Ok(()),
            other => Err(TranscodeError::invalid_state("write_trailer", other)),
        }
    }

    /// Release decoders, converters and the preview frame; later calls do nothing
    pub fn close(&mut self) {
        if self.phase == Phase::Closed {
            return;
        }
        for mapping in self.mappings.iter_mut() {
            mapping.release();
        }
        self.decoders.clear();
        self.preview_decoder = None;
        self.preview_target = None;
        self.preview.reset();
        self.phase = Phase::Closed;
        debug!("Transcoder closed");
    }

    fn expect_phase(&self, expected: Phase, operation: &'static str) -> TranscodeResult<()> {
        if self.phase != expected {
            return Err(TranscodeError::invalid_state(operation, self.phase));
        }
        Ok(())
    }

    fn stream_info(&self, source_index: usize) -> TranscodeResult<StreamInfo> {
        self.demuxer
            .streams()
            .get(source_index)
            .cloned()
            .ok_or(TranscodeError::StreamNotFound { index: source_index })
    }

    fn decoder_for(&mut self, source_index: usize) -> TranscodeResult<&mut Box<dyn Decoder>> {
        if !self.decoders.contains_key(&source_index) {
            let stream = self.stream_info(source_index)?;
            let decoder = self.decoder_factory.open(&stream)?;
            debug!("Opened decoder for source stream {}", source_index);
            self.decoders.insert(source_index, decoder);
        }
        self.decoders
            .get_mut(&source_index)
            .ok_or(TranscodeError::StreamNotFound { index: source_index })
    }

    fn discard(&mut self, source_index: usize) {
        if let Some(flag) = self.discarded.get_mut(source_index) {
            *flag = true;
        }
        self.demuxer.discard(source_index);
    }

    fn default_preview_stream(&self) -> Option<usize> {
        [MediaKind::Video, MediaKind::Audio].into_iter().find_map(|kind| {
            let source = self.demuxer.best_stream(kind)?;
            let position = *self.mappings.for_source(source).first()?;
            self.mappings.get(position).map(|mapping| mapping.sink_index)
        })
    }

    fn open_preview_decoder(&mut self) -> TranscodeResult<()> {
        self.preview_decoder = None;
        self.preview_target = None;
        let Some(sink_index) = self.preview.stream_index() else {
            return Ok(());
        };
        let Some(mapping) = self.mappings.by_sink(sink_index) else {
            return Ok(());
        };
        if !mapping.is_copy() || !mapping.kind.is_decodable() || self.preview.update_interval().is_none() {
            return Ok(());
        }
        let stream = self.stream_info(mapping.source_index)?;
        match self.decoder_factory.open(&stream) {
            Ok(decoder) => {
                debug!("Opened preview decoder for copied sink stream {}", sink_index);
                self.preview_decoder = Some(decoder);
            }
            Err(e) => warn!("Preview disabled for sink stream {}: {}", sink_index, e),
        }
        Ok(())
    }

    fn all_discarded(&self) -> bool {
        self.discarded.iter().all(|flag| *flag)
    }

    /// Next packet of a live stream, or `None` at end of input
    fn read_next_packet(&mut self) -> TranscodeResult<Option<Packet>> {
        loop {
            if self.all_discarded() {
                return Ok(None);
            }
            let packet = match self.demuxer.read_packet()? {
                Step::Ready(packet) => packet,
                Step::TryAgain => continue,
                Step::EndOfFile => return Ok(None),
            };
            if self.is_discarded(packet.stream_index) {
                continue;
            }
            if timestamps::is_past_end(&packet, &self.trim) {
                debug!(
                    "Source stream {} reached the trim end at {:?}",
                    packet.stream_index,
                    packet.decode_ts()
                );
                self.discard(packet.stream_index);
                self.stats.streams_cut += 1;
                continue;
            }
            return Ok(Some(packet));
        }
    }

    /// Route a packet by media kind; true when anything moved downstream
    fn dispatch(&mut self, packet: &Packet) -> TranscodeResult<bool> {
        let kind = self.stream_info(packet.stream_index)?.kind;
        match kind {
            MediaKind::Video | MediaKind::Audio | MediaKind::Subtitle => {
                let copied = self.copy_to_mappings(packet)?;
                let decoded = self.decode_packet(packet)?;
                Ok(copied || decoded)
            }
            MediaKind::Data | MediaKind::Attachment => self.copy_to_mappings(packet),
        }
    }

    fn copy_to_mappings(&mut self, packet: &Packet) -> TranscodeResult<bool> {
        let positions = self.mappings.for_source(packet.stream_index).to_vec();
        let mut copied = false;
        for position in positions {
            let Some(mapping) = self.mappings.get(position) else {
                continue;
            };
            if !mapping.is_copy() {
                continue;
            }
            let (sink_index, sink_time_base, kind) = (mapping.sink_index, mapping.sink_time_base, mapping.kind);

            if self.preview.is_preview_stream(sink_index) {
                self.preview_copied_packet(packet, kind);
            }
            let out = timestamps::rebase_packet(packet, sink_index, sink_time_base, &self.trim);
            self.write_packet(out)?;
            self.stats.packets_copied += 1;
            copied = true;
        }
        Ok(copied)
    }

    /// Best-effort decode of a copied packet for the preview.
    ///
    /// A decode starts on a packet the tracker lets through and keeps
    /// feeding the following packets until the decoder hands back a frame
    /// at or past that packet. Older frames still buffered from an earlier
    /// round are skipped.
    fn preview_copied_packet(&mut self, packet: &Packet, kind: MediaKind) {
        if self.preview_decoder.is_none() {
            return;
        }
        if self.preview_target.is_none() {
            if !self.preview.should_decode(packet, kind) {
                return;
            }
            self.preview.mark_decoded();
            self.preview_target = Some((packet.pts.or(packet.dts).unwrap_or(i64::MIN), packet.time_base));
        }
        let Some(decoder) = self.preview_decoder.as_mut() else {
            return;
        };
        let Some((target, target_time_base)) = self.preview_target else {
            return;
        };

        let mut latest = None;
        let mut step = decoder.decode(packet);
        loop {
            match step {
                Ok(Step::Ready(frame)) => {
                    let current = frame
                        .pts
                        .map_or(true, |pts| frame.time_base.rescale(pts, target_time_base) >= target);
                    if current {
                        latest = Some(frame);
                    }
                }
                Ok(Step::TryAgain) | Ok(Step::EndOfFile) => break,
                Err(e) => {
                    warn!("Preview decode failed on stream {}: {}", packet.stream_index, e);
                    self.preview_target = None;
                    return;
                }
            }
            step = decoder.receive_buffered_frame();
        }

        if let Some(frame) = latest {
            self.preview.publish(&frame);
            self.preview_target = None;
        }
    }

    /// Decode once for every transcoding mapping of the packet's source
    fn decode_packet(&mut self, packet: &Packet) -> TranscodeResult<bool> {
        let source_index = packet.stream_index;
        let needs_decode = self
            .mappings
            .for_source(source_index)
            .iter()
            .any(|position| self.mappings.get(*position).is_some_and(|m| !m.is_copy()));
        if !needs_decode {
            return Ok(false);
        }

        let mut frames = Vec::new();
        {
            let decoder = self.decoder_for(source_index)?;
            if let Step::Ready(frame) = decoder.decode(packet)? {
                frames.push(frame);
            }
            while let Step::Ready(frame) = decoder.receive_buffered_frame()? {
                frames.push(frame);
            }
        }

        if frames.is_empty() {
            trace!("Decoder of source stream {} needs more input", source_index);
            return Ok(false);
        }
        for frame in &frames {
            self.stats.frames_decoded += 1;
            self.deliver_frame(source_index, frame)?;
        }
        Ok(true)
    }

    /// Hand a decoded frame to every transcoding mapping of its source
    fn deliver_frame(&mut self, source_index: usize, frame: &Frame) -> TranscodeResult<()> {
        let positions = self.mappings.for_source(source_index).to_vec();
        for position in positions {
            let Some(mapping) = self.mappings.get(position) else {
                continue;
            };
            if mapping.is_copy() {
                continue;
            }
            match (mapping.kind, mapping.filter) {
                (MediaKind::Subtitle, _) => self.encode_frame(position, frame.clone(), false)?,
                (_, Some(link)) => {
                    let graph = self.filter_graph.as_mut().ok_or_else(|| TranscodeError::filter("No filter graph attached"))?;
                    if !graph.send_frame(link.input, Some(frame))?.is_ready() {
                        trace!("Filter of mapping {} is not accepting frames", position);
                        continue;
                    }
                    self.pull_filtered(position, link)?;
                }
                (_, None) => self.encode_frame(position, frame.clone(), true)?,
            }
        }
        Ok(())
    }

    /// Move every frame waiting at a filter output into the encoder.
    /// Returns the number of frames pulled.
    fn pull_filtered(&mut self, position: usize, link: FilterLink) -> TranscodeResult<usize> {
        let mut pulled = 0;
        loop {
            let graph = self.filter_graph.as_mut().ok_or_else(|| TranscodeError::filter("No filter graph attached"))?;
            match graph.receive_frame(link.output)? {
                Step::Ready(filtered) => {
                    pulled += 1;
                    self.encode_frame(position, filtered, true)?;
                }
                Step::TryAgain | Step::EndOfFile => return Ok(pulled),
            }
        }
    }

    /// Convert (when asked), publish to the preview and encode one frame,
    /// then write every packet the encoder hands back.
    fn encode_frame(&mut self, position: usize, frame: Frame, convert: bool) -> TranscodeResult<()> {
        let Self {
            mappings,
            converter_factory,
            preview,
            stats,
            ..
        } = self;
        let Some(mapping) = mappings.get_mut(position) else {
            return Ok(());
        };
        let sink_index = mapping.sink_index;
        let Some(mapped) = mapping.encoder.as_mut() else {
            return Ok(());
        };

        let frame = if convert {
            mapping
                .converters
                .convert(&frame, &mapped.settings.format, &**converter_factory, sink_index)?
        } else {
            frame
        };
        let frame = timestamps::rescale_frame(frame, mapped.settings.time_base);

        if preview.is_preview_stream(sink_index) {
            preview.publish(&frame);
        }

        match mapped.encoder.send_frame(Some(&frame))? {
            Step::Ready(()) => stats.frames_encoded += 1,
            Step::TryAgain => {
                trace!("Encoder of sink stream {} is not accepting frames", sink_index);
                return Ok(());
            }
            Step::EndOfFile => {
                return Err(TranscodeError::EncodeError {
                    sink_index,
                    message: "encoder already finished".to_string(),
                })
            }
        }

        while self.receive_encoded(position)? {}
        Ok(())
    }

    /// Pull one packet from a mapping's encoder and write it.
    /// Returns false when the encoder had nothing to give.
    fn receive_encoded(&mut self, position: usize) -> TranscodeResult<bool> {
        Ok(matches!(self.poll_encoder(position)?, Step::Ready(())))
    }

    fn poll_encoder(&mut self, position: usize) -> TranscodeResult<Step<()>> {
        let Some(mapping) = self.mappings.get_mut(position) else {
            return Ok(Step::EndOfFile);
        };
        let (sink_index, sink_time_base) = (mapping.sink_index, mapping.sink_time_base);
        let Some(mapped) = mapping.encoder.as_mut() else {
            return Ok(Step::EndOfFile);
        };
        match mapped.encoder.receive_packet()? {
            Step::Ready(packet) => {
                let out = timestamps::rebase_packet(&packet, sink_index, sink_time_base, &self.trim);
                self.write_packet(out)?;
                Ok(Step::Ready(()))
            }
            Step::TryAgain => Ok(Step::TryAgain),
            Step::EndOfFile => Ok(Step::EndOfFile),
        }
    }

    fn write_packet(&mut self, packet: Packet) -> TranscodeResult<()> {
        if self.preview.is_preview_stream(packet.stream_index) {
            if let Some(pts) = packet.pts {
                self.preview.set_position(packet.time_base.to_duration(pts));
            }
        }
        trace!(
            "Writing packet: sink stream {}, pts {:?}, dts {:?}",
            packet.stream_index,
            packet.pts,
            packet.dts
        );
        self.muxer.write_packet(&packet)?;
        self.stats.packets_written += 1;
        Ok(())
    }

    /// Run passes of `pass` until one yields or the phase is over.
    /// True when something was produced.
    fn drain_pass(&mut self, pass: fn(&mut Self) -> TranscodeResult<PassOutcome>) -> TranscodeResult<bool> {
        loop {
            let outcome = pass(self)?;
            if self.drain.phase_complete(outcome) {
                if outcome == PassOutcome::Pending {
                    warn!(
                        "Drain phase {} ended with endpoints still pending after {} idle passes",
                        self.drain.state(),
                        self.drain.idle_passes()
                    );
                }
                return Ok(false);
            }
            if outcome == PassOutcome::Yielded {
                return Ok(true);
            }
        }
    }

    /// Ask each audio and video decoder in turn for one buffered frame
    fn decoder_pass(&mut self) -> TranscodeResult<PassOutcome> {
        let streams = self.demuxer.streams();
        let sources: Vec<usize> = self
            .decoders
            .keys()
            .copied()
            .filter(|index| streams.get(*index).is_some_and(|stream| stream.kind.is_decodable()))
            .collect();
        let mut pending = false;
        for source_index in sources {
            if self.drain.is_exhausted(source_index) {
                continue;
            }
            let Some(decoder) = self.decoders.get_mut(&source_index) else {
                continue;
            };
            match decoder.receive_buffered_frame()? {
                Step::Ready(frame) => {
                    self.stats.frames_decoded += 1;
                    self.deliver_frame(source_index, &frame)?;
                    return Ok(PassOutcome::Yielded);
                }
                Step::TryAgain => pending = true,
                Step::EndOfFile => {
                    debug!("Decoder of source stream {} drained", source_index);
                    self.drain.mark_exhausted(source_index);
                }
            }
        }
        Ok(if pending { PassOutcome::Pending } else { PassOutcome::Exhausted })
    }

    /// Ask each filter output in turn for one remaining frame
    fn filter_pass(&mut self) -> TranscodeResult<PassOutcome> {
        let outputs: Vec<(usize, usize, FilterLink)> = self
            .mappings
            .iter()
            .enumerate()
            .filter_map(|(position, m)| m.filter.map(|link| (position, m.sink_index, link)))
            .collect();
        let mut pending = false;
        for (position, sink_index, link) in outputs {
            if self.drain.is_exhausted(sink_index) {
                continue;
            }
            let graph = self.filter_graph.as_mut().ok_or_else(|| TranscodeError::filter("No filter graph attached"))?;
            match graph.receive_frame(link.output)? {
                Step::Ready(frame) => {
                    self.encode_frame(position, frame, true)?;
                    return Ok(PassOutcome::Yielded);
                }
                Step::TryAgain => pending = true,
                Step::EndOfFile => {
                    debug!("Filter output of sink stream {} drained", sink_index);
                    self.drain.mark_exhausted(sink_index);
                }
            }
        }
        Ok(if pending { PassOutcome::Pending } else { PassOutcome::Exhausted })
    }

    /// Send end-of-stream into every filter input that has not taken it yet.
    /// An input that answers `TryAgain` has its output pulled before the
    /// signal is sent again on a later pass.
    fn filter_close_pass(&mut self) -> TranscodeResult<PassOutcome> {
        let inputs: Vec<(usize, usize, FilterLink)> = self
            .mappings
            .iter()
            .enumerate()
            .filter_map(|(position, m)| m.filter.map(|link| (position, m.sink_index, link)))
            .collect();
        let mut pending = false;
        for (position, sink_index, link) in inputs {
            if self.drain.is_flushed(sink_index) {
                continue;
            }
            let graph = self.filter_graph.as_mut().ok_or_else(|| TranscodeError::filter("No filter graph attached"))?;
            match graph.send_frame(link.input, None)? {
                Step::Ready(()) | Step::EndOfFile => {
                    debug!("Closed filter input of sink stream {}", sink_index);
                    self.drain.mark_flushed(sink_index);
                }
                Step::TryAgain => {
                    trace!("Filter input of sink stream {} deferred end of stream", sink_index);
                    if self.pull_filtered(position, link)? > 0 {
                        return Ok(PassOutcome::Yielded);
                    }
                    pending = true;
                }
            }
        }
        Ok(if pending { PassOutcome::Pending } else { PassOutcome::Exhausted })
    }

    /// Send end-of-stream into every encoder that has not taken it yet.
    /// An encoder that answers `TryAgain` is polled for a packet before the
    /// signal is sent again on a later pass.
    fn encoder_close_pass(&mut self) -> TranscodeResult<PassOutcome> {
        let encoders: Vec<(usize, usize)> = self
            .mappings
            .iter()
            .enumerate()
            .filter(|(_, m)| !m.is_copy())
            .map(|(position, m)| (position, m.sink_index))
            .collect();
        let mut pending = false;
        for (position, sink_index) in encoders {
            if self.drain.is_flushed(sink_index) {
                continue;
            }
            let Some(mapped) = self.mappings.get_mut(position).and_then(|m| m.encoder.as_mut()) else {
                continue;
            };
            match mapped.encoder.send_frame(None)? {
                Step::Ready(()) | Step::EndOfFile => {
                    debug!("Flushed encoder of sink stream {}", sink_index);
                    self.drain.mark_flushed(sink_index);
                }
                Step::TryAgain => {
                    trace!("Encoder of sink stream {} deferred its flush", sink_index);
                    if let Step::Ready(()) = self.poll_encoder(position)? {
                        return Ok(PassOutcome::Yielded);
                    }
                    pending = true;
                }
            }
        }
        Ok(if pending { PassOutcome::Pending } else { PassOutcome::Exhausted })
    }

    /// Ask each encoder in turn for one remaining packet
    fn encoder_pass(&mut self) -> TranscodeResult<PassOutcome> {
        let encoders: Vec<(usize, usize)> = self
            .mappings
            .iter()
            .enumerate()
            .filter(|(_, m)| !m.is_copy())
            .map(|(position, m)| (position, m.sink_index))
            .collect();
        let mut pending = false;
        for (position, sink_index) in encoders {
            if self.drain.is_exhausted(sink_index) {
                continue;
            }
            match self.poll_encoder(position)? {
                Step::Ready(()) => return Ok(PassOutcome::Yielded),
                Step::TryAgain => pending = true,
                Step::EndOfFile => {
                    debug!("Encoder of sink stream {} drained", sink_index);
                    self.drain.mark_exhausted(sink_index);
                }
            }
        }
        Ok(if pending { PassOutcome::Pending } else { PassOutcome::Exhausted })
    }
}
