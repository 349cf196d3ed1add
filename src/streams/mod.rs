//! Stream handling and mapping module
//!
//! A mapping associates one source stream with one sink stream. A source may
//! be mapped any number of times (copy and transcode of the same stream side
//! by side), while every sink index belongs to exactly one mapping.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::domain::model::{CodecParameters, FrameFormat, MediaKind, Timebase};
use crate::engine::convert::ConverterCache;
use crate::error::{TranscodeError, TranscodeResult};
use crate::filters::FilterLink;
use crate::ports::{Encoder, EncoderSettings};

pub mod mapper;

pub use mapper::{EncoderSpec, StreamMapper};

/// Encoder bound to a mapping together with its resolved settings
pub struct MappedEncoder {
    pub encoder: Box<dyn Encoder>,
    pub settings: EncoderSettings,
}

impl MappedEncoder {
    /// Container-level parameters describing what this encoder produces
    pub fn codec_parameters(&self, kind: MediaKind) -> CodecParameters {
        let mut params = CodecParameters::new(kind, self.settings.codec.clone());
        match self.settings.format {
            FrameFormat::Video(video) => {
                params.width = video.width;
                params.height = video.height;
                params.pixel_format = Some(video.pixel_format);
            }
            FrameFormat::Audio(audio) => {
                params.sample_rate = audio.sample_rate;
                params.sample_format = Some(audio.sample_format);
                params.channel_layout = Some(audio.channel_layout);
            }
            FrameFormat::Subtitle => {}
        }
        params.bit_rate = self.settings.bit_rate;
        params.extradata = self.encoder.extradata();
        params
    }
}

/// One source -> sink association
pub struct StreamMapping {
    pub source_index: usize,
    pub sink_index: usize,
    pub kind: MediaKind,
    /// Time base of the source stream
    pub source_time_base: Timebase,
    /// Time base of the sink stream; final once the header is written
    pub sink_time_base: Timebase,
    pub filter: Option<FilterLink>,
    pub encoder: Option<MappedEncoder>,
    pub(crate) converters: ConverterCache,
}

impl StreamMapping {
    pub fn new(
        source_index: usize,
        sink_index: usize,
        kind: MediaKind,
        source_time_base: Timebase,
        filter: Option<FilterLink>,
        encoder: Option<MappedEncoder>,
    ) -> Self {
        Self {
            source_index,
            sink_index,
            kind,
            source_time_base,
            sink_time_base: source_time_base,
            filter,
            encoder,
            converters: ConverterCache::default(),
        }
    }

    /// A mapping without an encoder copies packets through untouched
    pub fn is_copy(&self) -> bool {
        self.encoder.is_none()
    }

    pub fn summary(&self) -> MappingSummary {
        MappingSummary {
            source_index: self.source_index,
            sink_index: self.sink_index,
            kind: self.kind,
            mode: if self.is_copy() {
                MappingMode::Copy
            } else {
                MappingMode::Transcode
            },
            codec: self.encoder.as_ref().map(|e| e.settings.codec.clone()),
            filtered: self.filter.is_some(),
            sink_time_base: self.sink_time_base,
        }
    }

    /// Drop converters held by this mapping
    pub(crate) fn release(&mut self) {
        self.converters.clear();
    }
}

/// Processing mode of a mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MappingMode {
    /// Stream copy (lossless)
    Copy,
    /// Decode and re-encode
    Transcode,
}

/// Serializable view of a mapping for reports and logs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingSummary {
    pub source_index: usize,
    pub sink_index: usize,
    pub kind: MediaKind,
    pub mode: MappingMode,
    pub codec: Option<String>,
    pub filtered: bool,
    pub sink_time_base: Timebase,
}

/// All mappings of a transcoder, indexed by source stream
#[derive(Default)]
pub struct MappingTable {
    mappings: Vec<StreamMapping>,
    by_source: HashMap<usize, Vec<usize>>,
}

impl MappingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a mapping; the sink index must not be taken yet
    pub fn insert(&mut self, mapping: StreamMapping) -> TranscodeResult<usize> {
        if self.contains_sink(mapping.sink_index) {
            return Err(TranscodeError::DuplicateSinkMapping {
                sink_index: mapping.sink_index,
            });
        }
        let position = self.mappings.len();
        self.by_source
            .entry(mapping.source_index)
            .or_default()
            .push(position);
        self.mappings.push(mapping);
        Ok(position)
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    pub fn contains_sink(&self, sink_index: usize) -> bool {
        self.mappings.iter().any(|m| m.sink_index == sink_index)
    }

    /// True when at least one mapping reads from `source_index`
    pub fn is_mapped(&self, source_index: usize) -> bool {
        self.by_source
            .get(&source_index)
            .is_some_and(|positions| !positions.is_empty())
    }

    /// Positions of every mapping reading from `source_index`, in mapping order
    pub fn for_source(&self, source_index: usize) -> &[usize] {
        self.by_source
            .get(&source_index)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn get(&self, position: usize) -> Option<&StreamMapping> {
        self.mappings.get(position)
    }

    pub fn get_mut(&mut self, position: usize) -> Option<&mut StreamMapping> {
        self.mappings.get_mut(position)
    }

    pub fn by_sink(&self, sink_index: usize) -> Option<&StreamMapping> {
        self.mappings.iter().find(|m| m.sink_index == sink_index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &StreamMapping> {
        self.mappings.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut StreamMapping> {
        self.mappings.iter_mut()
    }

    pub fn summaries(&self) -> Vec<MappingSummary> {
        self.mappings.iter().map(StreamMapping::summary).collect()
    }
}
