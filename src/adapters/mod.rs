// Adapters - Collaborator implementations for the ports

pub mod memory;

#[cfg(feature = "libav")]
pub mod libav;

pub use memory::{
    EventLog, MemoryDemuxer, MemoryMuxer, MuxRecorder, MuxedOutput, ScriptedDecoderFactory, ScriptedEncoder,
    StampingConverterFactory,
};

#[cfg(feature = "libav")]
pub use libav::{CopyOnlyCodecs, LibavDemuxer, LibavMuxer};
