//! Filter graph support
//!
//! Filters are nodes in an arena owned by [`FilterArena`]; everything outside
//! the arena refers to them by [`FilterHandle`]. Filter implementations are
//! looked up by name in the process-wide [`FilterRegistry`].

use serde::{Deserialize, Serialize};

use crate::domain::model::Frame;
use crate::error::TranscodeResult;

pub mod arena;
pub mod registry;

pub use arena::FilterArena;
pub use registry::{FilterFactory, FilterRegistry};

/// Stable index of a node inside a filter arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FilterHandle(pub usize);

/// The two endpoints a stream mapping talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterLink {
    /// Endpoint decoded frames are pushed into
    pub input: FilterHandle,
    /// Endpoint filtered frames are pulled from
    pub output: FilterHandle,
}

/// A single frame-to-frames processing step inside a chain
pub trait FrameFilter: Send {
    fn name(&self) -> &str;

    /// Process one frame, returning whatever is ready to move downstream
    fn push(&mut self, frame: Frame) -> TranscodeResult<Vec<Frame>>;

    /// Release everything still buffered; no more frames will arrive
    fn flush(&mut self) -> TranscodeResult<Vec<Frame>>;
}
