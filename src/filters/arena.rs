//! Arena-backed filter graph
//!
//! Nodes are stored in a flat vector and linked by [`FilterHandle`]. A chain
//! runs from a source node through any number of filters into a sink node;
//! frames pushed into the source are carried downstream synchronously and
//! queue up at the sink until they are pulled.

use std::collections::VecDeque;

use tracing::{debug, trace};

use crate::domain::model::{Frame, StreamGeometry, Step};
use crate::error::{TranscodeError, TranscodeResult};
use crate::filters::{FilterHandle, FilterLink, FilterRegistry, FrameFilter};
use crate::ports::FilterGraph;

enum NodeKind {
    Source,
    Filter(Box<dyn FrameFilter>),
    Sink(VecDeque<Frame>),
}

struct FilterNode {
    label: String,
    kind: NodeKind,
    next: Option<FilterHandle>,
    geometry: Option<StreamGeometry>,
    end_of_stream: bool,
}

/// Filter graph owning all of its nodes
#[derive(Default)]
pub struct FilterArena {
    nodes: Vec<FilterNode>,
}

impl FilterArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of nodes in the arena
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Add an input endpoint producing frames of `geometry`
    pub fn add_source(&mut self, label: &str, geometry: StreamGeometry) -> FilterHandle {
        self.push_node(label, NodeKind::Source, Some(geometry))
    }

    /// Add a registered filter by name
    pub fn add_filter(&mut self, name: &str, args: &str) -> TranscodeResult<FilterHandle> {
        let filter = FilterRegistry::global().create(name, args)?;
        Ok(self.push_node(name, NodeKind::Filter(filter), None))
    }

    /// Add an already constructed filter
    pub fn add_custom_filter(&mut self, filter: Box<dyn FrameFilter>) -> FilterHandle {
        let label = filter.name().to_string();
        self.push_node(&label, NodeKind::Filter(filter), None)
    }

    /// Add an output endpoint
    pub fn add_sink(&mut self, label: &str) -> FilterHandle {
        self.push_node(label, NodeKind::Sink(VecDeque::new()), None)
    }

    /// Connect `from` to `to`; each node has at most one downstream link
    pub fn link(&mut self, from: FilterHandle, to: FilterHandle) -> TranscodeResult<()> {
        self.node(from)?;
        self.node(to)?;
        if matches!(self.nodes[from.0].kind, NodeKind::Sink(_)) {
            return Err(TranscodeError::filter(format!(
                "Sink '{}' cannot feed another node",
                self.nodes[from.0].label
            )));
        }
        if matches!(self.nodes[to.0].kind, NodeKind::Source) {
            return Err(TranscodeError::filter(format!(
                "Source '{}' cannot be fed by another node",
                self.nodes[to.0].label
            )));
        }
        if self.nodes[from.0].next.is_some() {
            return Err(TranscodeError::filter(format!(
                "Node '{}' is already linked",
                self.nodes[from.0].label
            )));
        }

        let mut cursor = Some(to);
        while let Some(handle) = cursor {
            if handle == from {
                return Err(TranscodeError::filter(format!(
                    "Linking '{}' to '{}' would form a cycle",
                    self.nodes[from.0].label, self.nodes[to.0].label
                )));
            }
            cursor = self.nodes[handle.0].next;
        }

        self.nodes[from.0].next = Some(to);

        // Carry the geometry down to the end of the chain
        let geometry = self.nodes[from.0].geometry;
        let mut cursor = Some(to);
        while let Some(handle) = cursor {
            let node = &mut self.nodes[handle.0];
            node.geometry = geometry;
            cursor = node.next;
        }
        Ok(())
    }

    /// Build a complete source -> filters -> sink chain
    pub fn chain(
        &mut self,
        label: &str,
        geometry: StreamGeometry,
        filters: &[(&str, &str)],
    ) -> TranscodeResult<FilterLink> {
        let input = self.add_source(&format!("{}:in", label), geometry);
        let mut tail = input;
        for (name, args) in filters {
            let filter = self.add_filter(name, args)?;
            self.link(tail, filter)?;
            tail = filter;
        }
        let output = self.add_sink(&format!("{}:out", label));
        self.link(tail, output)?;
        debug!("Built filter chain '{}' with {} filters", label, filters.len());
        Ok(FilterLink { input, output })
    }

    fn push_node(&mut self, label: &str, kind: NodeKind, geometry: Option<StreamGeometry>) -> FilterHandle {
        let handle = FilterHandle(self.nodes.len());
        self.nodes.push(FilterNode {
            label: label.to_string(),
            kind,
            next: None,
            geometry,
            end_of_stream: false,
        });
        handle
    }

    fn node(&self, handle: FilterHandle) -> TranscodeResult<&FilterNode> {
        self.nodes
            .get(handle.0)
            .ok_or_else(|| TranscodeError::filter(format!("No filter node with handle {}", handle.0)))
    }

    /// Walk the chain below `from`, feeding frames through every filter.
    /// With `finish` set, every filter is flushed on the way and the sink is
    /// marked as ending.
    fn propagate(&mut self, from: FilterHandle, mut frames: Vec<Frame>, finish: bool) -> TranscodeResult<()> {
        let mut cursor = self.nodes[from.0].next;
        while let Some(handle) = cursor {
            let node = &mut self.nodes[handle.0];
            match &mut node.kind {
                NodeKind::Filter(filter) => {
                    let mut produced = Vec::new();
                    for frame in frames {
                        produced.extend(filter.push(frame)?);
                    }
                    if finish {
                        produced.extend(filter.flush()?);
                        node.end_of_stream = true;
                    }
                    frames = produced;
                    cursor = node.next;
                }
                NodeKind::Sink(queue) => {
                    trace!("{} frame(s) reached sink '{}'", frames.len(), node.label);
                    queue.extend(frames);
                    if finish {
                        node.end_of_stream = true;
                    }
                    return Ok(());
                }
                NodeKind::Source => {
                    return Err(TranscodeError::filter("Source node found inside a chain"));
                }
            }
        }
        Err(TranscodeError::filter(format!(
            "Chain starting at '{}' does not end in a sink",
            self.nodes[from.0].label
        )))
    }
}

impl FilterGraph for FilterArena {
    fn output_geometry(&self, output: FilterHandle) -> TranscodeResult<StreamGeometry> {
        let node = self.node(output)?;
        node.geometry
            .ok_or_else(|| TranscodeError::filter(format!("Node '{}' is not linked to a source", node.label)))
    }

    fn send_frame(&mut self, input: FilterHandle, frame: Option<&Frame>) -> TranscodeResult<Step<()>> {
        let node = self.node(input)?;
        if !matches!(node.kind, NodeKind::Source) {
            return Err(TranscodeError::filter(format!("Node '{}' is not an input", node.label)));
        }

        match frame {
            Some(frame) => {
                if node.end_of_stream {
                    return Err(TranscodeError::filter(format!(
                        "Frame sent to '{}' after end of stream",
                        node.label
                    )));
                }
                self.propagate(input, vec![frame.clone()], false)?;
            }
            None => {
                if node.end_of_stream {
                    return Ok(Step::Ready(()));
                }
                self.nodes[input.0].end_of_stream = true;
                self.propagate(input, Vec::new(), true)?;
            }
        }
        Ok(Step::Ready(()))
    }

    fn receive_frame(&mut self, output: FilterHandle) -> TranscodeResult<Step<Frame>> {
        self.node(output)?;
        let node = &mut self.nodes[output.0];
        let NodeKind::Sink(queue) = &mut node.kind else {
            return Err(TranscodeError::filter(format!("Node '{}' is not an output", node.label)));
        };
        match queue.pop_front() {
            Some(frame) => Ok(Step::Ready(frame)),
            None if node.end_of_stream => Ok(Step::EndOfFile),
            None => Ok(Step::TryAgain),
        }
    }
}
