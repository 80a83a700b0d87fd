//! Edges: the transforms between node groups.
//!
//! Every edge connects one channel of an input node group to one channel of an output node group.
//! Spatial edges implement [`Edge<Cube>`]; FFT filter edges exchange frequency-domain volumes and
//! implement [`Edge<CCube>`]. The network keeps both behind [`EdgeRef`].

pub mod dummy;
pub mod fft_filter;
pub mod filter;
pub mod max_filter;

pub use dummy::DummyEdge;
pub use fft_filter::FftFilterEdge;
pub use filter::{FilterEdge, FilterEdgeOptions};
pub use max_filter::MaxFilterEdge;

use super::nodes::Nodes;
use super::task::TaskManager;
use crate::tensor::{CCube, Cube, Real};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

/// Receives the notification an edge sends once it has been zapped.
pub trait EdgeOwner: Sync {
    fn edge_zapped(&self, name: &str);
}

/// An edge carrying values of type `V`.
pub trait Edge<V>: Send + Sync {
    fn base(&self) -> &EdgeBase;

    /// Transforms `value` and eventually delivers it to the output node. No-op when disabled.
    fn forward(self: Arc<Self>, value: Arc<V>);

    /// Transforms `gradient` and delivers it to the input node. No-op when disabled.
    fn backward(self: Arc<Self>, gradient: Arc<V>);

    /// Blocks until no background work of this edge is outstanding.
    fn drain(&self);

    fn name(&self) -> &str {
        self.base().name()
    }

    fn is_enabled(&self) -> bool {
        self.base().is_enabled()
    }

    fn set_enabled(&self, enabled: bool) {
        self.base().set_enabled(enabled);
    }

    /// Drains the edge, then notifies `owner` exactly once.
    fn zap(&self, owner: &dyn EdgeOwner) {
        self.drain();
        owner.edge_zapped(self.name());
    }
}

/// One side of an edge: a channel of a node group and the bucket the edge was given there.
#[derive(Debug)]
pub struct Endpoint {
    pub nodes: Arc<Nodes>,
    pub channel: usize,
    pub bucket: usize,
}

/// Where a new edge goes: its name, both channels, and the scheduler it runs on.
#[derive(Clone, Debug)]
pub struct Link {
    pub name: String,
    pub input: Arc<Nodes>,
    pub input_channel: usize,
    pub output: Arc<Nodes>,
    pub output_channel: usize,
    pub tasks: Arc<TaskManager>,
    pub patch_size: Real,
}

impl Link {
    /// Attaches a spatial edge to both node groups.
    pub fn attach_spatial(self, edge: Weak<dyn Edge<Cube>>) -> EdgeBase {
        let in_bucket = self.input.attach_out_edge(self.input_channel, edge.clone());
        let out_bucket = self.output.attach_in_edge(self.output_channel, edge);
        self.into_base(in_bucket, out_bucket)
    }

    /// Attaches a frequency-domain edge. Its forward values have the input group's size.
    pub fn attach_fft(self, edge: Weak<dyn Edge<CCube>>) -> EdgeBase {
        let in_bucket = self
            .input
            .attach_out_fft_edge(self.input_channel, edge.clone());
        let out_bucket =
            self.output
                .attach_in_fft_edge(self.output_channel, edge, self.input.fsize());
        self.into_base(in_bucket, out_bucket)
    }

    fn into_base(self, in_bucket: usize, out_bucket: usize) -> EdgeBase {
        EdgeBase {
            name: self.name,
            input: Endpoint {
                nodes: self.input,
                channel: self.input_channel,
                bucket: in_bucket,
            },
            output: Endpoint {
                nodes: self.output,
                channel: self.output_channel,
                bucket: out_bucket,
            },
            tasks: self.tasks,
            enabled: AtomicBool::new(true),
            upstream: AtomicBool::new(true),
            patch_size: self.patch_size,
        }
    }
}

/// State common to every edge variant.
pub struct EdgeBase {
    name: String,
    pub input: Endpoint,
    pub output: Endpoint,
    pub tasks: Arc<TaskManager>,
    enabled: AtomicBool,
    // whether the input node waits for this edge's gradient
    upstream: AtomicBool,
    pub patch_size: Real,
}

impl EdgeBase {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn deliver_forward(&self, value: Cube) {
        let out = &self.output;
        out.nodes.forward(out.channel, out.bucket, value);
    }

    pub fn deliver_forward_fft(&self, value: CCube) {
        let out = &self.output;
        out.nodes.forward_fft(out.channel, out.bucket, value);
    }

    pub fn deliver_backward(&self, gradient: Cube) {
        let input = &self.input;
        input.nodes.backward(input.channel, input.bucket, gradient);
    }

    pub fn deliver_backward_fft(&self, gradient: CCube) {
        let input = &self.input;
        input.nodes.backward_fft(input.channel, input.bucket, gradient);
    }

    /// Switches the edge on or off and keeps both nodes' contribution counts in step.
    /// Only valid between traversals.
    pub fn set_enabled(&self, enabled: bool) {
        if self.enabled.swap(enabled, Ordering::AcqRel) == enabled {
            return;
        }
        self.output
            .nodes
            .set_in_enabled(self.output.channel, self.output.bucket, enabled);
        self.set_upstream(enabled);
        debug!(edge = %self.name, enabled, "edge toggled");
    }

    /// Whether a backward pass sends a gradient through this edge.
    pub fn is_upstream(&self) -> bool {
        self.upstream.load(Ordering::Acquire)
    }

    /// Adds or removes this edge from the gradients the input node waits for. An enabled edge
    /// whose output channel never fires backward must not be waited for. Only valid between
    /// traversals.
    pub fn set_upstream(&self, upstream: bool) {
        if self.upstream.swap(upstream, Ordering::AcqRel) == upstream {
            return;
        }
        self.input
            .nodes
            .set_out_enabled(self.input.channel, self.input.bucket, upstream);
    }
}

impl std::fmt::Debug for EdgeBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EdgeBase")
            .field("name", &self.name)
            .field("input", &(self.input.nodes.name(), self.input.channel))
            .field("output", &(self.output.nodes.name(), self.output.channel))
            .field("enabled", &self.is_enabled())
            .field("upstream", &self.is_upstream())
            .finish()
    }
}

/// An edge of either domain, as held by the network.
#[derive(Clone)]
pub enum EdgeRef {
    Spatial(Arc<dyn Edge<Cube>>),
    Frequency(Arc<dyn Edge<CCube>>),
}

impl EdgeRef {
    pub fn base(&self) -> &EdgeBase {
        match self {
            EdgeRef::Spatial(e) => e.base(),
            EdgeRef::Frequency(e) => e.base(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            EdgeRef::Spatial(e) => e.name(),
            EdgeRef::Frequency(e) => e.name(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        match self {
            EdgeRef::Spatial(e) => e.is_enabled(),
            EdgeRef::Frequency(e) => e.is_enabled(),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        match self {
            EdgeRef::Spatial(e) => e.set_enabled(enabled),
            EdgeRef::Frequency(e) => e.set_enabled(enabled),
        }
    }

    pub fn drain(&self) {
        match self {
            EdgeRef::Spatial(e) => e.drain(),
            EdgeRef::Frequency(e) => e.drain(),
        }
    }

    pub fn zap(&self, owner: &dyn EdgeOwner) {
        match self {
            EdgeRef::Spatial(e) => e.zap(owner),
            EdgeRef::Frequency(e) => e.zap(owner),
        }
    }
}

impl std::fmt::Debug for EdgeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EdgeRef::Spatial(e) => f.debug_tuple("Spatial").field(e.base()).finish(),
            EdgeRef::Frequency(e) => f.debug_tuple("Frequency").field(e.base()).finish(),
        }
    }
}

/// Counts zap notifications.
#[derive(Debug, Default)]
pub struct ZapTally {
    zapped: AtomicUsize,
}

impl ZapTally {
    pub fn count(&self) -> usize {
        self.zapped.load(Ordering::Acquire)
    }
}

impl EdgeOwner for ZapTally {
    fn edge_zapped(&self, name: &str) {
        self.zapped.fetch_add(1, Ordering::AcqRel);
        tracing::trace!(edge = name, "edge zapped");
    }
}
