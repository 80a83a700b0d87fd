//! Node groups: the activations of a network.
//!
//! A [`Nodes`] group has `count` channels sharing one spatial size. Each channel keeps a forward
//! and a backward accumulator. Contributions arrive at a bucket index handed out when the edge
//! attached: bucket `0` is the spatial sum, higher buckets collect frequency-domain contributions
//! keyed by their transform shape. A channel fires once every enabled edge attached to it has
//! contributed, and fans the result out to the edges on the other side (or to the network's sink
//! when there are none).

use super::edge::Edge;
use super::fatal;
use super::transfer::TransferFn;
use crate::tensor::{CCube, Cube, Tensor, Vec3i};
use crossbeam::channel::Sender;
use parking_lot::{Mutex, RwLock};
use std::ops::AddAssign;
use std::sync::{Arc, Weak};
use tracing::trace;

/// What a node group does to the sum of its inputs.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum NodeKind {
    /// Source of a traversal; fed by the network.
    Input,
    /// Passes the sum through unchanged.
    Sum,
    /// Applies an activation to the sum.
    Transfer(TransferFn),
}

/// A finished value leaving the graph.
#[derive(Debug)]
pub struct Delivery {
    pub node: usize,
    pub channel: usize,
    pub value: Arc<Cube>,
}

/// Bucket index of the spatial sum.
pub const SPATIAL_BUCKET: usize = 0;

trait Accumulate {
    fn accumulate(&mut self, other: &Self);
}

impl<T> Accumulate for Tensor<T, 3>
where
    T: Copy + Send + Sync + AddAssign,
{
    fn accumulate(&mut self, other: &Self) {
        fatal(self.add_assign(other), "accumulated volumes disagree");
    }
}

struct SumState<V> {
    required: usize,
    partial: Option<(V, usize)>,
}

// Sums contributions without holding the lock during the addition: a contributor that finds a
// partial sum takes it, adds it outside the lock and tries again.
struct Sum<V> {
    state: Mutex<SumState<V>>,
}

impl<V: Accumulate> Sum<V> {
    fn new() -> Self {
        Self {
            state: Mutex::new(SumState {
                required: 0,
                partial: None,
            }),
        }
    }

    fn required(&self) -> usize {
        self.state.lock().required
    }

    fn set_required(&self, required: usize) {
        let mut state = self.state.lock();
        assert!(
            state.partial.is_none(),
            "required contributions changed during a traversal"
        );
        state.required = required;
    }

    /// Returns the total once this contribution completes the sum.
    fn add(&self, value: V) -> Option<V> {
        let mut value = value;
        let mut merged = 1;
        loop {
            let mut state = self.state.lock();
            match state.partial.take() {
                Some((other, count)) => {
                    drop(state);
                    value.accumulate(&other);
                    merged += count;
                }
                None => {
                    if merged >= state.required {
                        return Some(value);
                    }
                    state.partial = Some((value, merged));
                    return None;
                }
            }
        }
    }
}

struct FftBucket {
    shape: Vec3i,
    sum: Sum<CCube>,
}

struct Direction {
    spatial: Sum<Cube>,
    buckets: RwLock<Vec<Arc<FftBucket>>>,
}

impl Direction {
    fn new() -> Self {
        Self {
            spatial: Sum::new(),
            buckets: RwLock::new(Vec::new()),
        }
    }

    fn bucket(&self, index: usize) -> Arc<FftBucket> {
        let buckets = self.buckets.read();
        match index.checked_sub(1).and_then(|i| buckets.get(i)) {
            Some(bucket) => Arc::clone(bucket),
            None => panic!("no frequency bucket {index}"),
        }
    }

    fn bucket_for(&self, shape: Vec3i) -> usize {
        let mut buckets = self.buckets.write();
        if let Some(i) = buckets.iter().position(|b| b.shape == shape) {
            return i + 1;
        }
        buckets.push(Arc::new(FftBucket {
            shape,
            sum: Sum::new(),
        }));
        buckets.len()
    }

    fn set_bucket_required(&self, index: usize, enabled: bool) {
        let bucket = self.bucket(index);
        let required = bucket.sum.required();
        bucket.sum.set_required(if enabled {
            required + 1
        } else {
            required - 1
        });
    }

    fn recount(&self, spatial_edges: usize) {
        let active = self
            .buckets
            .read()
            .iter()
            .filter(|b| b.sum.required() > 0)
            .count();
        self.spatial.set_required(spatial_edges + active);
    }
}

#[derive(Default)]
struct Wiring {
    in_spatial: Vec<Weak<dyn Edge<Cube>>>,
    in_fft: Vec<Vec<Weak<dyn Edge<CCube>>>>,
    out_spatial: Vec<Weak<dyn Edge<Cube>>>,
    out_fft: Vec<Weak<dyn Edge<CCube>>>,
    fwd_spatial: usize,
    bwd_spatial: usize,
}

impl Wiring {
    fn has_in_edges(&self) -> bool {
        !self.in_spatial.is_empty() || self.in_fft.iter().any(|b| !b.is_empty())
    }

    fn has_out_edges(&self) -> bool {
        !self.out_spatial.is_empty() || !self.out_fft.is_empty()
    }
}

struct Channel {
    fwd: Direction,
    bwd: Direction,
    wiring: RwLock<Wiring>,
    output: Mutex<Option<Arc<Cube>>>,
}

fn live<V>(edges: &[Weak<dyn Edge<V>>]) -> Vec<Arc<dyn Edge<V>>> {
    edges
        .iter()
        .filter_map(Weak::upgrade)
        .filter(|e| e.is_enabled())
        .collect()
}

/// A named group of channels with a common spatial size.
pub struct Nodes {
    id: usize,
    name: String,
    kind: NodeKind,
    fsize: Vec3i,
    channels: Vec<Channel>,
    forward_sink: Sender<Delivery>,
    backward_sink: Sender<Delivery>,
}

impl Nodes {
    pub fn new(
        id: usize,
        name: impl Into<String>,
        kind: NodeKind,
        count: usize,
        fsize: Vec3i,
        forward_sink: Sender<Delivery>,
        backward_sink: Sender<Delivery>,
    ) -> Self {
        let channels = (0..count)
            .map(|_| Channel {
                fwd: Direction::new(),
                bwd: Direction::new(),
                wiring: RwLock::new(Wiring::default()),
                output: Mutex::new(None),
            })
            .collect();
        Self {
            id,
            name: name.into(),
            kind,
            fsize,
            channels,
            forward_sink,
            backward_sink,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn count(&self) -> usize {
        self.channels.len()
    }

    pub fn fsize(&self) -> Vec3i {
        self.fsize
    }

    fn channel(&self, channel: usize) -> &Channel {
        match self.channels.get(channel) {
            Some(c) => c,
            None => panic!(
                "node group '{}' has {} channels, got channel {channel}",
                self.name,
                self.channels.len()
            ),
        }
    }

    /// Whether any edge leaves channel `channel`. Channels without one deliver to the sink.
    pub fn has_out_edges(&self, channel: usize) -> bool {
        self.channel(channel).wiring.read().has_out_edges()
    }

    pub fn has_in_edges(&self, channel: usize) -> bool {
        self.channel(channel).wiring.read().has_in_edges()
    }

    /// Contributions channel `channel` waits for before firing forward.
    pub fn forward_required(&self, channel: usize) -> usize {
        self.channel(channel).fwd.spatial.required()
    }

    pub fn backward_required(&self, channel: usize) -> usize {
        self.channel(channel).bwd.spatial.required()
    }

    pub fn attach_in_edge(&self, channel: usize, edge: Weak<dyn Edge<Cube>>) -> usize {
        let c = self.channel(channel);
        let mut wiring = c.wiring.write();
        wiring.in_spatial.push(edge);
        wiring.fwd_spatial += 1;
        c.fwd.recount(wiring.fwd_spatial);
        SPATIAL_BUCKET
    }

    pub fn attach_out_edge(&self, channel: usize, edge: Weak<dyn Edge<Cube>>) -> usize {
        let c = self.channel(channel);
        let mut wiring = c.wiring.write();
        wiring.out_spatial.push(edge);
        wiring.bwd_spatial += 1;
        c.bwd.recount(wiring.bwd_spatial);
        SPATIAL_BUCKET
    }

    /// Registers an edge delivering frequency-domain values of shape `shape`; returns its bucket.
    pub fn attach_in_fft_edge(
        &self,
        channel: usize,
        edge: Weak<dyn Edge<CCube>>,
        shape: Vec3i,
    ) -> usize {
        let c = self.channel(channel);
        let mut wiring = c.wiring.write();
        let bucket = c.fwd.bucket_for(shape);
        if wiring.in_fft.len() < bucket {
            wiring.in_fft.resize_with(bucket, Vec::new);
        }
        wiring.in_fft[bucket - 1].push(edge);
        c.fwd.set_bucket_required(bucket, true);
        c.fwd.recount(wiring.fwd_spatial);
        bucket
    }

    /// Registers an edge reading this channel in the frequency domain; returns the bucket its
    /// gradients arrive in.
    pub fn attach_out_fft_edge(&self, channel: usize, edge: Weak<dyn Edge<CCube>>) -> usize {
        let c = self.channel(channel);
        let mut wiring = c.wiring.write();
        let bucket = c.bwd.bucket_for(self.fsize);
        wiring.out_fft.push(edge);
        c.bwd.set_bucket_required(bucket, true);
        c.bwd.recount(wiring.bwd_spatial);
        bucket
    }

    /// Adjusts the forward contribution count when an incoming edge is switched on or off.
    pub fn set_in_enabled(&self, channel: usize, bucket: usize, enabled: bool) {
        let c = self.channel(channel);
        let mut wiring = c.wiring.write();
        if bucket == SPATIAL_BUCKET {
            if enabled {
                wiring.fwd_spatial += 1;
            } else {
                wiring.fwd_spatial -= 1;
            }
        } else {
            c.fwd.set_bucket_required(bucket, enabled);
        }
        c.fwd.recount(wiring.fwd_spatial);
    }

    pub fn set_out_enabled(&self, channel: usize, bucket: usize, enabled: bool) {
        let c = self.channel(channel);
        let mut wiring = c.wiring.write();
        if bucket == SPATIAL_BUCKET {
            if enabled {
                wiring.bwd_spatial += 1;
            } else {
                wiring.bwd_spatial -= 1;
            }
        } else {
            c.bwd.set_bucket_required(bucket, enabled);
        }
        c.bwd.recount(wiring.bwd_spatial);
    }

    /// Feeds a source value; the channel fires immediately.
    pub fn forward_input(&self, channel: usize, value: Cube) {
        self.fire_forward(channel, value);
    }

    /// Feeds a gradient into a channel without outgoing edges; the channel fires immediately.
    pub fn backward_input(&self, channel: usize, gradient: Cube) {
        self.fire_backward(channel, gradient);
    }

    /// A spatial contribution from an incoming edge.
    pub fn forward(&self, channel: usize, bucket: usize, value: Cube) {
        debug_assert_eq!(bucket, SPATIAL_BUCKET);
        if let Some(total) = self.channel(channel).fwd.spatial.add(value) {
            self.fire_forward(channel, total);
        }
    }

    /// A frequency-domain contribution from an incoming FFT edge.
    pub fn forward_fft(&self, channel: usize, bucket: usize, value: CCube) {
        let b = self.channel(channel).fwd.bucket(bucket);
        if let Some(total) = b.sum.add(value) {
            let full = fatal(total.ifft(), "inverse transform of forward bucket");
            let valid = fatal(full.crop_trailing(self.fsize), "valid region of forward bucket");
            self.forward(channel, SPATIAL_BUCKET, valid);
        }
    }

    /// A spatial gradient from an outgoing edge.
    pub fn backward(&self, channel: usize, bucket: usize, gradient: Cube) {
        debug_assert_eq!(bucket, SPATIAL_BUCKET);
        if let Some(total) = self.channel(channel).bwd.spatial.add(gradient) {
            self.fire_backward(channel, total);
        }
    }

    /// A frequency-domain gradient from an outgoing FFT edge.
    pub fn backward_fft(&self, channel: usize, bucket: usize, gradient: CCube) {
        let b = self.channel(channel).bwd.bucket(bucket);
        if let Some(total) = b.sum.add(gradient) {
            let mut spatial = fatal(total.ifft(), "inverse transform of backward bucket");
            spatial.flip();
            self.backward(channel, SPATIAL_BUCKET, spatial);
        }
    }

    fn fire_forward(&self, channel: usize, value: Cube) {
        let c = self.channel(channel);
        let value = match self.kind {
            NodeKind::Transfer(f) => {
                let out = Arc::new(value.map(|x| f.apply(x)));
                *c.output.lock() = Some(Arc::clone(&out));
                out
            }
            NodeKind::Input | NodeKind::Sum => Arc::new(value),
        };

        let (spatial, fft, is_sink) = {
            let wiring = c.wiring.read();
            (
                live(&wiring.out_spatial),
                live(&wiring.out_fft),
                !wiring.has_out_edges(),
            )
        };
        trace!(node = %self.name, channel, "forward fired");

        if is_sink {
            let _ = self.forward_sink.send(Delivery {
                node: self.id,
                channel,
                value,
            });
            return;
        }

        for edge in spatial {
            edge.forward(Arc::clone(&value));
        }
        if !fft.is_empty() {
            let freq = Arc::new(fatal(value.fft(), "forward transform of node output"));
            for edge in fft {
                edge.forward(Arc::clone(&freq));
            }
        }
    }

    fn fire_backward(&self, channel: usize, gradient: Cube) {
        let c = self.channel(channel);
        let gradient = match self.kind {
            NodeKind::Transfer(f) => {
                let output = match c.output.lock().clone() {
                    Some(output) => output,
                    None => panic!(
                        "node group '{}' has no forward output to differentiate",
                        self.name
                    ),
                };
                let derivative = output.map(|y| f.derivative(y));
                fatal(&gradient * &derivative, "gradient of transfer node")
            }
            NodeKind::Input | NodeKind::Sum => gradient,
        };
        let gradient = Arc::new(gradient);

        let (spatial, fft, is_source) = {
            let wiring = c.wiring.read();
            let buckets = c.fwd.buckets.read();
            let fft: Vec<(Vec3i, Vec<Arc<dyn Edge<CCube>>>)> = wiring
                .in_fft
                .iter()
                .zip(buckets.iter())
                .map(|(edges, bucket)| (bucket.shape, live(edges)))
                .filter(|(_, edges)| !edges.is_empty())
                .collect();
            (live(&wiring.in_spatial), fft, !wiring.has_in_edges())
        };
        trace!(node = %self.name, channel, "backward fired");

        if is_source {
            let _ = self.backward_sink.send(Delivery {
                node: self.id,
                channel,
                value: gradient,
            });
            return;
        }

        for edge in spatial {
            edge.backward(Arc::clone(&gradient));
        }
        if !fft.is_empty() {
            let mut flipped = (*gradient).clone();
            flipped.flip();
            for (shape, edges) in fft {
                let padded = fatal(flipped.pad(shape), "padding gradient to bucket shape");
                let freq = Arc::new(fatal(padded.fft(), "forward transform of gradient"));
                for edge in edges {
                    edge.backward(Arc::clone(&freq));
                }
            }
        }
    }
}

impl std::fmt::Debug for Nodes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Nodes")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("count", &self.channels.len())
            .field("fsize", &self.fsize)
            .finish()
    }
}
