use super::config::NetworkConfig;
use super::edge::{
    DummyEdge, EdgeRef, FftFilterEdge, FilterEdge, FilterEdgeOptions, Link, MaxFilterEdge,
};
use super::filter::{Filter, FilterInit, SharedFilter};
use super::nodes::{NodeKind, Nodes};
use super::task::TaskManager;
use super::transfer::TransferFn;
use super::{EdgeGroup, Network};
use crate::error::{Result, ZnnError};
use crate::tensor::Vec3i;
use crossbeam::channel::unbounded;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info};

/// Settings of a convolution edge group.
///
/// ```rust
/// use znn_rs::network::{ConvOptions, FilterInit};
///
/// let options = ConvOptions::new([3, 3, 1])
///     .with_stride([2, 2, 1])
///     .with_init(FilterInit::Constant(0.5));
/// assert!(!options.deconv);
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct ConvOptions {
    /// Compact filter shape.
    pub size: Vec3i,
    /// Distance between filter taps.
    pub stride: Vec3i,
    /// Block pattern the weights are averaged over; `[1, 1, 1]` leaves them untouched.
    pub repeat: Vec3i,
    pub deconv: bool,
    /// Overrides [`NetworkConfig::fft`] for this group.
    pub fft: Option<bool>,
    pub init: FilterInit,
    /// Reuse the filters of another convolution group. Tied groups update inline.
    pub tie_to: Option<String>,
}

impl ConvOptions {
    pub fn new(size: Vec3i) -> Self {
        Self {
            size,
            stride: [1, 1, 1],
            repeat: [1, 1, 1],
            deconv: false,
            fft: None,
            init: FilterInit::default(),
            tie_to: None,
        }
    }

    pub fn with_stride(mut self, stride: Vec3i) -> Self {
        self.stride = stride;
        self
    }

    pub fn with_repeat(mut self, repeat: Vec3i) -> Self {
        self.repeat = repeat;
        self
    }

    pub fn deconv(mut self) -> Self {
        self.deconv = true;
        self
    }

    pub fn with_fft(mut self, fft: bool) -> Self {
        self.fft = Some(fft);
        self
    }

    pub fn with_init(mut self, init: FilterInit) -> Self {
        self.init = init;
        self
    }

    pub fn tie_to(mut self, group: impl Into<String>) -> Self {
        self.tie_to = Some(group.into());
        self
    }
}

struct NodeSpec {
    name: String,
    kind: NodeKind,
    count: usize,
    size: Option<Vec3i>,
}

enum EdgeKind {
    Conv(ConvOptions),
    MaxFilter { window: Vec3i, stride: Vec3i },
    Dummy,
}

struct EdgeSpec {
    name: String,
    from: String,
    to: String,
    kind: EdgeKind,
}

/// Sizes and strides of every node group, fixed at build time.
struct Geometry {
    sizes: Vec<Vec3i>,
    /// Spacing between neighbouring voxels of a group, in input voxels.
    strides: Vec<Vec3i>,
    /// Tap spacing each edge group runs with.
    dilations: Vec<Vec3i>,
    fovs: Vec<Vec3i>,
}

/// Describes a network group by group, then wires it up.
///
/// Only input groups carry a size; every other size follows from the edges.
///
/// Networks filter densely: a max filter keeps one output per input position instead of
/// subsampling, and its `stride` becomes the spacing of every group downstream. Convolutions and
/// max filters below it space their taps by that accumulated stride (times their own
/// [`ConvOptions::stride`]), so the output is what a subsampling network would compute at every
/// offset.
pub struct NetworkBuilder {
    config: NetworkConfig,
    nodes: Vec<NodeSpec>,
    edges: Vec<EdgeSpec>,
}

fn extent(kernel: Vec3i, stride: Vec3i) -> Vec3i {
    [
        (kernel[0] - 1) * stride[0] + 1,
        (kernel[1] - 1) * stride[1] + 1,
        (kernel[2] - 1) * stride[2] + 1,
    ]
}

fn times(a: Vec3i, b: Vec3i) -> Vec3i {
    [a[0] * b[0], a[1] * b[1], a[2] * b[2]]
}

// Distinct random streams for every filter of every group.
fn filter_stream(group: usize, index: usize) -> u64 {
    ((group as u64) << 32) | index as u64
}

fn shrink(name: &str, input: Vec3i, kernel: Vec3i, stride: Vec3i) -> Result<Vec3i> {
    let e = extent(kernel, stride);
    if (0..3).any(|d| input[d] < e[d]) {
        return Err(ZnnError::Topology(format!(
            "edge group '{name}': input of size {input:?} is smaller than the window extent {e:?}"
        )));
    }
    Ok([
        input[0] - e[0] + 1,
        input[1] - e[1] + 1,
        input[2] - e[2] + 1,
    ])
}

fn check_positive(name: &str, what: &str, v: Vec3i) -> Result<()> {
    if v.contains(&0) {
        return Err(ZnnError::Topology(format!(
            "'{name}': {what} must be positive, got {v:?}"
        )));
    }
    Ok(())
}

impl NetworkBuilder {
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            config,
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }

    fn node(mut self, name: &str, kind: NodeKind, count: usize, size: Option<Vec3i>) -> Self {
        self.nodes.push(NodeSpec {
            name: name.to_string(),
            kind,
            count,
            size,
        });
        self
    }

    fn edge(mut self, name: &str, from: &str, to: &str, kind: EdgeKind) -> Self {
        self.edges.push(EdgeSpec {
            name: name.to_string(),
            from: from.to_string(),
            to: to.to_string(),
            kind,
        });
        self
    }

    pub fn input(self, name: &str, count: usize, size: Vec3i) -> Self {
        self.node(name, NodeKind::Input, count, Some(size))
    }

    pub fn sum(self, name: &str, count: usize) -> Self {
        self.node(name, NodeKind::Sum, count, None)
    }

    pub fn transfer(self, name: &str, count: usize, function: TransferFn) -> Self {
        self.node(name, NodeKind::Transfer(function), count, None)
    }

    /// Fully connects `from` to `to` with one filter per channel pair.
    pub fn conv(self, name: &str, from: &str, to: &str, options: ConvOptions) -> Self {
        self.edge(name, from, to, EdgeKind::Conv(options))
    }

    /// Connects channel `i` of `from` to channel `i` of `to` through a max filter over `window`.
    /// `stride` is the pooling stride: it multiplies the stride of every group below.
    pub fn max_filter(
        self,
        name: &str,
        from: &str,
        to: &str,
        window: Vec3i,
        stride: Vec3i,
    ) -> Self {
        self.edge(name, from, to, EdgeKind::MaxFilter { window, stride })
    }

    /// Connects channel `i` of `from` to channel `i` of `to` unchanged.
    pub fn dummy(self, name: &str, from: &str, to: &str) -> Self {
        self.edge(name, from, to, EdgeKind::Dummy)
    }

    /// Validates the description, resolves every group's size and starts the scheduler.
    ///
    /// # Errors
    ///
    /// Returns `ZnnError::Topology` for inconsistent graphs (duplicate names, sizes or strides
    /// that do not agree, cycles, groups no input reaches), `ZnnError::UnknownNodes` and
    /// `ZnnError::UnknownEdges` for dangling references and `ZnnError::Config` for invalid
    /// settings.
    pub fn build(self) -> Result<Network> {
        self.config.validate()?;

        let mut node_index = HashMap::new();
        for (i, node) in self.nodes.iter().enumerate() {
            if node.count == 0 {
                return Err(ZnnError::Topology(format!(
                    "node group '{}' has no channels",
                    node.name
                )));
            }
            if node_index.insert(node.name.clone(), i).is_some() {
                return Err(ZnnError::Topology(format!(
                    "duplicate node group '{}'",
                    node.name
                )));
            }
        }
        let mut group_index = HashMap::new();
        for (i, edge) in self.edges.iter().enumerate() {
            if group_index.insert(edge.name.clone(), i).is_some() {
                return Err(ZnnError::Topology(format!(
                    "duplicate edge group '{}'",
                    edge.name
                )));
            }
        }

        let mut ends = Vec::with_capacity(self.edges.len());
        for edge in &self.edges {
            let from = *node_index
                .get(&edge.from)
                .ok_or_else(|| ZnnError::UnknownNodes(edge.from.clone()))?;
            let to = *node_index
                .get(&edge.to)
                .ok_or_else(|| ZnnError::UnknownNodes(edge.to.clone()))?;
            self.check_edge(edge, from, to)?;
            ends.push((from, to));
        }
        self.check_ties(&ends, &group_index)?;

        let order = self.topological_order(&ends)?;
        let geometry = self.resolve_geometry(&ends, &order)?;
        let shared = self.shared_groups();

        let tasks = Arc::new(TaskManager::new(self.config.threads)?);
        let (forward_tx, forward_rx) = unbounded();
        let (backward_tx, backward_rx) = unbounded();
        let nodes: Vec<Arc<Nodes>> = self
            .nodes
            .iter()
            .zip(&geometry.sizes)
            .enumerate()
            .map(|(id, (spec, &size))| {
                Arc::new(Nodes::new(
                    id,
                    spec.name.clone(),
                    spec.kind,
                    spec.count,
                    size,
                    forward_tx.clone(),
                    backward_tx.clone(),
                ))
            })
            .collect();

        // untied groups first so tied ones can borrow their filters
        let mut filters: Vec<Vec<SharedFilter>> = vec![Vec::new(); self.edges.len()];
        for tied in [false, true] {
            for (g, edge) in self.edges.iter().enumerate() {
                let EdgeKind::Conv(options) = &edge.kind else {
                    continue;
                };
                match (&options.tie_to, tied) {
                    (None, false) => {
                        let (from, to) = ends[g];
                        let pairs = self.nodes[from].count * self.nodes[to].count;
                        filters[g] = (0..pairs)
                            .map(|i| {
                                Filter::new(
                                    options.init.cube(options.size, filter_stream(g, i)),
                                    self.config.eta,
                                    self.config.momentum,
                                    self.config.weight_decay,
                                )
                                .shared()
                            })
                            .collect();
                    }
                    (Some(target), true) => {
                        filters[g] = filters[group_index[target]].clone();
                    }
                    _ => {}
                }
            }
        }

        let mut groups = Vec::with_capacity(self.edges.len());
        for (g, edge) in self.edges.iter().enumerate() {
            let (from, to) = ends[g];
            let input = &nodes[from];
            let output = &nodes[to];
            let dilation = geometry.dilations[g];
            let link = |i: usize, j: usize| Link {
                name: format!("{}[{i}->{j}]", edge.name),
                input: Arc::clone(input),
                input_channel: i,
                output: Arc::clone(output),
                output_channel: j,
                tasks: Arc::clone(&tasks),
                patch_size: self.config.patch_size,
            };

            let mut members = Vec::new();
            match &edge.kind {
                EdgeKind::Conv(options) => {
                    let fft = options.fft.unwrap_or(self.config.fft);
                    for i in 0..input.count() {
                        for j in 0..output.count() {
                            let filter = Arc::clone(&filters[g][i * output.count() + j]);
                            members.push(if fft {
                                EdgeRef::Frequency(FftFilterEdge::new(link(i, j), filter, dilation))
                            } else {
                                EdgeRef::Spatial(FilterEdge::new(
                                    link(i, j),
                                    filter,
                                    FilterEdgeOptions {
                                        stride: dilation,
                                        repeat: options.repeat,
                                        deconv: options.deconv,
                                        shared: shared[g],
                                    },
                                ))
                            });
                        }
                    }
                }
                EdgeKind::MaxFilter { window, .. } => {
                    for i in 0..input.count() {
                        members.push(EdgeRef::Spatial(MaxFilterEdge::new(
                            link(i, i),
                            *window,
                            dilation,
                        )));
                    }
                }
                EdgeKind::Dummy => {
                    for i in 0..input.count() {
                        members.push(EdgeRef::Spatial(DummyEdge::new(link(i, i))));
                    }
                }
            }
            debug!(
                group = %edge.name,
                edges = members.len(),
                dilation = ?dilation,
                "edge group built"
            );
            groups.push(EdgeGroup {
                name: edge.name.clone(),
                edges: members,
                filters: std::mem::take(&mut filters[g]),
            });
        }

        info!(
            nodes = nodes.len(),
            edge_groups = groups.len(),
            threads = tasks.threads(),
            "network built"
        );

        Ok(Network {
            config: self.config,
            tasks,
            nodes,
            strides: geometry.strides,
            fovs: geometry.fovs,
            node_index,
            groups,
            group_index,
            forward_rx,
            backward_rx,
        })
    }

    fn check_edge(&self, edge: &EdgeSpec, from: usize, to: usize) -> Result<()> {
        let name = &edge.name;
        if from == to {
            return Err(ZnnError::Topology(format!(
                "edge group '{name}' connects '{}' to itself",
                edge.from
            )));
        }
        if self.nodes[to].kind == NodeKind::Input {
            return Err(ZnnError::Topology(format!(
                "edge group '{name}' feeds input group '{}'",
                edge.to
            )));
        }

        match &edge.kind {
            EdgeKind::Conv(options) => {
                check_positive(name, "filter size", options.size)?;
                check_positive(name, "stride", options.stride)?;
                check_positive(name, "repeat", options.repeat)?;
                if (0..3).any(|d| options.size[d] % options.repeat[d] != 0) {
                    return Err(ZnnError::Topology(format!(
                        "edge group '{name}': repeat {:?} does not divide filter size {:?}",
                        options.repeat, options.size
                    )));
                }
                if let FilterInit::Uniform { low, high, .. } = options.init {
                    if low.is_nan() || high.is_nan() || low > high {
                        return Err(ZnnError::Config(format!(
                            "edge group '{name}': uniform init needs low <= high"
                        )));
                    }
                }

                let fft = options.fft.unwrap_or(self.config.fft);
                if fft && options.deconv {
                    return Err(ZnnError::Config(format!(
                        "edge group '{name}': deconvolution has no frequency-domain form"
                    )));
                }
                if fft && options.repeat != [1, 1, 1] {
                    return Err(ZnnError::Config(format!(
                        "edge group '{name}': repeat patterns need a spatial edge"
                    )));
                }
                if fft && options.tie_to.is_some() {
                    return Err(ZnnError::Config(format!(
                        "edge group '{name}': tied filters need a spatial edge"
                    )));
                }
            }
            EdgeKind::MaxFilter { window, stride } => {
                check_positive(name, "window", *window)?;
                check_positive(name, "stride", *stride)?;
                self.check_one_to_one(edge, from, to)?;
            }
            EdgeKind::Dummy => self.check_one_to_one(edge, from, to)?,
        }
        Ok(())
    }

    fn check_ties(
        &self,
        ends: &[(usize, usize)],
        group_index: &HashMap<String, usize>,
    ) -> Result<()> {
        let pairs = |g: usize| {
            let (from, to) = ends[g];
            self.nodes[from].count * self.nodes[to].count
        };
        for (g, edge) in self.edges.iter().enumerate() {
            let name = &edge.name;
            let EdgeKind::Conv(ConvOptions {
                tie_to: Some(target),
                size,
                ..
            }) = &edge.kind
            else {
                continue;
            };

            let t = *group_index
                .get(target)
                .ok_or_else(|| ZnnError::UnknownEdges(target.clone()))?;
            let EdgeKind::Conv(theirs) = &self.edges[t].kind else {
                return Err(ZnnError::Topology(format!(
                    "edge group '{name}' is tied to '{target}', which has no filters"
                )));
            };
            if theirs.tie_to.is_some() || t == g {
                return Err(ZnnError::Topology(format!(
                    "edge group '{name}' must be tied to an untied group, not '{target}'"
                )));
            }
            if theirs.fft.unwrap_or(self.config.fft) {
                return Err(ZnnError::Config(format!(
                    "edge group '{name}': tied filters need a spatial edge"
                )));
            }
            if theirs.size != *size || pairs(t) != pairs(g) {
                return Err(ZnnError::Topology(format!(
                    "edge group '{name}' does not match the filters of '{target}'"
                )));
            }
        }
        Ok(())
    }

    fn check_one_to_one(&self, edge: &EdgeSpec, from: usize, to: usize) -> Result<()> {
        let (a, b) = (self.nodes[from].count, self.nodes[to].count);
        if a != b {
            return Err(ZnnError::Topology(format!(
                "edge group '{}' pairs channels one to one, but '{}' has {a} and '{}' has {b}",
                edge.name, edge.from, edge.to
            )));
        }
        Ok(())
    }

    fn out_size(edge: &EdgeSpec, input: Vec3i, dilation: Vec3i) -> Result<Vec3i> {
        match &edge.kind {
            EdgeKind::Conv(options) if options.deconv => {
                let e = extent(options.size, dilation);
                Ok([
                    input[0] + e[0] - 1,
                    input[1] + e[1] - 1,
                    input[2] + e[2] - 1,
                ])
            }
            EdgeKind::Conv(options) => shrink(&edge.name, input, options.size, dilation),
            EdgeKind::MaxFilter { window, .. } => shrink(&edge.name, input, *window, dilation),
            EdgeKind::Dummy => Ok(input),
        }
    }

    // Input extent behind one voxel of `to`, seen from the input side of `edge`.
    fn grow_fov(edge: &EdgeSpec, fov: Vec3i, dilation: Vec3i) -> Vec3i {
        let window = match &edge.kind {
            EdgeKind::Conv(options) => options.size,
            EdgeKind::MaxFilter { window, .. } => *window,
            EdgeKind::Dummy => return fov,
        };
        let e = extent(window, dilation);
        match &edge.kind {
            EdgeKind::Conv(options) if options.deconv => {
                [0, 1, 2].map(|d| fov[d].saturating_sub(e[d] - 1).max(1))
            }
            _ => [0, 1, 2].map(|d| fov[d] + e[d] - 1),
        }
    }

    // Kahn's algorithm from the input groups.
    fn topological_order(&self, ends: &[(usize, usize)]) -> Result<Vec<usize>> {
        let mut indegree = vec![0usize; self.nodes.len()];
        for &(_, to) in ends {
            indegree[to] += 1;
        }

        if !self.nodes.iter().any(|n| n.kind == NodeKind::Input) {
            return Err(ZnnError::Topology("network has no input group".into()));
        }
        for (i, node) in self.nodes.iter().enumerate() {
            if node.kind != NodeKind::Input && indegree[i] == 0 {
                return Err(ZnnError::Topology(format!(
                    "node group '{}' has no incoming edges",
                    node.name
                )));
            }
            if let Some(size) = node.size {
                check_positive(&node.name, "size", size)?;
            }
        }

        let mut ready: VecDeque<usize> =
            (0..self.nodes.len()).filter(|&i| indegree[i] == 0).collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(node) = ready.pop_front() {
            order.push(node);
            for &(from, to) in ends {
                if from != node {
                    continue;
                }
                indegree[to] -= 1;
                if indegree[to] == 0 {
                    ready.push_back(to);
                }
            }
        }

        if order.len() != self.nodes.len() {
            return Err(ZnnError::Topology("network contains a cycle".into()));
        }
        Ok(order)
    }

    // Fixes sizes and strides walking down from the inputs, then fields of view walking up from
    // the outputs.
    fn resolve_geometry(&self, ends: &[(usize, usize)], order: &[usize]) -> Result<Geometry> {
        let mut sizes: Vec<Option<Vec3i>> = self.nodes.iter().map(|n| n.size).collect();
        let mut strides: Vec<Option<Vec3i>> = self
            .nodes
            .iter()
            .map(|n| (n.kind == NodeKind::Input).then_some([1, 1, 1]))
            .collect();
        let mut dilations = vec![[1, 1, 1]; self.edges.len()];

        for &node in order {
            let (Some(size), Some(stride)) = (sizes[node], strides[node]) else {
                return Err(ZnnError::Topology(format!(
                    "node group '{}' has no size",
                    self.nodes[node].name
                )));
            };
            for (g, (edge, &(from, to))) in self.edges.iter().zip(ends).enumerate() {
                if from != node {
                    continue;
                }
                let (dilation, out_stride) = match &edge.kind {
                    EdgeKind::Conv(options) => (times(options.stride, stride), stride),
                    EdgeKind::MaxFilter { stride: pool, .. } => (stride, times(stride, *pool)),
                    EdgeKind::Dummy => (stride, stride),
                };
                dilations[g] = dilation;

                let out = Self::out_size(edge, size, dilation)?;
                let target = &self.nodes[to].name;
                match sizes[to] {
                    Some(existing) if existing != out => {
                        return Err(ZnnError::Topology(format!(
                            "node group '{target}' receives size {out:?} from '{}' but \
                             {existing:?} elsewhere",
                            edge.name
                        )));
                    }
                    _ => sizes[to] = Some(out),
                }
                match strides[to] {
                    Some(existing) if existing != out_stride => {
                        return Err(ZnnError::Topology(format!(
                            "node group '{target}' receives stride {out_stride:?} from '{}' but \
                             {existing:?} elsewhere",
                            edge.name
                        )));
                    }
                    _ => strides[to] = Some(out_stride),
                }
            }
        }

        let mut fovs = vec![[1, 1, 1]; self.nodes.len()];
        for &node in order.iter().rev() {
            for (g, (edge, &(from, to))) in self.edges.iter().zip(ends).enumerate() {
                if from != node {
                    continue;
                }
                let grown = Self::grow_fov(edge, fovs[to], dilations[g]);
                fovs[node] = [0, 1, 2].map(|d| fovs[node][d].max(grown[d]));
            }
        }

        Ok(Geometry {
            sizes: sizes.into_iter().flatten().collect(),
            strides: strides.into_iter().flatten().collect(),
            dilations,
            fovs,
        })
    }

    // A group's edges update inline when its filters are reachable from another group.
    fn shared_groups(&self) -> Vec<bool> {
        let mut shared = vec![false; self.edges.len()];
        for (g, edge) in self.edges.iter().enumerate() {
            if let EdgeKind::Conv(ConvOptions {
                tie_to: Some(target),
                ..
            }) = &edge.kind
            {
                shared[g] = true;
                if let Some(t) = self.edges.iter().position(|e| e.name == *target) {
                    shared[t] = true;
                }
            }
        }
        shared
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> NetworkConfig {
        NetworkConfig::default().with_threads(1)
    }

    #[test]
    fn test_pooling_strides_compound_downstream() {
        let net = NetworkBuilder::new(config())
            .input("input", 1, [12, 12, 1])
            .sum("p1", 1)
            .sum("p2", 1)
            .sum("out", 1)
            .max_filter("pool1", "input", "p1", [2, 2, 1], [2, 2, 1])
            .max_filter("pool2", "p1", "p2", [2, 2, 1], [2, 2, 1])
            .conv("conv", "p2", "out", ConvOptions::new([2, 2, 1]))
            .build()
            .unwrap();

        assert_eq!(net.node_stride("input").unwrap(), [1, 1, 1]);
        assert_eq!(net.node_stride("p1").unwrap(), [2, 2, 1]);
        assert_eq!(net.node_stride("p2").unwrap(), [4, 4, 1]);
        assert_eq!(net.node_stride("out").unwrap(), [4, 4, 1]);

        // pool2 taps 2 apart, conv taps 4 apart
        assert_eq!(net.node_size("p1").unwrap(), [11, 11, 1]);
        assert_eq!(net.node_size("p2").unwrap(), [9, 9, 1]);
        assert_eq!(net.node_size("out").unwrap(), [5, 5, 1]);

        assert_eq!(net.node_fov("out").unwrap(), [1, 1, 1]);
        assert_eq!(net.node_fov("p2").unwrap(), [5, 5, 1]);
        assert_eq!(net.node_fov("p1").unwrap(), [7, 7, 1]);
        assert_eq!(net.fov(), [8, 8, 1]);
        assert_eq!(net.input_size_for([5, 5, 1]), [12, 12, 1]);
    }

    #[test]
    fn test_disagreeing_strides_are_rejected() {
        let err = NetworkBuilder::new(config())
            .input("input", 1, [6, 6, 1])
            .sum("pooled", 1)
            .sum("merge", 1)
            .max_filter("pool", "input", "pooled", [1, 1, 1], [2, 2, 1])
            .dummy("coarse", "pooled", "merge")
            .dummy("fine", "input", "merge")
            .build();
        match err {
            Err(ZnnError::Topology(msg)) => assert!(msg.contains("stride"), "{msg}"),
            other => panic!("expected a stride mismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_deconv_shrinks_field_of_view() {
        let net = NetworkBuilder::new(config())
            .input("input", 1, [3, 3, 1])
            .sum("up", 1)
            .sum("out", 1)
            .conv("grow", "input", "up", ConvOptions::new([3, 3, 1]).deconv())
            .conv("shrink", "up", "out", ConvOptions::new([2, 2, 1]))
            .build()
            .unwrap();
        assert_eq!(net.node_size("out").unwrap(), [4, 4, 1]);
        assert_eq!(net.node_fov("up").unwrap(), [2, 2, 1]);
        assert_eq!(net.fov(), [1, 1, 1]);
    }

    #[test]
    fn test_default_init_differs_across_groups() {
        let net = NetworkBuilder::new(config())
            .input("input", 1, [3, 3, 1])
            .sum("left", 2)
            .sum("right", 2)
            .conv("a", "input", "left", ConvOptions::new([2, 2, 1]))
            .conv("b", "input", "right", ConvOptions::new([2, 2, 1]))
            .build()
            .unwrap();

        let a = net.filters("a").unwrap();
        let b = net.filters("b").unwrap();
        assert_ne!(a[0], a[1]);
        assert_ne!(a[0], b[0]);
        assert_ne!(a[1], b[1]);
    }

    #[test]
    fn test_filter_streams_are_distinct() {
        assert_ne!(filter_stream(0, 1), filter_stream(1, 0));
        assert_eq!(filter_stream(0, 3), 3);
    }
}
