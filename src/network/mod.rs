//! The execution engine: node groups, edges and the network that drives them.
//!
//! A [`Network`] is built with a [`NetworkBuilder`]. Forward and backward traversals start on the
//! calling thread; filter edges push their convolutions and weight updates onto the network's
//! [`TaskManager`] as continuations of their own pending task, so a traversal overlaps the
//! updates left over from the previous one.
//!
//! ```rust
//! use std::collections::{HashMap, HashSet};
//! use znn_rs::network::{ConvOptions, FilterInit, NetworkBuilder, NetworkConfig};
//! use znn_rs::tensor::Cube;
//!
//! let mut net = NetworkBuilder::new(NetworkConfig::default().with_threads(2))
//!     .input("input", 1, [5, 5, 1])
//!     .sum("output", 1)
//!     .conv(
//!         "conv",
//!         "input",
//!         "output",
//!         ConvOptions::new([3, 3, 1]).with_init(FilterInit::Constant(1.0)),
//!     )
//!     .build()
//!     .unwrap();
//!
//! let out = net
//!     .forward(HashMap::from([("input".to_string(), vec![Cube::ones([5, 5, 1])])]))
//!     .unwrap();
//! assert_eq!(out["output"][0].data(), &[9.0; 9]);
//! ```

pub mod builder;
pub mod config;
pub mod edge;
pub mod filter;
pub mod nodes;
pub mod task;
pub mod transfer;

pub use builder::{ConvOptions, NetworkBuilder};
pub use config::NetworkConfig;
pub use edge::{Edge, EdgeBase, EdgeOwner, EdgeRef, ZapTally};
pub use filter::{Filter, FilterInit, SharedFilter};
pub use nodes::{NodeKind, Nodes};
pub use task::{TaskHandle, TaskManager};
pub use transfer::TransferFn;

use crate::error::{Result, ZnnError};
use crate::tensor::{Cube, Real, Vec3i};
use crossbeam::channel::Receiver;
use nodes::Delivery;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

/// Unwraps the result of a computation whose arguments were validated up front.
pub(crate) fn fatal<T, E: std::fmt::Display>(
    result: std::result::Result<T, E>,
    context: &str,
) -> T {
    match result {
        Ok(value) => value,
        Err(e) => panic!("{context}: {e}"),
    }
}

/// Volumes per node group, one per channel.
pub type Volumes = HashMap<String, Vec<Cube>>;

pub(crate) struct EdgeGroup {
    pub(crate) name: String,
    pub(crate) edges: Vec<EdgeRef>,
    pub(crate) filters: Vec<SharedFilter>,
}

/// A built network.
pub struct Network {
    pub(crate) config: NetworkConfig,
    pub(crate) tasks: Arc<TaskManager>,
    pub(crate) nodes: Vec<Arc<Nodes>>,
    pub(crate) strides: Vec<Vec3i>,
    pub(crate) fovs: Vec<Vec3i>,
    pub(crate) node_index: HashMap<String, usize>,
    pub(crate) groups: Vec<EdgeGroup>,
    pub(crate) group_index: HashMap<String, usize>,
    pub(crate) forward_rx: Receiver<Delivery>,
    pub(crate) backward_rx: Receiver<Delivery>,
}

fn into_cube(value: Arc<Cube>) -> Cube {
    Arc::try_unwrap(value).unwrap_or_else(|shared| (*shared).clone())
}

impl Network {
    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    fn node_group(&self, name: &str) -> Result<&Arc<Nodes>> {
        self.node_index
            .get(name)
            .map(|&i| &self.nodes[i])
            .ok_or_else(|| ZnnError::UnknownNodes(name.to_string()))
    }

    fn group(&self, name: &str) -> Result<&EdgeGroup> {
        self.group_index
            .get(name)
            .map(|&i| &self.groups[i])
            .ok_or_else(|| ZnnError::UnknownEdges(name.to_string()))
    }

    fn edges(&self) -> impl Iterator<Item = &EdgeRef> {
        self.groups.iter().flat_map(|g| g.edges.iter())
    }

    pub fn node_size(&self, name: &str) -> Result<Vec3i> {
        Ok(self.node_group(name)?.fsize())
    }

    pub fn node_count(&self, name: &str) -> Result<usize> {
        Ok(self.node_group(name)?.count())
    }

    /// Spacing of a group's voxels in input voxels: the product of the pooling strides above it.
    pub fn node_stride(&self, name: &str) -> Result<Vec3i> {
        Ok(self.strides[self.node_group(name)?.id()])
    }

    /// Extent of a group's volume that one output voxel depends on.
    pub fn node_fov(&self, name: &str) -> Result<Vec3i> {
        Ok(self.fovs[self.node_group(name)?.id()])
    }

    /// Field of view of the network: the largest input extent behind one output voxel.
    pub fn fov(&self) -> Vec3i {
        self.input_nodes()
            .map(|n| self.fovs[n.id()])
            .fold([1, 1, 1], |a, b| [0, 1, 2].map(|d| a[d].max(b[d])))
    }

    /// Input size that yields an output of size `output` through a field of view of
    /// [`Network::fov`].
    pub fn input_size_for(&self, output: Vec3i) -> Vec3i {
        let fov = self.fov();
        [0, 1, 2].map(|d| fov[d] + output[d] - 1)
    }

    pub fn edge_count(&self) -> usize {
        self.edges().count()
    }

    fn input_nodes(&self) -> impl Iterator<Item = &Arc<Nodes>> {
        self.nodes.iter().filter(|n| n.kind() == NodeKind::Input)
    }

    fn output_nodes(&self) -> impl Iterator<Item = &Arc<Nodes>> {
        self.nodes.iter().filter(|n| !n.has_out_edges(0))
    }

    /// Names of the groups [`Network::forward`] returns.
    pub fn outputs(&self) -> Vec<String> {
        self.output_nodes().map(|n| n.name().to_string()).collect()
    }

    // Checks that `volumes` has exactly one entry per group of `expected`, with the right shape.
    fn check_volumes<'a>(
        &self,
        mut volumes: Volumes,
        expected: impl Iterator<Item = &'a Arc<Nodes>>,
        role: &str,
    ) -> Result<Vec<(Arc<Nodes>, Vec<Cube>)>> {
        let expected: Vec<&Arc<Nodes>> = expected.collect();
        for name in volumes.keys() {
            let nodes = self.node_group(name)?;
            if !expected.iter().any(|n| n.id() == nodes.id()) {
                return Err(ZnnError::Topology(format!(
                    "node group '{name}' is not an {role} group"
                )));
            }
        }

        let mut checked = Vec::with_capacity(expected.len());
        for nodes in expected {
            let cubes = volumes.remove(nodes.name()).unwrap_or_default();
            if cubes.len() != nodes.count() {
                return Err(ZnnError::ChannelCount {
                    name: nodes.name().to_string(),
                    expected: nodes.count(),
                    got: cubes.len(),
                });
            }
            if let Some(bad) = cubes.iter().find(|c| *c.shape() != nodes.fsize()) {
                return Err(ZnnError::VolumeSize {
                    name: nodes.name().to_string(),
                    expected: nodes.fsize(),
                    got: *bad.shape(),
                });
            }
            checked.push((Arc::clone(nodes), cubes));
        }
        Ok(checked)
    }

    /// Runs one forward pass and returns the value of every output group.
    ///
    /// # Errors
    ///
    /// Fails if an input group is missing, has the wrong channel count or volume size, or if
    /// disabled edges left a group with nothing to wait for.
    pub fn forward(&mut self, inputs: Volumes) -> Result<Volumes> {
        let feeds = self.check_volumes(inputs, self.input_nodes(), "input")?;
        for nodes in &self.nodes {
            if nodes.kind() == NodeKind::Input {
                continue;
            }
            if let Some(channel) = (0..nodes.count()).find(|&c| nodes.forward_required(c) == 0) {
                return Err(ZnnError::Topology(format!(
                    "node group '{}' channel {channel} has no enabled incoming edges",
                    nodes.name()
                )));
            }
        }

        let expected: usize = self.output_nodes().map(|n| n.count()).sum();
        debug!(inputs = feeds.len(), expected, "forward pass");

        self.tasks.install(|| {
            for (nodes, cubes) in feeds {
                for (channel, cube) in cubes.into_iter().enumerate() {
                    nodes.forward_input(channel, cube);
                }
            }
        });

        let mut outputs: HashMap<usize, Vec<Option<Cube>>> = HashMap::new();
        for _ in 0..expected {
            let delivery = self
                .forward_rx
                .recv()
                .map_err(|_| ZnnError::Topology("forward sink disconnected".into()))?;
            let count = self.nodes[delivery.node].count();
            outputs.entry(delivery.node).or_insert_with(|| vec![None; count])[delivery.channel] =
                Some(into_cube(delivery.value));
        }

        Ok(outputs
            .into_iter()
            .map(|(id, cubes)| {
                (
                    self.nodes[id].name().to_string(),
                    cubes.into_iter().flatten().collect(),
                )
            })
            .collect())
    }

    /// Runs one backward pass from gradients at the output groups and returns the gradients that
    /// reach the input groups. Channels cut off by disabled edges come back as zeros.
    ///
    /// Weight updates are left running in the background; the next traversal, [`Network::drain`]
    /// or [`Network::filters`] waits for them.
    ///
    /// Every backward must follow its own forward. A second backward without a forward in
    /// between reads frequency-domain filters that an update from the first may still be
    /// rewriting.
    ///
    /// # Panics
    ///
    /// Panics if no forward pass has run yet.
    pub fn backward(&mut self, gradients: Volumes) -> Result<Volumes> {
        let feeds = self.check_volumes(gradients, self.output_nodes(), "output")?;
        debug!(outputs = feeds.len(), "backward pass");

        self.tasks.install(|| {
            for (nodes, cubes) in feeds {
                for (channel, cube) in cubes.into_iter().enumerate() {
                    nodes.backward_input(channel, cube);
                }
            }
        });

        let mut result: Volumes = self
            .input_nodes()
            .map(|n| (n.name().to_string(), vec![Cube::zeros(n.fsize()); n.count()]))
            .collect();
        for delivery in self.backward_rx.try_iter() {
            let nodes = &self.nodes[delivery.node];
            if let Some(cubes) = result.get_mut(nodes.name()) {
                cubes[delivery.channel] = into_cube(delivery.value);
            }
        }
        Ok(result)
    }

    /// Switches every edge of a group on or off. Must be called between traversals.
    ///
    /// A channel left without an enabled path to an output group no longer fires backward, so the
    /// edges feeding it stop carrying gradients too.
    pub fn set_enabled(&mut self, group: &str, enabled: bool) -> Result<()> {
        for edge in &self.group(group)?.edges {
            edge.set_enabled(enabled);
        }
        self.route_gradients();
        debug!(group, enabled, "edge group toggled");
        Ok(())
    }

    // Marks the channels a backward pass reaches: sinks, plus the inputs of enabled edges into
    // reached channels. Only edges into reached channels are waited for upstream.
    fn route_gradients(&self) {
        let mut reached: HashSet<(usize, usize)> = HashSet::new();
        for nodes in &self.nodes {
            for channel in 0..nodes.count() {
                if !nodes.has_out_edges(channel) {
                    reached.insert((nodes.id(), channel));
                }
            }
        }

        let enabled: Vec<&EdgeBase> = self
            .edges()
            .map(EdgeRef::base)
            .filter(|b| b.is_enabled())
            .collect();
        loop {
            let before = reached.len();
            for base in &enabled {
                if reached.contains(&(base.output.nodes.id(), base.output.channel)) {
                    reached.insert((base.input.nodes.id(), base.input.channel));
                }
            }
            if reached.len() == before {
                break;
            }
        }

        let mut cut = 0;
        for edge in self.edges() {
            let base = edge.base();
            let upstream = base.is_enabled()
                && reached.contains(&(base.output.nodes.id(), base.output.channel));
            if base.is_enabled() && !upstream {
                cut += 1;
            }
            base.set_upstream(upstream);
        }
        debug!(reached = reached.len(), cut, "gradient paths routed");
    }

    pub fn set_eta(&mut self, eta: Real) -> Result<()> {
        let config = self.config.clone().with_eta(eta);
        config.validate()?;
        self.drain();
        for group in &self.groups {
            for filter in &group.filters {
                filter.lock().set_eta(eta);
            }
        }
        self.config = config;
        Ok(())
    }

    pub fn set_momentum(&mut self, momentum: Real) -> Result<()> {
        let config = self.config.clone().with_momentum(momentum);
        config.validate()?;
        self.drain();
        for group in &self.groups {
            for filter in &group.filters {
                filter.lock().set_momentum(momentum);
            }
        }
        self.config = config;
        Ok(())
    }

    /// Current weights of a convolution group, ordered
    /// `input channel * output count + output channel`. Waits for the group's pending updates
    /// first.
    pub fn filters(&self, group: &str) -> Result<Vec<Cube>> {
        let group = self.group(group)?;
        for edge in &group.edges {
            edge.drain();
        }
        Ok(group
            .filters
            .iter()
            .map(|f| f.lock().weights().clone())
            .collect())
    }

    /// Blocks until no edge has background work outstanding.
    pub fn drain(&self) {
        for edge in self.edges() {
            edge.drain();
        }
    }

    /// Zaps every edge and returns how many notifications arrived.
    pub fn zap(&mut self) -> usize {
        let tally = ZapTally::default();
        for edge in self.edges() {
            edge.zap(&tally);
        }
        info!(edges = tally.count(), "network zapped");
        tally.count()
    }
}

impl Drop for Network {
    fn drop(&mut self) {
        self.zap();
    }
}

impl std::fmt::Debug for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Network")
            .field("nodes", &self.nodes)
            .field("fov", &self.fov())
            .field("edge_groups", &self.groups.iter().map(|g| &g.name).collect::<Vec<_>>())
            .field("tasks", &self.tasks)
            .finish()
    }
}
