use super::{Edge, EdgeBase, Link};
use crate::network::fatal;
use crate::network::filter::SharedFilter;
use crate::network::task::PendingTask;
use crate::tensor::{Cube, Vec3i};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::trace;

/// Variant settings of a [`FilterEdge`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FilterEdgeOptions {
    /// Distance between filter taps.
    pub stride: Vec3i,
    /// Block pattern the weights are averaged over after every update.
    pub repeat: Vec3i,
    /// Runs the filter transposed: forward grows the volume, backward shrinks it.
    pub deconv: bool,
    /// The filter is tied to other edges and is updated inline during backward.
    pub shared: bool,
}

impl Default for FilterEdgeOptions {
    fn default() -> Self {
        Self {
            stride: [1, 1, 1],
            repeat: [1, 1, 1],
            deconv: false,
            shared: false,
        }
    }
}

/// Sparse convolution in the spatial domain.
pub struct FilterEdge {
    base: EdgeBase,
    options: FilterEdgeOptions,
    filter: SharedFilter,
    last_input: Mutex<Option<Arc<Cube>>>,
    pending: PendingTask,
}

impl FilterEdge {
    pub fn new(link: Link, filter: SharedFilter, options: FilterEdgeOptions) -> Arc<Self> {
        fatal(
            filter.lock().weights_mut().flatten(options.repeat),
            "repeat pattern does not divide the filter",
        );

        Arc::new_cyclic(|weak: &Weak<FilterEdge>| {
            let edge: Weak<dyn Edge<Cube>> = weak.clone();
            Self {
                base: link.attach_spatial(edge),
                options,
                filter,
                last_input: Mutex::new(None),
                pending: PendingTask::idle(),
            }
        })
    }

    pub fn filter(&self) -> &SharedFilter {
        &self.filter
    }

    fn weights(&self) -> Cube {
        self.filter.lock().weights().clone()
    }

    fn convolve_forward(&self, input: &Cube, weights: &Cube) -> Cube {
        let stride = self.options.stride;
        let out = if self.options.deconv {
            input.convolve_sparse_inverse(weights, stride)
        } else {
            input.convolve_sparse(weights, stride)
        };
        fatal(out, "forward convolution")
    }

    fn convolve_backward(&self, gradient: &Cube, weights: &Cube) -> Cube {
        let stride = self.options.stride;
        let out = if self.options.deconv {
            gradient.convolve_sparse(weights, stride)
        } else {
            gradient.convolve_sparse_inverse(weights, stride)
        };
        fatal(out, "backward convolution")
    }

    fn do_forward(&self, input: Arc<Cube>) {
        let out = self.convolve_forward(&input, &self.weights());
        *self.last_input.lock() = Some(input);
        self.base.deliver_forward(out);
    }

    fn do_update(&self, gradient: &Cube, last_input: &Cube) {
        let stride = self.options.stride;
        let dedw = if self.options.deconv {
            gradient.convolve_sparse_flipped(last_input, stride)
        } else {
            last_input.convolve_sparse_flipped(gradient, stride)
        };
        let dedw = fatal(dedw, "weight gradient");

        let mut filter = self.filter.lock();
        fatal(filter.update(&dedw, self.base.patch_size), "filter update");
        fatal(
            filter.weights_mut().flatten(self.options.repeat),
            "repeat pattern does not divide the filter",
        );
        trace!(edge = self.base.name(), "filter updated");
    }
}

impl Edge<Cube> for FilterEdge {
    fn base(&self) -> &EdgeBase {
        &self.base
    }

    fn forward(self: Arc<Self>, value: Arc<Cube>) {
        if !self.is_enabled() {
            return;
        }
        let edge = Arc::clone(&self);
        self.pending
            .then(&self.base.tasks, move || edge.do_forward(value));
    }

    fn backward(self: Arc<Self>, gradient: Arc<Cube>) {
        if !self.is_enabled() {
            return;
        }
        let last_input = match self.last_input.lock().clone() {
            Some(input) => input,
            None => panic!(
                "edge '{}': backward requires last_input from a previous forward",
                self.name()
            ),
        };

        self.base
            .deliver_backward(self.convolve_backward(&gradient, &self.weights()));

        if self.options.shared {
            self.do_update(&gradient, &last_input);
        } else {
            let edge = Arc::clone(&self);
            self.pending.then(&self.base.tasks, move || {
                edge.do_update(&gradient, &last_input)
            });
        }
    }

    fn drain(&self) {
        self.pending.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::edge::ZapTally;
    use crate::network::filter::Filter;
    use crate::network::nodes::{Delivery, NodeKind, Nodes};
    use crate::network::task::TaskManager;
    use crossbeam::channel::{unbounded, Receiver};

    struct Fixture {
        edge: Arc<FilterEdge>,
        outputs: Receiver<Delivery>,
        gradients: Receiver<Delivery>,
        tasks: Arc<TaskManager>,
        input: Arc<Nodes>,
    }

    fn fixture(size: Vec3i, out_size: Vec3i, weights: Cube, options: FilterEdgeOptions) -> Fixture {
        let tasks = Arc::new(TaskManager::new(Some(2)).unwrap());
        let (fwd_tx, outputs) = unbounded();
        let (bwd_tx, gradients) = unbounded();
        let input = Arc::new(Nodes::new(
            0,
            "in",
            NodeKind::Input,
            1,
            size,
            fwd_tx.clone(),
            bwd_tx.clone(),
        ));
        let output = Arc::new(Nodes::new(1, "out", NodeKind::Sum, 1, out_size, fwd_tx, bwd_tx));
        let link = Link {
            name: "conv".into(),
            input: Arc::clone(&input),
            input_channel: 0,
            output,
            output_channel: 0,
            tasks: Arc::clone(&tasks),
            patch_size: 0.0,
        };
        let edge = FilterEdge::new(link, Filter::new(weights, 0.1, 0.0, 0.0).shared(), options);
        Fixture {
            edge,
            outputs,
            gradients,
            tasks,
            input,
        }
    }

    #[test]
    fn test_forward_convolves() {
        let f = fixture([4, 4, 1], [3, 3, 1], Cube::ones([2, 2, 1]), FilterEdgeOptions::default());
        let input = Arc::clone(&f.input);
        f.tasks.install(|| input.forward_input(0, Cube::ones([4, 4, 1])));
        let out = f.outputs.recv().unwrap();
        assert_eq!(out.node, 1);
        assert_eq!(out.value.data(), &[4.0; 9]);
    }

    #[test]
    #[should_panic(expected = "last_input")]
    fn test_backward_before_forward_panics() {
        let f = fixture([4, 4, 1], [3, 3, 1], Cube::ones([2, 2, 1]), FilterEdgeOptions::default());
        Arc::clone(&f.edge).backward(Arc::new(Cube::ones([3, 3, 1])));
    }

    #[test]
    fn test_backward_and_update() {
        let f = fixture([3, 3, 1], [3, 3, 1], Cube::ones([1, 1, 1]), FilterEdgeOptions::default());
        let input = Arc::clone(&f.input);
        f.tasks.install(|| input.forward_input(0, Cube::ones([3, 3, 1])));
        f.outputs.recv().unwrap();

        Arc::clone(&f.edge).backward(Arc::new(Cube::ones([3, 3, 1])));
        let grad = f.gradients.recv().unwrap();
        assert_eq!(grad.value.data(), &[1.0; 9]);

        f.edge.drain();
        // w = 1 - 0.1 * 9
        let w = f.edge.filter().lock().weights().data()[0];
        assert!((w - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_deconv_grows_output() {
        let options = FilterEdgeOptions {
            stride: [2, 2, 1],
            deconv: true,
            ..FilterEdgeOptions::default()
        };
        let f = fixture([3, 3, 1], [7, 7, 1], Cube::ones([3, 3, 1]), options);
        let input = Arc::clone(&f.input);
        f.tasks.install(|| input.forward_input(0, Cube::ones([3, 3, 1])));
        let out = f.outputs.recv().unwrap();
        assert_eq!(out.value.shape(), &[7, 7, 1]);
        assert_eq!(out.value.sum(), 81.0);
    }

    #[test]
    fn test_zap_notifies_once() {
        let f = fixture([4, 4, 1], [3, 3, 1], Cube::ones([2, 2, 1]), FilterEdgeOptions::default());
        let input = Arc::clone(&f.input);
        f.tasks.install(|| input.forward_input(0, Cube::ones([4, 4, 1])));
        f.outputs.recv().unwrap();

        let tally = ZapTally::default();
        f.edge.zap(&tally);
        assert_eq!(tally.count(), 1);
        assert!(f.edge.pending.is_idle());
    }
}
