use super::{Edge, EdgeBase, Link};
use crate::network::fatal;
use crate::network::task::PendingTask;
use crate::tensor::{Cube, Vec3i};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

struct Routing {
    winners: Vec<usize>,
    input_shape: Vec3i,
}

/// Sliding-window max pooling without subsampling; taps are `stride` apart.
pub struct MaxFilterEdge {
    base: EdgeBase,
    window: Vec3i,
    stride: Vec3i,
    routing: Mutex<Option<Routing>>,
    pending: PendingTask,
}

impl MaxFilterEdge {
    pub fn new(link: Link, window: Vec3i, stride: Vec3i) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<MaxFilterEdge>| {
            let edge: Weak<dyn Edge<Cube>> = weak.clone();
            Self {
                base: link.attach_spatial(edge),
                window,
                stride,
                routing: Mutex::new(None),
                pending: PendingTask::idle(),
            }
        })
    }

    fn do_forward(&self, input: Arc<Cube>) {
        let (out, winners) = fatal(input.max_filter(self.window, self.stride), "max filter");
        *self.routing.lock() = Some(Routing {
            winners,
            input_shape: *input.shape(),
        });
        self.base.deliver_forward(out);
    }
}

impl Edge<Cube> for MaxFilterEdge {
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
        let routed = {
            let routing = self.routing.lock();
            let Some(routing) = routing.as_ref() else {
                panic!(
                    "edge '{}': backward requires the routing of a previous forward",
                    self.name()
                );
            };
            fatal(
                gradient.max_filter_backward(&routing.winners, routing.input_shape),
                "max filter routing",
            )
        };
        self.base.deliver_backward(routed);
    }

    fn drain(&self) {
        self.pending.wait();
    }
}
