use super::{Edge, EdgeBase, Link};
use crate::tensor::Cube;
use std::sync::{Arc, Weak};

/// Identity edge. Runs inline on the calling thread and never has background work.
pub struct DummyEdge {
    base: EdgeBase,
}

impl DummyEdge {
    pub fn new(link: Link) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<DummyEdge>| {
            let edge: Weak<dyn Edge<Cube>> = weak.clone();
            Self {
                base: link.attach_spatial(edge),
            }
        })
    }
}

impl Edge<Cube> for DummyEdge {
    fn base(&self) -> &EdgeBase {
        &self.base
    }

    fn forward(self: Arc<Self>, value: Arc<Cube>) {
        if self.is_enabled() {
            self.base
                .deliver_forward(Arc::try_unwrap(value).unwrap_or_else(|v| (*v).clone()));
        }
    }

    fn backward(self: Arc<Self>, gradient: Arc<Cube>) {
        if self.is_enabled() {
            self.base
                .deliver_backward(Arc::try_unwrap(gradient).unwrap_or_else(|g| (*g).clone()));
        }
    }

    fn drain(&self) {}
}
