use super::{Edge, EdgeBase, Link};
use crate::network::fatal;
use crate::network::filter::SharedFilter;
use crate::network::task::PendingTask;
use crate::tensor::{CCube, Vec3i};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::trace;

#[derive(Default)]
struct FftState {
    w_fft: Option<Arc<CCube>>,
    last_input: Option<Arc<CCube>>,
}

/// Sparse convolution carried out as a product in the frequency domain.
///
/// The dilated weights are transformed once at the input group's size and cached; the cache is
/// rebuilt after every update. All work touching the cache runs as a chain of continuations on the
/// edge's pending task, so forward passes always see the weights left by the last update.
pub struct FftFilterEdge {
    base: EdgeBase,
    stride: Vec3i,
    filter: SharedFilter,
    state: Mutex<FftState>,
    pending: PendingTask,
}

impl FftFilterEdge {
    pub fn new(link: Link, filter: SharedFilter, stride: Vec3i) -> Arc<Self> {
        let edge = Arc::new_cyclic(|weak: &Weak<FftFilterEdge>| {
            let fft: Weak<dyn Edge<CCube>> = weak.clone();
            Self {
                base: link.attach_fft(fft),
                stride,
                filter,
                state: Mutex::new(FftState::default()),
                pending: PendingTask::idle(),
            }
        });

        let init = Arc::clone(&edge);
        edge.pending.set(edge.base.tasks.schedule(move || init.initialize()));
        edge
    }

    pub fn filter(&self) -> &SharedFilter {
        &self.filter
    }

    fn initialize(&self) {
        let weights = self.filter.lock().weights().clone();
        let exploded = fatal(
            weights.sparse_explode(self.stride, self.base.input.nodes.fsize()),
            "dilating filter to input size",
        );
        let w_fft = fatal(exploded.fft(), "transforming filter");
        self.state.lock().w_fft = Some(Arc::new(w_fft));
    }

    fn w_fft(&self) -> Arc<CCube> {
        match self.state.lock().w_fft.clone() {
            Some(w) => w,
            None => panic!("edge '{}': filter transform not initialised", self.name()),
        }
    }

    fn do_forward(&self, input: Arc<CCube>) {
        let w_fft = self.w_fft();
        let product = fatal(&*w_fft * &*input, "frequency-domain forward product");
        self.state.lock().last_input = Some(input);
        self.base.deliver_forward_fft(product);
    }

    fn do_update(&self, gradient: &CCube) {
        let last_input = match self.state.lock().last_input.clone() {
            Some(input) => input,
            None => panic!("edge '{}': update requires last_input", self.name()),
        };

        let product = fatal(&*last_input * gradient, "frequency-domain weight gradient");
        let mut dedw = fatal(product.ifft_raw(), "inverse transform of weight gradient");
        let norm = dedw.size() as f64;
        dedw.flip();

        let mut filter = self.filter.lock();
        let compact = *filter.weights().shape();
        let mut dedw = fatal(
            dedw.sparse_implode(self.stride, compact),
            "compacting weight gradient",
        );
        dedw.scale(1.0 / norm);
        fatal(filter.update(&dedw, self.base.patch_size), "filter update");
        drop(filter);

        self.initialize();
        trace!(edge = self.base.name(), "filter updated");
    }
}

impl Edge<CCube> for FftFilterEdge {
    fn base(&self) -> &EdgeBase {
        &self.base
    }

    fn forward(self: Arc<Self>, value: Arc<CCube>) {
        if !self.is_enabled() {
            return;
        }
        let edge = Arc::clone(&self);
        self.pending
            .then(&self.base.tasks, move || edge.do_forward(value));
    }

    fn backward(self: Arc<Self>, gradient: Arc<CCube>) {
        if !self.is_enabled() {
            return;
        }
        assert!(
            self.state.lock().last_input.is_some(),
            "edge '{}': backward requires last_input from a previous forward",
            self.name()
        );

        let w_fft = self.w_fft();
        let grad = fatal(&*w_fft * &*gradient, "frequency-domain backward product");
        self.base.deliver_backward_fft(grad);

        let edge = Arc::clone(&self);
        self.pending
            .then(&self.base.tasks, move || edge.do_update(&gradient));
    }

    fn drain(&self) {
        self.pending.wait();
    }
}
