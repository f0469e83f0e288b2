use crate::{PathId, Result, RouterId};

/// Delivery outcome reported by the wire transport for tracked sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Success,
    Timeout,
    NoLink,
    InvalidRouter,
    Congestion,
}

pub type SendStatusHandler = Box<dyn FnOnce(SendStatus) + Send + 'static>;

/// The framing/connection layer the core submits encoded messages to.
/// Implementations must accept submissions from any thread; callbacks are
/// invoked from the host event loop.
pub trait WireTransport: Send + Sync {
    /// Queue an encoded message for delivery to a directly linked peer.
    fn submit(&self, peer: &RouterId, message: Vec<u8>) -> Result<()>;

    /// Like `submit`, but reports the delivery outcome.
    fn send_with_status(
        &self,
        peer: &RouterId,
        message: Vec<u8>,
        on_status: SendStatusHandler,
    ) -> Result<()>;

    /// Drop any transport-side state (reorder buffers, pending sends)
    /// associated with a path id that no longer exists.
    fn forget_path(&self, path_id: &PathId);
}

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Sink for work the event loop must not block on: crypto batches and
/// nodedb disk writes. The core only requires that posted jobs eventually
/// run and that per-path completions come back in FIFO order.
pub trait WorkDispatcher: Send + Sync {
    fn post(&self, job: Job);
}

/// Dispatcher that runs jobs inline on the calling thread. Useful for
/// tests and for hosts without a worker pool.
#[derive(Default)]
pub struct InlineDispatcher;

impl WorkDispatcher for InlineDispatcher {
    fn post(&self, job: Job) {
        job();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_inline_dispatcher_runs_jobs() {
        let counter = Arc::new(AtomicUsize::new(0));
        let dispatcher = InlineDispatcher;
        for _ in 0..3 {
            let counter = counter.clone();
            dispatcher.post(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }
}
