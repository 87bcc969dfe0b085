use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::oneshot;
use tracing::warn;

use crate::core::errors::{FlowError, Result};
use crate::flow::graph::FlowGraph;

/// How many times a topology executes its graph.
pub(crate) enum RunPolicy {
    Once,
    Repeat(usize),
    /// Continue until the predicate returns true. Evaluated once per
    /// completed iteration, on an engine thread, never concurrently.
    Until(Box<dyn FnMut() -> bool + Send>),
}

pub(crate) type Callback = Box<dyn FnOnce() + Send>;
pub(crate) type DoneSender = oneshot::Sender<Result<()>>;

/// Per-run bookkeeping record binding one framework execution to one
/// completion signal.
///
/// `join` mirrors how many scheduled nodes of the current iteration have not
/// yet finished; the iteration is globally complete exactly when it drains
/// to zero. At most one topology actively executes against a given graph at
/// any instant - the executor's per-graph queue serializes the rest in FIFO
/// order. The record lives until its completion signal has been delivered.
pub(crate) struct Topology {
    /// Diagnostic run id used in logs.
    pub(crate) id: String,
    pub(crate) graph: Arc<FlowGraph>,
    policy: Mutex<RunPolicy>,
    pub(crate) join: AtomicUsize,
    /// Completed iterations of this run request.
    pub(crate) iterations: AtomicUsize,
    callback: Mutex<Option<Callback>>,
    done_tx: Mutex<Option<DoneSender>>,
    /// First captured task failure; later failures are logged only.
    failure: Mutex<Option<FlowError>>,
}

impl Topology {
    pub(crate) fn new(
        graph: Arc<FlowGraph>,
        policy: RunPolicy,
        callback: Option<Callback>,
        done_tx: DoneSender,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: cuid2::create_id(),
            graph,
            policy: Mutex::new(policy),
            join: AtomicUsize::new(0),
            iterations: AtomicUsize::new(0),
            callback: Mutex::new(callback),
            done_tx: Mutex::new(Some(done_tx)),
            failure: Mutex::new(None),
        })
    }

    /// Decide whether another iteration follows the one that just completed.
    /// For `Until` this is the single per-iteration predicate call.
    pub(crate) fn should_continue(&self, completed_iterations: usize) -> bool {
        match &mut *lock(&self.policy) {
            RunPolicy::Once => false,
            RunPolicy::Repeat(n) => completed_iterations < *n,
            RunPolicy::Until(pred) => !pred(),
        }
    }

    /// Capture a task failure. The first one becomes the run's result;
    /// execution of already-scheduled siblings continues regardless.
    pub(crate) fn record_failure(&self, task: &str, message: String) {
        warn!(
            "topology {}: task '{}' failed: {}",
            self.id, task, message
        );
        let mut failure = lock(&self.failure);
        if failure.is_none() {
            *failure = Some(FlowError::task_failure(task, message));
        }
    }

    pub(crate) fn result(&self) -> Result<()> {
        match lock(&self.failure).clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub(crate) fn take_callback(&self) -> Option<Callback> {
        lock(&self.callback).take()
    }

    pub(crate) fn take_done_tx(&self) -> Option<DoneSender> {
        lock(&self.done_tx).take()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Future-like handle returned by the executor's run calls.
///
/// The handle resolves once the whole run request - including every repeat
/// iteration - has finished. `get` is a caller-visible suspension point and
/// must not be invoked from inside a task body.
pub struct RunHandle {
    pub(crate) rx: oneshot::Receiver<Result<()>>,
}

impl RunHandle {
    /// Block the calling thread until the run completes, yielding the first
    /// captured task failure, if any.
    pub fn get(self) -> Result<()> {
        match self.rx.blocking_recv() {
            Ok(result) => result,
            Err(_) => Err(FlowError::internal("run completion channel dropped")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topology(policy: RunPolicy) -> (Arc<Topology>, oneshot::Receiver<Result<()>>) {
        let (tx, rx) = oneshot::channel();
        (Topology::new(FlowGraph::new(), policy, None, tx), rx)
    }

    #[test]
    fn test_repeat_policy_counts_iterations() {
        let (topo, _rx) = topology(RunPolicy::Repeat(3));
        assert!(topo.should_continue(1));
        assert!(topo.should_continue(2));
        assert!(!topo.should_continue(3));
    }

    #[test]
    fn test_first_failure_wins() {
        let (topo, _rx) = topology(RunPolicy::Once);
        topo.record_failure("a", "boom".into());
        topo.record_failure("b", "later".into());
        let err = topo.result().unwrap_err();
        assert!(matches!(err, FlowError::TaskFailure { ref task, .. } if task == "a"));
    }

    #[test]
    fn test_callback_taken_once() {
        let (tx, _rx) = oneshot::channel();
        let topo = Topology::new(
            FlowGraph::new(),
            RunPolicy::Once,
            Some(Box::new(|| {})),
            tx,
        );
        assert!(topo.take_callback().is_some());
        assert!(topo.take_callback().is_none());
    }
}
