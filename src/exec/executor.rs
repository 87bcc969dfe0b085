use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Condvar, Mutex};

use dashmap::DashMap;
use petgraph::graph::NodeIndex;
use petgraph::Direction;
use tokio::runtime::{Builder as RuntimeBuilder, Handle, Runtime};
use tokio::sync::oneshot;
use tracing::{debug, error, info};

use crate::core::errors::{FlowError, Result};
use crate::exec::subflow::Subflow;
use crate::exec::topology::{Callback, RunHandle, RunPolicy, Topology};
use crate::flow::graph::load_join;
use crate::flow::node::Work;
use crate::flow::Framework;

/// Pending run requests against one graph. Only `active` executes; the rest
/// wait in FIFO order until the active request - including all its repeat
/// iterations - has finished.
#[derive(Default)]
struct GraphQueue {
    active: Option<Arc<Topology>>,
    pending: VecDeque<Arc<Topology>>,
}

struct WaitState {
    outstanding: usize,
    first_failure: Option<FlowError>,
}

pub(crate) struct ExecutorInner {
    handle: Handle,
    /// Per-graph serialization side-table keyed by graph identity.
    queues: DashMap<u64, GraphQueue>,
    wait: Mutex<WaitState>,
    wait_cv: Condvar,
}

/// Owner of the worker pool: schedules topologies and drives them to
/// completion, including repeats.
///
/// The pool is a dedicated multi-threaded runtime with a fixed number of
/// worker threads; ready tasks are dispatched onto it and workers produce
/// new ready tasks only by completing old ones, so the pool is
/// self-sustaining until each run request drains. Completion of all
/// predecessors of a task happens-before that task's dispatch. Frameworks
/// may be rerun safely from one executor; running the same framework from
/// two executors concurrently is undefined behavior by contract.
///
/// Dropping the executor waits for all outstanding runs first; in-flight
/// tasks always run to completion.
pub struct Executor {
    workers: usize,
    inner: Arc<ExecutorInner>,
    runtime: Runtime,
}

impl Executor {
    /// Create an executor with a pool of `workers` threads.
    pub fn new(workers: usize) -> Result<Self> {
        if workers == 0 {
            return Err(FlowError::configuration(
                "worker count must be greater than 0",
            ));
        }
        let runtime = RuntimeBuilder::new_multi_thread()
            .worker_threads(workers)
            .thread_name("taskloom-worker")
            .build()
            .map_err(|e| FlowError::internal(format!("failed to build worker pool: {e}")))?;
        let inner = Arc::new(ExecutorInner {
            handle: runtime.handle().clone(),
            queues: DashMap::new(),
            wait: Mutex::new(WaitState {
                outstanding: 0,
                first_failure: None,
            }),
            wait_cv: Condvar::new(),
        });
        info!("executor ready with {} worker(s)", workers);
        Ok(Self {
            workers,
            inner,
            runtime,
        })
    }

    pub fn num_workers(&self) -> usize {
        self.workers
    }

    /// Run the framework's graph once.
    pub fn run(&self, framework: &Framework) -> RunHandle {
        self.spawn_topology(framework, RunPolicy::Once, None)
    }

    /// Run once, invoking `callback` exactly once on an engine thread after
    /// completion.
    pub fn run_with<C>(&self, framework: &Framework, callback: C) -> RunHandle
    where
        C: FnOnce() + Send + 'static,
    {
        self.spawn_topology(framework, RunPolicy::Once, Some(Box::new(callback)))
    }

    /// Run the framework's graph `n` times, back to back. `n == 0` completes
    /// immediately without dispatching anything.
    pub fn run_n(&self, framework: &Framework, n: usize) -> RunHandle {
        self.spawn_topology(framework, RunPolicy::Repeat(n), None)
    }

    /// Run `n` times with a completion callback fired after the last
    /// iteration.
    pub fn run_n_with<C>(&self, framework: &Framework, n: usize, callback: C) -> RunHandle
    where
        C: FnOnce() + Send + 'static,
    {
        self.spawn_topology(framework, RunPolicy::Repeat(n), Some(Box::new(callback)))
    }

    /// Run the framework's graph repeatedly until `predicate` returns true.
    /// The predicate is evaluated once per completed iteration, on an engine
    /// thread, never concurrently; it cannot interrupt an iteration.
    pub fn run_until<P>(&self, framework: &Framework, predicate: P) -> RunHandle
    where
        P: FnMut() -> bool + Send + 'static,
    {
        self.spawn_topology(framework, RunPolicy::Until(Box::new(predicate)), None)
    }

    /// `run_until` with a completion callback fired after the last iteration.
    pub fn run_until_with<P, C>(&self, framework: &Framework, predicate: P, callback: C) -> RunHandle
    where
        P: FnMut() -> bool + Send + 'static,
        C: FnOnce() + Send + 'static,
    {
        self.spawn_topology(
            framework,
            RunPolicy::Until(Box::new(predicate)),
            Some(Box::new(callback)),
        )
    }

    /// Block the issuing thread until every outstanding run submitted
    /// through this executor has completed, surfacing the first captured
    /// task failure if any run failed since the last call.
    pub fn wait_for_all(&self) -> Result<()> {
        let mut state = self
            .inner
            .wait
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        while state.outstanding > 0 {
            state = self
                .inner
                .wait_cv
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
        match state.first_failure.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn spawn_topology(
        &self,
        framework: &Framework,
        policy: RunPolicy,
        callback: Option<Callback>,
    ) -> RunHandle {
        let (tx, rx) = oneshot::channel();

        if let RunPolicy::Repeat(0) = policy {
            // Nothing to dispatch; complete on an engine thread so the
            // callback contract stays uniform.
            self.inner.register_topology();
            let inner = self.inner.clone();
            self.inner.handle.spawn(async move {
                if let Some(cb) = callback {
                    cb();
                }
                let _ = tx.send(Ok(()));
                inner.complete_topology(None);
            });
            return RunHandle { rx };
        }

        let topology = Topology::new(framework.graph_arc(), policy, callback, tx);
        submit(&self.inner, topology);
        RunHandle { rx }
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        // In-flight topologies hold no reference back to the executor, so
        // drain them before the worker pool goes away.
        let _ = self.wait_for_all();
    }
}

impl ExecutorInner {
    fn register_topology(&self) {
        let mut state = self.wait.lock().unwrap_or_else(|e| e.into_inner());
        state.outstanding += 1;
    }

    fn complete_topology(&self, failure: Option<FlowError>) {
        let mut state = self.wait.lock().unwrap_or_else(|e| e.into_inner());
        state.outstanding -= 1;
        if state.first_failure.is_none() {
            state.first_failure = failure;
        }
        if state.outstanding == 0 {
            self.wait_cv.notify_all();
        }
    }
}

/// Enqueue a topology on its graph's FIFO; activate it right away if the
/// graph is idle.
pub(crate) fn submit(exec: &Arc<ExecutorInner>, topology: Arc<Topology>) {
    exec.register_topology();
    let graph_id = topology.graph.id();
    info!(
        "topology {}: queued against graph '{}'",
        topology.id,
        topology.graph.label()
    );

    let start_now = {
        let mut queue = exec.queues.entry(graph_id).or_default();
        if queue.active.is_none() {
            queue.active = Some(topology.clone());
            // Flipped under the queue guard so it cannot race finalize.
            topology.graph.set_active(true);
            true
        } else {
            queue.pending.push_back(topology.clone());
            false
        }
    };

    if start_now {
        let exec = exec.clone();
        let handle = exec.handle.clone();
        handle.spawn(async move {
            advance(&exec, topology, false);
        });
    }
}

/// Drive a topology forward on iteration boundaries: evaluate the repeat
/// policy after a completed iteration, start the next iteration, finalize,
/// and activate the next queued topology. Loop-structured so graphs that
/// drain synchronously (e.g. empty ones) cannot recurse.
fn advance(exec: &Arc<ExecutorInner>, topology: Arc<Topology>, completed_iteration: bool) {
    let mut topology = topology;
    let mut completed = completed_iteration;
    loop {
        if completed {
            let done = topology.iterations.fetch_add(1, Ordering::AcqRel) + 1;
            if topology.should_continue(done) {
                debug!(
                    "topology {}: iteration {} complete, rescheduling",
                    topology.id, done
                );
            } else {
                match finalize(exec, &topology) {
                    Some(next) => {
                        topology = next;
                        completed = false;
                        continue;
                    }
                    None => return,
                }
            }
        }
        if start_iteration(exec, &topology) {
            return;
        }
        completed = true;
    }
}

/// Reset counters, discard stale dynamic tasks, and dispatch all source
/// nodes of one iteration. Returns false when the iteration already drained
/// synchronously (no nodes, or everything finished before the scheduler
/// guard was released).
fn start_iteration(exec: &Arc<ExecutorInner>, topology: &Arc<Topology>) -> bool {
    let fresh = topology.iterations.load(Ordering::Acquire) == 0;
    topology.graph.prepare_iteration(fresh);

    // Scheduler guard: keeps the join counter above zero until every source
    // has been dispatched, so a fast worker cannot complete the iteration
    // while sources are still being scheduled.
    topology.join.store(1, Ordering::Release);
    let sources = topology.graph.source_indices();
    debug!(
        "topology {}: scheduling {} source task(s)",
        topology.id,
        sources.len()
    );
    for index in sources {
        schedule_node(exec, topology, index);
    }
    topology.join.fetch_sub(1, Ordering::AcqRel) != 1
}

/// Deliver the completion signal and hand the graph to the next queued
/// topology, if any.
fn finalize(exec: &Arc<ExecutorInner>, topology: &Arc<Topology>) -> Option<Arc<Topology>> {
    let result = topology.result();
    info!(
        "topology {}: finished after {} iteration(s) ({})",
        topology.id,
        topology.iterations.load(Ordering::Acquire),
        if result.is_ok() { "ok" } else { "failed" }
    );

    // Release the graph before signalling completion: a caller that has
    // observed the future may immediately mutate or resubmit the framework.
    let next = {
        let mut queue = exec.queues.entry(topology.graph.id()).or_default();
        queue.active = queue.pending.pop_front();
        if queue.active.is_none() {
            topology.graph.set_active(false);
        }
        queue.active.clone()
    };

    if let Some(callback) = topology.take_callback() {
        callback();
    }
    if let Some(tx) = topology.take_done_tx() {
        let _ = tx.send(result.clone());
    }
    exec.complete_topology(result.err());
    next
}

/// Mark a node ready and dispatch it onto the worker pool.
fn schedule_node(exec: &Arc<ExecutorInner>, topology: &Arc<Topology>, index: NodeIndex) {
    topology.join.fetch_add(1, Ordering::AcqRel);
    let exec = exec.clone();
    let topology = topology.clone();
    let handle = exec.handle.clone();
    handle.spawn(run_node(exec, topology, index));
}

/// Dispatch one ready node: run its work item to completion on this worker,
/// then fold the completion back into the dependency counters.
async fn run_node(exec: Arc<ExecutorInner>, topology: Arc<Topology>, index: NodeIndex) {
    let (work, label) = {
        let nodes = topology.graph.read();
        let slot = &nodes[index];
        (slot.work.clone(), slot.label(index))
    };
    debug!("topology {}: dispatching '{}'", topology.id, label);

    match work {
        Work::Placeholder => {
            finish_node(&exec, &topology, index);
        }
        Work::Static(body) => {
            if let Err(err) = invoke(|| (body.as_ref())()) {
                topology.record_failure(&label, err);
            }
            finish_node(&exec, &topology, index);
        }
        Work::Subflow(body) => {
            run_subflow_node(&exec, &topology, index, &label, body.as_ref());
        }
        Work::Module(target) => {
            // The embedded graph runs as a nested topology through the same
            // per-graph FIFO, which is what makes concurrent module tasks
            // referencing one framework mutually exclusive. Only this task
            // suspends; the worker thread stays free.
            info!(
                "topology {}: module '{}' entering graph '{}'",
                topology.id,
                label,
                target.label()
            );
            let (tx, rx) = oneshot::channel();
            let nested = Topology::new(target, RunPolicy::Once, None, tx);
            submit(&exec, nested);
            match rx.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    topology.record_failure(&label, format!("embedded run failed: {err}"))
                }
                Err(_) => topology.record_failure(
                    &label,
                    "embedded run dropped its completion channel".to_string(),
                ),
            }
            finish_node(&exec, &topology, index);
        }
    }
}

type SubflowBody = dyn Fn(&mut Subflow) -> anyhow::Result<()> + Send + Sync;

fn run_subflow_node(
    exec: &Arc<ExecutorInner>,
    topology: &Arc<Topology>,
    index: NodeIndex,
    label: &str,
    body: &SubflowBody,
) {
    let replay = {
        let nodes = topology.graph.read();
        nodes[index].expanded && nodes[index].retained
    };

    let children = if replay {
        let children = topology.graph.read()[index].children.clone();
        debug!(
            "topology {}: '{}' replaying retained expansion of {} task(s)",
            topology.id,
            label,
            children.len()
        );
        children
    } else {
        let mut subflow = Subflow::new(topology.graph.clone(), index);
        if let Err(err) = invoke(|| body(&mut subflow)) {
            topology.record_failure(label, err);
        }
        let (children, retain) = subflow.into_parts();
        {
            let mut nodes = topology.graph.write();
            let slot = &mut nodes[index];
            slot.children = children.clone();
            slot.retained = retain;
            slot.expanded = true;
        }
        children
    };

    if children.is_empty() {
        finish_node(exec, topology, index);
        return;
    }

    // The node stays unfinished until the spawned sub-region drains. The +1
    // is the scheduler guard again: children may finish while their siblings
    // are still being dispatched.
    {
        let nodes = topology.graph.read();
        nodes[index]
            .child_join
            .store(children.len() + 1, Ordering::Release);
    }
    let ready: Vec<NodeIndex> = {
        let nodes = topology.graph.read();
        children
            .iter()
            .copied()
            .filter(|&c| load_join(&nodes, c) == 0)
            .collect()
    };
    for child in ready {
        schedule_node(exec, topology, child);
    }
    let released = {
        let nodes = topology.graph.read();
        nodes[index].child_join.fetch_sub(1, Ordering::AcqRel)
    };
    if released == 1 {
        finish_node(exec, topology, index);
    }
}

/// Fold one finished node into the counters: successors whose remaining
/// dependencies drain become ready; a spawning subflow whose sub-region
/// drains finishes in turn; the iteration completes when the topology's own
/// join counter drains. The finished node is decremented last on each rung
/// so the counter can never reach zero while its parent is still pending.
fn finish_node(exec: &Arc<ExecutorInner>, topology: &Arc<Topology>, index: NodeIndex) {
    let mut cursor = Some(index);
    while let Some(current) = cursor {
        let (ready, parent, label) = {
            let nodes = topology.graph.read();
            let mut ready = Vec::new();
            for successor in nodes.neighbors_directed(current, Direction::Outgoing) {
                if nodes[successor].join.fetch_sub(1, Ordering::AcqRel) == 1 {
                    ready.push(successor);
                }
            }
            (ready, nodes[current].parent, nodes[current].label(current))
        };
        debug!(
            "topology {}: '{}' finished, {} successor(s) ready",
            topology.id,
            label,
            ready.len()
        );
        for successor in ready {
            schedule_node(exec, topology, successor);
        }

        let mut next = None;
        if let Some(parent) = parent {
            let drained = {
                let nodes = topology.graph.read();
                nodes[parent].child_join.fetch_sub(1, Ordering::AcqRel) == 1
            };
            if drained {
                next = Some(parent);
            }
        }

        if topology.join.fetch_sub(1, Ordering::AcqRel) == 1 {
            advance(exec, topology.clone(), true);
        }
        cursor = next;
    }
}

/// Run a work item, converting panics into task failures so a misbehaving
/// body cannot wedge the topology's counters.
fn invoke<F>(body: F) -> std::result::Result<(), String>
where
    F: FnOnce() -> anyhow::Result<()>,
{
    match catch_unwind(AssertUnwindSafe(body)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(format!("{err:#}")),
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!("task body panicked: {}", message);
            Err(format!("task panicked: {message}"))
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
