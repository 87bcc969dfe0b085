use std::fmt;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use anyhow::Result as WorkResult;
use petgraph::graph::NodeIndex;

use crate::core::errors::Result;
use crate::exec::Subflow;
use crate::flow::graph::FlowGraph;

/// Work item of a node, tagged by kind.
///
/// Dispatch is a single match over this enum at schedule time; there is no
/// dynamic inheritance hierarchy behind it.
#[derive(Clone)]
pub(crate) enum Work {
    /// Edges only, no work.
    Placeholder,
    /// A plain callable.
    Static(Arc<dyn Fn() -> WorkResult<()> + Send + Sync>),
    /// A callable that may spawn child tasks through a [`Subflow`] context.
    Subflow(Arc<dyn Fn(&mut Subflow) -> WorkResult<()> + Send + Sync>),
    /// An embedded framework's graph, run as a nested unit.
    Module(Arc<FlowGraph>),
}

impl Work {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Work::Placeholder => "placeholder",
            Work::Static(_) => "static",
            Work::Subflow(_) => "subflow",
            Work::Module(_) => "module",
        }
    }
}

/// A node owned by a [`FlowGraph`]: its work item plus runtime bookkeeping.
///
/// `join` is the remaining-dependency counter driving Kahn-style readiness.
/// `child_join` and `children` track tasks spawned by a subflow body so the
/// node's own completion can be deferred until the spawned sub-region has
/// drained. Plain fields are only written under the graph's write lock.
pub(crate) struct NodeSlot {
    pub(crate) work: Work,
    pub(crate) name: Option<String>,
    pub(crate) join: AtomicUsize,
    pub(crate) child_join: AtomicUsize,
    pub(crate) children: Vec<NodeIndex>,
    pub(crate) retained: bool,
    pub(crate) expanded: bool,
    /// Spawned during a run rather than declared up front.
    pub(crate) ephemeral: bool,
    /// The subflow node this node was spawned by, if any.
    pub(crate) parent: Option<NodeIndex>,
}

impl NodeSlot {
    pub(crate) fn new(work: Work) -> Self {
        Self {
            work,
            name: None,
            join: AtomicUsize::new(0),
            child_join: AtomicUsize::new(0),
            children: Vec::new(),
            retained: false,
            expanded: false,
            ephemeral: false,
            parent: None,
        }
    }

    pub(crate) fn spawned(work: Work, parent: NodeIndex) -> Self {
        let mut slot = Self::new(work);
        slot.ephemeral = true;
        slot.parent = Some(parent);
        slot
    }

    /// Display label: the assigned name, or a positional fallback.
    pub(crate) fn label(&self, index: NodeIndex) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("task_{}", index.index()),
        }
    }
}

/// An opaque, cheaply clonable reference to a task inside a framework.
///
/// Distinct handles may reference the same node; identity is node identity,
/// compared through [`PartialEq`]. Handles stay valid for the lifetime of the
/// owning framework's graph.
#[derive(Clone)]
pub struct TaskHandle {
    pub(crate) graph: Arc<FlowGraph>,
    pub(crate) index: NodeIndex,
}

impl TaskHandle {
    /// Add a precedence edge from this task to `successor`.
    ///
    /// Fails with `InvalidEdge` if the tasks live in different graphs or the
    /// edge would be a self-loop, and with `ConcurrentGraphMutation` while a
    /// run against this graph is active.
    pub fn precede(&self, successor: &TaskHandle) -> Result<()> {
        self.graph.link(self.index, successor)
    }

    /// Add a precedence edge from `predecessor` to this task.
    pub fn succeed(&self, predecessor: &TaskHandle) -> Result<()> {
        predecessor.graph.link(predecessor.index, self)
    }

    /// Assign a diagnostic name to this task. No behavioral effect.
    pub fn set_name<S: Into<String>>(&self, name: S) {
        self.graph.set_node_name(self.index, name.into());
    }

    /// The task's diagnostic name, if one was assigned.
    pub fn name(&self) -> Option<String> {
        self.graph.node_name(self.index)
    }
}

impl PartialEq for TaskHandle {
    fn eq(&self, other: &Self) -> bool {
        self.graph.id() == other.graph.id() && self.index == other.index
    }
}

impl Eq for TaskHandle {}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("graph", &self.graph.id())
            .field("index", &self.index.index())
            .finish()
    }
}
