//! Execution engine: the worker-pool executor, per-run topologies, and the
//! subflow context for dynamic task spawning.

pub(crate) mod topology;

mod executor;
mod subflow;

pub use executor::Executor;
pub use subflow::Subflow;
pub use topology::RunHandle;
