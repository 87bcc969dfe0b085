use thiserror::Error;

/// Unified error type for the taskloom library.
///
/// Build-time errors (`InvalidEdge`, `ConcurrentGraphMutation`,
/// `Configuration`) are reported synchronously by the call that caused them.
/// `TaskFailure` is captured at run time and attached to the owning
/// topology's completion signal. All variants are cheap to clone so a single
/// failure can surface both through its run handle and `wait_for_all`.
#[derive(Debug, Clone, Error)]
pub enum FlowError {
    /// Malformed edge request: endpoints in different graphs, a self-loop,
    /// or endpoints outside a subflow's own sub-region.
    #[error("invalid edge: {reason}")]
    InvalidEdge { reason: String },

    /// A framework was mutated while a topology referencing it was active.
    /// Detection is best-effort; races the flag misses remain a documented
    /// caller obligation.
    #[error("graph '{graph}' mutated while a run is active")]
    ConcurrentGraphMutation { graph: String },

    /// A work item returned an error (or panicked) during execution.
    #[error("task '{task}' failed: {message}")]
    TaskFailure { task: String, message: String },

    /// Invalid engine configuration (e.g. a zero-sized worker pool).
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Engine-internal fault, such as a dropped completion channel.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl FlowError {
    /// Create an invalid-edge error.
    pub fn invalid_edge<S: Into<String>>(reason: S) -> Self {
        Self::InvalidEdge {
            reason: reason.into(),
        }
    }

    /// Create a concurrent-mutation error for the named graph.
    pub fn concurrent_mutation<S: Into<String>>(graph: S) -> Self {
        Self::ConcurrentGraphMutation {
            graph: graph.into(),
        }
    }

    /// Create a task-failure error.
    pub fn task_failure<S: Into<String>, M: Into<String>>(task: S, message: M) -> Self {
        Self::TaskFailure {
            task: task.into(),
            message: message.into(),
        }
    }

    /// Create a configuration error.
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get error category for metrics/logging.
    pub fn category(&self) -> &'static str {
        match self {
            Self::InvalidEdge { .. } => "invalid_edge",
            Self::ConcurrentGraphMutation { .. } => "concurrent_mutation",
            Self::TaskFailure { .. } => "task_failure",
            Self::Configuration { .. } => "configuration",
            Self::Internal { .. } => "internal",
        }
    }

    /// True for errors raised while building a graph, false for runtime ones.
    pub fn is_build_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidEdge { .. } | Self::ConcurrentGraphMutation { .. }
        )
    }
}

/// Result type alias for convenience.
pub type Result<T> = std::result::Result<T, FlowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = FlowError::invalid_edge("endpoints belong to different graphs");
        assert!(matches!(err, FlowError::InvalidEdge { .. }));
        assert_eq!(err.category(), "invalid_edge");
        assert!(err.is_build_error());
    }

    #[test]
    fn test_task_failure_display() {
        let err = FlowError::task_failure("fetch", "connection refused");
        assert_eq!(err.to_string(), "task 'fetch' failed: connection refused");
        assert!(!err.is_build_error());
    }

    #[test]
    fn test_clone_keeps_category() {
        let err = FlowError::concurrent_mutation("pipeline");
        assert_eq!(err.clone().category(), err.category());
    }
}
