/// Failure reported by a [`crate::SchemaExecutor`] while applying a script or seed chunk.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ExecutorError {
    #[error("execution timed out after {timeout_seconds}s")]
    TimedOut { timeout_seconds: u64 },
    #[error("script failed: {0}")]
    Script(String),
    #[error("operation not supported by executor: {0}")]
    Unsupported(String),
    #[error("executor i/o failure: {0}")]
    Io(String),
}

impl ExecutorError {
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut { .. })
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum EngineError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("cyclic dependency: {}", render_path(.path))]
    CyclicDependency { path: Vec<String> },
    #[error("conflict: {left} conflicts with {right}")]
    Conflict { left: String, right: String },
    #[error("unit {unit} is not reversible")]
    NonReversibleUnit { unit: String },
    #[error("a run is already in progress for scope {scope} (held by run {holder})")]
    RunInProgress { scope: String, holder: String },
    #[error("execution of {unit} timed out after {timeout_seconds}s")]
    ExecutionTimeout { unit: String, timeout_seconds: u64 },
    #[error("rollback of {unit} failed in run {run_id}: {reason}; manual intervention required")]
    RollbackFailure {
        run_id: String,
        unit: String,
        reason: String,
    },
    #[error("{resource} has {records} execution record(s); pass force to retire it")]
    HasHistory { resource: String, records: usize },
    #[error("actor {actor} may not perform {operation}: {reason}")]
    Unauthorized {
        actor: String,
        operation: String,
        reason: String,
    },
    #[error("executor error: {0}")]
    Executor(#[from] ExecutorError),
    #[error("state store error: {0}")]
    Store(String),
}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        Self::Store(format!("{err:#}"))
    }
}

impl EngineError {
    /// Stable machine-readable code, used by audit entries and CLI output.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::NotFound(_) => "not_found",
            Self::CyclicDependency { .. } => "cyclic_dependency",
            Self::Conflict { .. } => "conflict",
            Self::NonReversibleUnit { .. } => "non_reversible_unit",
            Self::RunInProgress { .. } => "run_in_progress",
            Self::ExecutionTimeout { .. } => "execution_timeout",
            Self::RollbackFailure { .. } => "rollback_failure",
            Self::HasHistory { .. } => "has_history",
            Self::Unauthorized { .. } => "unauthorized",
            Self::Executor(_) => "executor_error",
            Self::Store(_) => "store_error",
        }
    }
}

fn render_path(path: &[String]) -> String {
    path.join(" -> ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_message_lists_path_in_order() {
        let err = EngineError::CyclicDependency {
            path: vec!["a".to_string(), "b".to_string(), "a".to_string()],
        };
        assert_eq!(err.to_string(), "cyclic dependency: a -> b -> a");
        assert_eq!(err.code(), "cyclic_dependency");
    }

    #[test]
    fn store_errors_keep_context_chain() {
        let err: EngineError = anyhow::anyhow!("disk full").context("failed to append").into();
        assert_eq!(err, EngineError::Store("failed to append: disk full".to_string()));
    }

    #[test]
    fn executor_errors_convert() {
        let err: EngineError = ExecutorError::TimedOut { timeout_seconds: 3 }.into();
        assert!(matches!(err, EngineError::Executor(ref inner) if inner.is_timeout()));
    }
}
