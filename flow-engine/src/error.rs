// Error taxonomy
// Fatal errors abort before execution; node failures and cache errors are
// scoped and recoverable

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::expression::ResolutionError;

/// Fatal elaboration failure: the namespace cannot be produced
#[derive(Debug, Error)]
pub enum ElaborationError {
    #[error("inheritance cycle through '{0}'")]
    InheritanceCycle(String),

    #[error("duplicate name '{name}' in package '{package}'")]
    DuplicateName { name: String, package: String },

    #[error("package '{package}' has no configuration '{name}'")]
    MissingConfig { name: String, package: String },

    #[error("unknown reference '{name}' in package '{package}'")]
    UnknownReference { name: String, package: String },

    #[error("unknown task implementation '{0}'")]
    UnknownImpl(String),

    #[error("failed to load package from '{path}': {message}")]
    Load { path: String, message: String },

    #[error("import path may only reference built-in variables: {0}")]
    ImportExpression(String),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),
}

/// Classification of graph-construction failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphErrorKind {
    Cyclic,
    UnknownDependency,
    InvalidStructure,
}

/// Fatal graph-construction failure
#[derive(Debug, Clone)]
pub struct GraphError {
    pub message: String,
    pub kind: GraphErrorKind,
}

impl GraphError {
    pub fn cyclic(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: GraphErrorKind::Cyclic,
        }
    }

    pub fn unknown_dependency(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: GraphErrorKind::UnknownDependency,
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: GraphErrorKind::InvalidStructure,
        }
    }
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            GraphErrorKind::Cyclic => "cycle",
            GraphErrorKind::UnknownDependency => "unknown dependency",
            GraphErrorKind::InvalidStructure => "invalid structure",
        };
        write!(f, "graph error ({}): {}", kind, self.message)
    }
}

impl std::error::Error for GraphError {}

/// Recoverable cache failure: callers fall back to normal execution
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("timed out waiting for cache lock at {0}")]
    LockTimeout(PathBuf),

    #[error("corrupt cache entry at {path}: {message}")]
    Corrupt { path: PathBuf, message: String },

    #[error("output path '{0}' escapes the run directory")]
    PathEscape(PathBuf),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

impl CacheError {
    /// Lock timeouts are worth retrying; everything else means skip the
    /// cache for this run
    pub fn is_retryable(&self) -> bool {
        matches!(self, CacheError::LockTimeout(_))
    }
}

/// A task implementation returned a non-zero status. Node-scoped: dependents
/// become blocked, sibling branches keep running.
#[derive(Debug, Clone, Error)]
#[error("task '{node}' failed with status {status}")]
pub struct TaskFailure {
    pub node: String,
    pub status: i32,
}

/// Non-fatal diagnostics collected during elaboration and graph building
#[derive(Debug, Clone, PartialEq)]
pub enum Warning {
    /// Cross-package reference to a task without the export flag
    Visibility {
        from_package: String,
        target: String,
    },
    /// A consume pattern that no producer satisfies
    DataflowMismatch { task: String, pattern: String },
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Warning::Visibility {
                from_package,
                target,
            } => write!(
                f,
                "package '{}' references non-exported task '{}'",
                from_package, target
            ),
            Warning::DataflowMismatch { task, pattern } => write!(
                f,
                "task '{}' consume pattern {} matches no producer",
                task, pattern
            ),
        }
    }
}

/// Top-level engine error
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Elaboration(#[from] ElaborationError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Task(#[from] TaskFailure),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
