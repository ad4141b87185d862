//! Unified error handling for graphforge
//!
//! Two tiers exist:
//! - Recoverable statuses ([`ForgeError`]) returned from planning, kernel
//!   lookup, allocation and kernel compute. Callers inspect [`ForgeError::kind`]
//!   and react.
//! - Contract violations (out-of-range value ids, missing required inputs,
//!   stale buffer handles). These go through [`enforce!`](crate::enforce),
//!   which logs and panics. They never travel the `Result` path.

use std::fmt;

/// Unified error type for graphforge
#[derive(Debug, Clone, thiserror::Error)]
pub enum ForgeError {
    // ========== Caller Errors ==========
    /// Invalid argument supplied by the caller (bad feed, unknown output name)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Session used before `initialize()` completed
    #[error("Session not initialized")]
    NotInitialized,

    /// Named entity does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    // ========== Graph / Plan Errors ==========
    /// Graph is malformed (cycle, undefined input, duplicate producer)
    #[error("Invalid graph: {0}")]
    InvalidGraph(String),

    /// Allocation plan is inconsistent with the requested operation
    #[error("Invalid allocation plan: {0}")]
    InvalidPlan(String),

    // ========== Kernel Dispatch Errors ==========
    /// No registered kernel matches a node
    #[error("No kernel found: {0}")]
    KernelNotFound(String),

    /// More than one registered kernel matches a node
    #[error("Ambiguous kernel: {0}")]
    AmbiguousKernel(String),

    /// Identical kernel signature registered twice in one registry
    #[error("Kernel registration conflict: {0}")]
    KernelRegistrationConflict(String),

    /// Kernel compute failed for a node
    #[error("Kernel for node '{node}' failed: {source}")]
    KernelFailed {
        node: String,
        #[source]
        source: Box<ForgeError>,
    },

    // ========== Resource Errors ==========
    /// Allocator could not satisfy a request
    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    /// Generic failure
    #[error("{0}")]
    Fail(String),

    /// Lock poisoned (a thread panicked while holding it)
    #[error("Internal lock poisoned: {0}")]
    LockPoisoned(String),
}

impl ForgeError {
    /// Status kind used by callers to decide how to react
    pub fn kind(&self) -> StatusKind {
        match self {
            ForgeError::InvalidArgument(_) => StatusKind::InvalidArgument,
            ForgeError::NotFound(_) | ForgeError::KernelNotFound(_) => StatusKind::NotFound,
            ForgeError::InvalidGraph(_) => StatusKind::InvalidGraph,
            ForgeError::OutOfMemory(_) => StatusKind::OutOfMemory,
            ForgeError::AmbiguousKernel(_) => StatusKind::AmbiguousKernel,
            ForgeError::KernelFailed { source, .. } => source.kind(),
            ForgeError::NotInitialized
            | ForgeError::InvalidPlan(_)
            | ForgeError::KernelRegistrationConflict(_)
            | ForgeError::Fail(_)
            | ForgeError::LockPoisoned(_) => StatusKind::Fail,
        }
    }

    /// True for errors raised while building a session (registration,
    /// dispatch, planning). These are never produced by `run()`.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            ForgeError::KernelNotFound(_)
                | ForgeError::AmbiguousKernel(_)
                | ForgeError::KernelRegistrationConflict(_)
                | ForgeError::InvalidGraph(_)
        )
    }

    /// Attach the failing node name to a kernel error
    pub fn in_node(self, node: impl Into<String>) -> Self {
        match self {
            already @ ForgeError::KernelFailed { .. } => already,
            other => ForgeError::KernelFailed {
                node: node.into(),
                source: Box::new(other),
            },
        }
    }
}

/// Status kinds surfaced to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    InvalidArgument,
    Fail,
    NotFound,
    InvalidGraph,
    OutOfMemory,
    AmbiguousKernel,
}

impl fmt::Display for StatusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatusKind::InvalidArgument => "INVALID_ARGUMENT",
            StatusKind::Fail => "FAIL",
            StatusKind::NotFound => "NOT_FOUND",
            StatusKind::InvalidGraph => "INVALID_GRAPH",
            StatusKind::OutOfMemory => "OUT_OF_MEMORY",
            StatusKind::AmbiguousKernel => "AMBIGUOUS_KERNEL",
        };
        f.write_str(name)
    }
}

impl<T> From<std::sync::PoisonError<T>> for ForgeError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        ForgeError::LockPoisoned(err.to_string())
    }
}

/// Log and panic on a contract violation
#[cold]
pub fn contract_violation(message: String) -> ! {
    tracing::error!("contract violation: {}", message);
    panic!("contract violation: {}", message);
}

/// Result alias used across the crate
pub type ForgeResult<T> = std::result::Result<T, ForgeError>;

/// Build an `InvalidArgument` error
///
/// ```ignore
/// return Err(invalid_arg!("unknown feed '{}'", name));
/// ```
#[macro_export]
macro_rules! invalid_arg {
    ($msg:expr) => {
        $crate::error::ForgeError::InvalidArgument($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::ForgeError::InvalidArgument(format!($fmt, $($arg)*))
    };
}

/// Build a generic `Fail` error
#[macro_export]
macro_rules! fail {
    ($msg:expr) => {
        $crate::error::ForgeError::Fail($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::ForgeError::Fail(format!($fmt, $($arg)*))
    };
}

/// Check a contract. On violation the message is logged and the thread panics.
///
/// Contract violations are programming errors (out-of-range ids, null
/// required inputs). They are not data errors and must not be returned as
/// `ForgeError`.
#[macro_export]
macro_rules! enforce {
    ($cond:expr) => {
        if !$cond {
            $crate::__tracing::error!("contract violation: {}", stringify!($cond));
            panic!("contract violation: {}", stringify!($cond));
        }
    };
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            let message = format!($($arg)+);
            $crate::__tracing::error!("contract violation: {}", message);
            panic!("contract violation: {}", message);
        }
    };
}
