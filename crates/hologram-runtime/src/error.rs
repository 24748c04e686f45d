//! Error types for runtime operations

use crate::caps::AllocationKind;
use std::fmt;

/// Result type for runtime operations
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Errors raised by memory objects, streams and events
///
/// The type is `Clone` because one asynchronous failure is reported to every
/// waiter of the failed event and of every event that depends on it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeError {
    /// Requested feature or descriptor is not supported by this device or build
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Host access requested on memory the host cannot touch
    #[error("host access denied for {kind} memory")]
    AccessDenied { kind: AllocationKind },

    /// `unlock` without a matching `lock`
    #[error("unlock without matching lock on memory #{memory}")]
    LockUnderflow { memory: u64 },

    /// Device memory exhausted
    #[error("out of device memory: requested {requested} bytes, available {available} bytes")]
    OutOfMemory { requested: u64, available: u64 },

    /// Single allocation exceeds the device limit
    #[error("allocation of {requested} bytes exceeds device limit of {max} bytes")]
    AllocationTooLarge { requested: u64, max: u64 },

    /// Access outside the bounds of a memory object
    #[error("access out of bounds: offset {offset} + size {size} > capacity {capacity}")]
    OutOfBounds { offset: usize, size: usize, capacity: usize },

    /// Byte sizes of two operands differ
    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    /// Layout cannot back a memory object
    #[error("invalid layout: {0}")]
    InvalidLayout(String),

    /// Invalid argument passed to a runtime call
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A submitted device operation failed
    #[error("{operation} failed: {message}")]
    ExecutionFailed { operation: String, message: String },

    /// An operation was skipped because one of its dependencies failed
    #[error("dependency failed: {0}")]
    DependencyFailed(Box<RuntimeError>),

    /// No device matches the request
    #[error("unknown device: {0}")]
    UnknownDevice(String),

    /// Memory or handle belongs to another engine or device
    #[error("foreign memory: {0}")]
    ForeignMemory(String),

    /// Invalid runtime configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// The device queue has shut down
    #[error("device queue is closed")]
    QueueClosed,
}

impl RuntimeError {
    /// Create an unsupported error
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    /// Create an execution failure for the named operation
    pub fn execution_failed(operation: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::ExecutionFailed {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create an invalid layout error
    pub fn invalid_layout(msg: impl Into<String>) -> Self {
        Self::InvalidLayout(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Wrap a failure observed on a dependency
    pub fn dependency_failed(cause: RuntimeError) -> Self {
        Self::DependencyFailed(Box::new(cause))
    }

    /// The innermost error, looking through dependency wrappers
    pub fn root_cause(&self) -> &RuntimeError {
        match self {
            Self::DependencyFailed(inner) => inner.root_cause(),
            other => other,
        }
    }

    /// Bounds check used by host transfers and mapped access
    pub(crate) fn check_bounds(offset: usize, size: usize, capacity: usize) -> Result<()> {
        match offset.checked_add(size) {
            Some(end) if end <= capacity => Ok(()),
            _ => Err(Self::OutOfBounds { offset, size, capacity }),
        }
    }
}
