//! Error types for μKernel
//!
//! Every fallible kernel operation returns [`KernelResult`]. Remote faults
//! (a crashing unit, a silent peer, a garbled frame) are never raised
//! across the messaging boundary; they are reported through handler
//! callbacks and scheduler events, and only map onto these variants when
//! a caller asks about them.

use crate::sys::message::MessageId;
use crate::sys::syscall::{ErrorCode, Signal, Syscall};
use crate::sys::ProcessId;
use thiserror::Error;

/// Result type for kernel operations
pub type KernelResult<T> = Result<T, KernelError>;

/// Kernel error types
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KernelError {
    // ========== Admission Errors ==========

    /// Admission policy refused a start request (transient; the request is requeued)
    #[error("Admission denied for uid {uid}: {reason}")]
    AdmissionDenied { uid: u32, reason: String },

    /// PID probe ran out of its retry budget
    #[error("PID allocation exhausted after {budget} probes")]
    AllocationExhausted { budget: usize },

    // ========== Process Faults ==========

    /// INIT handshake answered with the wrong syscall
    #[error("Handshake mismatch: expected {expected:?}, got {got:?}")]
    HandshakeMismatch { expected: Syscall, got: Syscall },

    /// Previous heartbeat still unacknowledged
    #[error("Heartbeat timeout for pid {0}")]
    HeartbeatTimeout(ProcessId),

    /// Execution unit crashed
    #[error("Execution fault: {0}")]
    ExecutionFault(String),

    /// Frame could not be decoded
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    // ========== Lookup Errors ==========

    /// No image registered under this URI
    #[error("Image not found: {0}")]
    ImageNotFound(String),

    /// No live process with this PID
    #[error("Process not found: {0}")]
    ProcessNotFound(ProcessId),

    // ========== Messaging Errors ==========

    /// Identifier already has an outstanding request
    #[error("Duplicate message identifier: {0}")]
    DuplicateIdentifier(MessageId),

    /// Thread was terminated before the operation completed
    #[error("Thread terminated")]
    ThreadTerminated,

    /// Peer sent a signal the receiver was not expecting
    #[error("Unexpected signal: {0:?}")]
    UnexpectedSignal(Signal),

    /// Kernel answered a syscall with ERROR
    #[error("Syscall failed: {0:?}")]
    SyscallFailed(ErrorCode),

    /// Encoding or decoding failed
    #[error("Codec error: {0}")]
    Codec(String),

    // ========== Configuration Errors ==========

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    // ========== Kernel Errors ==========

    /// Irrecoverable kernel condition
    #[error("Kernel panic: {0}")]
    KernelPanic(String),

    /// Coordinator is gone or shutting down
    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl KernelError {
    /// Check if the condition is expected to clear on its own
    pub fn is_transient(&self) -> bool {
        matches!(self, KernelError::AdmissionDenied { .. })
    }

    /// Check if this error means the affected process must be torn down
    pub fn is_fatal_to_process(&self) -> bool {
        matches!(self,
            KernelError::HandshakeMismatch { .. } |
            KernelError::HeartbeatTimeout(_) |
            KernelError::ExecutionFault(_)
        )
    }

    /// Error code reported to a process in an ERROR signal
    pub fn code(&self) -> ErrorCode {
        match self {
            KernelError::AllocationExhausted { .. } => ErrorCode::AllocationExhausted,
            KernelError::ImageNotFound(_) => ErrorCode::ImageNotFound,
            KernelError::Codec(_) | KernelError::MalformedMessage(_) => ErrorCode::InvalidPayload,
            KernelError::ExecutionFault(_) | KernelError::ThreadTerminated => ErrorCode::SpawnFailed,
            _ => ErrorCode::Unknown,
        }
    }
}

impl From<serde_json::Error> for KernelError {
    fn from(err: serde_json::Error) -> Self {
        KernelError::Codec(err.to_string())
    }
}
