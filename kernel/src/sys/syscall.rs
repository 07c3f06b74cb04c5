//! Signal and Syscall Vocabulary
//!
//! Shared between the kernel and every process image:
//! - Signals travel kernel → process
//! - Syscalls travel process → kernel
//! - Each tag has a fixed payload contract
//!
//! Tags are encoded on the wire as plain integers.

use crate::{KernelError, KernelResult};
use super::ProcessId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Interval between heartbeat signals
///
/// A process must answer each HEARTBEAT before the next tick, or the
/// kernel treats it as crashed and kills it.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(1000);

/// Startup tolerance before the first heartbeat tick
pub const HEARTBEAT_GRACE_PERIOD: Duration = Duration::from_millis(500);

/// Signals sent to processes by the kernel
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Signal {
    /// Sent on process initialisation, carries [`InitPayload`]
    Init = 0,
    /// Sent to parent and child after a fork, carries [`ForkedPayload`]
    Forked = 1,
    /// Sent in reply when a syscall fails, carries [`ErrorPayload`]
    Error = 2,
    /// Liveness probe, no payload
    Heartbeat = 3,
    /// Process was reassigned to a new parent, carries [`NewPpidPayload`]
    NewPpid = 4,
}

impl TryFrom<u8> for Signal {
    type Error = KernelError;

    fn try_from(value: u8) -> Result<Self, KernelError> {
        match value {
            0 => Ok(Signal::Init),
            1 => Ok(Signal::Forked),
            2 => Ok(Signal::Error),
            3 => Ok(Signal::Heartbeat),
            4 => Ok(Signal::NewPpid),
            _ => Err(KernelError::Codec(format!("unknown signal {}", value))),
        }
    }
}

impl From<Signal> for u8 {
    fn from(signal: Signal) -> u8 {
        signal as u8
    }
}

/// Syscalls sent to the kernel by processes
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Syscall {
    /// Handshake acknowledgement, reply to INIT
    Init = 0,
    /// Duplicate the calling process
    Fork = 1,
    /// Replace the running image, same pid, carries [`ExecPayload`]
    Exec = 2,
    /// Liveness acknowledgement, reply to HEARTBEAT
    Heartbeat = 3,
    /// Clean process-initiated shutdown, carries [`ExitPayload`]
    Exit = 4,
}

impl TryFrom<u8> for Syscall {
    type Error = KernelError;

    fn try_from(value: u8) -> Result<Self, KernelError> {
        match value {
            0 => Ok(Syscall::Init),
            1 => Ok(Syscall::Fork),
            2 => Ok(Syscall::Exec),
            3 => Ok(Syscall::Heartbeat),
            4 => Ok(Syscall::Exit),
            _ => Err(KernelError::Codec(format!("unknown syscall {}", value))),
        }
    }
}

impl From<Syscall> for u8 {
    fn from(call: Syscall) -> u8 {
        call as u8
    }
}

/// Error numbers carried by [`Signal::Error`]
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub enum ErrorCode {
    Unknown = 0,
    AllocationExhausted = 1,
    ImageNotFound = 2,
    InvalidPayload = 3,
    SpawnFailed = 4,
}

impl TryFrom<u16> for ErrorCode {
    type Error = KernelError;

    fn try_from(value: u16) -> Result<Self, KernelError> {
        match value {
            0 => Ok(ErrorCode::Unknown),
            1 => Ok(ErrorCode::AllocationExhausted),
            2 => Ok(ErrorCode::ImageNotFound),
            3 => Ok(ErrorCode::InvalidPayload),
            4 => Ok(ErrorCode::SpawnFailed),
            _ => Err(KernelError::Codec(format!("unknown error code {}", value))),
        }
    }
}

impl From<ErrorCode> for u16 {
    fn from(code: ErrorCode) -> u16 {
        code as u16
    }
}

// ============================================================================
// Payloads
// ============================================================================

/// Body of the INIT signal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitPayload {
    pub ppid: ProcessId,
    pub pid: ProcessId,
    pub uid: u32,
    pub gid: u32,
    pub env: BTreeMap<String, String>,
    pub args: Vec<String>,
}

/// Body of the FORKED signal
///
/// The parent learns the pid of its new child; the child receives a copy
/// of the parent's descriptor list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum ForkedPayload {
    Parent { pid: ProcessId },
    Child { descriptors: Vec<u32> },
}

/// Body of the ERROR signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
}

/// Body of the NEWPPID signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPpidPayload {
    pub ppid: ProcessId,
}

/// Body of the EXEC syscall
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecPayload {
    pub image: String,
    /// Replacement arguments; the current ones are kept when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
}

/// Body of the EXIT syscall
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitPayload {
    pub code: i32,
}

/// Serialize a payload into envelope data
pub fn to_data<P: Serialize>(payload: &P) -> KernelResult<serde_json::Value> {
    Ok(serde_json::to_value(payload)?)
}
