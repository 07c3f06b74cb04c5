//! Core Kernel Services
//!
//! Provides fundamental kernel services:
//! - Message envelopes and the signal/syscall vocabulary
//! - Thread management
//! - Process supervision
//! - Scheduler

pub mod message;
pub mod process;
pub mod scheduler;
pub mod syscall;
pub mod thread;

/// Process identifier
pub type ProcessId = u32;

pub use message::{Envelope, KernelMessage, MessageId, Origin, ProcessMessage};
pub use process::{HeartbeatState, LaunchSpec, Process, ProcessInfo, ProcessState};
pub use scheduler::{KillReason, PidFuture, Scheduler, SchedulerEvent};
pub use syscall::{ErrorCode, Signal, Syscall};
pub use thread::{Reply, Thread, ThreadHandler, ThreadInfo};
