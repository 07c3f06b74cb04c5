//! μKernel: Process Supervisor for μOS
//!
//! A user-space kernel core that runs programs as isolated execution
//! units and supervises them:
//! - Message-passing only, over framed JSON envelopes
//! - Admission control with global and per-user limits
//! - Liveness by heartbeat
//! - Reparenting of orphans to PID 0
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Execution Units                          │
//! │  ┌──────────┐ ┌──────────┐ ┌──────────┐ ┌──────────────────┐│
//! │  │ bin/idle │ │bin/forker│ │ bin/exec │ │   Any Program    ││
//! │  │ runtime  │ │ runtime  │ │ runtime  │ │     runtime      ││
//! │  └────┬─────┘ └────┬─────┘ └────┬─────┘ └────────┬─────────┘│
//! │       │            │            │                 │          │
//! │  ═════╪════════════╪════════════╪═════════════════╪═════════ │
//! │       │  Signals ▲ │ ▼ Syscalls │                 │          │
//! │       ▼            ▼            ▼                 ▼          │
//! ├─────────────────────────────────────────────────────────────┤
//! │                      μKernel                                │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────┐   │
//! │  │   Threads    │  │  Processes   │  │    Scheduler     │   │
//! │  │ (RPC peers)  │  │ (heartbeat)  │  │ (table, queue)   │   │
//! │  └──────────────┘  └──────────────┘  └──────────────────┘   │
//! │  ┌──────────────────────────────────────────────────────┐   │
//! │  │          Coordinator (Kernel / KernelHandle)         │   │
//! │  └──────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use mukernel::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn demo() -> KernelResult<()> {
//! let provider = Arc::new(TaskProvider::new(programs::builtin()));
//! let (kernel, handle) = Kernel::new(KernelConfig::default(), provider)?;
//! tokio::spawn(kernel.run());
//!
//! let pid = handle.start(LaunchSpec::new("bin/idle").with_uid(1000)).await?;
//! handle.kill(pid).await?;
//! handle.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod exec;
pub mod kernel;
pub mod panic;
pub mod programs;
pub mod runtime;
pub mod sys;

pub use config::KernelConfig;
pub use error::{KernelError, KernelResult};
pub use kernel::{Kernel, KernelHandle, KernelStatus};

/// Kernel version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Kernel name
pub const NAME: &str = "μKernel";

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::KernelConfig;
    pub use crate::exec::{ImageStore, TaskProvider, UnitPort, UnitProvider};
    pub use crate::kernel::{Kernel, KernelHandle};
    pub use crate::programs;
    pub use crate::runtime::{ProcessRuntime, RuntimeEvent};
    pub use crate::sys::{
        LaunchSpec, ProcessId, ProcessInfo, Scheduler, SchedulerEvent, Signal, Syscall,
    };
    pub use crate::{KernelError, KernelResult};
}
