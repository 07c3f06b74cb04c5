//! Execution Units
//!
//! An execution unit is one isolated, independently running program. The
//! kernel never shares memory with it: the only contact is a pair of
//! frame channels.
//!
//! ```text
//!   kernel side (Unit)                      program side (UnitPort)
//!   ┌──────────────────┐   Bytes frames    ┌──────────────────┐
//!   │ outbound ────────┼──────────────────►│ inbound          │
//!   │ inbound  ◄───────┼───────────────────┤ outbound         │
//!   │ handle (abort)   │ Message | Fault   │                  │
//!   └──────────────────┘                   └──────────────────┘
//! ```
//!
//! [`TaskProvider`] runs each unit as a tokio task on the multi-threaded
//! runtime, loading the program from an [`ImageStore`].

pub mod image;

pub use image::{ImageStore, Program, ProgramFuture};

use crate::{KernelError, KernelResult};
use bytes::Bytes;
use std::any::Any;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, trace};

/// Event delivered from a unit to the kernel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitEvent {
    /// Raw frame sent by the program
    Message(Bytes),
    /// Unrecoverable fault inside the unit
    Fault(String),
}

/// Kernel side of an execution unit
#[derive(Debug)]
pub struct Unit {
    outbound: mpsc::UnboundedSender<Bytes>,
    inbound: mpsc::UnboundedReceiver<UnitEvent>,
    handle: UnitHandle,
}

impl Unit {
    /// Attach a task that must be stopped when the unit is terminated
    pub fn adopt(&mut self, task: AbortHandle) {
        self.handle.tasks.push(task);
    }

    /// Split into sender, receiver and termination handle
    pub fn into_parts(self) -> (mpsc::UnboundedSender<Bytes>, mpsc::UnboundedReceiver<UnitEvent>, UnitHandle) {
        (self.outbound, self.inbound, self.handle)
    }
}

/// Termination handle for a unit's tasks
#[derive(Debug, Default)]
pub struct UnitHandle {
    tasks: Vec<AbortHandle>,
}

impl UnitHandle {
    /// Stop the unit immediately
    pub fn terminate(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Program side of an execution unit
#[derive(Debug)]
pub struct UnitPort {
    inbound: mpsc::UnboundedReceiver<Bytes>,
    outbound: mpsc::UnboundedSender<UnitEvent>,
}

impl UnitPort {
    /// Wait for the next frame from the kernel
    ///
    /// Returns `None` once the kernel side is gone.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.inbound.recv().await
    }

    /// Send a frame to the kernel
    pub fn send(&self, frame: Bytes) -> KernelResult<()> {
        self.outbound
            .send(UnitEvent::Message(frame))
            .map_err(|_| KernelError::ThreadTerminated)
    }

    /// Report an unrecoverable fault
    pub fn fault(&self, reason: impl Into<String>) {
        let _ = self.outbound.send(UnitEvent::Fault(reason.into()));
    }
}

/// Create a connected unit/port pair
pub fn channel() -> (Unit, UnitPort) {
    let (to_unit, from_kernel) = mpsc::unbounded_channel();
    let (to_kernel, from_unit) = mpsc::unbounded_channel();

    let unit = Unit {
        outbound: to_unit,
        inbound: from_unit,
        handle: UnitHandle::default(),
    };
    let port = UnitPort {
        inbound: from_kernel,
        outbound: to_kernel,
    };

    (unit, port)
}

/// Source of execution units
pub trait UnitProvider: Send + Sync {
    /// Start a unit running `image`
    fn spawn(&self, image: &str, name: &str) -> KernelResult<Unit>;
}

/// Runs units as tokio tasks
#[derive(Debug, Clone)]
pub struct TaskProvider {
    images: ImageStore,
}

impl TaskProvider {
    /// Create a provider serving programs from `images`
    pub fn new(images: ImageStore) -> Self {
        Self { images }
    }

    /// Image store backing this provider
    pub fn images(&self) -> &ImageStore {
        &self.images
    }
}

impl UnitProvider for TaskProvider {
    fn spawn(&self, image: &str, name: &str) -> KernelResult<Unit> {
        let program = self.images
            .get(image)
            .ok_or_else(|| KernelError::ImageNotFound(image.to_string()))?;

        let (mut unit, port) = channel();
        let faults = port.outbound.clone();

        let task = tokio::spawn(program(port));
        unit.adopt(task.abort_handle());

        // The watcher turns a failed or panicked program into a fault.
        // An aborted program was terminated by the kernel and stays quiet.
        let unit_name = name.to_string();
        let watcher = tokio::spawn(async move {
            let name = unit_name;
            match task.await {
                Ok(Ok(())) => trace!("Unit {} finished", name),
                Ok(Err(err)) => {
                    let _ = faults.send(UnitEvent::Fault(err.to_string()));
                }
                Err(err) if err.is_panic() => {
                    let reason = panic_message(err.into_panic());
                    let _ = faults.send(UnitEvent::Fault(format!("{} panicked: {}", name, reason)));
                }
                Err(_) => trace!("Unit {} aborted", name),
            }
        });
        unit.adopt(watcher.abort_handle());

        debug!("Spawned unit {} from {}", name, image);
        Ok(unit)
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(text: &'static str) -> Bytes {
        Bytes::from_static(text.as_bytes())
    }

    #[tokio::test]
    async fn test_channel_pair() {
        let (unit, mut port) = channel();
        let (tx, mut rx, _handle) = unit.into_parts();

        tx.send(frame("ping")).unwrap();
        assert_eq!(port.recv().await.unwrap(), frame("ping"));

        port.send(frame("pong")).unwrap();
        assert_eq!(rx.recv().await.unwrap(), UnitEvent::Message(frame("pong")));

        port.fault("boom");
        assert_eq!(rx.recv().await.unwrap(), UnitEvent::Fault("boom".into()));
    }

    #[tokio::test]
    async fn test_unknown_image() {
        let provider = TaskProvider::new(ImageStore::new());
        let err = provider.spawn("bin/nope", "nope").unwrap_err();
        assert_eq!(err, KernelError::ImageNotFound("bin/nope".into()));
    }

    #[tokio::test]
    async fn test_failed_program_reports_fault() {
        let mut images = ImageStore::new();
        images.register("bin/fail", |_port| async move {
            Err(KernelError::ExecutionFault("exploded".into()))
        });
        let provider = TaskProvider::new(images);

        let unit = provider.spawn("bin/fail", "fail").unwrap();
        let (_tx, mut rx, _handle) = unit.into_parts();

        match rx.recv().await {
            Some(UnitEvent::Fault(reason)) => assert!(reason.contains("exploded")),
            other => panic!("expected fault, got {:?}", other),
        }
    }

    #[tokio::test]
    #[allow(unreachable_code)]
    async fn test_panicking_program_reports_fault() {
        let mut images = ImageStore::new();
        images.register("bin/panic", |_port| async move {
            panic!("kaboom");
            Ok(())
        });
        let provider = TaskProvider::new(images);

        let unit = provider.spawn("bin/panic", "panic").unwrap();
        let (_tx, mut rx, _handle) = unit.into_parts();

        match rx.recv().await {
            Some(UnitEvent::Fault(reason)) => assert!(reason.contains("kaboom")),
            other => panic!("expected fault, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_terminate_is_silent() {
        let mut images = ImageStore::new();
        images.register("bin/wait", |mut port| async move {
            while port.recv().await.is_some() {}
            Ok(())
        });
        let provider = TaskProvider::new(images);

        let unit = provider.spawn("bin/wait", "wait").unwrap();
        let (_tx, mut rx, handle) = unit.into_parts();
        handle.terminate();

        // Both tasks are gone, so the event stream just ends
        assert!(rx.recv().await.is_none());
    }
}
