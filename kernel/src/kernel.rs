//! Kernel Coordinator
//!
//! The single task that owns the [`Scheduler`]. Every table and queue
//! mutation happens here, driven by:
//! - Commands from [`KernelHandle`]s
//! - Process events from threads and supervisors
//! - An optional periodic drain tick
//!
//! After every mutation the table invariants are checked; a violation is
//! a kernel panic and stops the coordinator.

use crate::config::KernelConfig;
use crate::exec::UnitProvider;
use crate::sys::process::{LaunchSpec, ProcessInfo};
use crate::sys::scheduler::{PidFuture, Scheduler, SchedulerEvent};
use crate::sys::ProcessId;
use crate::{panic, KernelError, KernelResult, NAME, VERSION};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{self, Interval, MissedTickBehavior};
use tracing::{debug, error, info};

/// Kernel status snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KernelStatus {
    /// Processes in the table
    pub live: usize,
    /// Processes past the handshake
    pub running: usize,
    /// Start requests waiting for admission
    pub queued: usize,
    /// Seconds since the coordinator started
    pub uptime_secs: u64,
}

enum Command {
    Start {
        launch: LaunchSpec,
        completion: oneshot::Sender<KernelResult<ProcessId>>,
    },
    Kill {
        pid: ProcessId,
        reply: oneshot::Sender<bool>,
    },
    Drain {
        reply: oneshot::Sender<usize>,
    },
    Processes {
        reply: oneshot::Sender<Vec<ProcessInfo>>,
    },
    Info {
        pid: ProcessId,
        reply: oneshot::Sender<Option<ProcessInfo>>,
    },
    Status {
        reply: oneshot::Sender<KernelStatus>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Coordinator task state
pub struct Kernel {
    config: KernelConfig,
    scheduler: Scheduler,
    commands: mpsc::UnboundedReceiver<Command>,
    start_time: Instant,
}

/// Cloneable handle to a running kernel
#[derive(Clone)]
pub struct KernelHandle {
    commands: mpsc::UnboundedSender<Command>,
    observers: broadcast::Sender<SchedulerEvent>,
}

impl Kernel {
    /// Build a kernel and its handle
    pub fn new(config: KernelConfig, provider: Arc<dyn UnitProvider>) -> KernelResult<(Self, KernelHandle)> {
        config.validate()?;

        let scheduler = Scheduler::new(&config, provider);
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let handle = KernelHandle {
            commands: commands_tx,
            observers: scheduler.observers(),
        };

        info!("Initializing {} v{}", NAME, VERSION);
        info!("  Max processes: {}", config.scheduler.max_processes);
        info!("  Max per user: {}", config.scheduler.max_user_processes);
        info!("  Heartbeat: {:?}", config.heartbeat.interval);

        let kernel = Self {
            config,
            scheduler,
            commands,
            start_time: Instant::now(),
        };
        Ok((kernel, handle))
    }

    /// Run until shutdown, every handle dropped, or a kernel panic
    pub async fn run(mut self) -> KernelResult<()> {
        let mut drain_ticker = self.config.scheduler.drain_interval.map(|period| {
            let mut ticker = time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker
        });

        info!("{} running", NAME);

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.scheduler.shutdown();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        debug!("All kernel handles dropped");
                        self.scheduler.shutdown();
                        break;
                    }
                },
                Some(event) = self.scheduler.next_event() => {
                    self.scheduler.handle_event(event);
                }
                _ = tick(&mut drain_ticker) => {
                    self.scheduler.drain();
                }
            }

            if let Err(err) = self.scheduler.check_invariants() {
                error!("Invariant violated: {}", err);
                panic::panic(&err.to_string());
                self.scheduler.shutdown();
                return Err(err);
            }
        }

        info!("{} stopped", NAME);
        Ok(())
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start { launch, completion } => {
                self.scheduler.start_with(launch, completion);
                self.scheduler.drain();
            }
            Command::Kill { pid, reply } => {
                let _ = reply.send(self.scheduler.kill(pid));
            }
            Command::Drain { reply } => {
                let _ = reply.send(self.scheduler.drain());
            }
            Command::Processes { reply } => {
                let _ = reply.send(self.scheduler.processes());
            }
            Command::Info { pid, reply } => {
                let _ = reply.send(self.scheduler.info(pid));
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
            // Handled by the run loop
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn status(&self) -> KernelStatus {
        KernelStatus {
            live: self.scheduler.len(),
            running: self.scheduler.running_count(),
            queued: self.scheduler.queue_len(),
            uptime_secs: self.start_time.elapsed().as_secs(),
        }
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

impl KernelHandle {
    /// Queue a process start
    ///
    /// The coordinator attempts admission right away; the future resolves
    /// once a drain pass admits or rejects the request.
    pub fn start(&self, launch: LaunchSpec) -> PidFuture {
        let (completion, future) = PidFuture::pair();
        // If the kernel is gone the completion is dropped and the future
        // resolves to ShuttingDown
        let _ = self.commands.send(Command::Start { launch, completion });
        future
    }

    /// Kill a process, false if it was not live
    pub async fn kill(&self, pid: ProcessId) -> KernelResult<bool> {
        self.request(|reply| Command::Kill { pid, reply }).await
    }

    /// Run a drain pass, returning the number admitted
    pub async fn drain(&self) -> KernelResult<usize> {
        self.request(|reply| Command::Drain { reply }).await
    }

    /// Snapshot of every live process
    pub async fn processes(&self) -> KernelResult<Vec<ProcessInfo>> {
        self.request(|reply| Command::Processes { reply }).await
    }

    /// Snapshot of one process
    pub async fn info(&self, pid: ProcessId) -> KernelResult<ProcessInfo> {
        self.request(|reply| Command::Info { pid, reply })
            .await?
            .ok_or(KernelError::ProcessNotFound(pid))
    }

    pub async fn status(&self) -> KernelResult<KernelStatus> {
        self.request(|reply| Command::Status { reply }).await
    }

    /// Kill everything and stop the coordinator
    pub async fn shutdown(&self) -> KernelResult<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    /// Subscribe to scheduler events
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.observers.subscribe()
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> KernelResult<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .map_err(|_| KernelError::ShuttingDown)?;
        rx.await.map_err(|_| KernelError::ShuttingDown)
    }
}

impl std::fmt::Debug for KernelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelHandle")
            .field("closed", &self.commands.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::TaskProvider;
    use crate::programs;
    use crate::sys::process::ProcessState;

    fn boot(config: KernelConfig) -> (KernelHandle, tokio::task::JoinHandle<KernelResult<()>>) {
        let provider = Arc::new(TaskProvider::new(programs::builtin()));
        let (kernel, handle) = Kernel::new(config, provider).unwrap();
        (handle, tokio::spawn(kernel.run()))
    }

    async fn wait_for(events: &mut broadcast::Receiver<SchedulerEvent>, wanted: impl Fn(&SchedulerEvent) -> bool) {
        loop {
            let event = events.recv().await.unwrap();
            if wanted(&event) {
                return;
            }
        }
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let provider = Arc::new(TaskProvider::new(programs::builtin()));
        let config = KernelConfig::default().with_limits(0, 0);
        assert!(Kernel::new(config, provider).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_and_handshake() {
        let (handle, task) = boot(KernelConfig::testing());
        let mut events = handle.subscribe();

        let pid = handle.start(LaunchSpec::new("bin/idle").with_uid(1)).await.unwrap();
        wait_for(&mut events, |e| matches!(e, SchedulerEvent::HandshakeComplete { pid: p } if *p == pid)).await;

        let info = handle.info(pid).await.unwrap();
        assert_eq!(info.state, ProcessState::Running);
        assert_eq!(info.image, "bin/idle");

        let status = handle.status().await.unwrap();
        assert_eq!(status.live, 1);
        assert_eq!(status.running, 1);
        assert_eq!(status.queued, 0);

        handle.shutdown().await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_kill_through_handle() {
        let (handle, task) = boot(KernelConfig::testing());

        let pid = handle.start(LaunchSpec::new("bin/idle")).await.unwrap();
        assert!(handle.kill(pid).await.unwrap());
        assert!(!handle.kill(pid).await.unwrap());
        assert_eq!(handle.info(pid).await.unwrap_err(), KernelError::ProcessNotFound(pid));

        handle.shutdown().await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_fails_requests() {
        let (handle, task) = boot(KernelConfig::testing());
        handle.shutdown().await.unwrap();
        task.await.unwrap().unwrap();

        assert_eq!(handle.start(LaunchSpec::new("bin/idle")).await.unwrap_err(), KernelError::ShuttingDown);
        assert_eq!(handle.processes().await.unwrap_err(), KernelError::ShuttingDown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_handles_stops_kernel() {
        let (handle, task) = boot(KernelConfig::testing());
        let _pid = handle.start(LaunchSpec::new("bin/idle")).await.unwrap();

        drop(handle);
        task.await.unwrap().unwrap();
    }
}
