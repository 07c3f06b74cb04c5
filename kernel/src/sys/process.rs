//! Process Management
//!
//! A process is a thread plus everything the scheduler needs to supervise
//! it: launch parameters, parent/child links and liveness.
//!
//! # Lifecycle
//!
//! ```text
//!   spawn ──INIT──► Handshaking ──Syscall::Init──► Alive ◄──┐
//!                        │                           │      │ HEARTBEAT ack
//!                        │ other tag                 ▼      │
//!                        └──► mismatch            Pending ──┘
//!                                                    │ next tick, no ack
//!                                                    ▼
//!                                                 TimedOut
//! ```
//!
//! The supervisor task never tears anything down itself. It reports to the
//! coordinator through [`KernelEvent`]s and the scheduler decides.

use crate::exec::UnitProvider;
use crate::KernelResult;
use super::message::{MessageId, ProcessMessage};
use super::syscall::{
    to_data, InitPayload, NewPpidPayload, Signal, Syscall,
    HEARTBEAT_GRACE_PERIOD, HEARTBEAT_INTERVAL,
};
use super::thread::{Reply, Thread, ThreadHandler, ThreadInfo, ThreadLink};
use super::ProcessId;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

/// Parameters a process is started with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Image URI
    pub image: String,
    /// Display name
    pub name: String,
    /// Requested parent
    pub ppid: ProcessId,
    /// User ID
    pub uid: u32,
    /// Group ID
    pub gid: u32,
    /// Environment
    pub env: BTreeMap<String, String>,
    /// Arguments
    pub args: Vec<String>,
}

impl LaunchSpec {
    /// Launch `image` as root with no parent
    pub fn new(image: impl Into<String>) -> Self {
        let image = image.into();
        Self {
            name: image.clone(),
            image,
            ppid: 0,
            uid: 0,
            gid: 0,
            env: BTreeMap::new(),
            args: Vec::new(),
        }
    }

    /// Display name, defaults to the image URI
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Parent to link to on admission
    pub fn with_ppid(mut self, ppid: ProcessId) -> Self {
        self.ppid = ppid;
        self
    }

    /// Run as `uid`, with the group set to the same ID
    pub fn with_uid(mut self, uid: u32) -> Self {
        self.uid = uid;
        self.gid = uid;
        self
    }

    /// Override the group ID
    pub fn with_gid(mut self, gid: u32) -> Self {
        self.gid = gid;
        self
    }

    /// Add an environment variable
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Replace the argument list
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

/// Scheduler-visible process state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// In the table, handshake not yet complete
    Admitted,
    /// Handshake complete
    Running,
}

/// Liveness as seen by the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatState {
    /// Waiting for the INIT reply
    Handshaking,
    /// Last heartbeat acknowledged
    Alive,
    /// Heartbeat sent, no reply yet
    Pending,
    /// A heartbeat went unanswered for a whole interval
    TimedOut,
}

/// Heartbeat timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatTiming {
    /// Period between ticks
    pub interval: Duration,
    /// Delay before the first tick
    pub grace_period: Duration,
}

impl Default for HeartbeatTiming {
    fn default() -> Self {
        Self {
            interval: HEARTBEAT_INTERVAL,
            grace_period: HEARTBEAT_GRACE_PERIOD,
        }
    }
}

/// What happened to a process
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessEvent {
    /// INIT handshake acknowledged
    Ready,
    /// INIT answered with the wrong syscall
    HandshakeMismatch(Syscall),
    /// Heartbeat acknowledged
    HeartbeatAcked,
    /// Heartbeat unanswered for a full interval
    HeartbeatTimeout,
    /// Execution unit crashed
    Fault(String),
    /// Frame could not be decoded
    Malformed(String),
    /// Unsolicited syscall
    Syscall(ProcessMessage),
}

/// Event routed to the coordinator
///
/// `instance` identifies one admission of `pid`, so events from a killed
/// process are recognisable after the pid is reused.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelEvent {
    pub pid: ProcessId,
    pub instance: u64,
    pub kind: ProcessEvent,
}

/// Forwards thread callbacks to the coordinator
struct EventForwarder {
    pid: ProcessId,
    instance: u64,
    events: mpsc::UnboundedSender<KernelEvent>,
}

impl EventForwarder {
    fn send(&self, kind: ProcessEvent) {
        let _ = self.events.send(KernelEvent {
            pid: self.pid,
            instance: self.instance,
            kind,
        });
    }
}

impl ThreadHandler for EventForwarder {
    fn on_message(&self, message: ProcessMessage) {
        self.send(ProcessEvent::Syscall(message));
    }

    fn on_fatal_error(&self, error: String) {
        self.send(ProcessEvent::Fault(error));
    }

    fn on_malformed_message(&self, frame: Bytes, error: String) {
        trace!("Pid {} sent {} undecodable bytes", self.pid, frame.len());
        self.send(ProcessEvent::Malformed(error));
    }
}

/// Parent waiting for a forked child to come up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForkNotice {
    pub parent: ProcessId,
    pub parent_instance: u64,
    /// Identifier of the parent's FORK syscall
    pub reply_to: MessageId,
}

/// Snapshot of a live process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: ProcessId,
    pub ppid: ProcessId,
    pub uid: u32,
    pub gid: u32,
    pub name: String,
    pub image: String,
    pub state: ProcessState,
    pub heartbeat: HeartbeatState,
    pub children: Vec<ProcessId>,
}

/// Supervised process
#[derive(Debug)]
pub struct Process {
    thread: Thread,
    launch: LaunchSpec,
    instance: u64,
    state: ProcessState,
    heartbeat: Arc<Mutex<HeartbeatState>>,
    children: BTreeSet<ProcessId>,
    fork_notice: Option<ForkNotice>,
    deferred: Vec<ProcessMessage>,
    supervisor: JoinHandle<()>,
}

impl Process {
    /// Start `launch` as `pid` and begin the INIT handshake
    pub fn spawn(
        provider: &dyn UnitProvider,
        launch: LaunchSpec,
        pid: ProcessId,
        instance: u64,
        timing: HeartbeatTiming,
        events: mpsc::UnboundedSender<KernelEvent>,
    ) -> KernelResult<Self> {
        let info = ThreadInfo {
            name: launch.name.clone(),
            ppid: launch.ppid,
            pid,
            uid: launch.uid,
            gid: launch.gid,
        };
        let forwarder = Arc::new(EventForwarder {
            pid,
            instance,
            events: events.clone(),
        });
        let thread = Thread::spawn(provider, &launch.image, info, forwarder)?;

        let init = InitPayload {
            ppid: launch.ppid,
            pid,
            uid: launch.uid,
            gid: launch.gid,
            env: launch.env.clone(),
            args: launch.args.clone(),
        };
        // Dropping the thread on error stops the unit
        let handshake = thread.send_request(Signal::Init, to_data(&init)?, None)?;

        let heartbeat = Arc::new(Mutex::new(HeartbeatState::Handshaking));
        let supervisor = tokio::spawn(supervise(
            handshake,
            thread.link().clone(),
            heartbeat.clone(),
            timing,
            EventForwarder { pid, instance, events },
        ));

        debug!("Process {} ({}) sent INIT", pid, launch.name);

        Ok(Self {
            thread,
            launch,
            instance,
            state: ProcessState::Admitted,
            heartbeat,
            children: BTreeSet::new(),
            fork_notice: None,
            deferred: Vec::new(),
            supervisor,
        })
    }

    /// Process ID
    pub fn pid(&self) -> ProcessId {
        self.thread.pid()
    }

    /// Parent process ID, 0 for orphans
    pub fn ppid(&self) -> ProcessId {
        self.thread.ppid()
    }

    /// User ID
    pub fn uid(&self) -> u32 {
        self.thread.uid()
    }

    /// Group ID
    pub fn gid(&self) -> u32 {
        self.thread.gid()
    }

    /// Display name
    pub fn name(&self) -> &str {
        self.thread.name()
    }

    /// Image URI currently running
    pub fn image(&self) -> &str {
        &self.launch.image
    }

    /// Admission instance number
    pub fn instance(&self) -> u64 {
        self.instance
    }

    /// Parameters the process runs with, ppid kept current
    pub fn launch(&self) -> &LaunchSpec {
        &self.launch
    }

    /// Admitted until the handshake completes
    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// Current heartbeat state
    pub fn heartbeat(&self) -> HeartbeatState {
        *self.heartbeat.lock()
    }

    /// Child PIDs
    pub fn children(&self) -> &BTreeSet<ProcessId> {
        &self.children
    }

    pub(crate) fn add_child(&mut self, pid: ProcessId) {
        self.children.insert(pid);
    }

    pub(crate) fn remove_child(&mut self, pid: ProcessId) {
        self.children.remove(&pid);
    }

    pub(crate) fn take_children(&mut self) -> BTreeSet<ProcessId> {
        std::mem::take(&mut self.children)
    }

    pub(crate) fn mark_running(&mut self) {
        self.state = ProcessState::Running;
    }

    pub(crate) fn set_fork_notice(&mut self, notice: ForkNotice) {
        self.fork_notice = Some(notice);
    }

    pub(crate) fn take_fork_notice(&mut self) -> Option<ForkNotice> {
        self.fork_notice.take()
    }

    /// Hold a syscall that overtook the handshake
    pub(crate) fn defer_syscall(&mut self, message: ProcessMessage) {
        self.deferred.push(message);
    }

    pub(crate) fn take_deferred(&mut self) -> Vec<ProcessMessage> {
        std::mem::take(&mut self.deferred)
    }

    /// Reassign the parent and tell the process
    pub fn set_parent(&mut self, ppid: ProcessId) -> KernelResult<()> {
        self.thread.set_ppid(ppid);
        self.launch.ppid = ppid;
        self.notify(Signal::NewPpid, to_data(&NewPpidPayload { ppid })?)
    }

    /// Answer a request the process sent
    pub fn reply(&self, identifier: MessageId, call: Signal, data: serde_json::Value) -> KernelResult<()> {
        self.thread.send_fire_and_forget(identifier, call, data)
    }

    /// Send a signal that expects no answer
    pub fn notify(&self, call: Signal, data: serde_json::Value) -> KernelResult<()> {
        let identifier = self.thread.link().next_identifier();
        self.thread.send_fire_and_forget(identifier, call, data)
    }

    /// Snapshot for introspection
    pub fn info(&self) -> ProcessInfo {
        ProcessInfo {
            pid: self.pid(),
            ppid: self.ppid(),
            uid: self.uid(),
            gid: self.gid(),
            name: self.name().to_string(),
            image: self.launch.image.clone(),
            state: self.state,
            heartbeat: self.heartbeat(),
            children: self.children.iter().copied().collect(),
        }
    }

    /// Stop supervision, then the thread
    pub fn kill(self) {
        self.supervisor.abort();
        self.thread.terminate();
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        self.supervisor.abort();
    }
}

async fn supervise(
    handshake: Reply,
    link: ThreadLink,
    heartbeat: Arc<Mutex<HeartbeatState>>,
    timing: HeartbeatTiming,
    forwarder: EventForwarder,
) {
    let pid = forwarder.pid;

    match handshake.await {
        Ok(reply) if reply.call == Syscall::Init => {
            *heartbeat.lock() = HeartbeatState::Alive;
            debug!("Process {} completed handshake", pid);
            forwarder.send(ProcessEvent::Ready);
        }
        Ok(reply) => {
            warn!("Process {} answered INIT with {:?}", pid, reply.call);
            forwarder.send(ProcessEvent::HandshakeMismatch(reply.call));
            return;
        }
        // Thread terminated while handshaking
        Err(_) => return,
    }

    let mut ticker = time::interval_at(Instant::now() + timing.grace_period, timing.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut outstanding: Option<Reply> = None;
    let mut unacked = false;

    loop {
        tokio::select! {
            // An ack that is already in beats a tick in the same poll
            biased;

            reply = next_reply(&mut outstanding) => {
                outstanding = None;
                match reply {
                    Ok(message) if message.call == Syscall::Heartbeat => {
                        unacked = false;
                        *heartbeat.lock() = HeartbeatState::Alive;
                        trace!("Process {} acknowledged heartbeat", pid);
                        forwarder.send(ProcessEvent::HeartbeatAcked);
                    }
                    Ok(message) => {
                        warn!("Process {} answered HEARTBEAT with {:?}", pid, message.call);
                    }
                    Err(_) => return,
                }
            }
            _ = ticker.tick() => {
                if unacked {
                    *heartbeat.lock() = HeartbeatState::TimedOut;
                    warn!("Process {} missed a heartbeat", pid);
                    forwarder.send(ProcessEvent::HeartbeatTimeout);
                    return;
                }

                *heartbeat.lock() = HeartbeatState::Pending;
                unacked = true;
                match link.send_request(Signal::Heartbeat, serde_json::Value::Null, None) {
                    Ok(reply) => outstanding = Some(reply),
                    // Counted as unacknowledged; the next tick times out
                    Err(err) => trace!("Heartbeat to {} not sent: {}", pid, err),
                }
            }
        }
    }
}

/// Wait on the outstanding heartbeat, or forever if there is none
async fn next_reply(outstanding: &mut Option<Reply>) -> KernelResult<ProcessMessage> {
    match outstanding {
        Some(reply) => reply.await,
        None => std::future::pending().await,
    }
}
