//! Process Scheduler
//!
//! Owns the process table and the queue of pending start requests.
//!
//! # Admission
//!
//! `start()` only queues. A later [`Scheduler::drain`] pass admits what
//! fits:
//! - The table never holds more than `max_processes` entries
//! - A non-root uid never holds more than `max_user_processes`
//! - A refused request goes back to the tail of the queue
//!
//! A refused request is not retried within the same pass, so a uid at its
//! limit can hold up nothing but itself. A request behind it may still be
//! admitted first.
//!
//! # Teardown
//!
//! Every way a process ends (kill request, EXIT, handshake mismatch,
//! missed heartbeat, execution fault) goes through one kill path that
//! unlinks the entry, reparents its children to PID 0, and only then
//! stops the process.

use crate::config::{KernelConfig, SchedulerConfig};
use crate::exec::UnitProvider;
use crate::{KernelError, KernelResult};
use super::message::{MessageId, ProcessMessage};
use super::process::{
    ForkNotice, HeartbeatTiming, KernelEvent, LaunchSpec, Process, ProcessEvent, ProcessInfo,
    ProcessState,
};
use super::syscall::{
    to_data, ErrorCode, ErrorPayload, ExecPayload, ExitPayload, ForkedPayload, Signal, Syscall,
};
use super::ProcessId;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, trace, warn};

/// Maximum number of processes
pub const MAX_PROCESSES: usize = 200;

/// Maximum number of processes per non-root user
pub const MAX_USER_PROCESSES: usize = 20;

/// Why a process was killed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KillReason {
    /// Explicit kill request
    Requested,
    /// Process called EXIT
    Exited(i32),
    /// Heartbeat went unanswered
    HeartbeatTimeout,
    /// Execution unit crashed
    ExecutionFault(String),
    /// INIT answered with the wrong syscall
    HandshakeMismatch(Syscall),
    /// Kernel shutting down
    Shutdown,
}

/// Observable scheduler activity
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    /// Start request admitted
    Admitted { pid: ProcessId, uid: u32, image: String },
    /// Start request failed for good
    Rejected { uid: u32, error: KernelError },
    /// INIT handshake acknowledged
    HandshakeComplete { pid: ProcessId },
    /// Heartbeat acknowledged
    HeartbeatAcked { pid: ProcessId },
    /// Heartbeat missed, a kill follows
    HeartbeatMissed { pid: ProcessId },
    /// Process removed from the table
    Killed { pid: ProcessId, reason: KillReason },
    /// Process called EXIT, a kill follows
    Exited { pid: ProcessId, code: i32 },
    /// Process lost its parent
    Reparented { pid: ProcessId, ppid: ProcessId },
    /// Process replaced its image
    Exec { pid: ProcessId, image: String },
    /// Process sent an undecodable frame
    MalformedMessage { pid: ProcessId, error: String },
}

/// Who is waiting on a start request
#[derive(Debug)]
enum Completion {
    /// External caller holding a [`PidFuture`]
    Caller(oneshot::Sender<KernelResult<ProcessId>>),
    /// Parent that issued FORK
    Fork(ForkNotice),
}

/// Queued start request
#[derive(Debug)]
pub struct StartRequest {
    launch: LaunchSpec,
    completion: Completion,
}

impl StartRequest {
    /// Requesting user
    pub fn uid(&self) -> u32 {
        self.launch.uid
    }

    /// Launch parameters
    pub fn launch(&self) -> &LaunchSpec {
        &self.launch
    }
}

/// Resolves to the PID once a start request is admitted
#[derive(Debug)]
pub struct PidFuture {
    rx: oneshot::Receiver<KernelResult<ProcessId>>,
}

impl PidFuture {
    /// Create a future with its completion side
    pub fn pair() -> (oneshot::Sender<KernelResult<ProcessId>>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    /// Take the result if the request has been processed
    pub fn try_pid(&mut self) -> Option<KernelResult<ProcessId>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(KernelError::ShuttingDown)),
        }
    }
}

impl Future for PidFuture {
    type Output = KernelResult<ProcessId>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|result| match result {
            Ok(result) => result,
            Err(_) => Err(KernelError::ShuttingDown),
        })
    }
}

/// Process scheduler
pub struct Scheduler {
    config: SchedulerConfig,
    timing: HeartbeatTiming,
    provider: Arc<dyn UnitProvider>,
    /// Process table
    table: HashMap<ProcessId, Process>,
    /// Pending start requests
    queue: VecDeque<StartRequest>,
    /// Next PID slot to probe
    pid_cursor: usize,
    next_instance: u64,
    events_tx: mpsc::UnboundedSender<KernelEvent>,
    events_rx: mpsc::UnboundedReceiver<KernelEvent>,
    observers: broadcast::Sender<SchedulerEvent>,
}

impl Scheduler {
    /// Create a scheduler spawning units from `provider`
    pub fn new(config: &KernelConfig, provider: Arc<dyn UnitProvider>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (observers, _) = broadcast::channel(config.event_capacity.max(1));

        Self {
            config: config.scheduler.clone(),
            timing: config.heartbeat.timing(),
            provider,
            table: HashMap::new(),
            queue: VecDeque::new(),
            pid_cursor: 0,
            next_instance: 1,
            events_tx,
            events_rx,
            observers,
        }
    }

    /// Subscribe to scheduler events
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.observers.subscribe()
    }

    /// Sender side of the event stream, for handing out subscriptions
    pub fn observers(&self) -> broadcast::Sender<SchedulerEvent> {
        self.observers.clone()
    }

    /// Queue a start request
    pub fn start(&mut self, launch: LaunchSpec) -> PidFuture {
        let (tx, future) = PidFuture::pair();
        self.start_with(launch, tx);
        future
    }

    /// Queue a start request whose [`PidFuture`] was created elsewhere
    pub fn start_with(&mut self, launch: LaunchSpec, completion: oneshot::Sender<KernelResult<ProcessId>>) {
        debug!("Queued {} for uid {}", launch.image, launch.uid);
        self.queue.push_back(StartRequest {
            launch,
            completion: Completion::Caller(completion),
        });
    }

    /// Admit queued requests
    ///
    /// Looks at each request queued at entry at most once. Returns the
    /// number admitted.
    pub fn drain(&mut self) -> usize {
        let pending = self.queue.len();
        let mut admitted = 0;

        for _ in 0..pending {
            if self.table.len() >= self.config.max_processes {
                break;
            }
            let Some(request) = self.queue.pop_front() else {
                break;
            };

            if let Err(err) = self.check_admission(request.uid()) {
                trace!("Requeued {}: {}", request.launch.image, err);
                self.queue.push_back(request);
                continue;
            }

            match self.allocate_pid() {
                Ok(pid) => {
                    if self.admit(pid, request) {
                        admitted += 1;
                    }
                }
                Err(err) => self.reject(request, err),
            }
        }

        if pending > 0 {
            debug!("Drain admitted {} of {}, {} queued", admitted, pending, self.queue.len());
        }
        admitted
    }

    /// Check the table and per-user limits for `uid`
    pub fn check_admission(&self, uid: u32) -> KernelResult<()> {
        if self.table.len() >= self.config.max_processes {
            return Err(KernelError::AdmissionDenied {
                uid,
                reason: "process table full".into(),
            });
        }

        if uid != 0 && self.user_count(uid) >= self.config.max_user_processes {
            return Err(KernelError::AdmissionDenied {
                uid,
                reason: format!("user limit of {} reached", self.config.max_user_processes),
            });
        }

        Ok(())
    }

    /// Probe for a free PID, cycling from the last allocation
    fn allocate_pid(&mut self) -> KernelResult<ProcessId> {
        let max = self.config.max_processes;

        for _ in 0..self.config.pid_probe_budget {
            let candidate = self.pid_cursor % max;
            self.pid_cursor = (candidate + 1) % max;

            let pid = candidate as ProcessId;
            if !self.table.contains_key(&pid) {
                return Ok(pid);
            }
        }

        Err(KernelError::AllocationExhausted {
            budget: self.config.pid_probe_budget,
        })
    }

    fn next_instance(&mut self) -> u64 {
        let instance = self.next_instance;
        self.next_instance += 1;
        instance
    }

    /// Spawn the process for `request` under `pid`
    fn admit(&mut self, pid: ProcessId, request: StartRequest) -> bool {
        let StartRequest { mut launch, completion } = request;

        // A parent that is gone (or is this very slot) leaves an orphan. A
        // fork only counts the instance that asked for it.
        let parent_live = match &completion {
            Completion::Fork(notice) => self.is_instance(notice.parent, notice.parent_instance),
            Completion::Caller(_) => self.table.contains_key(&launch.ppid),
        };
        let parent = (launch.ppid != pid && parent_live).then_some(launch.ppid);
        if parent.is_none() {
            launch.ppid = 0;
        }

        let uid = launch.uid;
        let image = launch.image.clone();
        let instance = self.next_instance();

        let mut process = match Process::spawn(
            self.provider.as_ref(),
            launch,
            pid,
            instance,
            self.timing,
            self.events_tx.clone(),
        ) {
            Ok(process) => process,
            Err(err) => {
                self.fail(uid, completion, err);
                return false;
            }
        };

        if let Some(ppid) = parent {
            if let Some(parent) = self.table.get_mut(&ppid) {
                parent.add_child(pid);
            }
        }

        match completion {
            Completion::Caller(tx) => {
                let _ = tx.send(Ok(pid));
            }
            // The parent hears about it once the child is up
            Completion::Fork(notice) => process.set_fork_notice(notice),
        }

        info!("Admitted {} as pid {} (uid {})", image, pid, uid);
        self.table.insert(pid, process);
        self.emit(SchedulerEvent::Admitted { pid, uid, image });
        true
    }

    fn reject(&mut self, request: StartRequest, err: KernelError) {
        warn!("Rejected {}: {}", request.launch.image, err);
        self.fail(request.uid(), request.completion, err);
    }

    fn fail(&mut self, uid: u32, completion: Completion, err: KernelError) {
        match completion {
            Completion::Caller(tx) => {
                let _ = tx.send(Err(err.clone()));
            }
            Completion::Fork(notice) => {
                if self.is_instance(notice.parent, notice.parent_instance) {
                    self.send_error(notice.parent, notice.reply_to, err.code());
                }
            }
        }
        self.emit(SchedulerEvent::Rejected { uid, error: err });
    }

    /// Kill a process
    ///
    /// Returns false if `pid` is not live.
    pub fn kill(&mut self, pid: ProcessId) -> bool {
        self.kill_with_reason(pid, KillReason::Requested)
    }

    /// Kill a process, recording why
    pub fn kill_with_reason(&mut self, pid: ProcessId, reason: KillReason) -> bool {
        let Some(mut process) = self.table.remove(&pid) else {
            return false;
        };

        let ppid = process.ppid();
        if ppid != pid {
            if let Some(parent) = self.table.get_mut(&ppid) {
                parent.remove_child(pid);
            }
        }

        let mut adopted = Vec::new();
        for child in process.take_children() {
            let Some(orphan) = self.table.get_mut(&child) else {
                continue;
            };
            if let Err(err) = orphan.set_parent(0) {
                trace!("NEWPPID to {} not delivered: {}", child, err);
            }
            if child != 0 {
                adopted.push(child);
            }
            self.emit(SchedulerEvent::Reparented { pid: child, ppid: 0 });
        }
        if let Some(init) = self.table.get_mut(&0) {
            for child in adopted {
                init.add_child(child);
            }
        }

        process.kill();
        info!("Killed pid {} ({:?})", pid, reason);
        self.emit(SchedulerEvent::Killed { pid, reason });

        if self.config.drain_on_kill {
            self.drain();
        }
        true
    }

    /// Kill everything and fail every queued request
    pub fn shutdown(&mut self) {
        for request in self.queue.drain(..) {
            if let Completion::Caller(tx) = request.completion {
                let _ = tx.send(Err(KernelError::ShuttingDown));
            }
        }

        let mut pids: Vec<_> = self.table.keys().copied().collect();
        pids.sort_unstable();
        for pid in pids {
            self.kill_with_reason(pid, KillReason::Shutdown);
        }
    }

    /// Wait for the next process event
    pub async fn next_event(&mut self) -> Option<KernelEvent> {
        self.events_rx.recv().await
    }

    /// Wait for one process event and act on it
    pub async fn step(&mut self) {
        if let Some(event) = self.next_event().await {
            self.handle_event(event);
        }
    }

    /// Act on a process event
    pub fn handle_event(&mut self, event: KernelEvent) {
        let KernelEvent { pid, instance, kind } = event;

        if !self.is_instance(pid, instance) {
            trace!("Dropped stale event for pid {}: {:?}", pid, kind);
            return;
        }

        match kind {
            ProcessEvent::Ready => self.on_ready(pid),
            ProcessEvent::HandshakeMismatch(got) => {
                warn!("Pid {} failed handshake with {:?}", pid, got);
                self.kill_with_reason(pid, KillReason::HandshakeMismatch(got));
            }
            ProcessEvent::HeartbeatAcked => {
                self.emit(SchedulerEvent::HeartbeatAcked { pid });
            }
            ProcessEvent::HeartbeatTimeout => {
                self.emit(SchedulerEvent::HeartbeatMissed { pid });
                self.kill_with_reason(pid, KillReason::HeartbeatTimeout);
            }
            ProcessEvent::Fault(reason) => {
                warn!("Pid {} crashed: {}", pid, reason);
                self.kill_with_reason(pid, KillReason::ExecutionFault(reason));
            }
            ProcessEvent::Malformed(error) => {
                warn!("Malformed message from pid {}: {}", pid, error);
                self.emit(SchedulerEvent::MalformedMessage { pid, error });
            }
            ProcessEvent::Syscall(message) => {
                // The pump can forward a syscall before the supervisor reports Ready
                let handshaking = self.table.get(&pid).map(Process::state) == Some(ProcessState::Admitted);
                if !handshaking {
                    self.on_syscall(pid, message);
                } else if let Some(process) = self.table.get_mut(&pid) {
                    trace!("Deferred {:?} from pid {} until handshake", message.call, pid);
                    process.defer_syscall(message);
                }
            }
        }
    }

    fn on_ready(&mut self, pid: ProcessId) {
        let Some(process) = self.table.get_mut(&pid) else {
            return;
        };
        process.mark_running();
        let instance = process.instance();
        let notice = process.take_fork_notice();
        let deferred = process.take_deferred();
        self.emit(SchedulerEvent::HandshakeComplete { pid });

        if let Some(notice) = notice {
            self.answer_fork(pid, notice);
        }

        for message in deferred {
            // An earlier EXEC or EXIT replaced or removed this instance
            if !self.is_instance(pid, instance) {
                debug!("Dropped deferred {:?} from pid {}", message.call, pid);
                continue;
            }
            self.on_syscall(pid, message);
        }
    }

    /// Tell both sides of a fork that the child is up
    fn answer_fork(&self, pid: ProcessId, notice: ForkNotice) {
        if self.is_instance(notice.parent, notice.parent_instance) {
            if let (Some(parent), Ok(data)) = (
                self.table.get(&notice.parent),
                to_data(&ForkedPayload::Parent { pid }),
            ) {
                if let Err(err) = parent.reply(notice.reply_to, Signal::Forked, data) {
                    trace!("FORKED to parent {} not delivered: {}", notice.parent, err);
                }
            }
        }

        if let (Some(child), Ok(data)) = (
            self.table.get(&pid),
            to_data(&ForkedPayload::Child { descriptors: Vec::new() }),
        ) {
            if let Err(err) = child.notify(Signal::Forked, data) {
                trace!("FORKED to child {} not delivered: {}", pid, err);
            }
        }
    }

    fn on_syscall(&mut self, pid: ProcessId, message: ProcessMessage) {
        debug!("Pid {} called {:?} ({})", pid, message.call, message.identifier);

        match message.call {
            Syscall::Fork => self.fork(pid, message.identifier),
            Syscall::Exec => match message.payload::<ExecPayload>() {
                Ok(payload) => self.exec(pid, message.identifier, payload),
                Err(err) => self.send_error(pid, message.identifier, err.code()),
            },
            Syscall::Exit => match message.payload::<ExitPayload>() {
                Ok(ExitPayload { code }) => {
                    info!("Pid {} exited with {}", pid, code);
                    self.emit(SchedulerEvent::Exited { pid, code });
                    self.kill_with_reason(pid, KillReason::Exited(code));
                }
                Err(err) => self.send_error(pid, message.identifier, err.code()),
            },
            // Late or duplicate replies to requests no longer pending
            Syscall::Init | Syscall::Heartbeat => {
                debug!("Ignored unsolicited {:?} from pid {}", message.call, pid);
            }
        }
    }

    /// Queue a copy of `pid` as its child
    fn fork(&mut self, pid: ProcessId, reply_to: MessageId) {
        let Some(parent) = self.table.get(&pid) else {
            return;
        };

        let launch = parent.launch().clone().with_ppid(pid);
        let notice = ForkNotice {
            parent: pid,
            parent_instance: parent.instance(),
            reply_to,
        };
        self.queue.push_back(StartRequest {
            launch,
            completion: Completion::Fork(notice),
        });
        self.drain();
    }

    /// Replace the image running under `pid`
    fn exec(&mut self, pid: ProcessId, identifier: MessageId, payload: ExecPayload) {
        let Some(current) = self.table.get(&pid) else {
            return;
        };

        let mut launch = current.launch().clone();
        launch.name = payload.image.clone();
        launch.image = payload.image;
        if let Some(args) = payload.args {
            launch.args = args;
        }
        let image = launch.image.clone();
        let instance = self.next_instance();

        let mut replacement = match Process::spawn(
            self.provider.as_ref(),
            launch,
            pid,
            instance,
            self.timing,
            self.events_tx.clone(),
        ) {
            Ok(process) => process,
            Err(err) => {
                warn!("Exec of {} by pid {} failed: {}", image, pid, err);
                self.send_error(pid, identifier, err.code());
                return;
            }
        };

        if let Some(mut previous) = self.table.remove(&pid) {
            for child in previous.take_children() {
                replacement.add_child(child);
            }
            if let Some(notice) = previous.take_fork_notice() {
                replacement.set_fork_notice(notice);
            }
            previous.kill();
        }
        self.table.insert(pid, replacement);

        info!("Pid {} exec'd {}", pid, image);
        self.emit(SchedulerEvent::Exec { pid, image });
    }

    fn send_error(&self, pid: ProcessId, identifier: MessageId, code: ErrorCode) {
        let Some(process) = self.table.get(&pid) else {
            return;
        };
        let sent = to_data(&ErrorPayload { code })
            .and_then(|data| process.reply(identifier, Signal::Error, data));
        if let Err(err) = sent {
            trace!("ERROR to pid {} not delivered: {}", pid, err);
        }
    }

    fn is_instance(&self, pid: ProcessId, instance: u64) -> bool {
        self.table.get(&pid).map(Process::instance) == Some(instance)
    }

    fn emit(&self, event: SchedulerEvent) {
        // No subscribers is fine
        let _ = self.observers.send(event);
    }

    /// Live processes of `uid`
    pub fn user_count(&self, uid: u32) -> usize {
        self.table.values().filter(|p| p.uid() == uid).count()
    }

    /// Number of live processes
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// No live processes
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Number of queued start requests
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Whether `pid` is live
    pub fn contains(&self, pid: ProcessId) -> bool {
        self.table.contains_key(&pid)
    }

    /// Live process by PID
    pub fn get(&self, pid: ProcessId) -> Option<&Process> {
        self.table.get(&pid)
    }

    /// Snapshot of one process
    pub fn info(&self, pid: ProcessId) -> Option<ProcessInfo> {
        self.table.get(&pid).map(Process::info)
    }

    /// Snapshot of every process, ordered by PID
    pub fn processes(&self) -> Vec<ProcessInfo> {
        let mut list: Vec<_> = self.table.values().map(Process::info).collect();
        list.sort_by_key(|info| info.pid);
        list
    }

    /// Number of processes that completed the handshake
    pub fn running_count(&self) -> usize {
        self.table
            .values()
            .filter(|p| p.state() == ProcessState::Running)
            .count()
    }

    /// Verify the table invariants
    pub fn check_invariants(&self) -> KernelResult<()> {
        let max = self.config.max_processes;

        if self.table.len() > max {
            return Err(KernelError::KernelPanic(format!(
                "process table holds {} entries, limit {}", self.table.len(), max
            )));
        }

        let mut per_user: HashMap<u32, usize> = HashMap::new();
        for (&pid, process) in &self.table {
            if process.pid() != pid || pid as usize >= max {
                return Err(KernelError::KernelPanic(format!(
                    "pid {} stored under slot {}", process.pid(), pid
                )));
            }

            if process.uid() != 0 {
                *per_user.entry(process.uid()).or_default() += 1;
            }

            for child in process.children() {
                match self.table.get(child) {
                    Some(c) if c.ppid() == pid => {}
                    _ => {
                        return Err(KernelError::KernelPanic(format!(
                            "pid {} lists {} as a child", pid, child
                        )));
                    }
                }
            }
        }

        if let Some((uid, count)) = per_user
            .into_iter()
            .find(|&(_, count)| count > self.config.max_user_processes)
        {
            return Err(KernelError::KernelPanic(format!(
                "uid {} holds {} processes, limit {}", uid, count, self.config.max_user_processes
            )));
        }

        Ok(())
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("processes", &self.table.len())
            .field("queued", &self.queue.len())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::{ImageStore, TaskProvider};

    /// Units that never answer INIT, enough to exercise admission
    fn silent_scheduler(max_processes: usize, max_user_processes: usize) -> Scheduler {
        let mut images = ImageStore::new();
        images.register("bin/silent", |mut port| async move {
            while port.recv().await.is_some() {}
            Ok(())
        });
        let config = KernelConfig::testing().with_limits(max_processes, max_user_processes);
        Scheduler::new(&config, Arc::new(TaskProvider::new(images)))
    }

    fn silent(uid: u32) -> LaunchSpec {
        LaunchSpec::new("bin/silent").with_uid(uid)
    }

    #[tokio::test]
    async fn test_start_only_queues() {
        let mut scheduler = silent_scheduler(4, 4);
        let mut pid = scheduler.start(silent(1));

        assert_eq!(scheduler.queue_len(), 1);
        assert!(pid.try_pid().is_none());

        assert_eq!(scheduler.drain(), 1);
        assert_eq!(pid.await.unwrap(), 0);
        assert_eq!(scheduler.queue_len(), 0);
        assert_eq!(scheduler.info(0).unwrap().state, ProcessState::Admitted);
    }

    #[tokio::test]
    async fn test_pids_are_distinct_and_cyclic() {
        let mut scheduler = silent_scheduler(3, 3);
        let futures: Vec<_> = (0..3).map(|_| scheduler.start(silent(1))).collect();
        scheduler.drain();

        let mut pids = Vec::new();
        for future in futures {
            pids.push(future.await.unwrap());
        }
        assert_eq!(pids, vec![0, 1, 2]);

        // The cursor wrapped around, so the freed slot is found again
        assert!(scheduler.kill(1));
        let pid = scheduler.start(silent(1));
        scheduler.drain();
        assert_eq!(pid.await.unwrap(), 1);
        assert!(scheduler.check_invariants().is_ok());
    }

    #[tokio::test]
    async fn test_root_exempt_from_user_limit() {
        let mut scheduler = silent_scheduler(5, 1);
        let futures: Vec<_> = (0..3).map(|_| scheduler.start(silent(0))).collect();
        scheduler.drain();

        for future in futures {
            assert!(future.await.is_ok());
        }
        assert_eq!(scheduler.user_count(0), 3);
    }

    #[tokio::test]
    async fn test_table_full_stops_drain() {
        let mut scheduler = silent_scheduler(2, 5);
        let _a = scheduler.start(silent(0));
        let _b = scheduler.start(silent(0));
        let mut c = scheduler.start(silent(0));

        assert_eq!(scheduler.drain(), 2);
        assert_eq!(scheduler.len(), 2);
        assert_eq!(scheduler.queue_len(), 1);
        assert!(c.try_pid().is_none());
        assert!(matches!(
            scheduler.check_admission(0),
            Err(KernelError::AdmissionDenied { .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_image_rejected() {
        let mut scheduler = silent_scheduler(4, 4);
        let mut events = scheduler.subscribe();

        let pid = scheduler.start(LaunchSpec::new("bin/missing"));
        scheduler.drain();

        assert_eq!(pid.await.unwrap_err(), KernelError::ImageNotFound("bin/missing".into()));
        assert!(scheduler.is_empty());
        assert!(matches!(events.recv().await.unwrap(), SchedulerEvent::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_kill_links_and_reparents() {
        let mut scheduler = silent_scheduler(10, 10);
        let init = scheduler.start(silent(0));
        scheduler.drain();
        let init = init.await.unwrap();

        let parent = scheduler.start(silent(1).with_ppid(init));
        scheduler.drain();
        let parent = parent.await.unwrap();

        let c1 = scheduler.start(silent(1).with_ppid(parent));
        let c2 = scheduler.start(silent(1).with_ppid(parent));
        scheduler.drain();
        let (c1, c2) = (c1.await.unwrap(), c2.await.unwrap());

        assert_eq!(scheduler.info(parent).unwrap().children, vec![c1, c2]);
        assert!(scheduler.kill(parent));
        assert!(!scheduler.kill(parent));

        assert_eq!(scheduler.info(c1).unwrap().ppid, 0);
        assert_eq!(scheduler.info(c2).unwrap().ppid, 0);
        assert_eq!(scheduler.info(init).unwrap().children, vec![c1, c2]);
        assert!(scheduler.check_invariants().is_ok());
    }

    #[tokio::test]
    async fn test_missing_parent_leaves_orphan() {
        let mut scheduler = silent_scheduler(4, 4);
        let pid = scheduler.start(silent(1).with_ppid(3));
        scheduler.drain();

        let pid = pid.await.unwrap();
        assert_eq!(scheduler.info(pid).unwrap().ppid, 0);
    }

    #[tokio::test]
    async fn test_stale_events_ignored() {
        let mut scheduler = silent_scheduler(4, 4);
        let pid = scheduler.start(silent(1));
        scheduler.drain();
        let pid = pid.await.unwrap();
        let instance = scheduler.get(pid).unwrap().instance();

        scheduler.handle_event(KernelEvent {
            pid,
            instance: instance + 100,
            kind: ProcessEvent::Fault("old".into()),
        });
        assert!(scheduler.contains(pid));

        scheduler.handle_event(KernelEvent {
            pid,
            instance,
            kind: ProcessEvent::Fault("new".into()),
        });
        assert!(!scheduler.contains(pid));
    }

    #[tokio::test]
    async fn test_syscall_before_ready_is_deferred() {
        let mut scheduler = silent_scheduler(4, 4);
        let mut events = scheduler.subscribe();
        let pid = scheduler.start(silent(1));
        scheduler.drain();
        let pid = pid.await.unwrap();
        let instance = scheduler.get(pid).unwrap().instance();

        let exit = ProcessMessage::new(
            MessageId::process(1),
            Syscall::Exit,
            to_data(&ExitPayload { code: 3 }).unwrap(),
        );
        scheduler.handle_event(KernelEvent { pid, instance, kind: ProcessEvent::Syscall(exit) });
        assert!(scheduler.contains(pid));
        assert_eq!(scheduler.info(pid).unwrap().state, ProcessState::Admitted);

        scheduler.handle_event(KernelEvent { pid, instance, kind: ProcessEvent::Ready });
        assert!(!scheduler.contains(pid));

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        let ready = seen.iter().position(|e| *e == SchedulerEvent::HandshakeComplete { pid }).unwrap();
        let exited = seen.iter().position(|e| *e == SchedulerEvent::Exited { pid, code: 3 }).unwrap();
        assert!(ready < exited);
    }

    #[tokio::test]
    async fn test_shutdown_fails_queue() {
        let mut scheduler = silent_scheduler(1, 1);
        let _running = scheduler.start(silent(1));
        scheduler.drain();
        let queued = scheduler.start(silent(2));

        scheduler.shutdown();
        assert!(scheduler.is_empty());
        assert_eq!(queued.await.unwrap_err(), KernelError::ShuttingDown);
    }
}
