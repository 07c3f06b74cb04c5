//! Process Runtime
//!
//! The process side of the protocol, linked into every image:
//!
//! ```ignore
//! async fn main(port: UnitPort) -> KernelResult<()> {
//!     let mut rt = ProcessRuntime::init(port).await?;
//!     let child = rt.fork().await?;
//!     rt.serve().await
//! }
//! ```
//!
//! While a program waits on the runtime (`serve`, `sleep`, `next_event`,
//! `call` and friends), HEARTBEAT is answered immediately and NEWPPID is
//! applied. A program that stops polling the runtime stops answering
//! heartbeats, and the kernel kills it.

use crate::exec::UnitPort;
use crate::sys::message::{IdCounter, KernelMessage, Origin, ProcessMessage};
use crate::sys::syscall::{
    to_data, ErrorPayload, ExecPayload, ExitPayload, ForkedPayload, InitPayload,
    NewPpidPayload, Signal, Syscall,
};
use crate::sys::ProcessId;
use crate::{KernelError, KernelResult};
use bytes::Bytes;
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;
use tokio::time::{self, Instant};
use tracing::trace;

/// Something the kernel told the process
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeEvent {
    /// Parent died, new parent attached
    Reparented { ppid: ProcessId },
    /// This process is a freshly forked child
    Forked { descriptors: Vec<u32> },
    /// Any other unsolicited signal
    Signal(KernelMessage),
}

/// Process-side runtime
#[derive(Debug)]
pub struct ProcessRuntime {
    port: UnitPort,
    ids: IdCounter,
    ppid: ProcessId,
    pid: ProcessId,
    uid: u32,
    gid: u32,
    env: BTreeMap<String, String>,
    args: Vec<String>,
    /// Events seen while waiting for a reply
    backlog: VecDeque<RuntimeEvent>,
}

impl ProcessRuntime {
    /// Wait for INIT and acknowledge it
    pub async fn init(mut port: UnitPort) -> KernelResult<Self> {
        let frame = port.recv().await.ok_or(KernelError::ThreadTerminated)?;
        let message = KernelMessage::decode(&frame)?;
        if message.call != Signal::Init {
            return Err(KernelError::UnexpectedSignal(message.call));
        }
        let init: InitPayload = message.payload()?;

        let ack = ProcessMessage::bare(message.identifier, Syscall::Init);
        port.send(ack.encode()?)?;

        trace!("Pid {} initialised", init.pid);
        Ok(Self {
            port,
            ids: IdCounter::new(Origin::Process),
            ppid: init.ppid,
            pid: init.pid,
            uid: init.uid,
            gid: init.gid,
            env: init.env,
            args: init.args,
            backlog: VecDeque::new(),
        })
    }

    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    /// Parent PID, updated on NEWPPID
    pub fn ppid(&self) -> ProcessId {
        self.ppid
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn gid(&self) -> u32 {
        self.gid
    }

    /// Environment variable by name
    pub fn getenv(&self, name: &str) -> Option<&str> {
        self.env.get(name).map(String::as_str)
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Answer signals until the kernel goes away
    pub async fn serve(&mut self) -> KernelResult<()> {
        loop {
            match self.next_event().await {
                Ok(event) => trace!("Pid {} ignored {:?}", self.pid, event),
                Err(KernelError::ThreadTerminated) => return Ok(()),
                Err(err) => return Err(err),
            }
        }
    }

    /// Sleep while staying responsive
    pub async fn sleep(&mut self, duration: Duration) -> KernelResult<()> {
        let deadline = Instant::now() + duration;
        loop {
            tokio::select! {
                _ = time::sleep_until(deadline) => return Ok(()),
                message = self.next_message() => {
                    let event = classify(message?);
                    self.backlog.push_back(event);
                }
            }
        }
    }

    /// Wait for the next event
    pub async fn next_event(&mut self) -> KernelResult<RuntimeEvent> {
        if let Some(event) = self.backlog.pop_front() {
            return Ok(event);
        }
        Ok(classify(self.next_message().await?))
    }

    /// Wait for the next event, giving up after `timeout`
    pub async fn wait_event(&mut self, timeout: Duration) -> KernelResult<Option<RuntimeEvent>> {
        match time::timeout(timeout, self.next_event()).await {
            Ok(event) => event.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Issue a syscall and wait for its reply
    pub async fn call(&mut self, call: Syscall, data: serde_json::Value) -> KernelResult<KernelMessage> {
        let identifier = self.ids.next();
        self.send(&ProcessMessage::new(identifier, call, data))?;

        loop {
            let message = self.next_message().await?;
            if message.identifier == identifier {
                return Ok(message);
            }
            let event = classify(message);
            self.backlog.push_back(event);
        }
    }

    /// Duplicate this process, returning the child's PID
    pub async fn fork(&mut self) -> KernelResult<ProcessId> {
        let reply = self.call(Syscall::Fork, serde_json::Value::Null).await?;
        match reply.call {
            Signal::Forked => match reply.payload()? {
                ForkedPayload::Parent { pid } => Ok(pid),
                ForkedPayload::Child { .. } => Err(KernelError::MalformedMessage(
                    "fork answered with the child role".into()
                )),
            },
            Signal::Error => Err(syscall_error(&reply)),
            other => Err(KernelError::UnexpectedSignal(other)),
        }
    }

    /// Replace this process's image
    ///
    /// Only returns if the exec failed. On success the kernel stops this
    /// unit while the call is still waiting.
    pub async fn exec(&mut self, image: &str, args: Option<Vec<String>>) -> KernelResult<()> {
        let payload = ExecPayload {
            image: image.to_string(),
            args,
        };
        let reply = self.call(Syscall::Exec, to_data(&payload)?).await?;
        match reply.call {
            Signal::Error => Err(syscall_error(&reply)),
            other => Err(KernelError::UnexpectedSignal(other)),
        }
    }

    /// Ask the kernel to end this process
    pub fn exit(self, code: i32) -> KernelResult<()> {
        let identifier = self.ids.next();
        let message = ProcessMessage::new(identifier, Syscall::Exit, to_data(&ExitPayload { code })?);
        self.send(&message)
    }

    /// Send an arbitrary frame, bypassing the envelope codec
    pub fn send_raw(&self, frame: Bytes) -> KernelResult<()> {
        self.port.send(frame)
    }

    fn send(&self, message: &ProcessMessage) -> KernelResult<()> {
        self.port.send(message.encode()?)
    }

    /// Next message that needs the program's attention
    ///
    /// Cancel-safe: the only await point is the channel receive.
    async fn next_message(&mut self) -> KernelResult<KernelMessage> {
        loop {
            let frame = self.port.recv().await.ok_or(KernelError::ThreadTerminated)?;
            let message = KernelMessage::decode(&frame)?;

            match message.call {
                Signal::Heartbeat => {
                    self.send(&ProcessMessage::bare(message.identifier, Syscall::Heartbeat))?;
                }
                Signal::NewPpid => {
                    let NewPpidPayload { ppid } = message.payload()?;
                    self.ppid = ppid;
                    return Ok(message);
                }
                _ => return Ok(message),
            }
        }
    }
}

fn classify(message: KernelMessage) -> RuntimeEvent {
    match message.call {
        Signal::NewPpid => match message.payload::<NewPpidPayload>() {
            Ok(NewPpidPayload { ppid }) => RuntimeEvent::Reparented { ppid },
            Err(_) => RuntimeEvent::Signal(message),
        },
        Signal::Forked => match message.payload::<ForkedPayload>() {
            Ok(ForkedPayload::Child { descriptors }) => RuntimeEvent::Forked { descriptors },
            _ => RuntimeEvent::Signal(message),
        },
        _ => RuntimeEvent::Signal(message),
    }
}

fn syscall_error(reply: &KernelMessage) -> KernelError {
    match reply.payload::<ErrorPayload>() {
        Ok(ErrorPayload { code }) => KernelError::SyscallFailed(code),
        Err(err) => err,
    }
}
