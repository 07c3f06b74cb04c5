//! Thread Management
//!
//! A thread turns one execution unit into a duplex RPC peer:
//! - Outbound requests are correlated with replies by identifier
//! - Replies may arrive in any order
//! - Anything that is not a reply is handed to a [`ThreadHandler`]
//!
//! # Dispatch
//!
//! A pump task drains the unit's event stream. A decoded envelope whose
//! identifier is pending resolves that request; any other envelope goes
//! to `on_message`. Undecodable frames go to `on_malformed_message`, and
//! unit faults go to `on_fatal_error`.

use crate::exec::{Unit, UnitEvent, UnitHandle, UnitProvider};
use crate::{KernelError, KernelResult};
use super::message::{Envelope, IdCounter, KernelMessage, MessageId, Origin, ProcessMessage};
use super::syscall::Signal;
use super::ProcessId;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::trace;

/// Identity a thread runs under
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadInfo {
    /// Display name
    pub name: String,
    /// Parent process ID
    pub ppid: ProcessId,
    /// Process ID
    pub pid: ProcessId,
    /// User ID
    pub uid: u32,
    /// Group ID
    pub gid: u32,
}

/// Receiver for events that are not replies
///
/// Called from the thread's pump task, never from the coordinator.
pub trait ThreadHandler: Send + Sync + 'static {
    /// Unsolicited envelope from the unit
    fn on_message(&self, message: ProcessMessage);

    /// Unit crashed
    fn on_fatal_error(&self, error: String);

    /// Frame could not be decoded
    fn on_malformed_message(&self, frame: Bytes, error: String);
}

/// Pending reply to a request
///
/// Resolves exactly once, when the correlated reply arrives. There is no
/// timeout; if the thread is terminated first the reply resolves to
/// [`KernelError::ThreadTerminated`].
#[derive(Debug)]
pub struct Reply {
    identifier: MessageId,
    rx: oneshot::Receiver<ProcessMessage>,
}

impl Reply {
    /// Identifier the request was sent with
    pub fn identifier(&self) -> MessageId {
        self.identifier
    }

    /// Take the reply if it has already arrived
    pub fn try_take(&mut self) -> Option<KernelResult<ProcessMessage>> {
        match self.rx.try_recv() {
            Ok(message) => Some(Ok(message)),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(KernelError::ThreadTerminated)),
        }
    }
}

impl Future for Reply {
    type Output = KernelResult<ProcessMessage>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.map_err(|_| KernelError::ThreadTerminated))
    }
}

struct LinkInner {
    outbound: mpsc::UnboundedSender<Bytes>,
    pending: Mutex<HashMap<MessageId, oneshot::Sender<ProcessMessage>>>,
    ids: IdCounter,
}

/// Sending half of a thread, shareable with helper tasks
#[derive(Clone)]
pub struct ThreadLink {
    inner: Arc<LinkInner>,
}

impl ThreadLink {
    fn new(outbound: mpsc::UnboundedSender<Bytes>) -> Self {
        Self {
            inner: Arc::new(LinkInner {
                outbound,
                pending: Mutex::new(HashMap::new()),
                ids: IdCounter::new(Origin::Kernel),
            }),
        }
    }

    /// Fresh kernel-originated identifier
    pub fn next_identifier(&self) -> MessageId {
        self.inner.ids.next()
    }

    /// Send a request and register for its reply
    ///
    /// `identifier` continues an existing conversation; when `None` a
    /// fresh kernel identifier is allocated.
    pub fn send_request(
        &self,
        call: Signal,
        data: serde_json::Value,
        identifier: Option<MessageId>,
    ) -> KernelResult<Reply> {
        let (tx, rx) = oneshot::channel();

        let identifier = {
            let mut pending = self.inner.pending.lock();
            let identifier = match identifier {
                Some(id) if pending.contains_key(&id) => {
                    return Err(KernelError::DuplicateIdentifier(id));
                }
                Some(id) => id,
                None => loop {
                    let id = self.inner.ids.next();
                    if !pending.contains_key(&id) {
                        break id;
                    }
                },
            };
            pending.insert(identifier, tx);
            identifier
        };

        // Registered before transmitting so a fast reply always finds it
        if let Err(err) = self.transmit(&Envelope::new(identifier, call, data)) {
            self.inner.pending.lock().remove(&identifier);
            return Err(err);
        }

        Ok(Reply { identifier, rx })
    }

    /// Send without expecting a reply
    pub fn send_fire_and_forget(
        &self,
        identifier: MessageId,
        call: Signal,
        data: serde_json::Value,
    ) -> KernelResult<()> {
        self.transmit(&Envelope::new(identifier, call, data))
    }

    /// Number of requests still waiting for a reply
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    fn transmit(&self, message: &KernelMessage) -> KernelResult<()> {
        let frame = message.encode()?;
        self.inner.outbound
            .send(frame)
            .map_err(|_| KernelError::ThreadTerminated)
    }

    /// Resolve a pending request, handing the message back if nothing was waiting
    fn resolve(&self, message: ProcessMessage) -> Option<ProcessMessage> {
        let waiter = self.inner.pending.lock().remove(&message.identifier);
        match waiter {
            Some(tx) => {
                let _ = tx.send(message);
                None
            }
            None => Some(message),
        }
    }

    fn clear(&self) {
        self.inner.pending.lock().clear();
    }
}

impl std::fmt::Debug for ThreadLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadLink")
            .field("pending", &self.pending_count())
            .finish()
    }
}

/// Kernel-side thread
#[derive(Debug)]
pub struct Thread {
    info: ThreadInfo,
    link: ThreadLink,
    unit: UnitHandle,
    pump: JoinHandle<()>,
}

impl Thread {
    /// Start a unit from `image` and wrap it
    pub fn spawn(
        provider: &dyn UnitProvider,
        image: &str,
        info: ThreadInfo,
        handler: Arc<dyn ThreadHandler>,
    ) -> KernelResult<Self> {
        let unit = provider.spawn(image, &info.name)?;
        Ok(Self::attach(unit, info, handler))
    }

    /// Wrap an already running unit
    pub fn attach(unit: Unit, info: ThreadInfo, handler: Arc<dyn ThreadHandler>) -> Self {
        let (outbound, inbound, handle) = unit.into_parts();
        let link = ThreadLink::new(outbound);
        let pump = tokio::spawn(pump(inbound, link.clone(), handler, info.pid));

        Self {
            info,
            link,
            unit: handle,
            pump,
        }
    }

    /// Send a request, see [`ThreadLink::send_request`]
    pub fn send_request(
        &self,
        call: Signal,
        data: serde_json::Value,
        identifier: Option<MessageId>,
    ) -> KernelResult<Reply> {
        self.link.send_request(call, data, identifier)
    }

    /// Send without expecting a reply
    pub fn send_fire_and_forget(
        &self,
        identifier: MessageId,
        call: Signal,
        data: serde_json::Value,
    ) -> KernelResult<()> {
        self.link.send_fire_and_forget(identifier, call, data)
    }

    /// Shareable sending half
    pub fn link(&self) -> &ThreadLink {
        &self.link
    }

    /// Stop the unit immediately
    ///
    /// Only call once the thread is unlinked from every table. Pending
    /// replies resolve to `ThreadTerminated`.
    pub fn terminate(&self) {
        self.pump.abort();
        self.unit.terminate();
        self.link.clear();
    }

    /// Identity
    pub fn info(&self) -> &ThreadInfo {
        &self.info
    }

    /// Thread name
    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// Owning process ID
    pub fn pid(&self) -> ProcessId {
        self.info.pid
    }

    /// Parent process ID
    pub fn ppid(&self) -> ProcessId {
        self.info.ppid
    }

    /// User ID
    pub fn uid(&self) -> u32 {
        self.info.uid
    }

    /// Group ID
    pub fn gid(&self) -> u32 {
        self.info.gid
    }

    pub(crate) fn set_ppid(&mut self, ppid: ProcessId) {
        self.info.ppid = ppid;
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        self.terminate();
    }
}

async fn pump(
    mut inbound: mpsc::UnboundedReceiver<UnitEvent>,
    link: ThreadLink,
    handler: Arc<dyn ThreadHandler>,
    pid: ProcessId,
) {
    while let Some(event) = inbound.recv().await {
        match event {
            UnitEvent::Message(frame) => match ProcessMessage::decode(&frame) {
                Ok(message) => {
                    if let Some(unsolicited) = link.resolve(message) {
                        handler.on_message(unsolicited);
                    }
                }
                Err(err) => handler.on_malformed_message(frame, err.to_string()),
            },
            UnitEvent::Fault(reason) => handler.on_fatal_error(reason),
        }
    }
    trace!("Thread {} event stream closed", pid);
}
