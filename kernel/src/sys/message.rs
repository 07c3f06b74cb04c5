//! Message Envelope
//!
//! Every frame exchanged between the kernel and a process is an
//! [`Envelope`]: a correlation identifier, a Signal or Syscall tag and an
//! arbitrary JSON payload.
//!
//! # Identifiers
//!
//! Each side numbers the requests it originates with its own monotonic
//! counter, and the identifier records which side that was. A reply
//! reuses the identifier of the request it answers, so the two namespaces
//! never collide.

use crate::{KernelError, KernelResult};
use super::syscall::{Signal, Syscall};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Side that originated a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Kernel,
    Process,
}

/// Message correlation identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId {
    pub origin: Origin,
    pub seq: u64,
}

impl MessageId {
    /// Create from origin and sequence number
    pub fn new(origin: Origin, seq: u64) -> Self {
        Self { origin, seq }
    }

    /// Kernel-originated identifier
    pub fn kernel(seq: u64) -> Self {
        Self::new(Origin::Kernel, seq)
    }

    /// Process-originated identifier
    pub fn process(seq: u64) -> Self {
        Self::new(Origin::Process, seq)
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.origin {
            Origin::Kernel => write!(f, "k#{}", self.seq),
            Origin::Process => write!(f, "p#{}", self.seq),
        }
    }
}

/// Monotonic identifier source for one origin
#[derive(Debug)]
pub struct IdCounter {
    origin: Origin,
    next: AtomicU64,
}

impl IdCounter {
    /// Create a counter starting at 1
    pub fn new(origin: Origin) -> Self {
        Self {
            origin,
            next: AtomicU64::new(1),
        }
    }

    /// Take the next identifier
    pub fn next(&self) -> MessageId {
        MessageId::new(self.origin, self.next.fetch_add(1, Ordering::Relaxed))
    }

    /// Origin this counter issues identifiers for
    pub fn origin(&self) -> Origin {
        self.origin
    }
}

/// Wire envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    /// Correlation identifier
    pub identifier: MessageId,
    /// Signal or Syscall tag
    pub call: T,
    /// Associated data
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Envelope sent by the kernel
pub type KernelMessage = Envelope<Signal>;

/// Envelope sent by a process
pub type ProcessMessage = Envelope<Syscall>;

impl<T> Envelope<T> {
    /// Create an envelope
    pub fn new(identifier: MessageId, call: T, data: serde_json::Value) -> Self {
        Self { identifier, call, data }
    }

    /// Create an envelope with no data
    pub fn bare(identifier: MessageId, call: T) -> Self {
        Self::new(identifier, call, serde_json::Value::Null)
    }

    /// Decode the data field into a payload type
    pub fn payload<P: DeserializeOwned>(&self) -> KernelResult<P> {
        serde_json::from_value(self.data.clone())
            .map_err(|e| KernelError::MalformedMessage(e.to_string()))
    }
}

impl<T: Serialize> Envelope<T> {
    /// Encode into a frame
    pub fn encode(&self) -> KernelResult<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }
}

impl<T: DeserializeOwned> Envelope<T> {
    /// Decode a frame
    pub fn decode(frame: &[u8]) -> KernelResult<Self> {
        serde_json::from_slice(frame).map_err(|e| KernelError::MalformedMessage(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::syscall::{ExitPayload, NewPpidPayload};

    #[test]
    fn test_counter_is_monotonic() {
        let counter = IdCounter::new(Origin::Kernel);
        let a = counter.next();
        let b = counter.next();
        assert_eq!(a, MessageId::kernel(1));
        assert_eq!(b, MessageId::kernel(2));
        assert_eq!(counter.origin(), Origin::Kernel);
    }

    #[test]
    fn test_origins_never_collide() {
        let kernel = IdCounter::new(Origin::Kernel);
        let process = IdCounter::new(Origin::Process);
        assert_ne!(kernel.next(), process.next());
    }

    #[test]
    fn test_wire_shape() {
        let env = Envelope::new(
            MessageId::kernel(3),
            Signal::NewPpid,
            serde_json::to_value(NewPpidPayload { ppid: 0 }).unwrap(),
        );
        let value: serde_json::Value = serde_json::from_slice(&env.encode().unwrap()).unwrap();
        assert_eq!(value["identifier"]["origin"], "kernel");
        assert_eq!(value["identifier"]["seq"], 3);
        assert_eq!(value["call"], 4);
        assert_eq!(value["data"]["ppid"], 0);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            ProcessMessage::decode(b"not json"),
            Err(KernelError::MalformedMessage(_))
        ));
        // Well-formed JSON with an unknown tag is malformed too
        let frame = br#"{"identifier":{"origin":"process","seq":1},"call":99,"data":null}"#;
        assert!(ProcessMessage::decode(frame).is_err());
    }

    #[test]
    fn test_missing_data_defaults_to_null() {
        let frame = br#"{"identifier":{"origin":"kernel","seq":8},"call":3}"#;
        let env = ProcessMessage::decode(frame).unwrap();
        assert_eq!(env.call, Syscall::Heartbeat);
        assert!(env.data.is_null());
    }

    #[test]
    fn test_payload_extraction() {
        let env = ProcessMessage::new(
            MessageId::process(1),
            Syscall::Exit,
            serde_json::json!({ "code": 3 }),
        );
        let exit: ExitPayload = env.payload().unwrap();
        assert_eq!(exit.code, 3);
        assert!(env.payload::<NewPpidPayload>().is_err());
    }
}
