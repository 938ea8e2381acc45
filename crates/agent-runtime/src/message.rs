//! # Messages and Signals
//!
//! Events carry typed payloads between agents. A payload type's identity is
//! its Rust [`TypeId`]; subscription tables and mailbox routing are keyed by
//! it, and the payload itself travels type-erased and is downcast again at
//! the subscriber's handler.
//!
//! A [`Signal`] is the payload-free kind of message: it is identified and
//! delivered by type alone.

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Marker for types that can travel through mailboxes.
///
/// Blanket-implemented for every `'static + Send + Sync` type; define a
/// plain struct and deliver it.
pub trait Message: Any + Send + Sync + 'static {}

impl<T: Any + Send + Sync + 'static> Message for T {}

/// Marker for payload-free messages.
///
/// Implement it on an empty struct and use
/// [`Mbox::deliver_signal`](crate::Mbox::deliver_signal):
///
/// ```
/// struct MsgPing;
/// impl agent_runtime::Signal for MsgPing {}
/// ```
pub trait Signal: Message {}

/// Unique identity of a mailbox within an environment.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct MboxId(u64);

impl MboxId {
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        MboxId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for MboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mbox-{}", self.0)
    }
}

/// Unique identity of an agent within an environment.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct AgentId(u64);

impl AgentId {
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        AgentId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "agent-{}", self.0)
    }
}

/// Type-erased payload of an event.
///
/// Messages are shared between subscribers of one delivery, so the payload
/// is an `Arc` and cloning an event is cheap. Signals carry no payload.
#[derive(Clone)]
pub(crate) struct Payload(Option<Arc<dyn Any + Send + Sync>>);

impl Payload {
    pub(crate) fn message<M: Message>(msg: M) -> Self {
        Payload(Some(Arc::new(msg)))
    }

    pub(crate) fn signal() -> Self {
        Payload(None)
    }

    pub(crate) fn downcast_ref<M: Message>(&self) -> Option<&M> {
        self.0.as_deref().and_then(|p| p.downcast_ref::<M>())
    }
}

/// One routed occurrence of a delivery: which mailbox, which payload type,
/// and the payload itself. The target agent travels alongside in the
/// dispatcher demand.
#[derive(Clone)]
pub(crate) struct Event {
    pub(crate) mbox_id: MboxId,
    pub(crate) type_id: TypeId,
    pub(crate) payload: Payload,
}
