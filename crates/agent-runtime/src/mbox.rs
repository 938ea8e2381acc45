//! # Mailboxes
//!
//! A mailbox is an addressable channel carrying typed events to its
//! subscribers. Delivery may happen from any thread; subscription changes
//! happen from the owning agent's worker (or during `define`). The
//! subscriber set is therefore kept under a read-write lock, and delivery
//! snapshots it under the read side, then enqueues outside the lock so no
//! lock is held across a worker wakeup.
//!
//! Two kinds exist:
//!
//! * **MPMC** - any number of subscribing agents. Created via
//!   [`Environment::create_local_mbox`](crate::Environment::create_local_mbox)
//!   or [`Environment::create_named_mbox`](crate::Environment::create_named_mbox).
//! * **MPSC** - locked to a single subscribing agent; the first subscriber
//!   becomes the owner and any other agent is refused with
//!   [`RuntimeError::TooManySubscribers`]. Every agent's direct mailbox is
//!   of this kind.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::trace;

use crate::agent::AgentCell;
use crate::error::RuntimeError;
use crate::message::{AgentId, Event, MboxId, Message, Payload, Signal};
use crate::observer::RuntimeObserver;

/// Subscription policy of a mailbox.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MboxKind {
    /// Multi-producer, multi-consumer.
    Mpmc,
    /// Multi-producer, single-consumer.
    Mpsc,
}

struct SubscriberEntry {
    agent_id: AgentId,
    cell: Weak<AgentCell>,
}

#[derive(Default)]
struct SubscriberMap {
    /// For MPSC mailboxes: the single agent allowed to subscribe. Locked in
    /// by the first subscription (or at creation for direct mailboxes) and
    /// never released.
    owner: Option<AgentId>,
    by_type: HashMap<TypeId, Vec<SubscriberEntry>>,
}

struct MboxInner {
    id: MboxId,
    kind: MboxKind,
    subscribers: RwLock<SubscriberMap>,
    observer: Arc<dyn RuntimeObserver>,
}

/// Handle to a mailbox. Cloning is cheap and all clones address the same
/// channel.
#[derive(Clone)]
pub struct Mbox {
    inner: Arc<MboxInner>,
}

impl Mbox {
    pub(crate) fn new(kind: MboxKind, observer: Arc<dyn RuntimeObserver>) -> Self {
        Mbox {
            inner: Arc::new(MboxInner {
                id: MboxId::next(),
                kind,
                subscribers: RwLock::new(SubscriberMap::default()),
                observer,
            }),
        }
    }

    /// A direct mailbox, pre-owned by the agent it belongs to.
    pub(crate) fn new_direct(owner: AgentId, observer: Arc<dyn RuntimeObserver>) -> Self {
        let mbox = Mbox::new(MboxKind::Mpsc, observer);
        mbox.inner.subscribers.write().owner = Some(owner);
        mbox
    }

    pub fn id(&self) -> MboxId {
        self.inner.id
    }

    pub fn kind(&self) -> MboxKind {
        self.inner.kind
    }

    /// Deliver a message to every subscriber for its type.
    ///
    /// Never fails from the producer's point of view: a delivery that finds
    /// no subscriber (or only shutting-down agents) is dropped through the
    /// deadletter path.
    pub fn deliver<M: Message>(&self, msg: M) {
        self.deliver_erased(TypeId::of::<M>(), Payload::message(msg));
    }

    /// Deliver a payload-free signal, identified by type alone.
    pub fn deliver_signal<S: Signal>(&self) {
        self.deliver_erased(TypeId::of::<S>(), Payload::signal());
    }

    pub(crate) fn deliver_erased(&self, type_id: TypeId, payload: Payload) {
        // Snapshot under the read lock, enqueue outside it.
        let targets: Vec<Arc<AgentCell>> = {
            let map = self.inner.subscribers.read();
            match map.by_type.get(&type_id) {
                Some(entries) => entries.iter().filter_map(|e| e.cell.upgrade()).collect(),
                None => Vec::new(),
            }
        };

        if targets.is_empty() {
            trace!(mbox = %self.inner.id, "delivery without subscribers dropped");
            self.inner.observer.deadletter(None, self.inner.id);
            return;
        }

        for target in targets {
            target.push_event(Event {
                mbox_id: self.inner.id,
                type_id,
                payload: payload.clone(),
            });
        }
    }

    pub(crate) fn add_subscriber(
        &self,
        type_id: TypeId,
        cell: &Arc<AgentCell>,
    ) -> Result<(), RuntimeError> {
        let mut map = self.inner.subscribers.write();
        if self.inner.kind == MboxKind::Mpsc {
            match map.owner {
                Some(owner) if owner != cell.id() => return Err(RuntimeError::TooManySubscribers),
                _ => map.owner = Some(cell.id()),
            }
        }
        map.by_type.entry(type_id).or_default().push(SubscriberEntry {
            agent_id: cell.id(),
            cell: Arc::downgrade(cell),
        });
        Ok(())
    }

    /// Idempotent removal of one agent's subscription for one type.
    pub(crate) fn remove_subscriber(&self, type_id: TypeId, agent: AgentId) {
        let mut map = self.inner.subscribers.write();
        if let Some(entries) = map.by_type.get_mut(&type_id) {
            entries.retain(|e| e.agent_id != agent);
            if entries.is_empty() {
                map.by_type.remove(&type_id);
            }
        }
    }
}
