//! Per-agent subscription table: the routing map from `(mailbox, type)` to
//! a type-erased handler. Logically owned by the agent; written only during
//! `define` or from the agent's own worker, read only by that worker.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use crate::agent::AgentContext;
use crate::error::RuntimeError;
use crate::mbox::Mbox;
use crate::message::{MboxId, Payload};

/// Handler with agent type and payload type erased. The worker downcasts
/// both sides at dispatch; a mismatch drops the event.
pub(crate) type ErasedHandler =
    Arc<dyn Fn(&mut dyn Any, &mut AgentContext, &Payload) + Send + Sync>;

struct HandlerEntry {
    /// Keeps the mailbox alive and reachable for teardown-time
    /// unsubscription.
    mbox: Mbox,
    handler: ErasedHandler,
}

#[derive(Default)]
pub(crate) struct SubscriptionTable {
    entries: HashMap<(MboxId, TypeId), HandlerEntry>,
}

impl SubscriptionTable {
    pub(crate) fn insert(
        &mut self,
        mbox: Mbox,
        type_id: TypeId,
        handler: ErasedHandler,
    ) -> Result<(), RuntimeError> {
        let key = (mbox.id(), type_id);
        if self.entries.contains_key(&key) {
            return Err(RuntimeError::HandlerAlreadySubscribed);
        }
        self.entries.insert(key, HandlerEntry { mbox, handler });
        Ok(())
    }

    /// Returns the mailbox handle if the subscription existed.
    pub(crate) fn remove(&mut self, mbox_id: MboxId, type_id: TypeId) -> Option<Mbox> {
        self.entries.remove(&(mbox_id, type_id)).map(|e| e.mbox)
    }

    pub(crate) fn lookup(&self, mbox_id: MboxId, type_id: TypeId) -> Option<ErasedHandler> {
        self.entries
            .get(&(mbox_id, type_id))
            .map(|e| Arc::clone(&e.handler))
    }

    /// Empties the table, handing back every `(mailbox, type)` pair so the
    /// caller can drop the mailbox-side subscriptions as well.
    pub(crate) fn drain(&mut self) -> Vec<(Mbox, TypeId)> {
        self.entries
            .drain()
            .map(|((_, type_id), entry)| (entry.mbox, type_id))
            .collect()
    }
}
