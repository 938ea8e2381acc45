//! # Observability Sink
//!
//! Optional hooks for host code that wants to watch the runtime: handled
//! events, deadletters, cooperation lifecycle. The runtime calls these
//! outside of its internal locks; implementations should still return
//! quickly since some hooks fire on worker threads.

use crate::coop::DeregReason;
use crate::message::{AgentId, MboxId};

/// Hook surface installed via
/// [`EnvParams::observer`](crate::EnvParams::observer).
///
/// All methods default to no-ops, so an implementation only overrides what
/// it cares about.
pub trait RuntimeObserver: Send + Sync {
    /// An agent's handler finished processing one event.
    fn event_handled(&self, _agent: AgentId) {}

    /// An event was dropped: no subscriber, no handler for the
    /// `(mailbox, type)` pair, or the target agent is shutting down.
    /// `agent` is `None` when the delivery found no subscriber at all.
    fn deadletter(&self, _agent: Option<AgentId>, _mbox: MboxId) {}

    /// A cooperation finished registration.
    fn coop_registered(&self, _name: &str) {}

    /// A cooperation finished final deregistration.
    fn coop_deregistered(&self, _name: &str, _reason: DeregReason) {}
}

/// Default observer: ignores everything.
pub(crate) struct NoopObserver;

impl RuntimeObserver for NoopObserver {}
