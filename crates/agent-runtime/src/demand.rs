//! Demands are the items dispatcher workers consume: lifecycle steps and
//! routed events, always tied to the agent they must run on.

use std::sync::Arc;

use crate::agent::AgentRef;
use crate::message::Event;

pub(crate) enum DemandKind {
    /// Run the `start` hook. Always the first demand an agent sees.
    Start,
    /// Dispatch one event through the agent's subscription table.
    Event(Event),
    /// Run the `finish` hook and report back to the cooperation.
    Finish,
}

pub(crate) struct Demand {
    pub(crate) agent: AgentRef,
    pub(crate) kind: DemandKind,
}

impl Demand {
    pub(crate) fn new(agent: AgentRef, kind: DemandKind) -> Self {
        Demand { agent, kind }
    }

    /// Entry point for dispatcher workers.
    pub(crate) fn execute(self) {
        let Demand { agent, kind } = self;
        agent.cell().exec_demand(kind);
    }
}

/// Destination of an agent's demands: one slot of a dispatcher queue.
///
/// Producers push from arbitrary threads; exactly one worker consumes.
pub(crate) trait EventSink: Send + Sync {
    fn push(&self, demand: Demand);
}

/// Opaque queue-slot handle produced by [`Binder::bind`](crate::dispatcher::Binder::bind).
#[derive(Clone)]
pub struct EventSinkRef {
    pub(crate) sink: Arc<dyn EventSink>,
}

impl EventSinkRef {
    pub(crate) fn new(sink: Arc<dyn EventSink>) -> Self {
        EventSinkRef { sink }
    }
}
