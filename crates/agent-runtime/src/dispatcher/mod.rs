//! # Dispatchers
//!
//! A dispatcher is a scheduling policy plus the worker threads that enact
//! it. Agents never meet a dispatcher directly: a cooperation carries a
//! [`Binder`], the per-agent attachment object a dispatcher hands out, and
//! the registration protocol calls `bind`/`unbind` through it.
//!
//! Standard dispatchers:
//!
//! * [`one_thread`] - a single worker drives every bound agent; one FIFO
//!   across all of them. This is also the environment's default dispatcher.
//! * [`active_obj`] - one dedicated worker per bound agent; blocking
//!   handlers affect only their own agent.
//! * [`thread_pool`] - N workers over per-agent queues; strict FIFO per
//!   agent, arbitrary interleaving across agents.
//! * [`adv_thread_pool`] - thread pool that returns an agent's queue to the
//!   pool after every single demand, so long handlers cannot hold a worker
//!   beyond one event.
//!
//! Each module exposes `make_dispatcher(env, name, params)` returning a
//! [`DispatcherHandle`]; only the handle's binder escapes to user code.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::Sender;

use crate::agent::AgentRef;
use crate::demand::{Demand, EventSink, EventSinkRef};
use crate::error::RuntimeError;

pub mod active_obj;
pub mod adv_thread_pool;
pub mod one_thread;
pub mod thread_pool;

/// Attaches agents to a dispatcher's queues.
///
/// `bind` allocates a queue slot for the agent and may refuse with
/// [`RuntimeError::DispatcherCapacityExceeded`] or
/// [`RuntimeError::DispatcherStopped`]. `unbind` detaches and must be safe
/// to call for an agent whose `bind` just failed.
pub trait Binder: Send + Sync {
    fn bind(&self, agent: &AgentRef, coop_name: &str) -> Result<EventSinkRef, RuntimeError>;
    fn unbind(&self, agent: &AgentRef);
}

/// Opaque handle to a running dispatcher. The only thing user code takes
/// from it is the binder.
pub struct DispatcherHandle {
    binder: Arc<dyn Binder>,
}

impl DispatcherHandle {
    pub(crate) fn new(binder: Arc<dyn Binder>) -> Self {
        DispatcherHandle { binder }
    }

    pub fn binder(&self) -> Arc<dyn Binder> {
        Arc::clone(&self.binder)
    }
}

/// Environment-facing face of a dispatcher: shut down and join the worker
/// threads at environment teardown.
pub(crate) trait Dispatcher: Send + Sync {
    fn name(&self) -> &str;
    fn shutdown(&self);
}

/// Queue slot backed by a plain channel sender.
pub(crate) struct ChannelSink {
    tx: Sender<Demand>,
}

impl ChannelSink {
    pub(crate) fn new(tx: Sender<Demand>) -> Self {
        ChannelSink { tx }
    }
}

impl EventSink for ChannelSink {
    fn push(&self, demand: Demand) {
        // A send after the worker went away only happens during teardown;
        // the demand is dropped with the channel.
        let _ = self.tx.send(demand);
    }
}

pub(crate) fn spawn_worker(
    name: String,
    body: impl FnOnce() + Send + 'static,
) -> Result<JoinHandle<()>, RuntimeError> {
    std::thread::Builder::new()
        .name(name)
        .spawn(body)
        .map_err(RuntimeError::DispatcherStartFailed)
}
