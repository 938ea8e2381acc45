//! Active-object dispatcher: one dedicated worker thread per bound agent,
//! each with its own MPSC queue. Strict per-agent FIFO, and a handler that
//! blocks only stalls its own agent.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use tracing::debug;

use crate::agent::AgentRef;
use crate::demand::{Demand, EventSinkRef};
use crate::dispatcher::{spawn_worker, Binder, ChannelSink, Dispatcher, DispatcherHandle};
use crate::environment::Environment;
use crate::error::RuntimeError;
use crate::message::AgentId;

/// Parameters of the active-object dispatcher.
#[derive(Default)]
pub struct DispParams {
    max_agents: Option<usize>,
}

impl DispParams {
    /// Caps the number of concurrently bound agents; binds beyond it fail
    /// with [`RuntimeError::DispatcherCapacityExceeded`].
    pub fn max_agents(mut self, limit: usize) -> Self {
        self.max_agents = Some(limit);
        self
    }
}

struct Worker {
    tx: Sender<Demand>,
    join: JoinHandle<()>,
}

pub(crate) struct ActiveObjDispatcher {
    name: String,
    workers: Mutex<HashMap<AgentId, Worker>>,
    stopped: AtomicBool,
    max_agents: Option<usize>,
}

impl Binder for ActiveObjDispatcher {
    fn bind(&self, agent: &AgentRef, coop_name: &str) -> Result<EventSinkRef, RuntimeError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(RuntimeError::DispatcherStopped(self.name.clone()));
        }
        let mut workers = self.workers.lock();
        if let Some(limit) = self.max_agents {
            if workers.len() >= limit {
                return Err(RuntimeError::DispatcherCapacityExceeded(self.name.clone()));
            }
        }
        let (tx, rx) = crossbeam_channel::unbounded::<Demand>();
        let thread_name = format!("{}-{}-{}", self.name, coop_name, agent.id());
        let join = spawn_worker(thread_name, move || {
            while let Ok(demand) = rx.recv() {
                demand.execute();
            }
        })?;
        workers.insert(agent.id(), Worker { tx: tx.clone(), join });
        Ok(EventSinkRef::new(Arc::new(ChannelSink::new(tx))))
    }

    fn unbind(&self, agent: &AgentRef) {
        let worker = self.workers.lock().remove(&agent.id());
        if let Some(worker) = worker {
            drop(worker.tx);
            let _ = worker.join.join();
        }
    }
}

impl Dispatcher for ActiveObjDispatcher {
    fn name(&self) -> &str {
        &self.name
    }

    fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let workers: Vec<Worker> = {
            let mut map = self.workers.lock();
            map.drain().map(|(_, w)| w).collect()
        };
        for worker in workers {
            drop(worker.tx);
            let _ = worker.join.join();
        }
        debug!(dispatcher = %self.name, "active_obj dispatcher stopped");
    }
}

/// Creates an active-object dispatcher: a worker thread per bound agent.
pub fn make_dispatcher(
    env: &Environment,
    name: &str,
    params: DispParams,
) -> Result<DispatcherHandle, RuntimeError> {
    if name.is_empty() {
        return Err(RuntimeError::EmptyName);
    }
    let dispatcher = Arc::new(ActiveObjDispatcher {
        name: name.to_string(),
        workers: Mutex::new(HashMap::new()),
        stopped: AtomicBool::new(false),
        max_agents: params.max_agents,
    });
    env.add_dispatcher(dispatcher.clone())?;
    debug!(dispatcher = name, "active_obj dispatcher started");
    Ok(DispatcherHandle::new(dispatcher))
}
