//! Single-worker dispatcher: every bound agent shares one thread and one
//! FIFO queue, so events are handled in global delivery order. The
//! environment's default dispatcher is an instance of this policy.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::debug;

use crate::agent::AgentRef;
use crate::demand::{Demand, EventSinkRef};
use crate::dispatcher::{spawn_worker, Binder, ChannelSink, Dispatcher, DispatcherHandle};
use crate::environment::Environment;
use crate::error::RuntimeError;

/// Parameters of the one-thread dispatcher. Nothing to tune yet; the type
/// keeps the `make_dispatcher` surface uniform across policies.
#[derive(Default)]
pub struct DispParams {}

pub(crate) struct OneThreadDispatcher {
    name: String,
    tx: Mutex<Option<Sender<Demand>>>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl OneThreadDispatcher {
    pub(crate) fn spawn(name: &str) -> Result<Arc<Self>, RuntimeError> {
        let (tx, rx) = crossbeam_channel::unbounded::<Demand>();
        let join = spawn_worker(format!("{name}-worker"), move || worker_loop(rx))?;
        debug!(dispatcher = name, "one_thread dispatcher started");
        Ok(Arc::new(OneThreadDispatcher {
            name: name.to_string(),
            tx: Mutex::new(Some(tx)),
            join: Mutex::new(Some(join)),
        }))
    }
}

fn worker_loop(rx: Receiver<Demand>) {
    while let Ok(demand) = rx.recv() {
        demand.execute();
    }
}

impl Binder for OneThreadDispatcher {
    fn bind(&self, _agent: &AgentRef, _coop_name: &str) -> Result<EventSinkRef, RuntimeError> {
        match &*self.tx.lock() {
            Some(tx) => Ok(EventSinkRef::new(Arc::new(ChannelSink::new(tx.clone())))),
            None => Err(RuntimeError::DispatcherStopped(self.name.clone())),
        }
    }

    fn unbind(&self, _agent: &AgentRef) {}
}

impl Dispatcher for OneThreadDispatcher {
    fn name(&self) -> &str {
        &self.name
    }

    fn shutdown(&self) {
        // The worker exits once every sender is gone; bound agents dropped
        // theirs at unbind, this drops the dispatcher's own.
        drop(self.tx.lock().take());
        if let Some(join) = self.join.lock().take() {
            let _ = join.join();
        }
        debug!(dispatcher = %self.name, "one_thread dispatcher stopped");
    }
}

/// Creates a one-thread dispatcher and registers it with the environment
/// for shutdown at teardown.
pub fn make_dispatcher(
    env: &Environment,
    name: &str,
    _params: DispParams,
) -> Result<DispatcherHandle, RuntimeError> {
    if name.is_empty() {
        return Err(RuntimeError::EmptyName);
    }
    let dispatcher = OneThreadDispatcher::spawn(name)?;
    if let Err(e) = env.add_dispatcher(dispatcher.clone()) {
        dispatcher.shutdown();
        return Err(e);
    }
    Ok(DispatcherHandle::new(dispatcher))
}
