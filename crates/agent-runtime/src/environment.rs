//! # Environment
//!
//! The process-wide registry: it owns the cooperation index, the live
//! dispatchers, the timer thread and the shutdown latch. An
//! [`Environment`] value is a cheap cloneable handle; agents reach it
//! through their [`AgentContext`](crate::AgentContext) and host code gets
//! it inside the [`launch`] init callback.
//!
//! ```no_run
//! agent_runtime::launch(|env| {
//!     let mut coop = env.create_coop("example")?;
//!     coop.define_agent().on_start(|ctx| ctx.environment().stop());
//!     env.register_coop(coop)
//! })
//! .expect("runtime failed");
//! ```
//!
//! `launch` runs the init callback on the calling thread and then parks it
//! until [`Environment::stop`] has been called and every cooperation has
//! fully deregistered.
//!
//! Final cooperation teardown never runs on an agent worker: the moment a
//! cooperation's reference count reaches zero it is handed to a dedicated
//! deregistration thread, which unbinds the agents (joining per-agent
//! workers where the dispatcher has them), fires notificators and drops
//! user resources.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, info};

use crate::agent::{Agent, ExceptionReaction};
use crate::coop::{Coop, CoopCell, DeregReason};
use crate::dispatcher::one_thread::OneThreadDispatcher;
use crate::dispatcher::{spawn_worker, Binder, Dispatcher};
use crate::error::RuntimeError;
use crate::mbox::{Mbox, MboxKind};
use crate::message::{Message, Payload, Signal};
use crate::observer::{NoopObserver, RuntimeObserver};
use crate::timer::{TimerId, TimerService};

/// Parameters for [`launch_with_params`].
pub struct EnvParams {
    exception_reaction: ExceptionReaction,
    shutdown_drain_limit: usize,
    observer: Arc<dyn RuntimeObserver>,
}

impl Default for EnvParams {
    fn default() -> Self {
        EnvParams {
            exception_reaction: ExceptionReaction::Abort,
            shutdown_drain_limit: 0,
            observer: Arc::new(NoopObserver),
        }
    }
}

impl EnvParams {
    /// Environment-wide exception reaction, used by cooperations and agents
    /// that inherit. [`ExceptionReaction::Inherit`] here falls back to
    /// [`ExceptionReaction::Abort`].
    pub fn exception_reaction(mut self, reaction: ExceptionReaction) -> Self {
        self.exception_reaction = reaction;
        self
    }

    /// How many already-queued application events an agent still handles
    /// after its cooperation entered deregistration. Defaults to zero:
    /// drop on shutdown.
    pub fn shutdown_drain_limit(mut self, limit: usize) -> Self {
        self.shutdown_drain_limit = limit;
        self
    }

    /// Installs an observability sink.
    pub fn observer(mut self, observer: Arc<dyn RuntimeObserver>) -> Self {
        self.observer = observer;
        self
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum EnvState {
    Building = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl EnvState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => EnvState::Building,
            1 => EnvState::Running,
            2 => EnvState::Stopping,
            _ => EnvState::Stopped,
        }
    }
}

#[derive(Default)]
struct CoopRegistry {
    registered: HashMap<String, Arc<CoopCell>>,
    deregistering: HashMap<String, Arc<CoopCell>>,
    /// `(parent, child)` name pairs, resolved on demand so parent and
    /// child never hold owning references to each other.
    relations: HashSet<(String, String)>,
}

impl CoopRegistry {
    fn contains_name(&self, name: &str) -> bool {
        self.registered.contains_key(name) || self.deregistering.contains_key(name)
    }

    fn children_of(&self, name: &str) -> Vec<String> {
        self.relations
            .iter()
            .filter(|(parent, _)| parent == name)
            .map(|(_, child)| child.clone())
            .collect()
    }
}

#[derive(Default)]
struct LatchState {
    stop_requested: bool,
    live_coops: usize,
}

struct Latch {
    state: Mutex<LatchState>,
    cond: Condvar,
}

enum DeregCommand {
    Final(String),
    Stop,
}

struct EnvInner {
    state: AtomicU8,
    registry: RwLock<CoopRegistry>,
    named_mboxes: Mutex<HashMap<String, Mbox>>,
    dispatchers: Mutex<Vec<Arc<dyn Dispatcher>>>,
    default_binder: Arc<dyn Binder>,
    dereg_tx: OnceLock<Sender<DeregCommand>>,
    dereg_join: Mutex<Option<JoinHandle<()>>>,
    timer: TimerService,
    latch: Latch,
    default_reaction: ExceptionReaction,
    drain_limit: usize,
    observer: Arc<dyn RuntimeObserver>,
}

/// Handle to the runtime environment.
#[derive(Clone)]
pub struct Environment {
    inner: Arc<EnvInner>,
}

impl Environment {
    fn build(params: EnvParams) -> Result<Environment, RuntimeError> {
        let default_reaction = match params.exception_reaction {
            ExceptionReaction::Inherit => ExceptionReaction::Abort,
            reaction => reaction,
        };
        let timer = TimerService::start()?;
        let default_dispatcher = OneThreadDispatcher::spawn("default")?;
        let env = Environment {
            inner: Arc::new(EnvInner {
                state: AtomicU8::new(EnvState::Building as u8),
                registry: RwLock::new(CoopRegistry::default()),
                named_mboxes: Mutex::new(HashMap::new()),
                dispatchers: Mutex::new(vec![default_dispatcher.clone()]),
                default_binder: default_dispatcher,
                dereg_tx: OnceLock::new(),
                dereg_join: Mutex::new(None),
                timer,
                latch: Latch {
                    state: Mutex::new(LatchState::default()),
                    cond: Condvar::new(),
                },
                default_reaction,
                drain_limit: params.shutdown_drain_limit,
                observer: params.observer,
            }),
        };

        let (tx, rx) = crossbeam_channel::unbounded::<DeregCommand>();
        let dereg_env = env.clone();
        let join = spawn_worker("coop-dereg".to_string(), move || dereg_loop(dereg_env, rx))?;
        let _ = env.inner.dereg_tx.set(tx);
        *env.inner.dereg_join.lock() = Some(join);

        env.inner
            .state
            .store(EnvState::Running as u8, Ordering::Release);
        Ok(env)
    }

    fn state(&self) -> EnvState {
        EnvState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub(crate) fn observer_arc(&self) -> Arc<dyn RuntimeObserver> {
        Arc::clone(&self.inner.observer)
    }

    pub(crate) fn add_dispatcher(&self, dispatcher: Arc<dyn Dispatcher>) -> Result<(), RuntimeError> {
        if self.state() != EnvState::Running {
            return Err(RuntimeError::EnvironmentStopping);
        }
        self.inner.dispatchers.lock().push(dispatcher);
        Ok(())
    }

    // --- Mailboxes ---

    /// Creates an anonymous MPMC mailbox.
    pub fn create_local_mbox(&self) -> Mbox {
        Mbox::new(MboxKind::Mpmc, self.observer_arc())
    }

    /// Returns the MPMC mailbox registered under `name`, creating it on
    /// first use. All callers asking for the same name share one mailbox.
    pub fn create_named_mbox(&self, name: impl Into<String>) -> Mbox {
        let name = name.into();
        self.inner
            .named_mboxes
            .lock()
            .entry(name)
            .or_insert_with(|| Mbox::new(MboxKind::Mpmc, Arc::clone(&self.inner.observer)))
            .clone()
    }

    // --- Cooperations ---

    /// Creates an empty cooperation on the environment's default
    /// dispatcher.
    pub fn create_coop(&self, name: impl Into<String>) -> Result<Coop, RuntimeError> {
        self.create_coop_with_binder(name, Arc::clone(&self.inner.default_binder))
    }

    /// Creates an empty cooperation with an explicit default binder for its
    /// agents.
    pub fn create_coop_with_binder(
        &self,
        name: impl Into<String>,
        binder: Arc<dyn Binder>,
    ) -> Result<Coop, RuntimeError> {
        let name = name.into();
        if name.is_empty() {
            return Err(RuntimeError::EmptyName);
        }
        Ok(Coop::new(name, self.clone(), binder))
    }

    /// Convenience wrapper: one agent as a whole cooperation.
    pub fn register_agent_as_coop(
        &self,
        name: impl Into<String>,
        agent: impl Agent,
    ) -> Result<(), RuntimeError> {
        let mut coop = self.create_coop(name)?;
        coop.add_agent(agent);
        self.register_coop(coop)
    }

    /// Registers a cooperation, all-or-nothing.
    ///
    /// Every agent is defined, then bound to its dispatcher; the first
    /// failure rolls back all previous steps in reverse order and nothing
    /// of the cooperation remains observable. On success the `start` event
    /// is scheduled as the first demand of every agent and registration
    /// notificators run (their panics are swallowed).
    pub fn register_coop(&self, coop: Coop) -> Result<(), RuntimeError> {
        let agent_count = coop.agent_count();
        if agent_count == 0 {
            return Err(RuntimeError::EmptyCoop(coop.name().to_string()));
        }
        let cell = Arc::new(CoopCell::from_coop(coop));
        let name = cell.name().to_string();
        {
            let mut registry = self.inner.registry.write();
            if self.state() != EnvState::Running {
                return Err(RuntimeError::EnvironmentStopping);
            }
            if registry.contains_name(&name) {
                return Err(RuntimeError::DuplicateCoopName(name));
            }
            let parent = match cell.parent_name() {
                Some(parent_name) => match registry.registered.get(parent_name) {
                    Some(parent) => Some(Arc::clone(parent)),
                    None => {
                        return Err(RuntimeError::UnknownParentCoop {
                            coop: name,
                            parent: parent_name.to_string(),
                        })
                    }
                },
                None => None,
            };
            cell.resolve_reactions(
                parent.as_ref().map(|p| p.resolved_reaction()),
                self.inner.default_reaction,
            );
            cell.run_registration_steps()?;
            cell.mark_registered();
            if let Some(parent) = &parent {
                parent.increment_usage();
                registry
                    .relations
                    .insert((parent.name().to_string(), name.clone()));
            }
            registry.registered.insert(name.clone(), Arc::clone(&cell));
        }
        self.inner.latch.state.lock().live_coops += 1;

        info!(coop = %name, agents = agent_count, "cooperation registered");
        self.inner.observer.coop_registered(&name);
        cell.arm_agents();
        cell.call_reg_notificators();
        // Release the registration routine's own usage of the cooperation.
        cell.decrement_usage();
        Ok(())
    }

    /// Starts deregistration of `name` and all its descendants. Completes
    /// asynchronously; a repeated call while teardown is in flight is a
    /// no-op.
    pub fn deregister_coop(&self, name: &str, reason: DeregReason) -> Result<(), RuntimeError> {
        let marked = {
            let mut registry = self.inner.registry.write();
            let Some(cell) = registry.registered.get(name).cloned() else {
                return if registry.deregistering.contains_key(name) {
                    Ok(())
                } else {
                    Err(RuntimeError::CoopNotFound(name.to_string()))
                };
            };
            let mut marked = Vec::new();
            mark_subtree(&mut registry, &cell, reason, &mut marked);
            marked
        };
        for cell in &marked {
            info!(coop = %cell.name(), reason = %cell.dereg_reason(), "cooperation deregistration started");
            cell.shutdown_agents(self.inner.drain_limit);
        }
        Ok(())
    }

    pub(crate) fn schedule_final_dereg(&self, name: String) {
        if let Some(tx) = self.inner.dereg_tx.get() {
            let _ = tx.send(DeregCommand::Final(name));
        }
    }

    /// Runs on the dedicated deregistration thread.
    fn final_deregister(&self, name: &str) {
        let (cell, parent) = {
            let mut registry = self.inner.registry.write();
            let Some(cell) = registry.deregistering.remove(name) else {
                return;
            };
            let parent = match cell.parent_name() {
                Some(parent_name) => {
                    registry
                        .relations
                        .remove(&(parent_name.to_string(), name.to_string()));
                    registry
                        .registered
                        .get(parent_name)
                        .or_else(|| registry.deregistering.get(parent_name))
                        .cloned()
                }
                None => None,
            };
            (cell, parent)
        };

        cell.unbind_all();
        let reason = cell.dereg_reason();
        cell.call_dereg_notificators();
        cell.drop_resources();
        info!(coop = %name, %reason, "cooperation deregistered");
        self.inner.observer.coop_deregistered(name, reason);
        if let Some(parent) = parent {
            parent.decrement_usage();
        }

        let mut latch = self.inner.latch.state.lock();
        latch.live_coops -= 1;
        if latch.live_coops == 0 {
            self.inner.latch.cond.notify_all();
        }
    }

    // --- Timers ---

    /// Delivers `msg` to `mbox` after `delay`, then every `period`. A zero
    /// `period` makes it a one-shot.
    pub fn schedule_timer<M: Message>(
        &self,
        msg: M,
        mbox: &Mbox,
        delay: Duration,
        period: Duration,
    ) -> TimerId {
        self.inner.timer.schedule(
            mbox.clone(),
            std::any::TypeId::of::<M>(),
            Payload::message(msg),
            delay,
            (!period.is_zero()).then_some(period),
        )
    }

    /// One-shot delayed delivery of `msg` to `mbox`.
    pub fn single_timer<M: Message>(&self, msg: M, mbox: &Mbox, delay: Duration) -> TimerId {
        self.schedule_timer(msg, mbox, delay, Duration::ZERO)
    }

    /// Signal counterpart of [`Environment::schedule_timer`].
    pub fn schedule_timer_signal<S: Signal>(
        &self,
        mbox: &Mbox,
        delay: Duration,
        period: Duration,
    ) -> TimerId {
        self.inner.timer.schedule(
            mbox.clone(),
            std::any::TypeId::of::<S>(),
            Payload::signal(),
            delay,
            (!period.is_zero()).then_some(period),
        )
    }

    /// Signal counterpart of [`Environment::single_timer`].
    pub fn single_timer_signal<S: Signal>(&self, mbox: &Mbox, delay: Duration) -> TimerId {
        self.schedule_timer_signal::<S>(mbox, delay, Duration::ZERO)
    }

    /// Stops future firings of a timer. Idempotent.
    pub fn cancel_timer(&self, id: TimerId) {
        self.inner.timer.cancel(id);
    }

    // --- Shutdown ---

    /// Initiates environment shutdown: every root cooperation is
    /// deregistered with reason [`DeregReason::Shutdown`] and new
    /// registrations are refused. Idempotent, returns immediately;
    /// [`launch`] unblocks once teardown completes.
    pub fn stop(&self) {
        if self
            .inner
            .state
            .compare_exchange(
                EnvState::Running as u8,
                EnvState::Stopping as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }
        info!("environment stop requested");
        let roots: Vec<String> = {
            // Write-locked so in-flight registrations either complete
            // before the sweep or fail with EnvironmentStopping after it.
            let registry = self.inner.registry.write();
            registry
                .registered
                .values()
                .filter(|cell| cell.parent_name().is_none())
                .map(|cell| cell.name().to_string())
                .collect()
        };
        for root in roots {
            let _ = self.deregister_coop(&root, DeregReason::Shutdown);
        }
        let mut latch = self.inner.latch.state.lock();
        latch.stop_requested = true;
        self.inner.latch.cond.notify_all();
    }

    fn wait_until_finished(&self) {
        let mut latch = self.inner.latch.state.lock();
        while !(latch.stop_requested && latch.live_coops == 0) {
            self.inner.latch.cond.wait(&mut latch);
        }
    }

    fn teardown(&self) {
        self.inner.timer.stop();
        let dispatchers: Vec<Arc<dyn Dispatcher>> =
            self.inner.dispatchers.lock().drain(..).collect();
        for dispatcher in dispatchers {
            debug!(dispatcher = dispatcher.name(), "shutting down dispatcher");
            dispatcher.shutdown();
        }
        if let Some(tx) = self.inner.dereg_tx.get() {
            let _ = tx.send(DeregCommand::Stop);
        }
        if let Some(join) = self.inner.dereg_join.lock().take() {
            let _ = join.join();
        }
        self.inner
            .state
            .store(EnvState::Stopped as u8, Ordering::Release);
    }
}

fn mark_subtree(
    registry: &mut CoopRegistry,
    cell: &Arc<CoopCell>,
    reason: DeregReason,
    marked: &mut Vec<Arc<CoopCell>>,
) {
    if !cell.begin_deregistration(reason) {
        return;
    }
    let name = cell.name().to_string();
    registry.registered.remove(&name);
    registry.deregistering.insert(name.clone(), Arc::clone(cell));
    marked.push(Arc::clone(cell));
    for child_name in registry.children_of(&name) {
        if let Some(child) = registry.registered.get(&child_name).cloned() {
            mark_subtree(registry, &child, DeregReason::ParentDeregistration, marked);
        }
    }
}

fn dereg_loop(env: Environment, rx: Receiver<DeregCommand>) {
    while let Ok(command) = rx.recv() {
        match command {
            DeregCommand::Final(name) => env.final_deregister(&name),
            DeregCommand::Stop => break,
        }
    }
}

/// Builds an environment, runs `init` on the calling thread and blocks it
/// until [`Environment::stop`] has been called and every cooperation has
/// fully deregistered. An error from `init` triggers shutdown and is
/// returned after teardown.
pub fn launch<F>(init: F) -> Result<(), RuntimeError>
where
    F: FnOnce(&Environment) -> Result<(), RuntimeError>,
{
    launch_with_params(EnvParams::default(), init)
}

/// [`launch`] with explicit [`EnvParams`].
pub fn launch_with_params<F>(params: EnvParams, init: F) -> Result<(), RuntimeError>
where
    F: FnOnce(&Environment) -> Result<(), RuntimeError>,
{
    let env = Environment::build(params)?;
    info!("environment started");
    let init_result = init(&env);
    if init_result.is_err() {
        env.stop();
    }
    env.wait_until_finished();
    env.teardown();
    info!("environment stopped");
    init_result
}
