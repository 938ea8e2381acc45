//! # Agents
//!
//! An agent is a single-threaded event-handling entity: it owns a
//! subscription table and three lifecycle hooks, and every hook or handler
//! runs on the one worker its dispatcher assigned to it. That is the
//! central invariant of the runtime. Because at most one handler runs for a
//! given agent at any instant, agent state needs no internal locking.
//!
//! ## Lifecycle
//!
//! `define` registers subscriptions, `start` is the first event the agent
//! sees after its cooperation registered, `finish` is the last one before
//! teardown. In between, incoming events are routed through the
//! subscription table built in `define` (and possibly amended from inside
//! handlers).
//!
//! ## Handlers
//!
//! Handlers are registered per `(mailbox, message type)` pair:
//!
//! ```
//! use agent_runtime::{Agent, AgentContext, DefineError};
//!
//! struct MsgGreet { text: String }
//!
//! struct Greeter;
//!
//! impl Agent for Greeter {
//!     fn define(&mut self, ctx: &mut AgentContext) -> Result<(), DefineError> {
//!         let mbox = ctx.direct_mbox();
//!         ctx.subscribe(&mbox)
//!             .event(|_: &mut Greeter, ctx: &mut AgentContext, msg: &MsgGreet| {
//!                 println!("{}", msg.text);
//!                 ctx.environment().stop();
//!             })?;
//!         Ok(())
//!     }
//!
//!     fn start(&mut self, ctx: &mut AgentContext) {
//!         ctx.direct_mbox().deliver(MsgGreet { text: "hello".into() });
//!     }
//! }
//! ```
//!
//! A handler that panics does not take the worker down: the panic is caught
//! and the effective [`ExceptionReaction`] is applied, resolved by walking
//! agent, cooperation, parent cooperations, environment default.

use std::any::{Any, TypeId};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use tracing::{debug, error, trace};

use crate::coop::{CoopCell, DeregReason};
use crate::demand::{Demand, DemandKind, EventSink};
use crate::environment::Environment;
use crate::error::{DefineError, RuntimeError};
use crate::mbox::Mbox;
use crate::message::{AgentId, Event, Message, Signal};
use crate::subscription::{ErasedHandler, SubscriptionTable};

/// Reaction to a panic escaping a handler, consulted per scope with
/// `Inherit` delegating to the enclosing scope (agent, cooperation, parent
/// cooperations, environment default).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ExceptionReaction {
    /// Terminate the whole process.
    Abort,
    /// Deregister the agent's own cooperation.
    ShutdownSelf,
    /// Deregister the agent's cooperation (same effect as `ShutdownSelf`;
    /// kept distinct so intent reads at the call site).
    ShutdownCoop,
    /// Drop the event and keep going.
    Ignore,
    /// Defer to the enclosing scope.
    Inherit,
}

impl ExceptionReaction {
    fn as_u8(self) -> u8 {
        match self {
            ExceptionReaction::Abort => 0,
            ExceptionReaction::ShutdownSelf => 1,
            ExceptionReaction::ShutdownCoop => 2,
            ExceptionReaction::Ignore => 3,
            ExceptionReaction::Inherit => 4,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => ExceptionReaction::Abort,
            1 => ExceptionReaction::ShutdownSelf,
            2 => ExceptionReaction::ShutdownCoop,
            3 => ExceptionReaction::Ignore,
            _ => ExceptionReaction::Inherit,
        }
    }
}

/// Contract every agent implements. All hooks default to no-ops so a dummy
/// agent is just an empty struct.
pub trait Agent: Any + Send {
    /// Register subscriptions. Runs on the registration thread before the
    /// agent is bound to a dispatcher; an error (or panic) fails the whole
    /// cooperation registration atomically.
    fn define(&mut self, _ctx: &mut AgentContext) -> Result<(), DefineError> {
        Ok(())
    }

    /// First event on the agent's worker.
    fn start(&mut self, _ctx: &mut AgentContext) {}

    /// Last event on the agent's worker, guaranteed to run for every agent
    /// that received `start`.
    fn finish(&mut self, _ctx: &mut AgentContext) {}

    /// Agent-level exception reaction. `Inherit` (the default) delegates to
    /// the cooperation.
    fn exception_reaction(&self) -> ExceptionReaction {
        ExceptionReaction::Inherit
    }
}

/// Object-safe downcast access, blanket-implemented for every agent type.
pub(crate) trait AnyAgent: Agent {
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<A: Agent> AnyAgent for A {
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Lifecycle states, monotonic except for registration rollback.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum AgentState {
    New = 0,
    Defined = 1,
    Bound = 2,
    Running = 3,
    ShuttingDown = 4,
    Dead = 5,
}

impl AgentState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => AgentState::New,
            1 => AgentState::Defined,
            2 => AgentState::Bound,
            3 => AgentState::Running,
            4 => AgentState::ShuttingDown,
            _ => AgentState::Dead,
        }
    }
}

/// Where the agent's demands currently go.
///
/// Between `define` and arming, demands are buffered so deliveries from
/// already-running agents are not lost and still land after `start`.
enum QueueState {
    Detached,
    Pending(Vec<DemandKind>),
    Attached(Arc<dyn EventSink>),
}

/// Shared handle to an agent, used by cooperations, mailboxes and binders.
#[derive(Clone)]
pub struct AgentRef {
    pub(crate) cell: Arc<AgentCell>,
}

impl AgentRef {
    pub fn id(&self) -> AgentId {
        self.cell.id
    }

    pub(crate) fn cell(&self) -> &Arc<AgentCell> {
        &self.cell
    }
}

/// Runtime-side representation of one agent: the user object, its
/// subscription table, its queue attachment and its lifecycle state.
pub(crate) struct AgentCell {
    id: AgentId,
    env: Environment,
    direct_mbox: Mbox,
    object: Mutex<Box<dyn AnyAgent>>,
    table: Mutex<SubscriptionTable>,
    state: AtomicU8,
    queue: Mutex<QueueState>,
    drain_credit: AtomicUsize,
    coop: OnceLock<Weak<CoopCell>>,
    /// Exception reaction resolved at registration time.
    reaction: AtomicU8,
}

impl AgentCell {
    pub(crate) fn new(object: Box<dyn AnyAgent>, env: Environment) -> Arc<Self> {
        let id = AgentId::next();
        let direct_mbox = Mbox::new_direct(id, env.observer_arc());
        Arc::new(AgentCell {
            id,
            env,
            direct_mbox,
            object: Mutex::new(object),
            table: Mutex::new(SubscriptionTable::default()),
            state: AtomicU8::new(AgentState::New as u8),
            queue: Mutex::new(QueueState::Detached),
            drain_credit: AtomicUsize::new(0),
            coop: OnceLock::new(),
            reaction: AtomicU8::new(ExceptionReaction::Inherit.as_u8()),
        })
    }

    pub(crate) fn id(&self) -> AgentId {
        self.id
    }

    pub(crate) fn direct_mbox(&self) -> Mbox {
        self.direct_mbox.clone()
    }

    pub(crate) fn state(&self) -> AgentState {
        AgentState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: AgentState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn compare_state(&self, from: AgentState, to: AgentState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn attach_coop(&self, coop: Weak<CoopCell>) {
        let _ = self.coop.set(coop);
    }

    pub(crate) fn agent_exception_reaction(&self) -> ExceptionReaction {
        self.object.lock().exception_reaction()
    }

    pub(crate) fn set_resolved_reaction(&self, reaction: ExceptionReaction) {
        self.reaction.store(reaction.as_u8(), Ordering::Release);
    }

    fn handle(self: &Arc<Self>) -> AgentRef {
        AgentRef {
            cell: Arc::clone(self),
        }
    }

    // --- Subscription plumbing (worker thread or define phase only) ---

    pub(crate) fn add_subscription(
        self: &Arc<Self>,
        mbox: &Mbox,
        type_id: TypeId,
        handler: ErasedHandler,
    ) -> Result<(), RuntimeError> {
        self.table.lock().insert(mbox.clone(), type_id, handler)?;
        if let Err(e) = mbox.add_subscriber(type_id, self) {
            self.table.lock().remove(mbox.id(), type_id);
            return Err(e);
        }
        Ok(())
    }

    pub(crate) fn remove_subscription(&self, mbox: &Mbox, type_id: TypeId) {
        if self.table.lock().remove(mbox.id(), type_id).is_some() {
            mbox.remove_subscriber(type_id, self.id);
        }
    }

    fn teardown_subscriptions(&self) {
        for (mbox, type_id) in self.table.lock().drain() {
            mbox.remove_subscriber(type_id, self.id);
        }
    }

    // --- Registration-side lifecycle ---

    /// Runs the `define` hook with demand buffering enabled. On failure the
    /// agent is left exactly as before the call.
    pub(crate) fn run_define(self: &Arc<Self>) -> Result<(), DefineError> {
        *self.queue.lock() = QueueState::Pending(Vec::new());
        let mut ctx = AgentContext::new(self.env.clone(), self.handle());
        let result = {
            let mut object = self.object.lock();
            panic::catch_unwind(AssertUnwindSafe(|| object.define(&mut ctx)))
                .unwrap_or_else(|_| Err("agent define hook panicked".into()))
        };
        match result {
            Ok(()) => {
                self.set_state(AgentState::Defined);
                Ok(())
            }
            Err(e) => {
                self.undefine();
                Err(e)
            }
        }
    }

    /// Reverse of `run_define`: drops every subscription made so far.
    pub(crate) fn undefine(&self) {
        self.teardown_subscriptions();
        *self.queue.lock() = QueueState::Detached;
        self.set_state(AgentState::New);
    }

    pub(crate) fn mark_bound(&self) {
        self.set_state(AgentState::Bound);
    }

    /// Attaches the dispatcher queue slot: schedules `start` as the first
    /// demand, then replays everything buffered since `define`.
    pub(crate) fn arm(self: &Arc<Self>, sink: Arc<dyn EventSink>) {
        let mut queue = self.queue.lock();
        sink.push(Demand::new(self.handle(), DemandKind::Start));
        if let QueueState::Pending(buffered) =
            std::mem::replace(&mut *queue, QueueState::Attached(Arc::clone(&sink)))
        {
            for kind in buffered {
                sink.push(Demand::new(self.handle(), kind));
            }
        }
    }

    /// Moves the agent into SHUTTING_DOWN and schedules its `finish`
    /// demand. Returns false if shutdown already began.
    pub(crate) fn initiate_shutdown(self: &Arc<Self>, drain_limit: usize) -> bool {
        loop {
            match self.state() {
                s @ (AgentState::Bound | AgentState::Running) => {
                    if self.compare_state(s, AgentState::ShuttingDown) {
                        break;
                    }
                }
                _ => return false,
            }
        }
        self.drain_credit.store(drain_limit, Ordering::Release);
        let mut queue = self.queue.lock();
        match &mut *queue {
            QueueState::Detached => {
                drop(queue);
                self.agent_finished();
            }
            QueueState::Pending(buffered) => buffered.push(DemandKind::Finish),
            QueueState::Attached(sink) => {
                sink.push(Demand::new(self.handle(), DemandKind::Finish))
            }
        }
        true
    }

    /// Final unbind: demands can no longer reach the agent.
    pub(crate) fn detach(&self) {
        *self.queue.lock() = QueueState::Detached;
        self.set_state(AgentState::Dead);
    }

    // --- Delivery side ---

    pub(crate) fn push_event(self: &Arc<Self>, ev: Event) {
        match self.state() {
            AgentState::ShuttingDown | AgentState::Dead => {
                self.deadletter(&ev);
                return;
            }
            _ => {}
        }
        let mut queue = self.queue.lock();
        match &mut *queue {
            QueueState::Detached => {
                drop(queue);
                self.deadletter(&ev);
            }
            QueueState::Pending(buffered) => buffered.push(DemandKind::Event(ev)),
            QueueState::Attached(sink) => {
                sink.push(Demand::new(self.handle(), DemandKind::Event(ev)))
            }
        }
    }

    fn deadletter(&self, ev: &Event) {
        trace!(agent = %self.id, mbox = %ev.mbox_id, "event dropped");
        self.env.observer_arc().deadletter(Some(self.id), ev.mbox_id);
    }

    // --- Worker side ---

    /// Runs one demand on the calling worker thread. The dispatcher
    /// guarantees at most one concurrent call per agent.
    pub(crate) fn exec_demand(self: &Arc<Self>, kind: DemandKind) {
        match kind {
            DemandKind::Start => {
                let _ = self.compare_state(AgentState::Bound, AgentState::Running);
                debug!(agent = %self.id, "start");
                if self.invoke(|agent, ctx| agent.start(ctx)).is_err() {
                    self.apply_exception_reaction("start");
                }
            }
            DemandKind::Event(ev) => {
                match self.state() {
                    AgentState::ShuttingDown => {
                        if !self.take_drain_credit() {
                            self.deadletter(&ev);
                            return;
                        }
                    }
                    AgentState::Dead => {
                        self.deadletter(&ev);
                        return;
                    }
                    _ => {}
                }
                let handler = self.table.lock().lookup(ev.mbox_id, ev.type_id);
                let Some(handler) = handler else {
                    self.deadletter(&ev);
                    return;
                };
                let outcome =
                    self.invoke(|agent, ctx| (*handler)(agent.as_any_mut(), ctx, &ev.payload));
                self.env.observer_arc().event_handled(self.id);
                if outcome.is_err() {
                    self.apply_exception_reaction("event handler");
                }
            }
            DemandKind::Finish => {
                debug!(agent = %self.id, "finish");
                if self.invoke(|agent, ctx| agent.finish(ctx)).is_err() {
                    error!(agent = %self.id, "finish hook panicked");
                }
                self.teardown_subscriptions();
                self.agent_finished();
            }
        }
    }

    fn invoke<R>(
        self: &Arc<Self>,
        f: impl FnOnce(&mut dyn AnyAgent, &mut AgentContext) -> R,
    ) -> std::thread::Result<R> {
        let mut ctx = AgentContext::new(self.env.clone(), self.handle());
        let mut object = self.object.lock();
        panic::catch_unwind(AssertUnwindSafe(|| f(&mut **object, &mut ctx)))
    }

    fn take_drain_credit(&self) -> bool {
        self.drain_credit
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1))
            .is_ok()
    }

    fn agent_finished(&self) {
        if let Some(coop) = self.coop.get().and_then(Weak::upgrade) {
            coop.agent_finished(self.id);
        }
    }

    fn apply_exception_reaction(self: &Arc<Self>, site: &str) {
        let reaction = ExceptionReaction::from_u8(self.reaction.load(Ordering::Acquire));
        let coop_name = self
            .coop
            .get()
            .and_then(Weak::upgrade)
            .map(|c| c.name().to_string());
        match reaction {
            ExceptionReaction::Ignore => {
                error!(agent = %self.id, site, "handler panicked, event dropped");
            }
            ExceptionReaction::ShutdownSelf | ExceptionReaction::ShutdownCoop => {
                if let Some(name) = coop_name {
                    error!(agent = %self.id, coop = %name, site, "handler panicked, deregistering cooperation");
                    let _ = self
                        .env
                        .deregister_coop(&name, DeregReason::UnhandledException);
                } else {
                    error!(agent = %self.id, site, "handler panicked outside a cooperation, aborting");
                    std::process::abort();
                }
            }
            ExceptionReaction::Abort | ExceptionReaction::Inherit => {
                error!(agent = %self.id, site, "handler panicked, aborting process");
                std::process::abort();
            }
        }
    }
}

/// Execution context handed to every hook and handler.
///
/// It gives access to the environment, the agent's direct mailbox, and the
/// subscription API. Subscription changes made through it take effect no
/// later than the next event the worker dequeues.
pub struct AgentContext {
    env: Environment,
    agent: AgentRef,
}

impl AgentContext {
    pub(crate) fn new(env: Environment, agent: AgentRef) -> Self {
        AgentContext { env, agent }
    }

    pub fn environment(&self) -> &Environment {
        &self.env
    }

    pub fn agent_id(&self) -> AgentId {
        self.agent.id()
    }

    /// The agent's own MPSC mailbox.
    pub fn direct_mbox(&self) -> Mbox {
        self.agent.cell.direct_mbox()
    }

    /// Starts a subscription on `mbox`; finish it with
    /// [`Subscribe::event`] or [`Subscribe::signal`].
    pub fn subscribe(&mut self, mbox: &Mbox) -> Subscribe<'_> {
        Subscribe {
            ctx: self,
            mbox: mbox.clone(),
        }
    }

    /// Idempotent removal of this agent's subscription for `M` on `mbox`.
    pub fn unsubscribe<M: Message>(&mut self, mbox: &Mbox) {
        self.agent.cell.remove_subscription(mbox, TypeId::of::<M>());
    }

    pub(crate) fn add_erased_subscription(
        &mut self,
        mbox: &Mbox,
        type_id: TypeId,
        handler: ErasedHandler,
    ) -> Result<(), RuntimeError> {
        self.agent.cell.add_subscription(mbox, type_id, handler)
    }
}

/// In-flight subscription, tied to one mailbox.
pub struct Subscribe<'c> {
    ctx: &'c AgentContext,
    mbox: Mbox,
}

impl Subscribe<'_> {
    /// Subscribes a message handler. `A` is the agent type, `M` the
    /// payload type; both are inferred from the handler.
    pub fn event<M, A, F>(self, handler: F) -> Result<(), RuntimeError>
    where
        M: Message,
        A: Agent,
        F: Fn(&mut A, &mut AgentContext, &M) + Send + Sync + 'static,
    {
        let erased: ErasedHandler = Arc::new(move |object, ctx, payload| {
            let Some(agent) = object.downcast_mut::<A>() else {
                trace!("agent type mismatch at dispatch, event dropped");
                return;
            };
            let Some(msg) = payload.downcast_ref::<M>() else {
                trace!("payload type mismatch at dispatch, event dropped");
                return;
            };
            handler(agent, ctx, msg);
        });
        self.ctx
            .agent
            .cell()
            .add_subscription(&self.mbox, TypeId::of::<M>(), erased)
    }

    /// Subscribes a signal handler. The signal type cannot be inferred and
    /// is given explicitly: `ctx.subscribe(&mbox).signal::<SigStop, _, _>(...)`.
    pub fn signal<S, A, F>(self, handler: F) -> Result<(), RuntimeError>
    where
        S: Signal,
        A: Agent,
        F: Fn(&mut A, &mut AgentContext) + Send + Sync + 'static,
    {
        let erased: ErasedHandler = Arc::new(move |object, ctx, _payload| {
            let Some(agent) = object.downcast_mut::<A>() else {
                trace!("agent type mismatch at dispatch, event dropped");
                return;
            };
            handler(agent, ctx);
        });
        self.ctx
            .agent
            .cell()
            .add_subscription(&self.mbox, TypeId::of::<S>(), erased)
    }
}
