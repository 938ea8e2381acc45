//! # Cooperations
//!
//! A cooperation is the transactional unit of registration: a named group
//! of agents that enters the environment all-or-nothing and leaves it the
//! same way. If any agent's `define` or dispatcher bind fails, every
//! already-performed step is rolled back in reverse order and the
//! environment never observes the group.
//!
//! Cooperations compose by name: a child names its parent, the environment
//! resolves the edge on demand, and deregistering a parent cascades to all
//! descendants. Teardown is gated on a reference count covering the live
//! agents, the live direct children and the registration routine itself;
//! the final teardown runs exactly once, when that count reaches zero.
//!
//! ```
//! # fn init(env: &agent_runtime::Environment) -> Result<(), agent_runtime::RuntimeError> {
//! let mut coop = env.create_coop("workers")?;
//! coop.add_agent(MyAgent::default());
//! coop.add_reg_notificator(|_env, name| println!("{name} is up"));
//! env.register_coop(coop)?;
//! # Ok(()) }
//! # #[derive(Default)] struct MyAgent;
//! # impl agent_runtime::Agent for MyAgent {}
//! ```

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::adhoc::AdhocAgentBuilder;
use crate::agent::{Agent, AgentCell, AgentRef, AnyAgent, ExceptionReaction};
use crate::demand::EventSinkRef;
use crate::dispatcher::Binder;
use crate::environment::Environment;
use crate::error::RuntimeError;
use crate::message::AgentId;

/// Why a cooperation is being torn down.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DeregReason {
    /// Explicit deregistration by user code.
    Normal,
    /// Environment shutdown.
    Shutdown,
    /// The parent cooperation is deregistering.
    ParentDeregistration,
    /// A handler panic escalated through the exception reaction.
    UnhandledException,
    /// An unclassified runtime failure.
    UnknownError,
    /// No reason recorded yet.
    Undefined,
    /// Application-defined reason; codes start at
    /// [`DeregReason::USER_REASON_BASE`].
    User(u32),
}

impl DeregReason {
    /// First code available for [`DeregReason::User`] reasons.
    pub const USER_REASON_BASE: u32 = 0x1000;
}

impl fmt::Display for DeregReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeregReason::Normal => write!(f, "normal"),
            DeregReason::Shutdown => write!(f, "shutdown"),
            DeregReason::ParentDeregistration => write!(f, "parent_deregistration"),
            DeregReason::UnhandledException => write!(f, "unhandled_exception"),
            DeregReason::UnknownError => write!(f, "unknown_error"),
            DeregReason::Undefined => write!(f, "undefined"),
            DeregReason::User(code) => write!(f, "user({code:#x})"),
        }
    }
}

/// Callback invoked after a cooperation finished registration.
pub type RegNotificator = Box<dyn Fn(&Environment, &str) + Send + Sync>;

/// Callback invoked after a cooperation finished final deregistration.
pub type DeregNotificator = Box<dyn Fn(&Environment, &str, DeregReason) + Send + Sync>;

/// A cooperation under construction. Obtained from
/// [`Environment::create_coop`], populated, then consumed by
/// [`Environment::register_coop`].
pub struct Coop {
    name: String,
    env: Environment,
    parent: Option<String>,
    default_binder: Arc<dyn Binder>,
    agents: Vec<(Arc<AgentCell>, Arc<dyn Binder>)>,
    reg_notificators: Vec<RegNotificator>,
    dereg_notificators: Vec<DeregNotificator>,
    resources: Vec<Box<dyn Any + Send>>,
    exception_reaction: ExceptionReaction,
}

impl Coop {
    pub(crate) fn new(name: String, env: Environment, default_binder: Arc<dyn Binder>) -> Self {
        Coop {
            name,
            env,
            parent: None,
            default_binder,
            agents: Vec::new(),
            reg_notificators: Vec::new(),
            dereg_notificators: Vec::new(),
            resources: Vec::new(),
            exception_reaction: ExceptionReaction::Inherit,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Adds an agent bound through the cooperation's default binder.
    pub fn add_agent(&mut self, agent: impl Agent) {
        self.add_boxed_agent(Box::new(agent), None);
    }

    /// Adds an agent with its own dispatcher binder.
    pub fn add_agent_with_binder(&mut self, agent: impl Agent, binder: Arc<dyn Binder>) {
        self.add_boxed_agent(Box::new(agent), Some(binder));
    }

    pub(crate) fn add_boxed_agent(
        &mut self,
        object: Box<dyn AnyAgent>,
        binder: Option<Arc<dyn Binder>>,
    ) {
        let binder = binder.unwrap_or_else(|| Arc::clone(&self.default_binder));
        let cell = AgentCell::new(object, self.env.clone());
        self.agents.push((cell, binder));
    }

    /// Starts the definition of an ad-hoc agent on the default binder; see
    /// [`AdhocAgentBuilder`].
    pub fn define_agent(&mut self) -> AdhocAgentBuilder<'_> {
        AdhocAgentBuilder::new(self, None)
    }

    /// Starts the definition of an ad-hoc agent on a specific binder.
    pub fn define_agent_with_binder(&mut self, binder: Arc<dyn Binder>) -> AdhocAgentBuilder<'_> {
        AdhocAgentBuilder::new(self, Some(binder))
    }

    /// Declares the parent cooperation. The parent must be registered by
    /// the time this cooperation registers.
    pub fn set_parent_coop_name(&mut self, name: impl Into<String>) {
        self.parent = Some(name.into());
    }

    pub fn add_reg_notificator(
        &mut self,
        notificator: impl Fn(&Environment, &str) + Send + Sync + 'static,
    ) {
        self.reg_notificators.push(Box::new(notificator));
    }

    pub fn add_dereg_notificator(
        &mut self,
        notificator: impl Fn(&Environment, &str, DeregReason) + Send + Sync + 'static,
    ) {
        self.dereg_notificators.push(Box::new(notificator));
    }

    /// Keeps `resource` alive for the cooperation's lifetime. Resources are
    /// dropped in reverse insertion order during final teardown.
    pub fn take_under_control<T: Any + Send>(&mut self, resource: T) {
        self.resources.push(Box::new(resource));
    }

    /// Exception reaction for agents of this cooperation that use
    /// [`ExceptionReaction::Inherit`].
    pub fn set_exception_reaction(&mut self, reaction: ExceptionReaction) {
        self.exception_reaction = reaction;
    }

    pub(crate) fn agent_count(&self) -> usize {
        self.agents.len()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum CoopStatus {
    NotRegistered,
    Registered,
    Deregistering,
}

struct BoundAgent {
    cell: Arc<AgentCell>,
    binder: Arc<dyn Binder>,
    sink: Mutex<Option<EventSinkRef>>,
}

impl BoundAgent {
    fn agent_ref(&self) -> AgentRef {
        AgentRef {
            cell: Arc::clone(&self.cell),
        }
    }
}

/// Runtime-side state of a registered (or registering) cooperation.
pub(crate) struct CoopCell {
    name: String,
    env: Environment,
    parent: Option<String>,
    agents: Vec<BoundAgent>,
    /// Status and the recorded deregistration reason, changed together.
    status: Mutex<(CoopStatus, DeregReason)>,
    /// Live agents + live direct children + 1 while the registration
    /// routine is in flight. Final teardown fires when it reaches zero
    /// after the cooperation left REGISTERED.
    refcount: AtomicUsize,
    reg_notificators: Vec<RegNotificator>,
    dereg_notificators: Vec<DeregNotificator>,
    resources: Mutex<Vec<Box<dyn Any + Send>>>,
    exception_reaction: ExceptionReaction,
    resolved_reaction: OnceLock<ExceptionReaction>,
}

impl CoopCell {
    pub(crate) fn from_coop(coop: Coop) -> Self {
        let refcount = AtomicUsize::new(coop.agents.len() + 1);
        CoopCell {
            name: coop.name,
            env: coop.env,
            parent: coop.parent,
            agents: coop
                .agents
                .into_iter()
                .map(|(cell, binder)| BoundAgent {
                    cell,
                    binder,
                    sink: Mutex::new(None),
                })
                .collect(),
            status: Mutex::new((CoopStatus::NotRegistered, DeregReason::Undefined)),
            refcount,
            reg_notificators: coop.reg_notificators,
            dereg_notificators: coop.dereg_notificators,
            resources: Mutex::new(coop.resources),
            exception_reaction: coop.exception_reaction,
            resolved_reaction: OnceLock::new(),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn parent_name(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    pub(crate) fn dereg_reason(&self) -> DeregReason {
        self.status.lock().1
    }

    /// Computes the effective exception reaction for the cooperation and
    /// caches the per-agent resolution. `parent_resolved` is already fully
    /// resolved, so the walk is one step here.
    pub(crate) fn resolve_reactions(
        &self,
        parent_resolved: Option<ExceptionReaction>,
        env_default: ExceptionReaction,
    ) {
        let own = if self.exception_reaction != ExceptionReaction::Inherit {
            self.exception_reaction
        } else {
            parent_resolved.unwrap_or(env_default)
        };
        let _ = self.resolved_reaction.set(own);
        for agent in &self.agents {
            let agent_level = agent.cell.agent_exception_reaction();
            let effective = if agent_level != ExceptionReaction::Inherit {
                agent_level
            } else {
                own
            };
            agent.cell.set_resolved_reaction(effective);
        }
    }

    pub(crate) fn resolved_reaction(&self) -> ExceptionReaction {
        self.resolved_reaction
            .get()
            .copied()
            .unwrap_or(ExceptionReaction::Abort)
    }

    /// Define and bind every agent, all-or-nothing. On failure all partial
    /// effects are undone in reverse order and the error surfaces to the
    /// `register_coop` caller.
    pub(crate) fn run_registration_steps(self: &Arc<Self>) -> Result<(), RuntimeError> {
        for agent in &self.agents {
            agent.cell.attach_coop(Arc::downgrade(self));
        }

        for (index, agent) in self.agents.iter().enumerate() {
            if let Err(source) = agent.cell.run_define() {
                for done in self.agents[..index].iter().rev() {
                    done.cell.undefine();
                }
                return Err(RuntimeError::AgentDefineFailed {
                    coop: self.name.clone(),
                    source,
                });
            }
        }

        for (index, agent) in self.agents.iter().enumerate() {
            match agent.binder.bind(&agent.agent_ref(), &self.name) {
                Ok(sink) => {
                    *agent.sink.lock() = Some(sink);
                    agent.cell.mark_bound();
                }
                Err(source) => {
                    for touched in self.agents[..=index].iter().rev() {
                        touched.binder.unbind(&touched.agent_ref());
                        *touched.sink.lock() = None;
                    }
                    for defined in self.agents.iter().rev() {
                        defined.cell.undefine();
                    }
                    return Err(RuntimeError::DispatcherBindFailed {
                        coop: self.name.clone(),
                        source: Box::new(source),
                    });
                }
            }
        }
        Ok(())
    }

    pub(crate) fn mark_registered(&self) {
        self.status.lock().0 = CoopStatus::Registered;
    }

    /// Schedules `start` as the first demand on every agent's queue and
    /// lets buffered deliveries through.
    pub(crate) fn arm_agents(&self) {
        for agent in &self.agents {
            let sink = agent.sink.lock().clone();
            if let Some(sink) = sink {
                agent.cell.arm(sink.sink);
            }
        }
    }

    /// Atomic REGISTERED to DEREGISTERING transition. Returns false when
    /// the cooperation is already past it, making deregistration a no-op
    /// the second time.
    pub(crate) fn begin_deregistration(&self, reason: DeregReason) -> bool {
        let mut status = self.status.lock();
        if status.0 != CoopStatus::Registered {
            return false;
        }
        *status = (CoopStatus::Deregistering, reason);
        true
    }

    /// Tells every agent to shut down after its in-flight event.
    pub(crate) fn shutdown_agents(&self, drain_limit: usize) {
        for agent in &self.agents {
            agent.cell.initiate_shutdown(drain_limit);
        }
    }

    /// Final unbind of all agents, reverse bind order.
    pub(crate) fn unbind_all(&self) {
        for agent in self.agents.iter().rev() {
            agent.cell.detach();
            *agent.sink.lock() = None;
            agent.binder.unbind(&agent.agent_ref());
        }
    }

    pub(crate) fn increment_usage(&self) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops one usage. The zero crossing after REGISTERED hands the
    /// cooperation to the environment's deregistration thread exactly once.
    pub(crate) fn decrement_usage(self: &Arc<Self>) {
        if self.refcount.fetch_sub(1, Ordering::AcqRel) == 1 {
            let deregistering = self.status.lock().0 == CoopStatus::Deregistering;
            if deregistering {
                self.env.schedule_final_dereg(self.name.clone());
            }
        }
    }

    pub(crate) fn agent_finished(self: &Arc<Self>, agent: AgentId) {
        debug!(coop = %self.name, %agent, "agent finished");
        self.decrement_usage();
    }

    /// Notificator panics are swallowed.
    pub(crate) fn call_reg_notificators(&self) {
        for notificator in &self.reg_notificators {
            let call = AssertUnwindSafe(|| notificator(&self.env, &self.name));
            if panic::catch_unwind(call).is_err() {
                warn!(coop = %self.name, "registration notificator panicked");
            }
        }
    }

    /// Notificator panics are swallowed.
    pub(crate) fn call_dereg_notificators(&self) {
        let reason = self.dereg_reason();
        for notificator in &self.dereg_notificators {
            let call = AssertUnwindSafe(|| notificator(&self.env, &self.name, reason));
            if panic::catch_unwind(call).is_err() {
                warn!(coop = %self.name, "deregistration notificator panicked");
            }
        }
    }

    /// Drops user resources in reverse insertion order.
    pub(crate) fn drop_resources(&self) {
        let mut resources = self.resources.lock();
        while let Some(resource) = resources.pop() {
            drop(resource);
        }
    }
}
