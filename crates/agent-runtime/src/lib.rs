//! # Agent Runtime
//!
//! An in-process actor runtime: independent units of computation
//! ("agents") communicate exclusively by asynchronous messages delivered
//! through mailboxes, and are scheduled onto worker threads by pluggable
//! dispatchers. Agents are grouped into cooperations, the transactional
//! unit of registration and deregistration.
//!
//! ## Why agents?
//!
//! Each agent processes its events **sequentially** on exactly one worker
//! thread at a time. That single invariant removes the need for locks in
//! application state: an agent's fields are only ever touched from its own
//! handlers. Parallelism comes from running many agents, not from sharing
//! one agent's state.
//!
//! ## Architecture Overview
//!
//! The runtime separates concerns into three layers:
//!
//! 1. **Messaging** ([`Mbox`], [`Message`], [`Signal`]) - typed events
//!    fanned out to subscribers with per-subscriber FIFO.
//! 2. **Scheduling** ([`dispatcher`]) - policies that map agents to worker
//!    threads behind a common [`Binder`](dispatcher::Binder) contract.
//! 3. **Lifecycle** ([`Coop`], [`Environment`]) - all-or-nothing
//!    registration of agent groups, reference-counted teardown that waits
//!    for in-flight work, and parent/child cascade.
//!
//! ## Quick Start
//!
//! ```
//! use agent_runtime::{launch, Agent, AgentContext, DefineError};
//!
//! struct MsgHello {
//!     text: String,
//! }
//!
//! struct HelloAgent;
//!
//! impl Agent for HelloAgent {
//!     fn define(&mut self, ctx: &mut AgentContext) -> Result<(), DefineError> {
//!         let mbox = ctx.direct_mbox();
//!         ctx.subscribe(&mbox).event(
//!             |_: &mut HelloAgent, ctx: &mut AgentContext, msg: &MsgHello| {
//!                 println!("{}", msg.text);
//!                 ctx.environment().stop();
//!             },
//!         )?;
//!         Ok(())
//!     }
//!
//!     fn start(&mut self, ctx: &mut AgentContext) {
//!         ctx.direct_mbox().deliver(MsgHello {
//!             text: "Hello, world!".into(),
//!         });
//!     }
//! }
//!
//! launch(|env| env.register_agent_as_coop("hello", HelloAgent)).unwrap();
//! ```
//!
//! ## Concurrency Model
//!
//! - Workers are plain OS threads owned by dispatchers; handlers run to
//!   completion and never suspend.
//! - Per `(mailbox, subscriber)` delivery order is FIFO.
//! - A blocking handler stalls exactly what its dispatcher policy says:
//!   one agent under [`dispatcher::active_obj`], everything bound to the
//!   worker under [`dispatcher::one_thread`].
//!
//! ## Shutdown
//!
//! [`Environment::stop`] deregisters every root cooperation (cascading to
//! children), each agent finishes the event in flight, runs its `finish`
//! hook, and [`launch`] returns once the registry is empty. In-flight
//! handlers are never cancelled; queued events past the drain budget are
//! dropped through the deadletter path.

pub mod dispatcher;
pub mod tracing;

mod adhoc;
mod agent;
mod coop;
mod demand;
mod environment;
mod error;
mod mbox;
mod message;
mod observer;
mod subscription;
mod timer;

pub use adhoc::AdhocAgentBuilder;
pub use agent::{Agent, AgentContext, AgentRef, ExceptionReaction, Subscribe};
pub use coop::{Coop, DeregNotificator, DeregReason, RegNotificator};
pub use demand::EventSinkRef;
pub use environment::{launch, launch_with_params, EnvParams, Environment};
pub use error::{DefineError, RuntimeError};
pub use mbox::{Mbox, MboxKind};
pub use message::{AgentId, MboxId, Message, Signal};
pub use observer::RuntimeObserver;
pub use timer::TimerId;
