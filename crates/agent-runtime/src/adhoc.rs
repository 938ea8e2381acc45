//! # Ad-hoc Agents
//!
//! Small agents whose behavior is a handful of closures do not deserve a
//! struct and an `impl Agent`. [`Coop::define_agent`](crate::Coop::define_agent)
//! returns a builder collecting `on_start` / `on_finish` closures and
//! per-`(mailbox, type)` handlers; when the builder is dropped the finished
//! agent joins the cooperation like any other.
//!
//! ```
//! # fn wire(coop: &mut agent_runtime::Coop, mbox: agent_runtime::Mbox) {
//! struct SigPing;
//! impl agent_runtime::Signal for SigPing {}
//!
//! coop.define_agent()
//!     .on_start(|_ctx| println!("ready"))
//!     .signal::<SigPing>(&mbox, move |_ctx| println!("ping"));
//! # }
//! ```
//!
//! This is sugar only: the builder populates a private agent type whose
//! `define` hook registers the collected handlers, so no new runtime
//! concept is involved.

use std::any::TypeId;
use std::sync::Arc;

use crate::agent::{Agent, AgentContext, ExceptionReaction};
use crate::coop::Coop;
use crate::dispatcher::Binder;
use crate::error::DefineError;
use crate::mbox::Mbox;
use crate::message::{Message, Payload, Signal};
use crate::subscription::ErasedHandler;

type AdhocHook = Box<dyn FnMut(&mut AgentContext) + Send>;
type AdhocHandler = Box<dyn FnMut(&mut AgentContext, &Payload) + Send>;

struct AdhocSubscription {
    mbox: Mbox,
    type_id: TypeId,
    handler: AdhocHandler,
}

/// The agent type behind [`Coop::define_agent`].
pub(crate) struct AdhocAgent {
    on_start: Option<AdhocHook>,
    on_finish: Option<AdhocHook>,
    subscriptions: Vec<AdhocSubscription>,
    reaction: ExceptionReaction,
}

impl Default for AdhocAgent {
    fn default() -> Self {
        AdhocAgent {
            on_start: None,
            on_finish: None,
            subscriptions: Vec::new(),
            reaction: ExceptionReaction::Inherit,
        }
    }
}

impl Agent for AdhocAgent {
    fn define(&mut self, ctx: &mut AgentContext) -> Result<(), DefineError> {
        for index in 0..self.subscriptions.len() {
            let mbox = self.subscriptions[index].mbox.clone();
            let type_id = self.subscriptions[index].type_id;
            // Trampoline back into the agent's own closure list so the
            // stored handlers can stay FnMut.
            let erased: ErasedHandler = Arc::new(move |object, ctx, payload| {
                let Some(agent) = object.downcast_mut::<AdhocAgent>() else {
                    return;
                };
                let sub = &mut agent.subscriptions[index];
                (sub.handler)(ctx, payload);
            });
            ctx.add_erased_subscription(&mbox, type_id, erased)?;
        }
        Ok(())
    }

    fn start(&mut self, ctx: &mut AgentContext) {
        if let Some(hook) = self.on_start.as_mut() {
            hook(ctx);
        }
    }

    fn finish(&mut self, ctx: &mut AgentContext) {
        if let Some(hook) = self.on_finish.as_mut() {
            hook(ctx);
        }
    }

    fn exception_reaction(&self) -> ExceptionReaction {
        self.reaction
    }
}

/// Builder returned by [`Coop::define_agent`]. Dropping it adds the
/// assembled agent to the cooperation.
pub struct AdhocAgentBuilder<'a> {
    coop: &'a mut Coop,
    binder: Option<Arc<dyn Binder>>,
    parts: AdhocAgent,
}

impl<'a> AdhocAgentBuilder<'a> {
    pub(crate) fn new(coop: &'a mut Coop, binder: Option<Arc<dyn Binder>>) -> Self {
        AdhocAgentBuilder {
            coop,
            binder,
            parts: AdhocAgent::default(),
        }
    }

    /// Action to run as the agent's first event.
    pub fn on_start(mut self, hook: impl FnMut(&mut AgentContext) + Send + 'static) -> Self {
        self.parts.on_start = Some(Box::new(hook));
        self
    }

    /// Action to run as the agent's last event.
    pub fn on_finish(mut self, hook: impl FnMut(&mut AgentContext) + Send + 'static) -> Self {
        self.parts.on_finish = Some(Box::new(hook));
        self
    }

    /// Subscribes a message handler on `mbox`.
    pub fn event<M: Message>(
        mut self,
        mbox: &Mbox,
        mut handler: impl FnMut(&mut AgentContext, &M) + Send + 'static,
    ) -> Self {
        let handler: AdhocHandler = Box::new(move |ctx, payload| {
            if let Some(msg) = payload.downcast_ref::<M>() {
                handler(ctx, msg);
            }
        });
        self.parts.subscriptions.push(AdhocSubscription {
            mbox: mbox.clone(),
            type_id: TypeId::of::<M>(),
            handler,
        });
        self
    }

    /// Subscribes a signal handler on `mbox`.
    pub fn signal<S: Signal>(
        mut self,
        mbox: &Mbox,
        mut handler: impl FnMut(&mut AgentContext) + Send + 'static,
    ) -> Self {
        let handler: AdhocHandler = Box::new(move |ctx, _payload| handler(ctx));
        self.parts.subscriptions.push(AdhocSubscription {
            mbox: mbox.clone(),
            type_id: TypeId::of::<S>(),
            handler,
        });
        self
    }

    /// Exception reaction for the ad-hoc agent.
    pub fn exception_reaction(mut self, reaction: ExceptionReaction) -> Self {
        self.parts.reaction = reaction;
        self
    }
}

impl Drop for AdhocAgentBuilder<'_> {
    fn drop(&mut self) {
        let agent = std::mem::take(&mut self.parts);
        self.coop.add_boxed_agent(Box::new(agent), self.binder.take());
    }
}
