//! # Runtime Errors
//!
//! This module defines the common error type used throughout the agent
//! runtime. By centralizing error definitions, we ensure consistent error
//! handling across registration, messaging and dispatching.

/// Errors that can occur within the agent runtime itself.
///
/// Registration errors roll back all partial effects and surface to the
/// caller of [`Environment::register_coop`](crate::Environment::register_coop).
/// Delivery-time failures are never surfaced to producers; they go through
/// the deadletter path instead.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("name must not be empty")]
    EmptyName,
    #[error("cooperation `{0}` is already registered")]
    DuplicateCoopName(String),
    #[error("parent cooperation `{parent}` of `{coop}` is not registered")]
    UnknownParentCoop { coop: String, parent: String },
    #[error("cooperation `{0}` has no agents")]
    EmptyCoop(String),
    #[error("agent define failed in cooperation `{coop}`: {source}")]
    AgentDefineFailed {
        coop: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("dispatcher bind failed in cooperation `{coop}`: {source}")]
    DispatcherBindFailed {
        coop: String,
        #[source]
        source: Box<RuntimeError>,
    },
    #[error("dispatcher `{0}` has reached its agent capacity")]
    DispatcherCapacityExceeded(String),
    #[error("dispatcher `{0}` is stopped")]
    DispatcherStopped(String),
    #[error("failed to start a dispatcher worker thread")]
    DispatcherStartFailed(#[source] std::io::Error),
    #[error("mailbox already has a subscriber for this message type")]
    TooManySubscribers,
    #[error("a handler for this mailbox and message type is already subscribed")]
    HandlerAlreadySubscribed,
    #[error("environment is stopping, new registrations are not accepted")]
    EnvironmentStopping,
    #[error("cooperation `{0}` is not registered")]
    CoopNotFound(String),
}

/// Error type surfaced from an agent's `define` hook.
///
/// Subscription failures ([`RuntimeError`]) convert into it with `?`; user
/// code may box any error of its own.
pub type DefineError = Box<dyn std::error::Error + Send + Sync>;
