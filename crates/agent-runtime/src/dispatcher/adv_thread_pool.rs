//! Cooperative thread-pool dispatcher: identical machinery to
//! [`thread_pool`](crate::dispatcher::thread_pool), but a worker hands an
//! agent's queue back to the pool after every single demand. Agents with
//! long handlers cannot starve the others between events.

use crate::dispatcher::{thread_pool, DispatcherHandle};
use crate::environment::Environment;
use crate::error::RuntimeError;

/// Parameters of the cooperative thread-pool dispatcher.
#[derive(Default)]
pub struct DispParams {
    thread_count: Option<usize>,
}

impl DispParams {
    /// Number of worker threads. Defaults to the machine's available
    /// parallelism.
    pub fn thread_count(mut self, count: usize) -> Self {
        self.thread_count = Some(count.max(1));
        self
    }
}

/// Creates a cooperative thread-pool dispatcher.
pub fn make_dispatcher(
    env: &Environment,
    name: &str,
    params: DispParams,
) -> Result<DispatcherHandle, RuntimeError> {
    thread_pool::make_with(env, name, params.thread_count, 1)
}
