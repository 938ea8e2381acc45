//! Thread-pool dispatcher: N workers over per-agent demand queues. An
//! agent's queue is handed to at most one worker at a time, which preserves
//! the single-writer invariant and per-agent FIFO; across agents the queues
//! round-robin through a shared feed channel.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::debug;

use crate::agent::AgentRef;
use crate::demand::{Demand, EventSink, EventSinkRef};
use crate::dispatcher::{spawn_worker, Binder, Dispatcher, DispatcherHandle};
use crate::environment::Environment;
use crate::error::RuntimeError;
use crate::message::AgentId;

/// Parameters of the thread-pool dispatcher.
pub struct DispParams {
    thread_count: Option<usize>,
    max_demands_at_once: usize,
}

impl Default for DispParams {
    fn default() -> Self {
        DispParams {
            thread_count: None,
            max_demands_at_once: 4,
        }
    }
}

impl DispParams {
    /// Number of worker threads. Defaults to the machine's available
    /// parallelism.
    pub fn thread_count(mut self, count: usize) -> Self {
        self.thread_count = Some(count.max(1));
        self
    }

    /// How many demands a worker may take from one agent's queue before
    /// handing the queue back to the pool.
    pub fn max_demands_at_once(mut self, count: usize) -> Self {
        self.max_demands_at_once = count.max(1);
        self
    }
}

enum FeedItem {
    Work(Arc<AgentQueue>),
    Stop,
}

struct QueueInner {
    items: VecDeque<Demand>,
    /// True while the queue sits in the feed channel or is held by a
    /// worker. Guarantees at most one worker per agent.
    scheduled: bool,
}

struct AgentQueue {
    inner: Mutex<QueueInner>,
    feed: Sender<FeedItem>,
    self_ref: Weak<AgentQueue>,
}

impl EventSink for AgentQueue {
    fn push(&self, demand: Demand) {
        let schedule = {
            let mut queue = self.inner.lock();
            queue.items.push_back(demand);
            if queue.scheduled {
                false
            } else {
                queue.scheduled = true;
                true
            }
        };
        if schedule {
            if let Some(queue) = self.self_ref.upgrade() {
                let _ = self.feed.send(FeedItem::Work(queue));
            }
        }
    }
}

fn worker_loop(rx: Receiver<FeedItem>, feed: Sender<FeedItem>, batch: usize) {
    while let Ok(item) = rx.recv() {
        let queue = match item {
            FeedItem::Work(queue) => queue,
            FeedItem::Stop => break,
        };
        let mut processed = 0;
        loop {
            let demand = {
                let mut inner = queue.inner.lock();
                match inner.items.pop_front() {
                    Some(demand) => demand,
                    None => {
                        inner.scheduled = false;
                        break;
                    }
                }
            };
            demand.execute();
            processed += 1;
            if processed >= batch {
                // Yield the queue back so other agents get the worker.
                let mut inner = queue.inner.lock();
                if inner.items.is_empty() {
                    inner.scheduled = false;
                } else {
                    drop(inner);
                    let _ = feed.send(FeedItem::Work(Arc::clone(&queue)));
                }
                break;
            }
        }
    }
}

pub(crate) struct PoolDispatcher {
    name: String,
    feed: Mutex<Option<Sender<FeedItem>>>,
    queues: Mutex<HashMap<AgentId, Arc<AgentQueue>>>,
    joins: Mutex<Vec<JoinHandle<()>>>,
    workers: usize,
    stopped: AtomicBool,
}

impl Binder for PoolDispatcher {
    fn bind(&self, agent: &AgentRef, _coop_name: &str) -> Result<EventSinkRef, RuntimeError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(RuntimeError::DispatcherStopped(self.name.clone()));
        }
        let feed = match &*self.feed.lock() {
            Some(feed) => feed.clone(),
            None => return Err(RuntimeError::DispatcherStopped(self.name.clone())),
        };
        let queue = Arc::new_cyclic(|self_ref| AgentQueue {
            inner: Mutex::new(QueueInner {
                items: VecDeque::new(),
                scheduled: false,
            }),
            feed,
            self_ref: self_ref.clone(),
        });
        self.queues.lock().insert(agent.id(), Arc::clone(&queue));
        Ok(EventSinkRef::new(queue))
    }

    fn unbind(&self, agent: &AgentRef) {
        self.queues.lock().remove(&agent.id());
    }
}

impl Dispatcher for PoolDispatcher {
    fn name(&self) -> &str {
        &self.name
    }

    fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(feed) = self.feed.lock().take() {
            for _ in 0..self.workers {
                let _ = feed.send(FeedItem::Stop);
            }
        }
        for join in self.joins.lock().drain(..) {
            let _ = join.join();
        }
        debug!(dispatcher = %self.name, "thread_pool dispatcher stopped");
    }
}

pub(crate) fn make_with(
    env: &Environment,
    name: &str,
    thread_count: Option<usize>,
    batch: usize,
) -> Result<DispatcherHandle, RuntimeError> {
    if name.is_empty() {
        return Err(RuntimeError::EmptyName);
    }
    let workers = thread_count.unwrap_or_else(|| {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2)
    });
    let (feed_tx, feed_rx) = crossbeam_channel::unbounded::<FeedItem>();
    let mut joins = Vec::with_capacity(workers);
    for index in 0..workers {
        let rx = feed_rx.clone();
        let feed = feed_tx.clone();
        joins.push(spawn_worker(format!("{name}-worker-{index}"), move || {
            worker_loop(rx, feed, batch)
        })?);
    }
    let dispatcher = Arc::new(PoolDispatcher {
        name: name.to_string(),
        feed: Mutex::new(Some(feed_tx)),
        queues: Mutex::new(HashMap::new()),
        joins: Mutex::new(joins),
        workers,
        stopped: AtomicBool::new(false),
    });
    if let Err(e) = env.add_dispatcher(dispatcher.clone()) {
        dispatcher.shutdown();
        return Err(e);
    }
    debug!(dispatcher = name, workers, batch, "thread_pool dispatcher started");
    Ok(DispatcherHandle::new(dispatcher))
}

/// Creates a thread-pool dispatcher.
pub fn make_dispatcher(
    env: &Environment,
    name: &str,
    params: DispParams,
) -> Result<DispatcherHandle, RuntimeError> {
    make_with(env, name, params.thread_count, params.max_demands_at_once)
}
