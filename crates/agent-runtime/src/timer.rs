//! Delayed and periodic delivery. A single timer thread keeps pending
//! deliveries in a deadline-ordered heap and fires each one into its
//! mailbox no earlier than the requested instant. Periodic timers
//! reschedule themselves until cancelled.

use std::any::TypeId;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::dispatcher::spawn_worker;
use crate::error::RuntimeError;
use crate::mbox::Mbox;
use crate::message::Payload;

/// Identifier of a scheduled timer, used with
/// [`Environment::cancel_timer`](crate::Environment::cancel_timer).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct TimerId(u64);

struct TimerEntry {
    deadline: Instant,
    seq: u64,
    id: u64,
    mbox: Mbox,
    type_id: TypeId,
    payload: Payload,
    period: Option<Duration>,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    // Reversed so the max-heap pops the earliest deadline first.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct TimerState {
    heap: BinaryHeap<TimerEntry>,
    cancelled: HashSet<u64>,
    stopped: bool,
    next_id: u64,
    next_seq: u64,
}

struct TimerShared {
    state: Mutex<TimerState>,
    wakeup: Condvar,
}

pub(crate) struct TimerService {
    shared: Arc<TimerShared>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl TimerService {
    pub(crate) fn start() -> Result<Self, RuntimeError> {
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerState::default()),
            wakeup: Condvar::new(),
        });
        let worker_shared = Arc::clone(&shared);
        let join = spawn_worker("timer-worker".to_string(), move || timer_loop(worker_shared))?;
        Ok(TimerService {
            shared,
            join: Mutex::new(Some(join)),
        })
    }

    pub(crate) fn schedule(
        &self,
        mbox: Mbox,
        type_id: TypeId,
        payload: Payload,
        delay: Duration,
        period: Option<Duration>,
    ) -> TimerId {
        let mut state = self.shared.state.lock();
        state.next_id += 1;
        state.next_seq += 1;
        let id = state.next_id;
        let entry = TimerEntry {
            deadline: Instant::now() + delay,
            seq: state.next_seq,
            id,
            mbox,
            type_id,
            payload,
            period,
        };
        state.heap.push(entry);
        drop(state);
        self.shared.wakeup.notify_one();
        TimerId(id)
    }

    /// Prevents all future firings of the timer. Idempotent; a delivery
    /// already in flight is not recalled.
    pub(crate) fn cancel(&self, id: TimerId) {
        self.shared.state.lock().cancelled.insert(id.0);
    }

    pub(crate) fn stop(&self) {
        {
            let mut state = self.shared.state.lock();
            state.stopped = true;
        }
        self.shared.wakeup.notify_one();
        if let Some(join) = self.join.lock().take() {
            let _ = join.join();
        }
        debug!("timer thread stopped");
    }
}

fn timer_loop(shared: Arc<TimerShared>) {
    let mut due: Vec<(Mbox, TypeId, Payload)> = Vec::new();
    loop {
        {
            let mut state = shared.state.lock();
            if state.stopped {
                return;
            }
            let now = Instant::now();
            loop {
                let fire_or_discard = match state.heap.peek() {
                    Some(top) => top.deadline <= now || state.cancelled.contains(&top.id),
                    None => false,
                };
                if !fire_or_discard {
                    break;
                }
                if let Some(entry) = state.heap.pop() {
                    if state.cancelled.remove(&entry.id) {
                        continue;
                    }
                    due.push((entry.mbox.clone(), entry.type_id, entry.payload.clone()));
                    if let Some(period) = entry.period {
                        state.next_seq += 1;
                        let seq = state.next_seq;
                        state.heap.push(TimerEntry {
                            deadline: now + period,
                            seq,
                            ..entry
                        });
                    }
                }
            }
            if due.is_empty() {
                match state.heap.peek().map(|e| e.deadline) {
                    Some(deadline) => {
                        shared.wakeup.wait_until(&mut state, deadline);
                    }
                    None => shared.wakeup.wait(&mut state),
                }
                continue;
            }
        }
        for (mbox, type_id, payload) in due.drain(..) {
            mbox.deliver_erased(type_id, payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mbox::MboxKind;
    use crate::observer::NoopObserver;

    fn entry(deadline: Instant, seq: u64) -> TimerEntry {
        TimerEntry {
            deadline,
            seq,
            id: seq,
            mbox: Mbox::new(MboxKind::Mpmc, Arc::new(NoopObserver)),
            type_id: TypeId::of::<u32>(),
            payload: Payload::signal(),
            period: None,
        }
    }

    #[test]
    fn heap_pops_earliest_deadline_first() {
        let base = Instant::now();
        let mut heap = BinaryHeap::new();
        heap.push(entry(base + Duration::from_millis(30), 1));
        heap.push(entry(base + Duration::from_millis(10), 2));
        heap.push(entry(base + Duration::from_millis(20), 3));

        let order: Vec<u64> = std::iter::from_fn(|| heap.pop().map(|e| e.seq)).collect();
        assert_eq!(order, vec![2, 3, 1]);
    }

    #[test]
    fn equal_deadlines_fire_in_schedule_order() {
        let deadline = Instant::now() + Duration::from_millis(5);
        let mut heap = BinaryHeap::new();
        heap.push(entry(deadline, 2));
        heap.push(entry(deadline, 1));

        let order: Vec<u64> = std::iter::from_fn(|| heap.pop().map(|e| e.seq)).collect();
        assert_eq!(order, vec![1, 2]);
    }
}
