//! Mailbox behavior: per-subscriber FIFO, MPSC ownership, deadletters and
//! subscription changes made from inside handlers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use agent_runtime::{
    launch, launch_with_params, Agent, AgentContext, AgentId, DefineError, EnvParams, Mbox,
    MboxId, RuntimeError, RuntimeObserver,
};

struct MsgSeq(u32);

/// Records the order of observed sequence numbers.
struct Collector {
    mbox: Mbox,
    limit: usize,
    seen: Arc<Mutex<Vec<u32>>>,
}

impl Agent for Collector {
    fn define(&mut self, ctx: &mut AgentContext) -> Result<(), DefineError> {
        let seen = Arc::clone(&self.seen);
        let limit = self.limit;
        ctx.subscribe(&self.mbox).event(
            move |_: &mut Collector, ctx: &mut AgentContext, msg: &MsgSeq| {
                let mut seen = seen.lock().unwrap();
                seen.push(msg.0);
                if seen.len() == limit {
                    ctx.environment().stop();
                }
            },
        )?;
        Ok(())
    }
}

#[test]
fn per_subscriber_fifo_is_preserved() {
    const COUNT: usize = 1000;
    let seen: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
    let seen_in = Arc::clone(&seen);

    launch(move |env| {
        let mbox = env.create_local_mbox();
        let mut coop = env.create_coop("collector")?;
        coop.add_agent(Collector {
            mbox: mbox.clone(),
            limit: COUNT,
            seen: Arc::clone(&seen_in),
        });
        env.register_coop(coop)?;

        for n in 0..COUNT as u32 {
            mbox.deliver(MsgSeq(n));
        }
        Ok(())
    })
    .unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), COUNT);
    assert!(seen.iter().enumerate().all(|(i, &n)| n == i as u32));
}

struct MsgProbe;

/// First agent on an MPSC mailbox; publishes its direct mailbox so another
/// agent can try (and fail) to subscribe to it.
struct Owner {
    shared_mbox: Arc<Mutex<Option<Mbox>>>,
    received: Arc<AtomicUsize>,
}

impl Agent for Owner {
    fn define(&mut self, ctx: &mut AgentContext) -> Result<(), DefineError> {
        let direct = ctx.direct_mbox();
        let received = Arc::clone(&self.received);
        ctx.subscribe(&direct).event(
            move |_: &mut Owner, ctx: &mut AgentContext, _: &MsgProbe| {
                received.fetch_add(1, Ordering::SeqCst);
                ctx.environment().stop();
            },
        )?;
        *self.shared_mbox.lock().unwrap() = Some(direct);
        Ok(())
    }
}

/// Tries to subscribe to a mailbox some other agent already owns.
struct Intruder {
    target: Arc<Mutex<Option<Mbox>>>,
}

impl Agent for Intruder {
    fn define(&mut self, ctx: &mut AgentContext) -> Result<(), DefineError> {
        let target = self
            .target
            .lock()
            .unwrap()
            .clone()
            .ok_or("target mailbox not published")?;
        ctx.subscribe(&target)
            .event(|_: &mut Intruder, _: &mut AgentContext, _: &MsgProbe| {})?;
        Ok(())
    }
}

#[test]
fn mpsc_mailbox_rejects_a_second_subscriber() {
    let received = Arc::new(AtomicUsize::new(0));
    let received_in = Arc::clone(&received);

    launch(move |env| {
        let shared_mbox: Arc<Mutex<Option<Mbox>>> = Arc::new(Mutex::new(None));

        let mut owners = env.create_coop("owner")?;
        owners.add_agent(Owner {
            shared_mbox: Arc::clone(&shared_mbox),
            received: Arc::clone(&received_in),
        });
        env.register_coop(owners)?;

        let mut intruders = env.create_coop("intruder")?;
        intruders.add_agent(Intruder {
            target: Arc::clone(&shared_mbox),
        });
        match env.register_coop(intruders) {
            Err(RuntimeError::AgentDefineFailed { source, .. }) => {
                let runtime_error = source.downcast_ref::<RuntimeError>();
                assert!(matches!(
                    runtime_error,
                    Some(RuntimeError::TooManySubscribers)
                ));
            }
            other => panic!("expected define failure, got {other:?}"),
        }

        // The first subscription stays effective.
        let mbox = shared_mbox.lock().unwrap().clone();
        mbox.expect("owner never published its mailbox")
            .deliver(MsgProbe);
        Ok(())
    })
    .unwrap();

    assert_eq!(received.load(Ordering::SeqCst), 1);
}

#[derive(Default)]
struct CountingObserver {
    deadletters: AtomicUsize,
}

impl RuntimeObserver for CountingObserver {
    fn deadletter(&self, _agent: Option<AgentId>, _mbox: MboxId) {
        self.deadletters.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn delivery_without_subscribers_goes_to_the_deadletter_sink() {
    let observer = Arc::new(CountingObserver::default());
    let observer_in = Arc::clone(&observer);

    launch_with_params(
        EnvParams::default().observer(observer.clone()),
        move |env| {
            let mbox = env.create_local_mbox();
            mbox.deliver(MsgProbe);
            assert_eq!(observer_in.deadletters.load(Ordering::SeqCst), 1);
            env.stop();
            Ok(())
        },
    )
    .unwrap();
}

struct MsgFirst;
struct MsgSecond;

/// Subscribes to a second message type from inside a handler, then sends
/// that message to itself.
struct LateSubscriber {
    mbox: Mbox,
    second_seen: Arc<AtomicUsize>,
}

impl Agent for LateSubscriber {
    fn define(&mut self, ctx: &mut AgentContext) -> Result<(), DefineError> {
        let mbox = self.mbox.clone();
        let second_seen = Arc::clone(&self.second_seen);
        ctx.subscribe(&self.mbox).event(
            move |_: &mut LateSubscriber, ctx: &mut AgentContext, _: &MsgFirst| {
                let second_seen = Arc::clone(&second_seen);
                let result = ctx.subscribe(&mbox).event(
                    move |_: &mut LateSubscriber, ctx: &mut AgentContext, _: &MsgSecond| {
                        second_seen.fetch_add(1, Ordering::SeqCst);
                        ctx.environment().stop();
                    },
                );
                assert!(result.is_ok());
                mbox.deliver(MsgSecond);
            },
        )?;
        Ok(())
    }
}

#[test]
fn subscription_added_inside_a_handler_takes_effect() {
    let second_seen = Arc::new(AtomicUsize::new(0));
    let second_seen_in = Arc::clone(&second_seen);

    launch(move |env| {
        let mbox = env.create_local_mbox();
        let mut coop = env.create_coop("late")?;
        coop.add_agent(LateSubscriber {
            mbox: mbox.clone(),
            second_seen: Arc::clone(&second_seen_in),
        });
        env.register_coop(coop)?;
        mbox.deliver(MsgFirst);
        Ok(())
    })
    .unwrap();

    assert_eq!(second_seen.load(Ordering::SeqCst), 1);
}

struct MsgPing;
struct MsgQuit;

/// Unsubscribes from `MsgPing` while an already-enqueued ping is still in
/// its queue; that ping must fall through to the deadletter path.
struct OneShot {
    mbox: Mbox,
    pings: Arc<AtomicUsize>,
}

impl Agent for OneShot {
    fn define(&mut self, ctx: &mut AgentContext) -> Result<(), DefineError> {
        let mbox = self.mbox.clone();
        let pings = Arc::clone(&self.pings);
        ctx.subscribe(&self.mbox).event(
            move |_: &mut OneShot, ctx: &mut AgentContext, _: &MsgPing| {
                pings.fetch_add(1, Ordering::SeqCst);
                ctx.unsubscribe::<MsgPing>(&mbox);
            },
        )?;
        ctx.subscribe(&self.mbox).event(
            |_: &mut OneShot, ctx: &mut AgentContext, _: &MsgQuit| {
                ctx.environment().stop();
            },
        )?;
        Ok(())
    }
}

#[test]
fn unsubscribe_stops_dispatch_of_already_enqueued_events() {
    let pings = Arc::new(AtomicUsize::new(0));
    let pings_in = Arc::clone(&pings);

    launch(move |env| {
        let mbox = env.create_local_mbox();
        let mut coop = env.create_coop("oneshot")?;
        coop.add_agent(OneShot {
            mbox: mbox.clone(),
            pings: Arc::clone(&pings_in),
        });
        env.register_coop(coop)?;

        mbox.deliver(MsgPing);
        mbox.deliver(MsgPing);
        mbox.deliver(MsgQuit);
        Ok(())
    })
    .unwrap();

    assert_eq!(pings.load(Ordering::SeqCst), 1);
}
