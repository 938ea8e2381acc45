//! Lifecycle properties: start/finish symmetry across environment
//! shutdown, parent/child cascade ordering, exception reactions, and the
//! single-writer guarantee under a multi-threaded dispatcher.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use agent_runtime::dispatcher::thread_pool;
use agent_runtime::{
    launch, Agent, AgentContext, DefineError, DeregReason, ExceptionReaction, Mbox,
};

/// Counts its own `start` and `finish` invocations.
struct TrackedAgent {
    started: Arc<AtomicUsize>,
    finished: Arc<AtomicUsize>,
}

impl Agent for TrackedAgent {
    fn start(&mut self, _ctx: &mut AgentContext) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }

    fn finish(&mut self, _ctx: &mut AgentContext) {
        self.finished.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn reg_some_and_stop_reaches_finish_everywhere_with_the_right_reasons() {
    let started = Arc::new(AtomicUsize::new(0));
    let finished = Arc::new(AtomicUsize::new(0));
    let reasons: Arc<Mutex<HashMap<String, DeregReason>>> = Arc::new(Mutex::new(HashMap::new()));
    let started_in = Arc::clone(&started);
    let finished_in = Arc::clone(&finished);
    let reasons_in = Arc::clone(&reasons);

    launch(move |env| {
        for index in 1..=6 {
            let mut coop = env.create_coop(format!("test_coop_{index}"))?;
            for _ in 0..2 {
                coop.add_agent(TrackedAgent {
                    started: Arc::clone(&started_in),
                    finished: Arc::clone(&finished_in),
                });
            }
            let reasons = Arc::clone(&reasons_in);
            coop.add_dereg_notificator(move |_env, name, reason| {
                reasons.lock().unwrap().insert(name.to_string(), reason);
            });
            env.register_coop(coop)?;
        }

        thread::sleep(Duration::from_millis(50));
        env.deregister_coop("test_coop_1", DeregReason::Normal)?;
        env.deregister_coop("test_coop_6", DeregReason::Normal)?;
        env.deregister_coop("test_coop_3", DeregReason::Normal)?;
        thread::sleep(Duration::from_millis(50));
        env.stop();
        Ok(())
    })
    .unwrap();

    assert_eq!(started.load(Ordering::SeqCst), 12);
    assert_eq!(finished.load(Ordering::SeqCst), 12);

    let reasons = reasons.lock().unwrap();
    assert_eq!(reasons.len(), 6);
    for name in ["test_coop_1", "test_coop_3", "test_coop_6"] {
        assert_eq!(reasons[name], DeregReason::Normal, "{name}");
    }
    for name in ["test_coop_2", "test_coop_4", "test_coop_5"] {
        assert_eq!(reasons[name], DeregReason::Shutdown, "{name}");
    }
}

#[derive(Default)]
struct DummyAgent;

impl Agent for DummyAgent {}

#[test]
fn deregistering_a_parent_cascades_to_children_first() {
    let order: Arc<Mutex<Vec<(String, DeregReason)>>> = Arc::new(Mutex::new(Vec::new()));
    let order_in = Arc::clone(&order);

    launch(move |env| {
        let record = |order: &Arc<Mutex<Vec<(String, DeregReason)>>>| {
            let order = Arc::clone(order);
            move |env: &agent_runtime::Environment, name: &str, reason: DeregReason| {
                let mut order = order.lock().unwrap();
                order.push((name.to_string(), reason));
                if order.len() == 2 {
                    env.stop();
                }
            }
        };

        let mut parent = env.create_coop("parent")?;
        parent.add_agent(DummyAgent);
        parent.add_dereg_notificator(record(&order_in));
        env.register_coop(parent)?;

        let mut child = env.create_coop("child")?;
        child.add_agent(DummyAgent);
        child.set_parent_coop_name("parent");
        child.add_dereg_notificator(record(&order_in));
        env.register_coop(child)?;

        env.deregister_coop("parent", DeregReason::Normal)?;
        Ok(())
    })
    .unwrap();

    let order = order.lock().unwrap();
    assert_eq!(order.len(), 2);
    assert_eq!(
        order[0],
        ("child".to_string(), DeregReason::ParentDeregistration)
    );
    assert_eq!(order[1], ("parent".to_string(), DeregReason::Normal));
}

struct SigBoom;
impl agent_runtime::Signal for SigBoom {}

/// Panics on its first event; its `finish` must still run.
struct Exploder {
    finished: Arc<AtomicBool>,
}

impl Agent for Exploder {
    fn define(&mut self, ctx: &mut AgentContext) -> Result<(), DefineError> {
        let direct = ctx.direct_mbox();
        ctx.subscribe(&direct)
            .signal::<SigBoom, _, _>(|_: &mut Exploder, _: &mut AgentContext| {
                panic!("handler blew up");
            })?;
        Ok(())
    }

    fn start(&mut self, ctx: &mut AgentContext) {
        ctx.direct_mbox().deliver_signal::<SigBoom>();
    }

    fn finish(&mut self, _ctx: &mut AgentContext) {
        self.finished.store(true, Ordering::SeqCst);
    }
}

#[test]
fn handler_panic_under_shutdown_coop_deregisters_with_unhandled_exception() {
    let finished = Arc::new(AtomicBool::new(false));
    let reason: Arc<Mutex<Option<DeregReason>>> = Arc::new(Mutex::new(None));
    let finished_in = Arc::clone(&finished);
    let reason_in = Arc::clone(&reason);

    launch(move |env| {
        let mut coop = env.create_coop("volatile")?;
        coop.set_exception_reaction(ExceptionReaction::ShutdownCoop);
        coop.add_agent(Exploder {
            finished: Arc::clone(&finished_in),
        });
        let reason = Arc::clone(&reason_in);
        coop.add_dereg_notificator(move |env, _name, dereg_reason| {
            *reason.lock().unwrap() = Some(dereg_reason);
            env.stop();
        });
        env.register_coop(coop)?;
        Ok(())
    })
    .unwrap();

    assert!(finished.load(Ordering::SeqCst));
    assert_eq!(
        *reason.lock().unwrap(),
        Some(DeregReason::UnhandledException)
    );
}

struct MsgWork;

/// Checks with an atomic flag that no two handler invocations for this
/// agent ever overlap, no matter how many pool workers exist.
struct ReentrancyProbe {
    mbox: Mbox,
    limit: usize,
    in_handler: Arc<AtomicBool>,
    violations: Arc<AtomicUsize>,
    handled: Arc<AtomicUsize>,
}

impl Agent for ReentrancyProbe {
    fn define(&mut self, ctx: &mut AgentContext) -> Result<(), DefineError> {
        let in_handler = Arc::clone(&self.in_handler);
        let violations = Arc::clone(&self.violations);
        let handled = Arc::clone(&self.handled);
        let limit = self.limit;
        ctx.subscribe(&self.mbox).event(
            move |_: &mut ReentrancyProbe, ctx: &mut AgentContext, _: &MsgWork| {
                if in_handler.swap(true, Ordering::SeqCst) {
                    violations.fetch_add(1, Ordering::SeqCst);
                }
                thread::yield_now();
                in_handler.store(false, Ordering::SeqCst);
                if handled.fetch_add(1, Ordering::SeqCst) + 1 == limit {
                    ctx.environment().stop();
                }
            },
        )?;
        Ok(())
    }
}

#[test]
fn at_most_one_handler_runs_per_agent_even_on_a_thread_pool() {
    const PRODUCERS: usize = 4;
    const PER_PRODUCER: usize = 250;
    let violations = Arc::new(AtomicUsize::new(0));
    let handled = Arc::new(AtomicUsize::new(0));
    let violations_in = Arc::clone(&violations);
    let handled_in = Arc::clone(&handled);

    launch(move |env| {
        let disp = thread_pool::make_dispatcher(
            env,
            "pool",
            thread_pool::DispParams::default().thread_count(4),
        )?;
        let mbox = env.create_local_mbox();
        let mut coop = env.create_coop_with_binder("probe", disp.binder())?;
        coop.add_agent(ReentrancyProbe {
            mbox: mbox.clone(),
            limit: PRODUCERS * PER_PRODUCER,
            in_handler: Arc::new(AtomicBool::new(false)),
            violations: Arc::clone(&violations_in),
            handled: Arc::clone(&handled_in),
        });
        env.register_coop(coop)?;

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|_| {
                let mbox = mbox.clone();
                thread::spawn(move || {
                    for _ in 0..PER_PRODUCER {
                        mbox.deliver(MsgWork);
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().expect("producer thread panicked");
        }
        Ok(())
    })
    .unwrap();

    assert_eq!(handled.load(Ordering::SeqCst), PRODUCERS * PER_PRODUCER);
    assert_eq!(violations.load(Ordering::SeqCst), 0);
}
