//! Cooperation registration and deregistration: atomicity of the
//! all-or-nothing protocol, rollback on define/bind failure, and the
//! bookkeeping around notificators and controlled resources.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use agent_runtime::dispatcher::active_obj;
use agent_runtime::{
    launch, Agent, AgentContext, DefineError, DeregReason, Environment, Mbox, RuntimeError,
};

#[derive(Default)]
struct DummyAgent;

impl Agent for DummyAgent {}

struct MsgProbe;

/// Subscribes to a shared mailbox and counts deliveries; also records
/// whether its lifecycle hooks ran.
struct WatchfulAgent {
    mbox: Mbox,
    received: Arc<AtomicUsize>,
    started: Arc<AtomicBool>,
}

impl Agent for WatchfulAgent {
    fn define(&mut self, ctx: &mut AgentContext) -> Result<(), DefineError> {
        let received = Arc::clone(&self.received);
        ctx.subscribe(&self.mbox).event(
            move |_: &mut WatchfulAgent, _: &mut AgentContext, _: &MsgProbe| {
                received.fetch_add(1, Ordering::SeqCst);
            },
        )?;
        Ok(())
    }

    fn start(&mut self, _ctx: &mut AgentContext) {
        self.started.store(true, Ordering::SeqCst);
    }
}

/// Fails its `define` hook, poisoning the whole registration.
struct FailingAgent;

impl Agent for FailingAgent {
    fn define(&mut self, _ctx: &mut AgentContext) -> Result<(), DefineError> {
        Err("refusing to define".into())
    }
}

#[test]
fn failed_define_rolls_back_the_whole_cooperation() {
    let received = Arc::new(AtomicUsize::new(0));
    let started = Arc::new(AtomicBool::new(false));
    let received_in = Arc::clone(&received);
    let started_in = Arc::clone(&started);

    launch(move |env| {
        let mbox = env.create_local_mbox();
        let mut coop = env.create_coop("doomed")?;
        coop.add_agent(WatchfulAgent {
            mbox: mbox.clone(),
            received: Arc::clone(&received_in),
            started: Arc::clone(&started_in),
        });
        coop.add_agent(FailingAgent);

        let result = env.register_coop(coop);
        assert!(matches!(
            result,
            Err(RuntimeError::AgentDefineFailed { .. })
        ));

        // No trace of the cooperation may remain.
        assert!(matches!(
            env.deregister_coop("doomed", DeregReason::Normal),
            Err(RuntimeError::CoopNotFound(_))
        ));
        // The first agent's subscription must have been rolled back.
        mbox.deliver(MsgProbe);

        env.stop();
        Ok(())
    })
    .unwrap();

    assert_eq!(received.load(Ordering::SeqCst), 0);
    assert!(!started.load(Ordering::SeqCst));
}

#[test]
fn failed_bind_rolls_back_defines_and_earlier_binds() {
    let received = Arc::new(AtomicUsize::new(0));
    let started = Arc::new(AtomicBool::new(false));
    let received_in = Arc::clone(&received);
    let started_in = Arc::clone(&started);

    launch(move |env| {
        let disp = active_obj::make_dispatcher(
            env,
            "tiny",
            active_obj::DispParams::default().max_agents(1),
        )?;
        let mbox = env.create_local_mbox();
        let mut coop = env.create_coop_with_binder("crowded", disp.binder())?;
        coop.add_agent(WatchfulAgent {
            mbox: mbox.clone(),
            received: Arc::clone(&received_in),
            started: Arc::clone(&started_in),
        });
        coop.add_agent(DummyAgent);

        match env.register_coop(coop) {
            Err(RuntimeError::DispatcherBindFailed { source, .. }) => {
                assert!(matches!(
                    *source,
                    RuntimeError::DispatcherCapacityExceeded(_)
                ));
            }
            other => panic!("expected bind failure, got {other:?}"),
        }

        assert!(matches!(
            env.deregister_coop("crowded", DeregReason::Normal),
            Err(RuntimeError::CoopNotFound(_))
        ));
        mbox.deliver(MsgProbe);

        env.stop();
        Ok(())
    })
    .unwrap();

    assert_eq!(received.load(Ordering::SeqCst), 0);
    assert!(!started.load(Ordering::SeqCst));
}

#[test]
fn duplicate_and_empty_and_unknown_parent_are_refused() {
    launch(|env| {
        let mut first = env.create_coop("taken")?;
        first.add_agent(DummyAgent);
        env.register_coop(first)?;

        let mut dup = env.create_coop("taken")?;
        dup.add_agent(DummyAgent);
        assert!(matches!(
            env.register_coop(dup),
            Err(RuntimeError::DuplicateCoopName(_))
        ));

        let empty = env.create_coop("empty")?;
        assert!(matches!(
            env.register_coop(empty),
            Err(RuntimeError::EmptyCoop(_))
        ));

        assert!(matches!(
            env.create_coop(""),
            Err(RuntimeError::EmptyName)
        ));

        let mut orphan = env.create_coop("orphan")?;
        orphan.add_agent(DummyAgent);
        orphan.set_parent_coop_name("never_registered");
        assert!(matches!(
            env.register_coop(orphan),
            Err(RuntimeError::UnknownParentCoop { .. })
        ));

        env.stop();
        Ok(())
    })
    .unwrap();
}

#[test]
fn registration_is_refused_while_stopping() {
    launch(|env| {
        env.stop();
        let mut late = env.create_coop("late")?;
        late.add_agent(DummyAgent);
        assert!(matches!(
            env.register_coop(late),
            Err(RuntimeError::EnvironmentStopping)
        ));
        Ok(())
    })
    .unwrap();
}

/// Pushes its name into a shared log when dropped.
struct DropProbe {
    name: &'static str,
    log: Arc<Mutex<Vec<&'static str>>>,
}

impl Drop for DropProbe {
    fn drop(&mut self) {
        self.log.lock().unwrap().push(self.name);
    }
}

#[test]
fn dereg_notificator_fires_once_and_resources_drop_in_reverse_order() {
    let drops: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let notifications = Arc::new(AtomicUsize::new(0));
    let drops_in = Arc::clone(&drops);
    let notifications_in = Arc::clone(&notifications);

    launch(move |env| {
        let mut coop = env.create_coop("guarded")?;
        coop.add_agent(DummyAgent);
        for name in ["first", "second", "third"] {
            coop.take_under_control(DropProbe {
                name,
                log: Arc::clone(&drops_in),
            });
        }
        let notifications = Arc::clone(&notifications_in);
        coop.add_dereg_notificator(move |env: &Environment, _name, _reason| {
            notifications.fetch_add(1, Ordering::SeqCst);
            env.stop();
        });
        env.register_coop(coop)?;

        env.deregister_coop("guarded", DeregReason::Normal)?;
        // Redundant deregistration is a no-op, not a second teardown.
        let _ = env.deregister_coop("guarded", DeregReason::Normal);
        Ok(())
    })
    .unwrap();

    assert_eq!(notifications.load(Ordering::SeqCst), 1);
    assert_eq!(*drops.lock().unwrap(), vec!["third", "second", "first"]);
}

#[test]
fn reg_notificator_panic_is_swallowed() {
    let reached = Arc::new(AtomicBool::new(false));
    let reached_in = Arc::clone(&reached);

    launch(move |env| {
        let mut coop = env.create_coop("noisy")?;
        coop.add_agent(DummyAgent);
        coop.add_reg_notificator(|_env, _name| panic!("notificator exploded"));
        env.register_coop(coop)?;

        reached_in.store(true, Ordering::SeqCst);
        env.stop();
        Ok(())
    })
    .unwrap();

    assert!(reached.load(Ordering::SeqCst));
}
