//! An agent greets itself on a schedule: a periodic timer on its direct
//! mailbox, and a delayed stop signal routed through a named mailbox to a
//! separate shutdowner cooperation.

use std::time::Duration;

use agent_runtime::tracing::setup_tracing;
use agent_runtime::{
    launch, Agent, AgentContext, DefineError, Environment, Mbox, RuntimeError, Signal, TimerId,
};

struct MsgGreeting {
    message: String,
}

struct SigStop;
impl Signal for SigStop {}

struct PeriodicAgent {
    shutdown_mbox: Mbox,
    greeting_timer: Option<TimerId>,
    greetings: u32,
}

impl PeriodicAgent {
    fn new(env: &Environment) -> Self {
        PeriodicAgent {
            shutdown_mbox: env.create_named_mbox("shutdown"),
            greeting_timer: None,
            greetings: 0,
        }
    }

    fn on_greeting(&mut self, ctx: &mut AgentContext, msg: &MsgGreeting) {
        println!("{}", msg.message);
        self.greetings += 1;
        if self.greetings == 5 {
            // Enough greetings; let the pending stop signal end the run.
            if let Some(timer) = self.greeting_timer.take() {
                ctx.environment().cancel_timer(timer);
            }
        }
    }
}

impl Agent for PeriodicAgent {
    fn define(&mut self, ctx: &mut AgentContext) -> Result<(), DefineError> {
        let direct = ctx.direct_mbox();
        ctx.subscribe(&direct).event(PeriodicAgent::on_greeting)?;
        Ok(())
    }

    fn start(&mut self, ctx: &mut AgentContext) {
        let env = ctx.environment();
        self.greeting_timer = Some(env.schedule_timer(
            MsgGreeting {
                message: "Hello, periodic!".to_string(),
            },
            &ctx.direct_mbox(),
            Duration::from_millis(250),
            Duration::from_millis(250),
        ));
        env.single_timer_signal::<SigStop>(&self.shutdown_mbox, Duration::from_secs(2));
    }
}

fn init(env: &Environment) -> Result<(), RuntimeError> {
    env.register_agent_as_coop("hello", PeriodicAgent::new(env))?;

    let shutdown_mbox = env.create_named_mbox("shutdown");
    let mut shutdowner = env.create_coop("shutdowner")?;
    shutdowner
        .define_agent()
        .signal::<SigStop>(&shutdown_mbox, |ctx| {
            println!("Stopping...");
            ctx.environment().stop();
        });
    env.register_coop(shutdowner)
}

fn main() {
    setup_tracing();
    if let Err(e) = launch(init) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
