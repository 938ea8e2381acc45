//! Two agents exchanging signals over one shared mailbox. The pinger is a
//! regular agent with state, the ponger is ad-hoc: a single closure wired
//! through the cooperation's `define_agent` builder.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use agent_runtime::{launch, Agent, AgentContext, DefineError, Mbox, RuntimeError, Signal};

struct SigPing;
impl Signal for SigPing {}

struct SigPong;
impl Signal for SigPong {}

/// How many of each signal the respective subscriber observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingPongTotals {
    pub pings: usize,
    pub pongs: usize,
}

struct Pinger {
    mbox: Mbox,
    pings_left: usize,
    pongs_observed: Arc<AtomicUsize>,
}

impl Pinger {
    fn send_ping(&mut self) {
        self.mbox.deliver_signal::<SigPing>();
        self.pings_left -= 1;
    }

    fn on_pong(&mut self, ctx: &mut AgentContext) {
        self.pongs_observed.fetch_add(1, Ordering::Relaxed);
        if self.pings_left > 0 {
            self.send_ping();
        } else {
            ctx.environment().stop();
        }
    }
}

impl Agent for Pinger {
    fn define(&mut self, ctx: &mut AgentContext) -> Result<(), DefineError> {
        ctx.subscribe(&self.mbox)
            .signal::<SigPong, _, _>(Pinger::on_pong)?;
        Ok(())
    }

    fn start(&mut self, ctx: &mut AgentContext) {
        if self.pings_left > 0 {
            self.send_ping();
        } else {
            ctx.environment().stop();
        }
    }
}

/// Runs a full exchange of `pings` round trips and reports what each side
/// observed.
pub fn run(pings: usize) -> Result<PingPongTotals, RuntimeError> {
    let pings_observed = Arc::new(AtomicUsize::new(0));
    let pongs_observed = Arc::new(AtomicUsize::new(0));
    let pings_counter = Arc::clone(&pings_observed);
    let pongs_counter = Arc::clone(&pongs_observed);

    launch(move |env| {
        let mbox = env.create_local_mbox();
        let mut coop = env.create_coop("ping_pong")?;

        coop.add_agent(Pinger {
            mbox: mbox.clone(),
            pings_left: pings,
            pongs_observed: pongs_counter,
        });

        let reply_mbox = mbox.clone();
        coop.define_agent().signal::<SigPing>(&mbox, move |_ctx| {
            pings_counter.fetch_add(1, Ordering::Relaxed);
            reply_mbox.deliver_signal::<SigPong>();
        });

        env.register_coop(coop)
    })?;

    Ok(PingPongTotals {
        pings: pings_observed.load(Ordering::Relaxed),
        pongs: pongs_observed.load(Ordering::Relaxed),
    })
}
