//! Registers several cooperations of dummy agents, deregisters a few of
//! them explicitly, then stops the environment.

use std::thread;
use std::time::Duration;

use agent_runtime::tracing::setup_tracing;
use agent_runtime::{launch, Agent, DeregReason, Environment, RuntimeError};

#[derive(Default)]
struct TestAgent;

impl Agent for TestAgent {}

fn reg_coop(name: &str, env: &Environment) -> Result<(), RuntimeError> {
    let mut coop = env.create_coop(name)?;
    coop.add_agent(TestAgent);
    coop.add_agent(TestAgent);
    env.register_coop(coop)
}

fn init(env: &Environment) -> Result<(), RuntimeError> {
    for index in 1..=6 {
        reg_coop(&format!("test_coop_{index}"), env)?;
    }

    thread::sleep(Duration::from_millis(50));

    env.deregister_coop("test_coop_1", DeregReason::Normal)?;
    env.deregister_coop("test_coop_6", DeregReason::Normal)?;
    env.deregister_coop("test_coop_3", DeregReason::Normal)?;

    thread::sleep(Duration::from_millis(50));

    env.stop();
    Ok(())
}

fn main() {
    setup_tracing();
    if let Err(e) = launch(init) {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
