//! The classic first program: an agent greets through its own direct
//! mailbox and shuts the environment down.

use agent_runtime::{launch, Agent, AgentContext, DefineError, RuntimeError};

struct MsgHello {
    message: String,
}

struct HelloAgent;

impl Agent for HelloAgent {
    fn define(&mut self, ctx: &mut AgentContext) -> Result<(), DefineError> {
        let direct = ctx.direct_mbox();
        ctx.subscribe(&direct).event(
            |_: &mut HelloAgent, ctx: &mut AgentContext, msg: &MsgHello| {
                println!("{}", msg.message);
                ctx.environment().stop();
            },
        )?;
        Ok(())
    }

    fn start(&mut self, ctx: &mut AgentContext) {
        ctx.direct_mbox().deliver(MsgHello {
            message: "Hello, world! This is v5.".to_string(),
        });
    }
}

pub fn run() -> Result<(), RuntimeError> {
    launch(|env| env.register_agent_as_coop("hello", HelloAgent))
}
