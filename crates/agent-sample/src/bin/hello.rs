use agent_runtime::tracing::setup_tracing;

fn main() {
    setup_tracing();
    if let Err(e) = agent_sample::hello::run() {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
