use agent_runtime::tracing::setup_tracing;
use tracing::info;

fn main() {
    setup_tracing();
    match agent_sample::ping_pong::run(100_000) {
        Ok(totals) => {
            info!(pings = totals.pings, pongs = totals.pongs, "exchange finished");
            println!("pings: {}, pongs: {}", totals.pings, totals.pongs);
        }
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(2);
        }
    }
}
