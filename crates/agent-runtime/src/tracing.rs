/// Initializes the tracing/logging infrastructure for a host application.
///
/// The runtime itself only emits `tracing` events and never installs a
/// subscriber; call this once from your binary (or install your own
/// subscriber) to see them.
///
/// # Environment Variables
///
/// Set `RUST_LOG` to control log verbosity:
/// - `RUST_LOG=info` - registrations, deregistrations, shutdown
/// - `RUST_LOG=debug` - agent lifecycle and dispatcher activity
/// - `RUST_LOG=trace` - dropped deliveries and dispatch details
/// - `RUST_LOG=agent_runtime=debug` - debug only for this crate
///
/// # Example
///
/// ```ignore
/// setup_tracing();
/// tracing::info!("host starting");
/// ```
pub fn setup_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
}
