//! Logging initialization for embedding hosts.

/// Install a stderr `tracing` subscriber filtered by `RUST_LOG`
/// (default `info`). Call once from the host; repeated calls are ignored.
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}
