use tracing_subscriber::EnvFilter;

/// Setup logging of events reported by the resolution core in unit tests.
///
/// Use the RUST_LOG environment variable to override the defaults.
///
/// E.g. To enable debug level logging:
///   RUST_LOG=DEBUG
///
/// Or to see only the statistics lines:
///   RUST_LOG=gns::stats=DEBUG
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_thread_ids(true)
        .without_time()
        .try_init()
        .ok();
}
