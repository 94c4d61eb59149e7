use tracing_subscriber::{fmt, EnvFilter};

/// Initialize structured logging with environment filter.
/// Set VKSHIM_LOG=debug (or trace, info, warn, error) for verbosity control;
/// `default_filter` applies when the variable is unset or invalid.
///
/// The shim lives inside someone else's process, which may already have
/// installed a global subscriber. In that case this is a no-op.
pub fn init_logging(default_filter: &str) {
    let filter = EnvFilter::try_from_env("VKSHIM_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .try_init();
}
