use tracing_subscriber::EnvFilter;

pub use function_monitor::log::Hex;

/// Environment variable holding the log filter directives.
pub const LOG_ENV: &str = "ET_LOG";

/// Installs a global subscriber that writes to stderr, filtered by [`LOG_ENV`].
pub fn initialize_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_env(LOG_ENV))
        .with_writer(std::io::stderr)
        .init();
}
