pub mod log;

use tracing_subscriber::EnvFilter;

/// Initialise process-wide logging from the configured app log level.
/// `RUST_LOG` still wins when set, so operators can raise verbosity per
/// module without touching config files.
pub fn setup_logging(level: &str) {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
	tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_writer(std::io::stdout)
		.init();
}
