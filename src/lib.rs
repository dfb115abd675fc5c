pub mod artifacts;
pub mod burst;
pub mod config;
pub mod context;
pub mod distribution;
pub mod error;
pub mod hooks;
pub mod license;
pub mod ooxml;
pub mod orchestrator;
pub mod progress;
pub mod settings;
pub mod variables;

pub use error::BurstError;
pub use orchestrator::{BurstEngine, JobOutcome, TestOptions};

use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber. `RUST_LOG` wins over the
/// built-in filters; `verbose` raises them to debug.
pub fn init_tracing(verbose: bool) {
    let fallback = if verbose {
        config::verbose_log_filter()
    } else {
        config::default_log_filter()
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)),
        )
        .with_writer(std::io::stderr)
        .try_init();
}
