//! Shared setup for the `hugemap` binaries.

use indicatif::MultiProgress;
use indicatif_log_bridge::LogWrapper;

/// Installs `env_logger` behind a [`MultiProgress`] so log lines do not tear
/// progress bars.
///
/// `RUST_LOG` overrides `default_filter`.
pub fn init_logging_with_progress(default_filter: &str) -> anyhow::Result<MultiProgress> {
    let env = env_logger::Env::default().default_filter_or(default_filter);
    let logger = env_logger::Builder::from_env(env).build();
    let progress = MultiProgress::new();
    LogWrapper::new(progress.clone(), logger).try_init()?;
    Ok(progress)
}
