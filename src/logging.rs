use crate::core::config::SessionConfig;
use crate::core::errors::Result;

/// Install a global fmt subscriber at the configured level.
///
/// Returns `Ok(false)` if a global subscriber was already installed, so
/// every rank thread of an in-process group can call this.
pub fn init_tracing(config: &SessionConfig) -> Result<bool> {
    let level = config.level()?;
    let installed = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_thread_names(true)
        .try_init()
        .is_ok();
    Ok(installed)
}
