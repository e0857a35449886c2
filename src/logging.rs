use std::sync::Once;

use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Initialize tracing.
///
/// Will only initialize once, so tests may call this.
pub fn init() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();

        debug!("Logging initialized");
    });
}
