//! Process-wide `tracing` subscriber.

use std::sync::OnceLock;

use tracing_subscriber::{fmt, EnvFilter};

/// Installs the `fmt` subscriber once; later calls are no-ops.
///
/// The filter comes from `RUST_LOG` and defaults to `info`.
pub fn install_tracing_subscriber() {
    static INSTALLED: OnceLock<()> = OnceLock::new();
    INSTALLED.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = fmt().with_env_filter(filter).with_writer(std::io::stderr).try_init();
    });
}
