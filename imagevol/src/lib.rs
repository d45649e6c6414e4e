//! imagevol: a CSI node plugin that exposes container image contents as volumes.
//!
//! Publishing a volume pulls the image through the node's CRI runtime, runs
//! a short-lived sandboxed container that copies the image filesystem into a
//! host directory, and bind-mounts that directory at the workload's target.
//! Unpublishing unmounts the target and deletes the copy.

use std::path::Path;
use std::sync::OnceLock;

use tracing_subscriber::EnvFilter;

// Global guard for tracing-appender to keep the writer thread alive
static LOG_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

pub mod cri;
pub mod csi;
pub mod driver;
pub mod extract;
pub mod mount;
pub mod server;
pub mod util;
pub mod volume;

pub use driver::Driver;
pub use driver::options::{PluginOptions, TimeoutOptions};
pub use extract::ReconcileReport;
pub use imagevol_shared::errors::{ImagevolError, ImagevolResult};
pub use volume::{PublishRequest, VolumeService, VolumeStatus};

/// Initialize tracing with logs written to `<log_dir>/imagevol.log`.
///
/// Files rotate daily. `RUST_LOG` controls filtering and falls back to
/// `default_filter`. Idempotent: subsequent calls return immediately once
/// initialized.
pub fn init_logging_for(log_dir: &Path, default_filter: &str) -> ImagevolResult<()> {
    std::fs::create_dir_all(log_dir).map_err(|e| {
        ImagevolError::Config(format!(
            "Failed to create logs directory {}: {}",
            log_dir.display(),
            e
        ))
    })?;

    let _ = LOG_GUARD.get_or_init(|| {
        let file_appender = tracing_appender::rolling::daily(log_dir, "imagevol.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let env_filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(default_filter))
            .unwrap_or_else(|_| EnvFilter::new("info"));

        util::register_to_tracing(non_blocking, env_filter);

        guard
    });

    Ok(())
}
