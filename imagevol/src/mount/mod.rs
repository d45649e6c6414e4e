//! Mount coordinator.
//!
//! Attaches a volume's content directory to a workload target by bind mount
//! and detaches it again. All calls block; callers run them on the blocking
//! pool.

mod system;

pub use system::SystemMounter;

use std::path::Path;
use std::sync::Arc;

use imagevol_shared::errors::{ImagevolError, ImagevolResult};

/// Host mount facility.
pub trait Mounter: Send + Sync {
    /// Whether `path` is a mount point. A missing path yields `NotFound`.
    fn is_mount_point(&self, path: &Path) -> std::io::Result<bool>;

    fn mount(
        &self,
        source: &Path,
        target: &Path,
        fs_type: Option<&str>,
        options: &[String],
    ) -> ImagevolResult<()>;

    /// Unmount `target`. A target that is not mounted is success.
    fn unmount(&self, target: &Path) -> ImagevolResult<()>;
}

/// Bind-mount options for an attach.
pub fn bind_options(read_only: bool, extra_flags: &[String]) -> Vec<String> {
    let mut options = vec!["bind".to_string()];
    if read_only {
        options.push("ro".to_string());
    }
    for flag in extra_flags {
        if !options.contains(flag) {
            options.push(flag.clone());
        }
    }
    options
}

#[derive(Clone)]
pub struct MountCoordinator {
    mounter: Arc<dyn Mounter>,
}

impl MountCoordinator {
    pub fn new(mounter: Arc<dyn Mounter>) -> Self {
        Self { mounter }
    }

    /// Bind-mount `content` onto `target`, creating `target` if needed.
    ///
    /// An already mounted target is left alone.
    pub fn attach(
        &self,
        content: &Path,
        target: &Path,
        read_only: bool,
        extra_flags: &[String],
    ) -> ImagevolResult<()> {
        let mounted = match self.mounter.is_mount_point(target) {
            Ok(mounted) => mounted,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                std::fs::create_dir_all(target).map_err(|e| {
                    ImagevolError::Internal(format!(
                        "Failed to create target {}: {}",
                        target.display(),
                        e
                    ))
                })?;
                false
            }
            Err(e) => {
                return Err(ImagevolError::Internal(format!(
                    "Failed to check mount point {}: {}",
                    target.display(),
                    e
                )));
            }
        };

        if mounted {
            tracing::debug!(target = %target.display(), "Target already mounted");
            return Ok(());
        }

        let options = bind_options(read_only, extra_flags);
        self.mounter.mount(content, target, None, &options)?;

        tracing::info!(
            "Attached {} → {} ({})",
            content.display(),
            target.display(),
            if read_only { "ro" } else { "rw" }
        );
        Ok(())
    }

    /// Unmount `target` and remove the directory. Absent or unmounted
    /// targets are success.
    pub fn detach(&self, target: &Path) -> ImagevolResult<()> {
        let mounted = match self.mounter.is_mount_point(target) {
            Ok(mounted) => mounted,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(ImagevolError::Mount(format!(
                    "Failed to check mount point {}: {}",
                    target.display(),
                    e
                )));
            }
        };

        if mounted {
            self.mounter.unmount(target)?;
            tracing::info!(target = %target.display(), "Detached");
        }

        // Only an empty directory goes; anything else is not ours to delete.
        if let Err(e) = std::fs::remove_dir(target)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(target = %target.display(), "Failed to remove target directory: {}", e);
        }
        Ok(())
    }
}
