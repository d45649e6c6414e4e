//! Volume lifecycle service.
//!
//! Publish and unpublish drive each volume through its state machine while
//! holding that volume's record lock, delegating to the extractor for
//! content and to the mount coordinator for the target.

mod registry;
mod state;

pub use registry::{VolumeHandle, VolumeRegistry};
pub use state::{VolumeRecord, VolumeStatus};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use imagevol_shared::errors::{ImagevolError, ImagevolResult};

use crate::driver::layout::validate_volume_id;
use crate::driver::options::{TimeoutOptions, validate_source_path};
use crate::extract::Extractor;
use crate::mount::MountCoordinator;

/// Arguments of a publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRequest {
    pub volume_id: String,
    pub image: String,
    pub target_path: PathBuf,
    pub read_only: bool,
    /// Extra mount options from the volume capability.
    pub mount_flags: Vec<String>,
    /// Path inside the image to expose instead of the configured default.
    pub source_path: Option<String>,
}

impl PublishRequest {
    pub fn new(volume_id: &str, image: &str, target_path: impl Into<PathBuf>) -> Self {
        Self {
            volume_id: volume_id.to_string(),
            image: image.to_string(),
            target_path: target_path.into(),
            read_only: true,
            mount_flags: Vec::new(),
            source_path: None,
        }
    }

    fn validate(&self) -> ImagevolResult<()> {
        validate_volume_id(&self.volume_id)?;
        validate_target(&self.volume_id, &self.target_path)?;
        if self.image.is_empty() {
            return Err(ImagevolError::InvalidArgument(format!(
                "volume {}: publish: image reference missing in volume context",
                self.volume_id
            )));
        }
        if let Some(path) = &self.source_path {
            validate_source_path(path).map_err(|reason| {
                ImagevolError::InvalidArgument(format!(
                    "volume {}: publish: {}",
                    self.volume_id, reason
                ))
            })?;
        }
        Ok(())
    }
}

fn validate_target(volume_id: &str, target: &Path) -> ImagevolResult<()> {
    if target.as_os_str().is_empty() {
        return Err(ImagevolError::InvalidArgument(format!(
            "volume {}: target path missing in request",
            volume_id
        )));
    }
    if !target.is_absolute() {
        return Err(ImagevolError::InvalidArgument(format!(
            "volume {}: target path must be absolute, got: {}",
            volume_id,
            target.display()
        )));
    }
    Ok(())
}

/// Entry points of the node plugin.
#[derive(Clone)]
pub struct VolumeService {
    registry: Arc<VolumeRegistry>,
    extractor: Extractor,
    mounts: MountCoordinator,
    timeouts: TimeoutOptions,
}

impl VolumeService {
    pub fn new(extractor: Extractor, mounts: MountCoordinator, timeouts: TimeoutOptions) -> Self {
        let registry = Arc::new(VolumeRegistry::new(extractor.layout().clone()));
        Self {
            registry,
            extractor,
            mounts,
            timeouts,
        }
    }

    pub fn registry(&self) -> &VolumeRegistry {
        &self.registry
    }

    /// Materialize the image if needed and mount it at the target.
    ///
    /// After any failure the volume is left unmounted and the call may be
    /// retried.
    pub async fn publish(&self, request: &PublishRequest) -> ImagevolResult<()> {
        request.validate()?;
        let volume_id = request.volume_id.as_str();

        let handle = self.registry.get_or_create(volume_id);
        let result = {
            let mut record = handle.lock().await;
            tracing::info!(
                volume_id = %volume_id,
                image = %request.image,
                target = %request.target_path.display(),
                read_only = request.read_only,
                status = %record.status,
                "Publishing volume"
            );
            self.publish_locked(&mut record, request).await
        };
        drop(handle);

        match &result {
            Ok(()) => tracing::info!(volume_id = %volume_id, "Volume published"),
            Err(_) => self.registry.prune(volume_id),
        }
        result
    }

    async fn publish_locked(
        &self,
        record: &mut VolumeRecord,
        request: &PublishRequest,
    ) -> ImagevolResult<()> {
        let volume_id = request.volume_id.as_str();
        self.settle_interrupted(record)?;

        match record.status {
            VolumeStatus::Mounted => {
                check_image(record, &request.image)?;
                if record.target_path.as_deref() == Some(request.target_path.as_path()) {
                    tracing::debug!(volume_id = %volume_id, "Volume already published");
                    return Ok(());
                }
                return Err(ImagevolError::Conflict(format!(
                    "volume {}: publish: already mounted at {}",
                    volume_id,
                    record
                        .target_path
                        .as_deref()
                        .map(|p| p.display().to_string())
                        .unwrap_or_default()
                )));
            }
            VolumeStatus::Materialized | VolumeStatus::Materializing => {
                check_image(record, &request.image)?
            }
            VolumeStatus::Unmounting => {
                // Finish the interrupted release before extracting again.
                self.release_locked(record).await?;
            }
            VolumeStatus::Unmaterialized | VolumeStatus::Released => {}
        }

        if record.status.can_materialize() || record.status == VolumeStatus::Materializing {
            if record.status != VolumeStatus::Materializing {
                record.transition_to(VolumeStatus::Materializing)?;
                record.image = Some(request.image.clone());
            } else {
                tracing::debug!(volume_id = %volume_id, "Joining abandoned extraction");
            }

            let result = self
                .extractor
                .materialize(volume_id, &request.image, request.source_path.as_deref())
                .await;
            if let Err(e) = result {
                self.settle_interrupted(record)?;
                return Err(e);
            }
            record.transition_to(VolumeStatus::Materialized)?;
        } else if record.image.is_none() {
            // Recovered from a marker that names no image.
            record.image = Some(request.image.clone());
        }

        let content = self.extractor.layout().volume(volume_id)?.content_dir();
        let mounts = self.mounts.clone();
        let target = request.target_path.clone();
        let read_only = request.read_only;
        let flags = request.mount_flags.clone();
        run_blocking(volume_id, "attach", self.timeouts.mount(), move || {
            mounts.attach(&content, &target, read_only, &flags)
        })
        .await
        .inspect_err(|e| {
            tracing::error!(volume_id = %volume_id, "Attach failed: {}", e);
        })?;

        record.transition_to(VolumeStatus::Mounted)?;
        record.target_path = Some(request.target_path.clone());
        record.read_only = request.read_only;
        Ok(())
    }

    /// Bring a `Materializing` record in line with the extractor.
    ///
    /// A publish that was cancelled while awaiting its extraction leaves the
    /// record `Materializing`. While the job is still running the record
    /// stays that way; once it has finished, the marker decides.
    fn settle_interrupted(&self, record: &mut VolumeRecord) -> ImagevolResult<()> {
        if record.status != VolumeStatus::Materializing
            || self.extractor.is_in_flight(&record.volume_id)
        {
            return Ok(());
        }

        let layout = self.extractor.layout().volume(&record.volume_id)?;
        if layout.is_materialized() {
            record.transition_to(VolumeStatus::Materialized)?;
            record.image = layout.materialized_image().or(record.image.take());
        } else {
            record.transition_to(VolumeStatus::Unmaterialized)?;
            record.image = None;
        }
        tracing::debug!(
            volume_id = %record.volume_id,
            status = %record.status,
            "Settled interrupted materialization"
        );
        Ok(())
    }

    /// Unmount the target and delete the volume's content.
    ///
    /// A failed unmount leaves everything in place. A failed deletion leaves
    /// the volume `Unmounting`; a retry resumes at the deletion. A target
    /// other than the one the volume is mounted at is unmounted, but the
    /// content stays.
    pub async fn unpublish(&self, volume_id: &str, target_path: &Path) -> ImagevolResult<()> {
        validate_volume_id(volume_id)?;
        validate_target(volume_id, target_path)?;

        let handle = self.registry.get_or_create(volume_id);
        let result = {
            let mut record = handle.lock().await;
            tracing::info!(
                volume_id = %volume_id,
                target = %target_path.display(),
                status = %record.status,
                "Unpublishing volume"
            );
            self.unpublish_locked(&mut record, target_path).await
        };
        drop(handle);

        if result.is_ok() {
            self.registry.prune(volume_id);
            tracing::info!(volume_id = %volume_id, "Volume unpublished");
        }
        result
    }

    async fn unpublish_locked(
        &self,
        record: &mut VolumeRecord,
        target_path: &Path,
    ) -> ImagevolResult<()> {
        let volume_id = record.volume_id.clone();
        self.settle_interrupted(record)?;
        if record.status == VolumeStatus::Materializing {
            return Err(ImagevolError::Conflict(format!(
                "volume {}: unpublish: materialization in progress",
                volume_id
            )));
        }

        let mounts = self.mounts.clone();
        let target = target_path.to_path_buf();
        run_blocking(&volume_id, "detach", self.timeouts.mount(), move || {
            mounts.detach(&target)
        })
        .await
        .inspect_err(|e| {
            tracing::error!(volume_id = %volume_id, "Detach failed: {}", e);
        })?;

        // The content is still bind-mounted at the recorded target.
        if record.status == VolumeStatus::Mounted
            && let Some(mounted_at) = record.target_path.as_deref()
            && mounted_at != target_path
        {
            tracing::warn!(
                volume_id = %volume_id,
                target = %target_path.display(),
                mounted_at = %mounted_at.display(),
                "Unpublish of a target the volume is not mounted at; keeping content"
            );
            return Ok(());
        }

        if record.status != VolumeStatus::Unmounting {
            record.transition_to(VolumeStatus::Unmounting)?;
            record.target_path = None;
        }
        self.release_locked(record).await
    }

    /// Delete content of an `Unmounting` volume and mark it `Released`.
    async fn release_locked(&self, record: &mut VolumeRecord) -> ImagevolResult<()> {
        self.extractor
            .release(&record.volume_id)
            .await
            .inspect_err(|e| {
                tracing::error!(volume_id = %record.volume_id, "Release failed: {}", e);
            })?;
        record.transition_to(VolumeStatus::Released)?;
        record.image = None;
        Ok(())
    }

    /// Staging is not advertised; accepted for compatibility.
    pub async fn stage(&self, volume_id: &str, staging_path: &Path) -> ImagevolResult<()> {
        validate_volume_id(volume_id)?;
        if staging_path.as_os_str().is_empty() {
            return Err(ImagevolError::InvalidArgument(format!(
                "volume {}: staging target path missing in request",
                volume_id
            )));
        }
        tracing::debug!(volume_id = %volume_id, "Stage is a no-op");
        Ok(())
    }

    pub async fn unstage(&self, volume_id: &str, staging_path: &Path) -> ImagevolResult<()> {
        validate_volume_id(volume_id)?;
        if staging_path.as_os_str().is_empty() {
            return Err(ImagevolError::InvalidArgument(format!(
                "volume {}: staging target path missing in request",
                volume_id
            )));
        }
        tracing::debug!(volume_id = %volume_id, "Unstage is a no-op");
        Ok(())
    }
}

fn check_image(record: &VolumeRecord, image: &str) -> ImagevolResult<()> {
    match &record.image {
        Some(current) if current != image => Err(ImagevolError::Conflict(format!(
            "volume {}: publish: materialized from {}, requested {}",
            record.volume_id, current, image
        ))),
        _ => Ok(()),
    }
}

/// Run a blocking mount call on the blocking pool under a deadline.
async fn run_blocking<F>(
    volume_id: &str,
    operation: &str,
    limit: Duration,
    f: F,
) -> ImagevolResult<()>
where
    F: FnOnce() -> ImagevolResult<()> + Send + 'static,
{
    let task = tokio::task::spawn_blocking(f);
    match tokio::time::timeout(limit, task).await {
        Ok(Ok(result)) => result.map_err(|e| match e {
            ImagevolError::Mount(msg) => {
                ImagevolError::Mount(format!("volume {}: {}: {}", volume_id, operation, msg))
            }
            ImagevolError::Internal(msg) => {
                ImagevolError::Internal(format!("volume {}: {}: {}", volume_id, operation, msg))
            }
            other => other,
        }),
        Ok(Err(e)) => Err(ImagevolError::Internal(format!(
            "volume {}: {}: task failed: {}",
            volume_id, operation, e
        ))),
        Err(_) => Err(ImagevolError::Timeout(format!(
            "volume {}: {}: no completion within {:?}",
            volume_id, operation, limit
        ))),
    }
}
