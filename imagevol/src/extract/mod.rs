//! Extraction orchestrator.
//!
//! ## Pipeline
//!
//! ```text
//! PullImage ──→ PrepareDirs ──→ Sandbox ──→ CreateContainer ──→ SeedCopyTool
//!                  │              │               │
//!                  │              │               └── undo: remove container (always)
//!                  │              └── undo: stop + remove sandbox (always)
//!                  └── undo: remove volume dirs (on failure)
//!
//!   ──→ StartContainer ──→ WaitExit ──→ MarkMaterialized
//! ```
//!
//! A volume is extracted at most once at a time. Concurrent callers for the
//! same volume and image share the outcome of the attempt in flight. The
//! attempt runs on its own task, so it always reaches its teardown even
//! when every caller has gone away.

mod compensation;
mod job;

pub use compensation::{Compensations, When};
pub use job::{ExtractionJob, JobStatus};

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use imagevol_copy::{CopyOptions, copy_path};
use imagevol_shared::errors::{ImagevolError, ImagevolResult};
use parking_lot::Mutex;

use crate::cri::{
    ContainerRuntime, ContainerSpec, ContainerState, MountSpec, Propagation, SandboxSpec,
};
use crate::driver::constants::{PSEUDO_FILESYSTEMS, cri_names, labels};
use crate::driver::layout::{FilesystemLayout, VolumeLayout};
use crate::driver::options::TimeoutOptions;

/// Settings the orchestrator needs from [`crate::PluginOptions`].
#[derive(Debug, Clone)]
pub struct ExtractorConfig {
    /// Host path of the copy tool binary.
    pub copy_tool: PathBuf,
    /// Default path inside the image to copy.
    pub source_path: String,
    pub runtime_handler: String,
    pub timeouts: TimeoutOptions,
}

/// What a reconciliation pass removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Volume IDs whose incomplete directories were deleted.
    pub removed_dirs: Vec<String>,
    /// IDs of lingering extraction sandboxes that were torn down.
    pub removed_sandboxes: Vec<String>,
}

type Outcome = Shared<BoxFuture<'static, ImagevolResult<()>>>;

struct InFlight {
    image: String,
    outcome: Outcome,
}

struct ExtractorInner {
    runtime: Arc<dyn ContainerRuntime>,
    layout: FilesystemLayout,
    config: ExtractorConfig,
    in_flight: Mutex<HashMap<String, InFlight>>,
}

/// Materializes and releases volume content.
#[derive(Clone)]
pub struct Extractor {
    inner: Arc<ExtractorInner>,
}

impl Extractor {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        layout: FilesystemLayout,
        config: ExtractorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ExtractorInner {
                runtime,
                layout,
                config,
                in_flight: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn layout(&self) -> &FilesystemLayout {
        &self.inner.layout
    }

    /// Whether an extraction for `volume_id` is running.
    pub fn is_in_flight(&self, volume_id: &str) -> bool {
        self.inner.in_flight.lock().contains_key(volume_id)
    }

    /// Ensure the content of `image` exists at the volume's content path.
    ///
    /// Volumes already materialized from `image` return immediately. A call for a volume
    /// that is being extracted from the same image awaits that attempt; a
    /// different image is a conflict.
    pub async fn materialize(
        &self,
        volume_id: &str,
        image: &str,
        source_path: Option<&str>,
    ) -> ImagevolResult<()> {
        if volume_id.is_empty() {
            return Err(ImagevolError::InvalidArgument(
                "materialize: volume ID must not be empty".into(),
            ));
        }
        if image.is_empty() {
            return Err(ImagevolError::InvalidArgument(format!(
                "volume {}: materialize: image reference must not be empty",
                volume_id
            )));
        }
        let layout = self.inner.layout.volume(volume_id)?;
        if layout.is_materialized() {
            if let Some(current) = layout.materialized_image()
                && current != image
            {
                return Err(ImagevolError::Conflict(format!(
                    "volume {}: materialize: content extracted from {}, requested {}",
                    volume_id, current, image
                )));
            }
            tracing::debug!(volume_id = %volume_id, "Volume already materialized");
            return Ok(());
        }

        let outcome = {
            let mut in_flight = self.inner.in_flight.lock();
            match in_flight.get(volume_id) {
                Some(entry) if entry.image != image => {
                    return Err(ImagevolError::Conflict(format!(
                        "volume {}: materialize: extraction of {} in progress, requested {}",
                        volume_id, entry.image, image
                    )));
                }
                Some(entry) => {
                    tracing::debug!(volume_id = %volume_id, "Joining extraction in flight");
                    entry.outcome.clone()
                }
                None => {
                    let outcome = self.spawn_job(
                        volume_id.to_string(),
                        layout,
                        image.to_string(),
                        source_path
                            .unwrap_or(self.inner.config.source_path.as_str())
                            .to_string(),
                    );
                    in_flight.insert(
                        volume_id.to_string(),
                        InFlight {
                            image: image.to_string(),
                            outcome: outcome.clone(),
                        },
                    );
                    outcome
                }
            }
        };

        outcome.await
    }

    /// Must be called with the in-flight lock held, so the job's own
    /// deregistration cannot overtake its registration.
    fn spawn_job(
        &self,
        volume_id: String,
        layout: VolumeLayout,
        image: String,
        source_path: String,
    ) -> Outcome {
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            let result = inner.run_job(&volume_id, &layout, &image, &source_path).await;
            inner.in_flight.lock().remove(&volume_id);
            result
        });

        async move {
            handle.await.unwrap_or_else(|e| {
                Err(ImagevolError::Internal(format!(
                    "extraction task aborted: {}",
                    e
                )))
            })
        }
        .boxed()
        .shared()
    }

    /// Remove the volume's host directories. Absent directories are success.
    pub async fn release(&self, volume_id: &str) -> ImagevolResult<()> {
        let layout = self.inner.layout.volume(volume_id)?;
        if self.is_in_flight(volume_id) {
            return Err(ImagevolError::Conflict(format!(
                "volume {}: release: extraction in progress",
                volume_id
            )));
        }

        tracing::debug!(volume_id = %volume_id, path = %layout.root().display(), "Releasing volume content");
        let vid = volume_id.to_string();
        tokio::task::spawn_blocking(move || layout.cleanup())
            .await
            .map_err(|e| {
                ImagevolError::Internal(format!("volume {}: release: task failed: {}", vid, e))
            })?
            .map_err(|e| context(volume_id, "release", e, ImagevolError::Internal))
    }

    /// Remove what a crash may have left behind.
    ///
    /// Deletes volume directories without the completion marker and tears
    /// down every extraction sandbox this plugin created. Volumes with an
    /// extraction in flight are skipped.
    pub async fn reconcile(&self) -> ImagevolResult<ReconcileReport> {
        let mut report = ReconcileReport::default();

        for volume_id in self.inner.layout.list_volume_ids()? {
            if self.is_in_flight(&volume_id) {
                continue;
            }
            let layout = self.inner.layout.volume(&volume_id)?;
            if layout.is_materialized() {
                continue;
            }
            tracing::info!(volume_id = %volume_id, "Removing incomplete volume directory");
            match layout.cleanup() {
                Ok(()) => report.removed_dirs.push(volume_id),
                Err(e) => {
                    tracing::warn!(volume_id = %volume_id, "Failed to remove incomplete volume: {}", e)
                }
            }
        }

        let selector = HashMap::from([(
            labels::MANAGED_BY.to_string(),
            labels::MANAGED_BY_VALUE.to_string(),
        )]);
        let call = self.inner.config.timeouts.call();
        let sandboxes = bounded(
            "-",
            "list sandboxes",
            call,
            self.inner.runtime.list_sandboxes(&selector),
        )
        .await?;

        for sandbox in sandboxes {
            if let Some(volume_id) = sandbox.labels.get(labels::VOLUME_ID)
                && self.is_in_flight(volume_id)
            {
                continue;
            }
            tracing::info!(sandbox_id = %sandbox.id, name = %sandbox.name, "Removing lingering extraction sandbox");
            match self.inner.teardown_sandbox(&sandbox.name, &sandbox.id).await {
                Ok(()) => report.removed_sandboxes.push(sandbox.id),
                Err(e) => {
                    tracing::warn!(sandbox_id = %sandbox.id, "Failed to remove sandbox: {}", e)
                }
            }
        }

        Ok(report)
    }
}

fn step_start(volume_id: &str, step: &str) {
    tracing::debug!(volume_id = %volume_id, step = %step, "Executing step");
}

fn log_step_error(volume_id: &str, step: &str, err: &ImagevolError) {
    tracing::error!(volume_id = %volume_id, step = %step, "Step failed: {}", err);
}

/// Wrap a failure with the volume and step, keeping timeouts and invalid
/// arguments as they are.
fn context(
    volume_id: &str,
    step: &str,
    err: ImagevolError,
    kind: fn(String) -> ImagevolError,
) -> ImagevolError {
    match err {
        ImagevolError::Timeout(_) | ImagevolError::InvalidArgument(_) => err,
        other => kind(format!("volume {}: {}: {}", volume_id, step, other)),
    }
}

/// Bound a runtime call by a deadline.
async fn bounded<T>(
    volume_id: &str,
    step: &str,
    limit: Duration,
    fut: impl Future<Output = ImagevolResult<T>>,
) -> ImagevolResult<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(ImagevolError::Timeout(format!(
            "volume {}: {}: no response within {:?}",
            volume_id, step, limit
        ))),
    }
}

fn sandbox_spec(volume_id: &str, runtime_handler: &str) -> SandboxSpec {
    SandboxSpec {
        name: volume_id.to_string(),
        uid: format!("imagevol-{}", volume_id),
        namespace: cri_names::SANDBOX_NAMESPACE.to_string(),
        labels: object_labels(volume_id),
        runtime_handler: runtime_handler.to_string(),
    }
}

fn object_labels(volume_id: &str) -> HashMap<String, String> {
    HashMap::from([
        (
            labels::MANAGED_BY.to_string(),
            labels::MANAGED_BY_VALUE.to_string(),
        ),
        (labels::VOLUME_ID.to_string(), volume_id.to_string()),
    ])
}

/// Helper container: runs the seeded copy tool from `source_path` in the
/// image into the content directory, both visible at their host paths.
fn container_spec(
    volume_id: &str,
    layout: &VolumeLayout,
    image: &str,
    source_path: &str,
) -> ContainerSpec {
    let support = layout.support_dir();
    let content = layout.content_dir();

    let mut command = vec![layout.copy_tool_path().to_string_lossy().into_owned()];
    for path in PSEUDO_FILESYSTEMS {
        command.push("--exclude".to_string());
        command.push((*path).to_string());
    }
    command.push("--exclude".to_string());
    command.push(support.to_string_lossy().into_owned());
    command.push(source_path.to_string());
    command.push(content.to_string_lossy().into_owned());

    ContainerSpec {
        name: cri_names::EXTRACT_CONTAINER.to_string(),
        image: image.to_string(),
        command,
        mounts: vec![
            MountSpec {
                container_path: support.clone(),
                host_path: support,
                read_only: false,
                propagation: Propagation::Bidirectional,
            },
            MountSpec {
                container_path: content.clone(),
                host_path: content,
                read_only: false,
                propagation: Propagation::Private,
            },
        ],
        labels: object_labels(volume_id),
    }
}

impl ExtractorInner {
    async fn run_job(
        self: &Arc<Self>,
        volume_id: &str,
        layout: &VolumeLayout,
        image: &str,
        source_path: &str,
    ) -> ImagevolResult<()> {
        // A job that finished between the caller's check and registration.
        if layout.is_materialized() {
            return Ok(());
        }

        tracing::info!(volume_id = %volume_id, image = %image, "Materializing volume");
        let mut job = ExtractionJob::new(volume_id, image);
        let mut compensations = Compensations::new(volume_id);

        let result = self
            .run_steps(&mut job, &mut compensations, layout, source_path)
            .await;
        job.finish(result.is_ok());

        let cleanup_failures = compensations.unwind(result.is_err()).await;
        match &result {
            Ok(()) => tracing::info!(
                volume_id = %volume_id,
                status = %job.status,
                cleanup_failures,
                "Volume materialized"
            ),
            Err(e) => tracing::error!(
                volume_id = %volume_id,
                status = %job.status,
                error_kind = e.kind(),
                "Materialization failed: {}",
                e
            ),
        }
        result
    }

    async fn run_steps(
        self: &Arc<Self>,
        job: &mut ExtractionJob,
        compensations: &mut Compensations,
        layout: &VolumeLayout,
        source_path: &str,
    ) -> ImagevolResult<()> {
        let volume_id = job.volume_id.clone();
        let vid = volume_id.as_str();
        let timeouts = &self.config.timeouts;

        // Pull
        step_start(vid, "pull image");
        let image_ref = bounded(
            vid,
            "pull image",
            timeouts.pull(),
            self.runtime.pull_image(&job.image),
        )
        .await
        .map_err(|e| context(vid, "pull image", e, ImagevolError::ImagePull))
        .inspect_err(|e| log_step_error(vid, "pull image", e))?;
        tracing::debug!(volume_id = %vid, image_ref = %image_ref, "Image pulled");

        // Host directories
        step_start(vid, "prepare directories");
        layout
            .prepare()
            .map_err(|e| context(vid, "prepare directories", e, ImagevolError::Internal))
            .inspect_err(|e| log_step_error(vid, "prepare directories", e))?;
        let dirs = layout.clone();
        compensations.push("remove volume directories", When::OnFailure, move || {
            async move {
                tokio::task::spawn_blocking(move || dirs.cleanup())
                    .await
                    .map_err(|e| ImagevolError::Internal(e.to_string()))?
            }
            .boxed()
        });

        // Sandbox
        step_start(vid, "create sandbox");
        let sandbox = sandbox_spec(vid, &self.config.runtime_handler);
        let sandbox_id = self
            .acquire_sandbox(vid, &sandbox)
            .await
            .map_err(|e| context(vid, "create sandbox", e, ImagevolError::SandboxCreate))
            .inspect_err(|e| log_step_error(vid, "create sandbox", e))?;
        job.sandbox_id = Some(sandbox_id.clone());
        let inner = Arc::clone(self);
        let (name, sid) = (vid.to_string(), sandbox_id.clone());
        compensations.push("remove sandbox", When::Always, move || {
            async move { inner.teardown_sandbox(&name, &sid).await }.boxed()
        });

        // Helper container
        step_start(vid, "create container");
        let spec = container_spec(vid, layout, &job.image, source_path);
        let container_id = bounded(
            vid,
            "create container",
            timeouts.call(),
            self.runtime.create_container(&sandbox_id, &sandbox, &spec),
        )
        .await
        .map_err(|e| context(vid, "create container", e, ImagevolError::Extraction))
        .inspect_err(|e| log_step_error(vid, "create container", e))?;
        job.container_id = Some(container_id.clone());
        let inner = Arc::clone(self);
        let cid = container_id.clone();
        compensations.push("remove container", When::Always, move || {
            async move {
                bounded(
                    "-",
                    "remove container",
                    inner.config.timeouts.call(),
                    inner.runtime.remove_container(&cid),
                )
                .await
            }
            .boxed()
        });

        // Copy tool
        step_start(vid, "seed copy tool");
        let tool_src = self.config.copy_tool.clone();
        let tool_dst = layout.copy_tool_path();
        tokio::task::spawn_blocking(move || copy_path(&tool_src, &tool_dst, &CopyOptions::default()))
            .await
            .map_err(|e| ImagevolError::Internal(format!("volume {}: seed copy tool: {}", vid, e)))?
            .map_err(|e| {
                ImagevolError::Internal(format!("volume {}: seed copy tool: {}", vid, e))
            })
            .inspect_err(|e| log_step_error(vid, "seed copy tool", e))?;

        // Run
        step_start(vid, "start container");
        bounded(
            vid,
            "start container",
            timeouts.call(),
            self.runtime.start_container(&container_id),
        )
        .await
        .map_err(|e| context(vid, "start container", e, ImagevolError::Extraction))
        .inspect_err(|e| log_step_error(vid, "start container", e))?;

        step_start(vid, "wait for exit");
        self.wait_for_exit(vid, &container_id)
            .await
            .inspect_err(|e| log_step_error(vid, "wait for exit", e))?;

        step_start(vid, "mark materialized");
        layout
            .mark_materialized(&job.image)
            .map_err(|e| context(vid, "mark materialized", e, ImagevolError::Internal))
            .inspect_err(|e| log_step_error(vid, "mark materialized", e))?;

        Ok(())
    }

    /// Reuse a ready sandbox left by an earlier attempt, or start a new one.
    async fn acquire_sandbox(&self, volume_id: &str, spec: &SandboxSpec) -> ImagevolResult<String> {
        let call = self.config.timeouts.call();
        let selector = object_labels(volume_id);
        let existing = bounded(
            volume_id,
            "list sandboxes",
            call,
            self.runtime.list_sandboxes(&selector),
        )
        .await?;

        let mut reuse = None;
        for sandbox in existing {
            if sandbox.ready && reuse.is_none() {
                reuse = Some(sandbox.id);
            } else {
                self.teardown_sandbox(volume_id, &sandbox.id).await?;
            }
        }

        if let Some(sandbox_id) = reuse {
            tracing::info!(volume_id = %volume_id, sandbox_id = %sandbox_id, "Reusing existing sandbox");
            // Containers of a crashed attempt would otherwise block the name.
            let stale = bounded(
                volume_id,
                "list containers",
                call,
                self.runtime.list_containers(&sandbox_id),
            )
            .await?;
            for container_id in stale {
                bounded(
                    volume_id,
                    "remove container",
                    call,
                    self.runtime.remove_container(&container_id),
                )
                .await?;
            }
            return Ok(sandbox_id);
        }

        let sandbox_id = bounded(volume_id, "run sandbox", call, self.runtime.run_sandbox(spec)).await?;
        tracing::debug!(volume_id = %volume_id, sandbox_id = %sandbox_id, "Sandbox created");
        Ok(sandbox_id)
    }

    async fn teardown_sandbox(&self, volume_id: &str, sandbox_id: &str) -> ImagevolResult<()> {
        let call = self.config.timeouts.call();
        bounded(
            volume_id,
            "stop sandbox",
            call,
            self.runtime.stop_sandbox(sandbox_id),
        )
        .await?;
        bounded(
            volume_id,
            "remove sandbox",
            call,
            self.runtime.remove_sandbox(sandbox_id),
        )
        .await
    }

    /// Poll the helper container until it exits or the extraction deadline passes.
    async fn wait_for_exit(&self, volume_id: &str, container_id: &str) -> ImagevolResult<()> {
        let timeouts = &self.config.timeouts;
        let poll = async {
            loop {
                let status = bounded(
                    volume_id,
                    "container status",
                    timeouts.call(),
                    self.runtime.container_status(container_id),
                )
                .await?;
                if status.state == ContainerState::Exited {
                    return Ok::<_, ImagevolError>(status);
                }
                tokio::time::sleep(timeouts.poll_interval()).await;
            }
        };

        let status = match tokio::time::timeout(timeouts.extraction(), poll).await {
            Ok(result) => {
                result.map_err(|e| context(volume_id, "wait for exit", e, ImagevolError::Extraction))?
            }
            Err(_) => {
                return Err(ImagevolError::Timeout(format!(
                    "volume {}: wait for exit: extraction did not finish within {:?}",
                    volume_id,
                    timeouts.extraction()
                )));
            }
        };

        if status.exit_code != 0 {
            return Err(ImagevolError::Extraction(format!(
                "volume {}: copy container exited with code {} (reason: {:?}, message: {:?})",
                volume_id, status.exit_code, status.reason, status.message
            )));
        }
        Ok(())
    }
}
