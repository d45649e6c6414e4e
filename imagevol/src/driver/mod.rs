//! Plugin assembly.
//!
//! [`Driver`] wires the runtime handle, the host layout, the extractor, the
//! mount coordinator and the lifecycle service together. The runtime handle
//! is passed in explicitly; nothing is process-global.

pub mod constants;
pub mod layout;
pub mod options;

use std::future::Future;
use std::sync::Arc;

use imagevol_shared::errors::ImagevolResult;

use crate::cri::{self, ConnectOptions, ContainerRuntime, CriRuntime, RuntimeEndpoint};
use crate::csi::{IdentityService, NodeService};
use crate::extract::{Extractor, ExtractorConfig, ReconcileReport};
use crate::mount::{MountCoordinator, Mounter, SystemMounter};
use crate::server;
use crate::volume::VolumeService;
use layout::FilesystemLayout;
use options::PluginOptions;

pub struct Driver {
    options: PluginOptions,
    extractor: Extractor,
    volumes: VolumeService,
}

impl Driver {
    /// Connect to the configured CRI endpoint and build the driver on it.
    ///
    /// Blocks until the runtime is ready or `timeouts.connect_secs` elapses.
    pub async fn connect(options: PluginOptions) -> ImagevolResult<Self> {
        options.validate()?;
        let endpoint = RuntimeEndpoint::parse(&options.runtime_endpoint)?;
        let connect_options = ConnectOptions {
            timeout: options.timeouts.connect(),
            attempt_timeout: options.timeouts.call().min(options.timeouts.connect()),
            ..Default::default()
        };
        let connection = cri::connect(&endpoint, &connect_options).await?;
        let runtime: Arc<dyn ContainerRuntime> = Arc::new(CriRuntime::from_connection(&connection));

        Self::with_runtime(options, runtime, Arc::new(SystemMounter::new()))
    }

    /// Build the driver on an existing runtime handle and mount facility.
    pub fn with_runtime(
        options: PluginOptions,
        runtime: Arc<dyn ContainerRuntime>,
        mounter: Arc<dyn Mounter>,
    ) -> ImagevolResult<Self> {
        options.validate()?;

        let layout = FilesystemLayout::new(options.root_dir.clone());
        layout.prepare()?;

        if !options.copy_tool.is_file() {
            tracing::warn!(
                copy_tool = %options.copy_tool.display(),
                "Copy tool not found; extractions will fail until it is installed"
            );
        }

        let extractor = Extractor::new(
            runtime,
            layout,
            ExtractorConfig {
                copy_tool: options.copy_tool.clone(),
                source_path: options.source_path.clone(),
                runtime_handler: options.runtime_handler.clone(),
                timeouts: options.timeouts.clone(),
            },
        );
        let volumes = VolumeService::new(
            extractor.clone(),
            MountCoordinator::new(mounter),
            options.timeouts.clone(),
        );

        tracing::debug!(
            driver = %options.driver_name,
            node_id = %options.node_id,
            root_dir = %options.root_dir.display(),
            "Driver initialized"
        );

        Ok(Self {
            options,
            extractor,
            volumes,
        })
    }

    pub fn options(&self) -> &PluginOptions {
        &self.options
    }

    pub fn volumes(&self) -> &VolumeService {
        &self.volumes
    }

    pub fn extractor(&self) -> &Extractor {
        &self.extractor
    }

    /// Clean up after a crash: incomplete volume directories and lingering
    /// extraction sandboxes.
    pub async fn reconcile(&self) -> ImagevolResult<ReconcileReport> {
        let report = self.extractor.reconcile().await?;
        tracing::info!(
            removed_dirs = report.removed_dirs.len(),
            removed_sandboxes = report.removed_sandboxes.len(),
            "Reconciliation complete"
        );
        Ok(report)
    }

    pub fn identity_service(&self) -> IdentityService {
        IdentityService::new(self.options.driver_name.clone())
    }

    pub fn node_service(&self) -> NodeService {
        NodeService::new(self.volumes.clone(), self.options.node_id.clone())
    }

    /// Serve the CSI services on the configured endpoint until `shutdown`.
    pub async fn serve<F>(&self, shutdown: F) -> ImagevolResult<()>
    where
        F: Future<Output = ()> + Send,
    {
        server::serve(
            &self.options.endpoint,
            self.identity_service(),
            self.node_service(),
            shutdown,
        )
        .await
    }
}
