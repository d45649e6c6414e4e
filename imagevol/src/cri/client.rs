//! [`ContainerRuntime`] over the CRI gRPC services.

use std::collections::HashMap;

use async_trait::async_trait;
use imagevol_shared::cri;
use imagevol_shared::cri::image_service_client::ImageServiceClient;
use imagevol_shared::cri::runtime_service_client::RuntimeServiceClient;
use imagevol_shared::errors::{ImagevolError, ImagevolResult};
use tonic::Code;
use tonic::transport::Channel;

use super::{
    ContainerRuntime, ContainerSpec, ContainerState, ContainerStatus, MountSpec, Propagation,
    RuntimeConnection, SandboxInfo, SandboxSpec,
};

/// CRI client pair sharing one channel.
///
/// The generated clients are cheap to clone; every call works on its own
/// clone so `&self` methods can run concurrently.
#[derive(Debug, Clone)]
pub struct CriRuntime {
    runtime: RuntimeServiceClient<Channel>,
    images: ImageServiceClient<Channel>,
}

impl CriRuntime {
    pub fn new(channel: Channel) -> Self {
        Self {
            runtime: RuntimeServiceClient::new(channel.clone()),
            images: ImageServiceClient::new(channel),
        }
    }

    pub fn from_connection(connection: &RuntimeConnection) -> Self {
        Self::new(connection.channel.clone())
    }
}

fn sandbox_config(spec: &SandboxSpec) -> cri::PodSandboxConfig {
    cri::PodSandboxConfig {
        metadata: Some(cri::PodSandboxMetadata {
            name: spec.name.clone(),
            uid: spec.uid.clone(),
            namespace: spec.namespace.clone(),
            attempt: 0,
        }),
        hostname: String::new(),
        log_directory: String::new(),
        labels: spec.labels.clone(),
        annotations: HashMap::new(),
    }
}

fn mount_to_proto(mount: &MountSpec) -> cri::Mount {
    let propagation = match mount.propagation {
        Propagation::Private => cri::MountPropagation::PropagationPrivate,
        Propagation::HostToContainer => cri::MountPropagation::PropagationHostToContainer,
        Propagation::Bidirectional => cri::MountPropagation::PropagationBidirectional,
    };
    cri::Mount {
        container_path: mount.container_path.to_string_lossy().into_owned(),
        host_path: mount.host_path.to_string_lossy().into_owned(),
        readonly: mount.read_only,
        selinux_relabel: false,
        propagation: propagation as i32,
    }
}

fn state_from_proto(state: cri::ContainerState) -> ContainerState {
    match state {
        cri::ContainerState::ContainerCreated => ContainerState::Created,
        cri::ContainerState::ContainerRunning => ContainerState::Running,
        cri::ContainerState::ContainerExited => ContainerState::Exited,
        cri::ContainerState::ContainerUnknown => ContainerState::Unknown,
    }
}

/// Removing something that is already gone is success.
fn ignore_not_found(result: Result<(), tonic::Status>) -> ImagevolResult<()> {
    match result {
        Ok(()) => Ok(()),
        Err(status) if status.code() == Code::NotFound => Ok(()),
        Err(status) => Err(status.into()),
    }
}

#[async_trait]
impl ContainerRuntime for CriRuntime {
    async fn pull_image(&self, image: &str) -> ImagevolResult<String> {
        let request = cri::PullImageRequest {
            image: Some(cri::ImageSpec {
                image: image.to_string(),
                annotations: HashMap::new(),
            }),
            sandbox_config: None,
        };
        let response = self.images.clone().pull_image(request).await?.into_inner();
        Ok(response.image_ref)
    }

    async fn run_sandbox(&self, spec: &SandboxSpec) -> ImagevolResult<String> {
        let request = cri::RunPodSandboxRequest {
            config: Some(sandbox_config(spec)),
            runtime_handler: spec.runtime_handler.clone(),
        };
        let response = self.runtime.clone().run_pod_sandbox(request).await?.into_inner();
        Ok(response.pod_sandbox_id)
    }

    async fn list_sandboxes(
        &self,
        labels: &HashMap<String, String>,
    ) -> ImagevolResult<Vec<SandboxInfo>> {
        let request = cri::ListPodSandboxRequest {
            filter: Some(cri::PodSandboxFilter {
                id: String::new(),
                state: None,
                label_selector: labels.clone(),
            }),
        };
        let response = self.runtime.clone().list_pod_sandbox(request).await?.into_inner();

        Ok(response
            .items
            .into_iter()
            .map(|sandbox| SandboxInfo {
                ready: sandbox.state() == cri::PodSandboxState::SandboxReady,
                name: sandbox
                    .metadata
                    .as_ref()
                    .map(|m| m.name.clone())
                    .unwrap_or_default(),
                id: sandbox.id,
                labels: sandbox.labels,
            })
            .collect())
    }

    async fn stop_sandbox(&self, sandbox_id: &str) -> ImagevolResult<()> {
        let request = cri::StopPodSandboxRequest {
            pod_sandbox_id: sandbox_id.to_string(),
        };
        ignore_not_found(self.runtime.clone().stop_pod_sandbox(request).await.map(|_| ()))
    }

    async fn remove_sandbox(&self, sandbox_id: &str) -> ImagevolResult<()> {
        let request = cri::RemovePodSandboxRequest {
            pod_sandbox_id: sandbox_id.to_string(),
        };
        ignore_not_found(self.runtime.clone().remove_pod_sandbox(request).await.map(|_| ()))
    }

    async fn create_container(
        &self,
        sandbox_id: &str,
        sandbox: &SandboxSpec,
        container: &ContainerSpec,
    ) -> ImagevolResult<String> {
        let config = cri::ContainerConfig {
            metadata: Some(cri::ContainerMetadata {
                name: container.name.clone(),
                attempt: 0,
            }),
            image: Some(cri::ImageSpec {
                image: container.image.clone(),
                annotations: HashMap::new(),
            }),
            command: container.command.clone(),
            args: Vec::new(),
            working_dir: String::new(),
            mounts: container.mounts.iter().map(mount_to_proto).collect(),
            labels: container.labels.clone(),
            annotations: HashMap::new(),
            log_path: String::new(),
        };
        let request = cri::CreateContainerRequest {
            pod_sandbox_id: sandbox_id.to_string(),
            config: Some(config),
            sandbox_config: Some(sandbox_config(sandbox)),
        };
        let response = self.runtime.clone().create_container(request).await?.into_inner();
        Ok(response.container_id)
    }

    async fn start_container(&self, container_id: &str) -> ImagevolResult<()> {
        let request = cri::StartContainerRequest {
            container_id: container_id.to_string(),
        };
        self.runtime.clone().start_container(request).await?;
        Ok(())
    }

    async fn container_status(&self, container_id: &str) -> ImagevolResult<ContainerStatus> {
        let request = cri::ContainerStatusRequest {
            container_id: container_id.to_string(),
            verbose: false,
        };
        let response = self.runtime.clone().container_status(request).await?.into_inner();
        let status = response.status.ok_or_else(|| {
            ImagevolError::Internal(format!(
                "ContainerStatus for {} returned no status",
                container_id
            ))
        })?;

        Ok(ContainerStatus {
            state: state_from_proto(status.state()),
            exit_code: status.exit_code,
            reason: status.reason,
            message: status.message,
        })
    }

    async fn list_containers(&self, sandbox_id: &str) -> ImagevolResult<Vec<String>> {
        let request = cri::ListContainersRequest {
            filter: Some(cri::ContainerFilter {
                id: String::new(),
                state: None,
                pod_sandbox_id: sandbox_id.to_string(),
                label_selector: HashMap::new(),
            }),
        };
        let response = self.runtime.clone().list_containers(request).await?.into_inner();
        Ok(response.containers.into_iter().map(|c| c.id).collect())
    }

    async fn remove_container(&self, container_id: &str) -> ImagevolResult<()> {
        let request = cri::RemoveContainerRequest {
            container_id: container_id.to_string(),
        };
        ignore_not_found(self.runtime.clone().remove_container(request).await.map(|_| ()))
    }
}
