//! Container runtime seam.
//!
//! The extraction pipeline talks to the node's runtime only through
//! [`ContainerRuntime`]. [`CriRuntime`] implements it over the CRI gRPC API;
//! tests plug in an in-process fake.

mod client;
mod connection;

pub use client::CriRuntime;
pub use connection::{Backoff, ConnectOptions, RuntimeConnection, RuntimeEndpoint, connect};

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use imagevol_shared::errors::ImagevolResult;

/// Sandbox to run the extraction container in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxSpec {
    /// Metadata name, equal to the volume ID.
    pub name: String,
    pub uid: String,
    pub namespace: String,
    pub labels: HashMap<String, String>,
    /// Runtime handler (empty = runtime default).
    pub runtime_handler: String,
}

/// Helper container that performs the copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// Full argv; `command[0]` is the copy tool in the support mount.
    pub command: Vec<String>,
    pub mounts: Vec<MountSpec>,
    pub labels: HashMap<String, String>,
}

/// Host path mounted into the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    pub container_path: PathBuf,
    pub host_path: PathBuf,
    pub read_only: bool,
    pub propagation: Propagation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Propagation {
    Private,
    HostToContainer,
    Bidirectional,
}

/// Sandbox as reported by `ListPodSandbox`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxInfo {
    pub id: String,
    pub name: String,
    pub ready: bool,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Created,
    Running,
    Exited,
    Unknown,
}

/// Status of a container as reported by `ContainerStatus`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerStatus {
    pub state: ContainerState,
    pub exit_code: i32,
    pub reason: String,
    pub message: String,
}

/// Operations the extraction pipeline needs from a container runtime.
///
/// Remove and stop calls treat an already-absent object as success.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Pull an image, returning the resolved image reference.
    async fn pull_image(&self, image: &str) -> ImagevolResult<String>;

    /// Create and start a sandbox, returning its ID.
    async fn run_sandbox(&self, spec: &SandboxSpec) -> ImagevolResult<String>;

    /// Sandboxes carrying all of the given labels.
    async fn list_sandboxes(
        &self,
        labels: &HashMap<String, String>,
    ) -> ImagevolResult<Vec<SandboxInfo>>;

    async fn stop_sandbox(&self, sandbox_id: &str) -> ImagevolResult<()>;

    async fn remove_sandbox(&self, sandbox_id: &str) -> ImagevolResult<()>;

    /// Create a container inside a sandbox, returning its ID.
    async fn create_container(
        &self,
        sandbox_id: &str,
        sandbox: &SandboxSpec,
        container: &ContainerSpec,
    ) -> ImagevolResult<String>;

    async fn start_container(&self, container_id: &str) -> ImagevolResult<()>;

    async fn container_status(&self, container_id: &str) -> ImagevolResult<ContainerStatus>;

    /// IDs of all containers in a sandbox.
    async fn list_containers(&self, sandbox_id: &str) -> ImagevolResult<Vec<String>>;

    async fn remove_container(&self, container_id: &str) -> ImagevolResult<()>;
}
