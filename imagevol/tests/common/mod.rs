//! Shared fixtures: in-process fakes for the container runtime and the
//! mount facility.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use imagevol::cri::{
    ContainerRuntime, ContainerSpec, ContainerState, ContainerStatus, SandboxInfo, SandboxSpec,
};
use imagevol::driver::constants::labels;
use imagevol::mount::Mounter;
use imagevol::{Driver, ImagevolError, ImagevolResult, PluginOptions};
use parking_lot::Mutex;
use tempfile::TempDir;

// ============================================================================
// FAKE RUNTIME
// ============================================================================

/// Injected runtime failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failpoint {
    Pull,
    RunSandbox,
    CreateContainer,
    StartContainer,
    /// The copy container exits with this code.
    Exit(i32),
    /// The copy container never exits.
    Hang,
}

#[derive(Debug, Clone)]
pub struct FakeSandbox {
    pub name: String,
    pub labels: HashMap<String, String>,
    pub ready: bool,
}

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub sandbox_id: String,
    pub spec: Option<ContainerSpec>,
    pub state: ContainerState,
    pub exit_code: i32,
}

#[derive(Default)]
pub struct FakeState {
    pub pulls: Vec<String>,
    pub sandboxes: HashMap<String, FakeSandbox>,
    pub containers: HashMap<String, FakeContainer>,
    pub created_sandbox_names: Vec<String>,
    pub created_specs: Vec<ContainerSpec>,
    pub removed_containers: Vec<String>,
    pub start_calls: usize,
    next_id: u64,
    failpoint: Option<Failpoint>,
}

impl FakeState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{}", prefix, self.next_id)
    }
}

/// Container runtime that simulates the copy container on the host.
///
/// Starting a container checks that the copy tool was seeded and writes a
/// small file tree into the content directory passed as the last argument.
pub struct FakeRuntime {
    pub state: Mutex<FakeState>,
    pull_delay: Duration,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FakeState::default()),
            pull_delay: Duration::from_millis(50),
        })
    }

    pub fn fail_with(&self, failpoint: Failpoint) {
        self.state.lock().failpoint = Some(failpoint);
    }

    pub fn clear_failpoint(&self) {
        self.state.lock().failpoint = None;
    }

    pub fn pull_count(&self) -> usize {
        self.state.lock().pulls.len()
    }

    pub fn run_sandbox_count(&self) -> usize {
        self.state.lock().created_sandbox_names.len()
    }

    pub fn sandbox_count(&self) -> usize {
        self.state.lock().sandboxes.len()
    }

    pub fn container_count(&self) -> usize {
        self.state.lock().containers.len()
    }

    /// Pretend an earlier attempt left a sandbox (with one container) behind.
    pub fn add_lingering_sandbox(&self, volume_id: &str, ready: bool) -> (String, String) {
        let mut state = self.state.lock();
        let sandbox_id = state.next_id("sandbox");
        state.sandboxes.insert(
            sandbox_id.clone(),
            FakeSandbox {
                name: volume_id.to_string(),
                labels: HashMap::from([
                    (
                        labels::MANAGED_BY.to_string(),
                        labels::MANAGED_BY_VALUE.to_string(),
                    ),
                    (labels::VOLUME_ID.to_string(), volume_id.to_string()),
                ]),
                ready,
            },
        );
        let container_id = state.next_id("container");
        state.containers.insert(
            container_id.clone(),
            FakeContainer {
                sandbox_id: sandbox_id.clone(),
                spec: None,
                state: ContainerState::Exited,
                exit_code: 1,
            },
        );
        (sandbox_id, container_id)
    }

    fn check(&self, failpoint: Failpoint, what: &str) -> ImagevolResult<()> {
        if self.state.lock().failpoint == Some(failpoint) {
            return Err(ImagevolError::Rpc(format!("injected {} failure", what)));
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn pull_image(&self, image: &str) -> ImagevolResult<String> {
        tokio::time::sleep(self.pull_delay).await;
        self.check(Failpoint::Pull, "pull")?;
        self.state.lock().pulls.push(image.to_string());
        Ok(format!("sha256:{}", image.len()))
    }

    async fn run_sandbox(&self, spec: &SandboxSpec) -> ImagevolResult<String> {
        self.check(Failpoint::RunSandbox, "run sandbox")?;
        let mut state = self.state.lock();
        let id = state.next_id("sandbox");
        state.created_sandbox_names.push(spec.name.clone());
        state.sandboxes.insert(
            id.clone(),
            FakeSandbox {
                name: spec.name.clone(),
                labels: spec.labels.clone(),
                ready: true,
            },
        );
        Ok(id)
    }

    async fn list_sandboxes(
        &self,
        selector: &HashMap<String, String>,
    ) -> ImagevolResult<Vec<SandboxInfo>> {
        let state = self.state.lock();
        let mut found: Vec<_> = state
            .sandboxes
            .iter()
            .filter(|(_, s)| selector.iter().all(|(k, v)| s.labels.get(k) == Some(v)))
            .map(|(id, s)| SandboxInfo {
                id: id.clone(),
                name: s.name.clone(),
                ready: s.ready,
                labels: s.labels.clone(),
            })
            .collect();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(found)
    }

    async fn stop_sandbox(&self, sandbox_id: &str) -> ImagevolResult<()> {
        if let Some(sandbox) = self.state.lock().sandboxes.get_mut(sandbox_id) {
            sandbox.ready = false;
        }
        Ok(())
    }

    async fn remove_sandbox(&self, sandbox_id: &str) -> ImagevolResult<()> {
        let mut state = self.state.lock();
        state.sandboxes.remove(sandbox_id);
        state.containers.retain(|_, c| c.sandbox_id != sandbox_id);
        Ok(())
    }

    async fn create_container(
        &self,
        sandbox_id: &str,
        _sandbox: &SandboxSpec,
        container: &ContainerSpec,
    ) -> ImagevolResult<String> {
        self.check(Failpoint::CreateContainer, "create container")?;
        let mut state = self.state.lock();
        if !state.sandboxes.contains_key(sandbox_id) {
            return Err(ImagevolError::Rpc(format!("sandbox {} not found", sandbox_id)));
        }
        let id = state.next_id("container");
        state.created_specs.push(container.clone());
        state.containers.insert(
            id.clone(),
            FakeContainer {
                sandbox_id: sandbox_id.to_string(),
                spec: Some(container.clone()),
                state: ContainerState::Created,
                exit_code: 0,
            },
        );
        Ok(id)
    }

    async fn start_container(&self, container_id: &str) -> ImagevolResult<()> {
        self.check(Failpoint::StartContainer, "start container")?;
        let mut state = self.state.lock();
        state.start_calls += 1;
        let failpoint = state.failpoint;
        let container = state
            .containers
            .get_mut(container_id)
            .ok_or_else(|| ImagevolError::Rpc(format!("container {} not found", container_id)))?;
        let spec = container
            .spec
            .clone()
            .ok_or_else(|| ImagevolError::Rpc("container has no spec".into()))?;

        let tool = PathBuf::from(&spec.command[0]);
        if !tool.is_file() {
            return Err(ImagevolError::Rpc(format!(
                "copy tool {} missing",
                tool.display()
            )));
        }

        match failpoint {
            Some(Failpoint::Hang) => {
                container.state = ContainerState::Running;
            }
            Some(Failpoint::Exit(code)) => {
                container.state = ContainerState::Exited;
                container.exit_code = code;
            }
            _ => {
                let content = PathBuf::from(spec.command.last().cloned().unwrap_or_default());
                let source = spec.command[spec.command.len() - 2].clone();
                std::fs::create_dir_all(content.join("etc")).map_err(ImagevolError::from)?;
                std::fs::write(content.join("etc/os-release"), format!("SOURCE={}", source))
                    .map_err(ImagevolError::from)?;
                container.state = ContainerState::Exited;
                container.exit_code = 0;
            }
        }
        Ok(())
    }

    async fn container_status(&self, container_id: &str) -> ImagevolResult<ContainerStatus> {
        let state = self.state.lock();
        let container = state
            .containers
            .get(container_id)
            .ok_or_else(|| ImagevolError::Rpc(format!("container {} not found", container_id)))?;
        Ok(ContainerStatus {
            state: container.state,
            exit_code: container.exit_code,
            reason: if container.exit_code == 0 {
                "Completed".into()
            } else {
                "Error".into()
            },
            message: String::new(),
        })
    }

    async fn list_containers(&self, sandbox_id: &str) -> ImagevolResult<Vec<String>> {
        let state = self.state.lock();
        Ok(state
            .containers
            .iter()
            .filter(|(_, c)| c.sandbox_id == sandbox_id)
            .map(|(id, _)| id.clone())
            .collect())
    }

    async fn remove_container(&self, container_id: &str) -> ImagevolResult<()> {
        let mut state = self.state.lock();
        state.containers.remove(container_id);
        state.removed_containers.push(container_id.to_string());
        Ok(())
    }
}

// ============================================================================
// FAKE MOUNTER
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedMount {
    pub source: PathBuf,
    pub options: Vec<String>,
}

#[derive(Default)]
pub struct FakeMounter {
    pub mounts: Mutex<HashMap<PathBuf, RecordedMount>>,
    pub fail_unmount: Mutex<bool>,
    pub fail_mount: Mutex<bool>,
}

impl FakeMounter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn mount_at(&self, target: &Path) -> Option<RecordedMount> {
        self.mounts.lock().get(target).cloned()
    }

    pub fn mount_count(&self) -> usize {
        self.mounts.lock().len()
    }
}

impl Mounter for FakeMounter {
    fn is_mount_point(&self, path: &Path) -> std::io::Result<bool> {
        std::fs::metadata(path)?;
        Ok(self.mounts.lock().contains_key(path))
    }

    fn mount(
        &self,
        source: &Path,
        target: &Path,
        _fs_type: Option<&str>,
        options: &[String],
    ) -> ImagevolResult<()> {
        if *self.fail_mount.lock() {
            return Err(ImagevolError::Mount("injected mount failure".into()));
        }
        self.mounts.lock().insert(
            target.to_path_buf(),
            RecordedMount {
                source: source.to_path_buf(),
                options: options.to_vec(),
            },
        );
        Ok(())
    }

    fn unmount(&self, target: &Path) -> ImagevolResult<()> {
        if *self.fail_unmount.lock() {
            return Err(ImagevolError::Mount("injected unmount failure".into()));
        }
        self.mounts.lock().remove(target);
        Ok(())
    }
}

// ============================================================================
// TEST CONTEXT
// ============================================================================

/// Driver on fakes, rooted in a temporary directory.
pub struct TestContext {
    pub driver: Driver,
    pub runtime: Arc<FakeRuntime>,
    pub mounter: Arc<FakeMounter>,
    pub options: PluginOptions,
    pub temp_dir: TempDir,
}

impl TestContext {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let copy_tool = temp_dir.path().join("bin/imagevol-copy");
        std::fs::create_dir_all(copy_tool.parent().unwrap()).unwrap();
        std::fs::write(&copy_tool, b"#!/bin/true\n").unwrap();

        let mut options = PluginOptions {
            node_id: "node-1".into(),
            root_dir: temp_dir.path().join("volumes"),
            copy_tool,
            ..Default::default()
        };
        options.timeouts.extraction_secs = 1;
        options.timeouts.call_secs = 5;
        options.timeouts.pull_secs = 5;
        options.timeouts.mount_secs = 5;
        options.timeouts.poll_interval_ms = 10;

        Self::with_options(temp_dir, options)
    }

    fn with_options(temp_dir: TempDir, options: PluginOptions) -> Self {
        let runtime = FakeRuntime::new();
        let mounter = FakeMounter::new();
        let driver = Driver::with_runtime(options.clone(), runtime.clone(), mounter.clone())
            .expect("Failed to build driver");
        Self {
            driver,
            runtime,
            mounter,
            options,
            temp_dir,
        }
    }

    /// A fresh driver over the same host directories, as after a restart.
    pub fn restart(self) -> Self {
        let TestContext {
            temp_dir, options, ..
        } = self;
        Self::with_options(temp_dir, options)
    }

    pub fn target(&self, name: &str) -> PathBuf {
        self.temp_dir.path().join("pods").join(name).join("mount")
    }

    pub fn volume_root(&self, volume_id: &str) -> PathBuf {
        self.options.root_dir.join(volume_id)
    }

    pub fn content_dir(&self, volume_id: &str) -> PathBuf {
        self.volume_root(volume_id).join("content")
    }
}
