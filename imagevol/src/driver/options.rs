//! Configuration options for the plugin.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use imagevol_shared::errors::{ImagevolError, ImagevolResult};
use serde::{Deserialize, Serialize};

use super::constants::DEFAULT_DRIVER_NAME;

/// Plugin-wide options.
///
/// Loaded from an optional JSON file and then overridden by CLI flags.
/// Every field has a default, so a partial file is valid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PluginOptions {
    /// Name advertised through CSI `GetPluginInfo`.
    pub driver_name: String,
    /// Node identifier returned from `NodeGetInfo`.
    pub node_id: String,
    /// CSI endpoint the plugin listens on (`unix://` path).
    pub endpoint: String,
    /// CRI endpoint of the node's container runtime.
    pub runtime_endpoint: String,
    /// Base directory for `<root>/<volume_id>/{support,content}`.
    pub root_dir: PathBuf,
    /// Host path of the static copy tool seeded into every volume.
    pub copy_tool: PathBuf,
    /// Path inside the image that becomes the volume content.
    pub source_path: String,
    /// Runtime handler for extraction sandboxes (empty = runtime default).
    pub runtime_handler: String,
    pub timeouts: TimeoutOptions,
}

impl Default for PluginOptions {
    fn default() -> Self {
        Self {
            driver_name: DEFAULT_DRIVER_NAME.to_string(),
            node_id: String::new(),
            endpoint: "unix:///csi/csi.sock".to_string(),
            runtime_endpoint: "unix:///run/containerd/containerd.sock".to_string(),
            root_dir: PathBuf::from("/var/lib/imagevol/volumes"),
            copy_tool: PathBuf::from("/imagevol-copy"),
            source_path: "/".to_string(),
            runtime_handler: String::new(),
            timeouts: TimeoutOptions::default(),
        }
    }
}

impl PluginOptions {
    /// Load options from a JSON file.
    pub fn from_file(path: &Path) -> ImagevolResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ImagevolError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            ImagevolError::Config(format!(
                "Failed to parse config file {}: {}",
                path.display(),
                e
            ))
        })
    }

    /// Check the options before any component is built.
    pub fn validate(&self) -> ImagevolResult<()> {
        if self.driver_name.is_empty() {
            return Err(ImagevolError::Config("driver_name must not be empty".into()));
        }
        if self.node_id.is_empty() {
            return Err(ImagevolError::Config("node_id must not be empty".into()));
        }
        if !self.root_dir.is_absolute() {
            return Err(ImagevolError::Config(format!(
                "root_dir must be absolute path, got: {}",
                self.root_dir.display()
            )));
        }
        validate_source_path(&self.source_path).map_err(ImagevolError::Config)?;
        self.timeouts.validate()
    }
}

/// Check that an in-image source path is absolute and free of `..`.
///
/// Returns the reason on failure so callers can pick the error kind.
pub fn validate_source_path(path: &str) -> Result<(), String> {
    let p = Path::new(path);
    if !p.is_absolute() {
        return Err(format!("source path must be absolute, got: {}", path));
    }
    if p.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(format!("source path must not contain '..', got: {}", path));
    }
    Ok(())
}

/// Deadlines for every blocking external call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimeoutOptions {
    /// Overall deadline for reaching a ready runtime connection at startup.
    pub connect_secs: u64,
    /// Default deadline for a single CRI call (create, start, status, remove).
    pub call_secs: u64,
    /// Deadline for `PullImage`.
    pub pull_secs: u64,
    /// Deadline for the extraction container to exit.
    pub extraction_secs: u64,
    /// Deadline for mount and unmount syscalls.
    pub mount_secs: u64,
    /// Interval between container status polls.
    pub poll_interval_ms: u64,
}

impl Default for TimeoutOptions {
    fn default() -> Self {
        Self {
            connect_secs: 60,
            call_secs: 30,
            pull_secs: 600,
            extraction_secs: 600,
            mount_secs: 30,
            poll_interval_ms: 500,
        }
    }
}

impl TimeoutOptions {
    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }

    pub fn call(&self) -> Duration {
        Duration::from_secs(self.call_secs)
    }

    pub fn pull(&self) -> Duration {
        Duration::from_secs(self.pull_secs)
    }

    pub fn extraction(&self) -> Duration {
        Duration::from_secs(self.extraction_secs)
    }

    pub fn mount(&self) -> Duration {
        Duration::from_secs(self.mount_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    fn validate(&self) -> ImagevolResult<()> {
        let fields = [
            ("connect_secs", self.connect_secs),
            ("call_secs", self.call_secs),
            ("pull_secs", self.pull_secs),
            ("extraction_secs", self.extraction_secs),
            ("mount_secs", self.mount_secs),
            ("poll_interval_ms", self.poll_interval_ms),
        ];
        for (name, value) in fields {
            if value == 0 {
                return Err(ImagevolError::Config(format!(
                    "timeouts.{} must be greater than zero",
                    name
                )));
            }
        }
        Ok(())
    }
}
