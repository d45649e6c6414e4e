//! Host filesystem layout.
//!
//! ```text
//! <root_dir>/
//! └── <volume_id>/
//!     ├── .materialized    # extraction finished
//!     ├── support/         # copy tool, mounted rshared into the sandbox
//!     │   └── imagevol-copy
//!     └── content/         # extracted image, bind-mounted to the target
//! ```
//!
//! Every volume ID maps to exactly one directory component below the root,
//! so distinct IDs never share or nest directories.

use std::path::{Path, PathBuf};

use imagevol_shared::errors::{ImagevolError, ImagevolResult};

use super::constants::dirs;

/// Root of all volume directories.
#[derive(Debug, Clone)]
pub struct FilesystemLayout {
    root_dir: PathBuf,
}

impl FilesystemLayout {
    pub fn new(root_dir: PathBuf) -> Self {
        Self { root_dir }
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// Create the root directory.
    pub fn prepare(&self) -> ImagevolResult<()> {
        std::fs::create_dir_all(&self.root_dir).map_err(|e| {
            ImagevolError::Internal(format!(
                "Failed to create volume root {}: {}",
                self.root_dir.display(),
                e
            ))
        })
    }

    /// Derive the layout of one volume, rejecting IDs that would escape the root.
    pub fn volume(&self, volume_id: &str) -> ImagevolResult<VolumeLayout> {
        validate_volume_id(volume_id)?;
        Ok(VolumeLayout {
            root: self.root_dir.join(volume_id),
        })
    }

    /// IDs of all volume directories currently present under the root.
    ///
    /// Entries that are not valid volume IDs are ignored.
    pub fn list_volume_ids(&self) -> ImagevolResult<Vec<String>> {
        let entries = match std::fs::read_dir(&self.root_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(ImagevolError::Internal(format!(
                    "Failed to read volume root {}: {}",
                    self.root_dir.display(),
                    e
                )));
            }
        };

        let mut ids = Vec::new();
        for entry in entries.flatten() {
            if !entry.file_type().is_ok_and(|t| t.is_dir()) {
                continue;
            }
            if let Some(name) = entry.file_name().to_str()
                && validate_volume_id(name).is_ok()
            {
                ids.push(name.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// Reject IDs that are empty or that are not a single plain path component.
pub fn validate_volume_id(volume_id: &str) -> ImagevolResult<()> {
    if volume_id.is_empty() {
        return Err(ImagevolError::InvalidArgument(
            "Volume ID missing in request".into(),
        ));
    }
    if volume_id == "." || volume_id.contains("..") {
        return Err(ImagevolError::InvalidArgument(format!(
            "volume ID {:?} contains a path traversal sequence",
            volume_id
        )));
    }
    if volume_id.contains('/') || volume_id.contains('\0') {
        return Err(ImagevolError::InvalidArgument(format!(
            "volume ID {:?} must not contain '/' or NUL",
            volume_id
        )));
    }
    Ok(())
}

/// Paths owned by a single volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeLayout {
    root: PathBuf,
}

impl VolumeLayout {
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the copy tool, shared with the extraction sandbox.
    pub fn support_dir(&self) -> PathBuf {
        self.root.join(dirs::SUPPORT_DIR)
    }

    /// Directory receiving the image filesystem.
    pub fn content_dir(&self) -> PathBuf {
        self.root.join(dirs::CONTENT_DIR)
    }

    /// Copy tool location, identical on the host and inside the container.
    pub fn copy_tool_path(&self) -> PathBuf {
        self.support_dir().join(dirs::COPY_TOOL_NAME)
    }

    pub fn marker_path(&self) -> PathBuf {
        self.root.join(dirs::MATERIALIZED_MARKER)
    }

    /// Whether a previous extraction completed.
    pub fn is_materialized(&self) -> bool {
        self.marker_path().is_file() && self.content_dir().is_dir()
    }

    /// Create the support and content directories.
    pub fn prepare(&self) -> ImagevolResult<()> {
        for dir in [self.support_dir(), self.content_dir()] {
            std::fs::create_dir_all(&dir).map_err(|e| {
                ImagevolError::Internal(format!(
                    "Failed to create {}: {}",
                    dir.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    /// Image the content was extracted from, as recorded in the marker.
    ///
    /// `None` when the volume is not materialized or the marker is empty.
    pub fn materialized_image(&self) -> Option<String> {
        if !self.is_materialized() {
            return None;
        }
        let image = std::fs::read_to_string(self.marker_path()).ok()?;
        let image = image.trim();
        (!image.is_empty()).then(|| image.to_string())
    }

    /// Record a completed extraction of `image`.
    pub fn mark_materialized(&self, image: &str) -> ImagevolResult<()> {
        let marker = self.marker_path();
        std::fs::write(&marker, image.as_bytes()).map_err(|e| {
            ImagevolError::Internal(format!(
                "Failed to write marker {}: {}",
                marker.display(),
                e
            ))
        })
    }

    /// Remove the whole volume directory. Absent directories are fine.
    pub fn cleanup(&self) -> ImagevolResult<()> {
        match std::fs::remove_dir_all(&self.root) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ImagevolError::Internal(format!(
                "Failed to remove {}: {}",
                self.root.display(),
                e
            ))),
        }
    }
}
