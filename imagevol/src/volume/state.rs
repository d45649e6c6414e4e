//! Volume lifecycle status and state machine.
//!
//! ```text
//! Unmaterialized ──→ Materializing ──→ Materialized ──→ Mounted
//!        ▲                 │                │              │
//!        └── (failure) ────┘                └──→ Unmounting ◀┘
//!                                                   │   ▲
//!                                                   ▼   │ (delete failed)
//!                                                Released
//! ```

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use imagevol_shared::errors::{ImagevolError, ImagevolResult};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeStatus {
    /// No content on the host.
    Unmaterialized,

    /// Extraction in progress. Exactly one job exists.
    Materializing,

    /// Content extracted, not mounted.
    Materialized,

    /// Content bind-mounted at the target.
    Mounted,

    /// Unmounted, content deletion pending or failed.
    Unmounting,

    /// Unmounted and content deleted.
    Released,
}

impl VolumeStatus {
    /// Whether content is present on the host.
    pub fn has_content(&self) -> bool {
        matches!(self, VolumeStatus::Materialized | VolumeStatus::Mounted)
    }

    pub fn is_mounted(&self) -> bool {
        matches!(self, VolumeStatus::Mounted)
    }

    /// Check if a materialization may start from this state.
    pub fn can_materialize(&self) -> bool {
        matches!(self, VolumeStatus::Unmaterialized | VolumeStatus::Released)
    }

    /// Check if transition to target state is valid.
    pub fn can_transition_to(&self, target: VolumeStatus) -> bool {
        use VolumeStatus::*;
        matches!(
            (self, target),
            (Unmaterialized, Materializing) |
            // Unpublish of a volume that never finished extracting
            (Unmaterialized, Unmounting) |
            (Materializing, Materialized) |
            (Materializing, Unmaterialized) |
            (Materialized, Mounted) |
            (Materialized, Unmounting) |
            (Mounted, Unmounting) |
            (Unmounting, Released) |
            // The same ID published again after release
            (Released, Materializing) |
            (Released, Unmounting)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeStatus::Unmaterialized => "unmaterialized",
            VolumeStatus::Materializing => "materializing",
            VolumeStatus::Materialized => "materialized",
            VolumeStatus::Mounted => "mounted",
            VolumeStatus::Unmounting => "unmounting",
            VolumeStatus::Released => "released",
        }
    }
}

impl std::str::FromStr for VolumeStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unmaterialized" => Ok(VolumeStatus::Unmaterialized),
            "materializing" => Ok(VolumeStatus::Materializing),
            "materialized" => Ok(VolumeStatus::Materialized),
            "mounted" => Ok(VolumeStatus::Mounted),
            "unmounting" => Ok(VolumeStatus::Unmounting),
            "released" => Ok(VolumeStatus::Released),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for VolumeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-volume record owned by the lifecycle service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeRecord {
    pub volume_id: String,
    pub status: VolumeStatus,
    /// Image the content was (or is being) extracted from.
    pub image: Option<String>,
    pub target_path: Option<PathBuf>,
    pub read_only: bool,
    /// Last state change timestamp (UTC).
    pub last_updated: DateTime<Utc>,
}

impl VolumeRecord {
    pub fn new(volume_id: &str, status: VolumeStatus) -> Self {
        Self {
            volume_id: volume_id.to_string(),
            status,
            image: None,
            target_path: None,
            read_only: false,
            last_updated: Utc::now(),
        }
    }

    /// Attempt state transition with validation.
    pub fn transition_to(&mut self, new_status: VolumeStatus) -> ImagevolResult<()> {
        if !self.status.can_transition_to(new_status) {
            return Err(ImagevolError::Internal(format!(
                "volume {}: cannot transition from {} to {}",
                self.volume_id, self.status, new_status
            )));
        }

        tracing::trace!(
            volume_id = %self.volume_id,
            from = %self.status,
            to = %new_status,
            "Volume state transition"
        );
        self.status = new_status;
        self.last_updated = Utc::now();
        Ok(())
    }
}
