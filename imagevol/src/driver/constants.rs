//! Names shared between the host layout, the runtime objects and the plugin.

/// Default CSI driver name advertised through `GetPluginInfo`.
pub const DEFAULT_DRIVER_NAME: &str = "image.csi.k8s.io";

/// Volume context keys read from `NodePublishVolume`.
pub mod volume_context {
    /// Image reference to materialize (required).
    pub const IMAGE: &str = "image";
    /// Path inside the image to copy instead of `/` (optional).
    pub const PATH: &str = "path";
}

/// Directory and file names below `<root>/<volume_id>/`.
pub mod dirs {
    pub const SUPPORT_DIR: &str = "support";
    pub const CONTENT_DIR: &str = "content";
    /// Written once extraction succeeded; its presence means "materialized".
    /// Holds the image reference the content came from.
    pub const MATERIALIZED_MARKER: &str = ".materialized";
    /// Name of the copy tool inside the support directory.
    pub const COPY_TOOL_NAME: &str = "imagevol-copy";
}

/// Labels and metadata applied to extraction sandboxes and containers.
pub mod labels {
    pub const MANAGED_BY: &str = "imagevol.io/managed-by";
    pub const MANAGED_BY_VALUE: &str = "imagevol";
    pub const VOLUME_ID: &str = "imagevol.io/volume-id";
}

/// CRI object names.
pub mod cri_names {
    /// Namespace recorded in the sandbox metadata.
    pub const SANDBOX_NAMESPACE: &str = "imagevol";
    /// Metadata name of the helper container.
    pub const EXTRACT_CONTAINER: &str = "extract";
}

/// Paths inside the extraction container that the copy never descends into.
pub const PSEUDO_FILESYSTEMS: &[&str] = &["/proc", "/sys", "/dev"];
