//! CSI Node service.
//!
//! Translates CSI requests into [`VolumeService`] calls and lifecycle errors
//! into status codes.

use std::path::Path;

use imagevol_shared::csi;
use imagevol_shared::csi::node_server::Node;
use imagevol_shared::csi::volume_capability::AccessType;
use imagevol_shared::csi::volume_capability::access_mode::Mode;
use imagevol_shared::errors::{ImagevolError, ImagevolResult};
use tonic::{Request, Response, Status};

use crate::driver::constants::volume_context;
use crate::volume::{PublishRequest, VolumeService};

#[derive(Clone)]
pub struct NodeService {
    volumes: VolumeService,
    node_id: String,
}

impl NodeService {
    pub fn new(volumes: VolumeService, node_id: impl Into<String>) -> Self {
        Self {
            volumes,
            node_id: node_id.into(),
        }
    }
}

/// Build a publish request from the CSI message.
fn publish_request(req: csi::NodePublishVolumeRequest) -> ImagevolResult<PublishRequest> {
    if req.volume_id.is_empty() {
        return Err(ImagevolError::InvalidArgument(
            "Volume ID missing in request".into(),
        ));
    }
    if req.target_path.is_empty() {
        return Err(ImagevolError::InvalidArgument(format!(
            "volume {}: target path missing in request",
            req.volume_id
        )));
    }

    let capability = req.volume_capability.ok_or_else(|| {
        ImagevolError::InvalidArgument(format!(
            "volume {}: volume capability missing in request",
            req.volume_id
        ))
    })?;

    let mount_flags = match capability.access_type {
        Some(AccessType::Mount(mount)) => mount.mount_flags,
        Some(AccessType::Block(_)) => {
            return Err(ImagevolError::InvalidArgument(format!(
                "volume {}: block access type is not supported",
                req.volume_id
            )));
        }
        None => Vec::new(),
    };

    let mode = capability
        .access_mode
        .map(|m| m.mode())
        .unwrap_or(Mode::Unknown);
    if matches!(
        mode,
        Mode::MultiNodeSingleWriter | Mode::MultiNodeMultiWriter | Mode::SingleNodeMultiWriter
    ) {
        return Err(ImagevolError::InvalidArgument(format!(
            "volume {}: access mode {} is not supported",
            req.volume_id,
            mode.as_str_name()
        )));
    }
    let read_only = req.readonly
        || matches!(mode, Mode::SingleNodeReaderOnly | Mode::MultiNodeReaderOnly);

    let image = req
        .volume_context
        .get(volume_context::IMAGE)
        .cloned()
        .unwrap_or_default();
    let source_path = req.volume_context.get(volume_context::PATH).cloned();

    Ok(PublishRequest {
        volume_id: req.volume_id,
        image,
        target_path: req.target_path.into(),
        read_only,
        mount_flags,
        source_path,
    })
}

fn to_status(operation: &str, volume_id: &str, err: ImagevolError) -> Status {
    tracing::error!(
        volume_id = %volume_id,
        operation = %operation,
        error_kind = err.kind(),
        retryable = err.is_retryable(),
        "{} failed: {}",
        operation,
        err
    );
    err.into()
}

#[tonic::async_trait]
impl Node for NodeService {
    async fn node_stage_volume(
        &self,
        request: Request<csi::NodeStageVolumeRequest>,
    ) -> Result<Response<csi::NodeStageVolumeResponse>, Status> {
        let req = request.into_inner();
        self.volumes
            .stage(&req.volume_id, Path::new(&req.staging_target_path))
            .await
            .map_err(|e| to_status("NodeStageVolume", &req.volume_id, e))?;
        Ok(Response::new(csi::NodeStageVolumeResponse {}))
    }

    async fn node_unstage_volume(
        &self,
        request: Request<csi::NodeUnstageVolumeRequest>,
    ) -> Result<Response<csi::NodeUnstageVolumeResponse>, Status> {
        let req = request.into_inner();
        self.volumes
            .unstage(&req.volume_id, Path::new(&req.staging_target_path))
            .await
            .map_err(|e| to_status("NodeUnstageVolume", &req.volume_id, e))?;
        Ok(Response::new(csi::NodeUnstageVolumeResponse {}))
    }

    async fn node_publish_volume(
        &self,
        request: Request<csi::NodePublishVolumeRequest>,
    ) -> Result<Response<csi::NodePublishVolumeResponse>, Status> {
        let req = request.into_inner();
        let volume_id = req.volume_id.clone();
        let publish = publish_request(req).map_err(|e| to_status("NodePublishVolume", &volume_id, e))?;

        self.volumes
            .publish(&publish)
            .await
            .map_err(|e| to_status("NodePublishVolume", &volume_id, e))?;
        Ok(Response::new(csi::NodePublishVolumeResponse {}))
    }

    async fn node_unpublish_volume(
        &self,
        request: Request<csi::NodeUnpublishVolumeRequest>,
    ) -> Result<Response<csi::NodeUnpublishVolumeResponse>, Status> {
        let req = request.into_inner();
        if req.volume_id.is_empty() {
            return Err(to_status(
                "NodeUnpublishVolume",
                "",
                ImagevolError::InvalidArgument("Volume ID missing in request".into()),
            ));
        }
        self.volumes
            .unpublish(&req.volume_id, Path::new(&req.target_path))
            .await
            .map_err(|e| to_status("NodeUnpublishVolume", &req.volume_id, e))?;
        Ok(Response::new(csi::NodeUnpublishVolumeResponse {}))
    }

    /// Staging is not advertised.
    async fn node_get_capabilities(
        &self,
        _request: Request<csi::NodeGetCapabilitiesRequest>,
    ) -> Result<Response<csi::NodeGetCapabilitiesResponse>, Status> {
        Ok(Response::new(csi::NodeGetCapabilitiesResponse {
            capabilities: Vec::new(),
        }))
    }

    async fn node_get_info(
        &self,
        _request: Request<csi::NodeGetInfoRequest>,
    ) -> Result<Response<csi::NodeGetInfoResponse>, Status> {
        Ok(Response::new(csi::NodeGetInfoResponse {
            node_id: self.node_id.clone(),
            max_volumes_per_node: 0,
            accessible_topology: None,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn request(access_type: Option<AccessType>, mode: Mode) -> csi::NodePublishVolumeRequest {
        csi::NodePublishVolumeRequest {
            volume_id: "v1".into(),
            publish_context: HashMap::new(),
            staging_target_path: String::new(),
            target_path: "/var/lib/kubelet/pods/p/volumes/v1".into(),
            volume_capability: Some(csi::VolumeCapability {
                access_type,
                access_mode: Some(csi::volume_capability::AccessMode { mode: mode as i32 }),
            }),
            readonly: false,
            secrets: HashMap::new(),
            volume_context: HashMap::from([("image".to_string(), "busybox:latest".to_string())]),
        }
    }

    fn mount(flags: &[&str]) -> Option<AccessType> {
        Some(AccessType::Mount(csi::volume_capability::MountVolume {
            fs_type: String::new(),
            mount_flags: flags.iter().map(|f| f.to_string()).collect(),
            volume_mount_group: String::new(),
        }))
    }

    #[test]
    fn test_reader_only_mode_is_read_only() {
        let publish = publish_request(request(mount(&[]), Mode::SingleNodeReaderOnly)).unwrap();
        assert!(publish.read_only);

        let publish = publish_request(request(mount(&[]), Mode::SingleNodeWriter)).unwrap();
        assert!(!publish.read_only);
    }

    #[test]
    fn test_mount_flags_and_path_carried() {
        let mut req = request(mount(&["nosuid"]), Mode::SingleNodeWriter);
        req.volume_context.insert("path".into(), "/usr/share".into());

        let publish = publish_request(req).unwrap();
        assert_eq!(publish.mount_flags, vec!["nosuid".to_string()]);
        assert_eq!(publish.source_path.as_deref(), Some("/usr/share"));
        assert_eq!(publish.image, "busybox:latest");
    }

    #[test]
    fn test_rejects_block_and_missing_capability() {
        let block = Some(AccessType::Block(csi::volume_capability::BlockVolume {}));
        let err = publish_request(request(block, Mode::SingleNodeWriter)).unwrap_err();
        assert!(matches!(err, ImagevolError::InvalidArgument(_)));

        let mut req = request(mount(&[]), Mode::SingleNodeWriter);
        req.volume_capability = None;
        assert!(matches!(
            publish_request(req),
            Err(ImagevolError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_rejects_multi_writer() {
        let err = publish_request(request(mount(&[]), Mode::MultiNodeMultiWriter)).unwrap_err();
        assert!(err.to_string().contains("MULTI_NODE_MULTI_WRITER"));
    }

    #[test]
    fn test_empty_target_rejected() {
        let mut req = request(mount(&[]), Mode::SingleNodeWriter);
        req.target_path.clear();
        assert!(matches!(
            publish_request(req),
            Err(ImagevolError::InvalidArgument(_))
        ));
    }
}
