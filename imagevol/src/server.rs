//! gRPC server for the CSI Identity and Node services on a unix socket.

use std::future::Future;
use std::path::{Path, PathBuf};

use imagevol_shared::csi::identity_server::IdentityServer;
use imagevol_shared::csi::node_server::NodeServer;
use imagevol_shared::errors::{ImagevolError, ImagevolResult};
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;

use crate::csi::{IdentityService, NodeService};

/// Socket path of a `unix://` endpoint (a bare absolute path is accepted too).
pub fn socket_path(endpoint: &str) -> ImagevolResult<PathBuf> {
    let path = endpoint.strip_prefix("unix://").unwrap_or(endpoint);
    if !Path::new(path).is_absolute() {
        return Err(ImagevolError::Config(format!(
            "CSI endpoint must be a unix socket path, got: {}",
            endpoint
        )));
    }
    Ok(PathBuf::from(path))
}

fn bind(path: &Path) -> ImagevolResult<UnixListener> {
    // A socket left by a previous run blocks bind().
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "Removed stale socket"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(ImagevolError::Internal(format!(
                "Failed to remove stale socket {}: {}",
                path.display(),
                e
            )));
        }
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    UnixListener::bind(path).map_err(|e| {
        ImagevolError::Internal(format!("Failed to bind {}: {}", path.display(), e))
    })
}

/// Serve until `shutdown` resolves. The socket file is removed afterwards.
pub async fn serve<F>(
    endpoint: &str,
    identity: IdentityService,
    node: NodeService,
    shutdown: F,
) -> ImagevolResult<()>
where
    F: Future<Output = ()> + Send,
{
    let path = socket_path(endpoint)?;
    let listener = bind(&path)?;
    tracing::info!(endpoint = %path.display(), "CSI server listening");

    let result = Server::builder()
        .add_service(IdentityServer::new(identity))
        .add_service(NodeServer::new(node))
        .serve_with_incoming_shutdown(UnixListenerStream::new(listener), shutdown)
        .await;

    if let Err(e) = std::fs::remove_file(&path)
        && e.kind() != std::io::ErrorKind::NotFound
    {
        tracing::warn!(path = %path.display(), "Failed to remove socket: {}", e);
    }

    result?;
    tracing::info!("CSI server stopped");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!("Failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("Received SIGINT, shutting down"),
        _ = sigterm.recv() => tracing::info!("Received SIGTERM, shutting down"),
    }
}
