//! Shared types for imagevol: errors and generated protocol bindings.

pub mod errors;

pub use errors::{ImagevolError, ImagevolResult};

/// Generated CSI v1 bindings (Identity + Node servers).
pub mod csi {
    tonic::include_proto!("csi.v1");
}

/// Generated CRI v1 bindings (RuntimeService + ImageService clients).
pub mod cri {
    tonic::include_proto!("runtime.v1");
}
