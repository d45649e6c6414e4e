//! CSI gRPC services.

mod identity;
mod node;

pub use identity::IdentityService;
pub use node::NodeService;
