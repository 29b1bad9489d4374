//! Physical fabrics behind [`CommunicationBackend`](crate::backend::CommunicationBackend).

pub mod local;
pub mod tcp;

pub use local::LocalFabric;
pub use tcp::TcpFabric;
