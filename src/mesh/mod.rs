//! Mesh coordinator: capability-routed distributed dispatch between a
//! captain (node registry + router) and crew nodes (registrant +
//! executor), authenticated with a shared-secret, non-cryptographic token.

pub mod captain;
pub mod crew;
pub mod node;
pub mod token;

pub use captain::{Captain, MeshResult};
pub use crew::Crew;
pub use node::MeshNode;
