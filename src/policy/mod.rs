//! In-memory mirror of the daemon's device rule tree

mod node;
mod registry;

pub use node::{NodeId, PolicyNode, RegistryEvent};
pub use registry::{InvariantViolation, PolicyRegistry, Walk};
