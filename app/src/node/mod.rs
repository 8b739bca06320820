//! Node lifecycle: single instances and the manager that owns them.

mod instance;
mod manager;

pub use instance::NodeInstance;
pub use manager::{HealthSummary, NodeManager, PeerReport};
