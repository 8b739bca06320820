//! Orchestrates a private multi-node geth network: concurrent node start-up,
//! an all-pairs peer mesh, health polling, mining supervision and graceful
//! shutdown.

mod app;
pub mod config;
pub mod error;
pub mod metrics;
pub mod mining;
pub mod node;

// for main.rs
pub use app::run;

pub use app::{App, Devnet, ENV_PREFIX};
pub use config::{Config, ConfigError, Validate};
pub use error::{ManagerError, MiningError, NodeError, StartFailure};
pub use mining::{MinerInfo, MiningService, MiningStats};
pub use node::{HealthSummary, NodeInstance, NodeManager, PeerReport};
