use engine::EngineError;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Node {0}: engine handle is not initialized")]
    NotInitialized(String),
    #[error("Node {0}: rpc client is not available")]
    ClientUnavailable(String),
    #[error("Node {name}: {operation} timed out after {timeout:?}")]
    Timeout {
        name: String,
        operation: &'static str,
        timeout: Duration,
    },
    #[error("Node {name}: failed to create data directory {path}: {source}")]
    DataDir {
        name: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Node {name}: {operation} failed: {source}")]
    Engine {
        name: String,
        operation: &'static str,
        #[source]
        source: EngineError,
    },
    #[error("Node {0}: startup cancelled")]
    Cancelled(String),
    #[error("Node {0}: startup task panicked")]
    TaskFailed(String),
}

impl NodeError {
    pub(crate) fn engine(name: &str, operation: &'static str, source: EngineError) -> Self {
        NodeError::Engine {
            name: name.to_string(),
            operation,
            source,
        }
    }
}

/// One node that failed during [`crate::node::NodeManager::start_all`].
#[derive(Debug)]
pub struct StartFailure {
    pub node: String,
    pub error: NodeError,
}

fn describe(failures: &[StartFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {}", f.node, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("Failed to start {} node(s): {}", .failures.len(), describe(.failures))]
    StartFailed { failures: Vec<StartFailure> },
}

impl ManagerError {
    /// Names of the nodes that failed, in configuration order.
    pub fn failed_nodes(&self) -> Vec<&str> {
        match self {
            ManagerError::StartFailed { failures } => {
                failures.iter().map(|f| f.node.as_str()).collect()
            }
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum MiningError {
    #[error("No nodes available for mining")]
    NoNodesAvailable,
    #[error("Mining service is already running")]
    AlreadyRunning,
    #[error("Mining service is not running")]
    NotRunning,
}
