use ethers::providers::ProviderError;
use std::time::Duration;
use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Engine for {0} has not been started")]
    NotStarted(String),
    #[error("Peer network unavailable: {0}")]
    NetworkUnavailable(String),
    #[error("Invalid enode url {url}: {reason}")]
    InvalidEnode { url: String, reason: String },
    #[error("Peer {0} was rejected by the engine")]
    PeerRejected(String),
    #[error("Invalid rpc endpoint {endpoint}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },
    #[error("Endpoint {0} is unreachable")]
    Unreachable(String),
    #[error("Rpc client has been closed")]
    ClientClosed,
    #[error("Rpc error: {0}")]
    Rpc(#[from] ProviderError),
    #[error("IO error while {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{command}` failed with {status}: {stderr}")]
    Command {
        command: String,
        status: String,
        stderr: String,
    },
    #[error("Engine process exited early ({0})")]
    ProcessExited(String),
    #[error("Engine did not become ready within {0:?}")]
    StartupTimeout(Duration),
    #[error("Keystore error: {0}")]
    Keystore(String),
}

impl EngineError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        EngineError::Io {
            context: context.into(),
            source,
        }
    }
}
