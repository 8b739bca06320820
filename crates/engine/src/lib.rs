//! Chain engine boundary for the devnet orchestrator.
//!
//! The orchestrator never runs consensus or execution itself. It asks an
//! engine to create a node process, start and stop it, wire peers together
//! and answer a handful of read-only queries. [`ChainEngine`] creates the
//! per-node [`EngineHandle`]s and opens [`EngineClient`]s against their RPC
//! endpoints; [`geth`] provides the implementation backed by an external
//! `geth` binary.

mod client;
mod enode;
mod error;
pub mod geth;
mod keystore;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub use client::RpcClient;
pub use enode::Enode;
pub use error::{EngineError, EngineResult};
pub use ethers::types::{Address, Bytes, U256};
pub use geth::{GethEngine, GethHandle};

/// Everything an engine needs to create one node process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSpec {
    pub name: String,
    pub data_dir: PathBuf,
    pub network_id: u64,
    pub chain_id: u64,
    pub host: String,
    pub p2p_port: u16,
    pub discovery_port: u16,
    pub rpc_port: u16,
    pub ws_port: u16,
    pub miner: bool,
    pub mining_threads: usize,
    pub gas_price: u64,
}

impl EngineSpec {
    pub fn rpc_endpoint(&self) -> String {
        format!("http://{}:{}", self.host, self.rpc_port)
    }

    pub fn ws_endpoint(&self) -> Option<String> {
        (self.ws_port != 0).then(|| format!("ws://{}:{}", self.host, self.ws_port))
    }
}

/// Factory for node processes and RPC clients.
#[async_trait]
pub trait ChainEngine: Send + Sync {
    /// Configure a node process without starting it.
    async fn create(&self, spec: &EngineSpec) -> EngineResult<Arc<dyn EngineHandle>>;

    /// Open an RPC client against a running node.
    async fn open_client(&self, endpoint: &str) -> EngineResult<Arc<dyn EngineClient>>;
}

/// Lifecycle and peering control of a single node process.
#[async_trait]
pub trait EngineHandle: Send + Sync {
    /// Initialize genesis state. Returns `false` when the chain data already
    /// exists or no genesis file was supplied.
    async fn init_genesis(&self, genesis: Option<&Path>) -> EngineResult<bool>;

    /// First keystore account, created through the engine if there is none.
    async fn ensure_account(&self) -> EngineResult<Address>;

    /// Register the block reward beneficiary. Takes effect on `start`.
    async fn set_etherbase(&self, address: Address);

    async fn start(&self) -> EngineResult<()>;

    async fn stop(&self) -> EngineResult<()>;

    /// The node's own enode URL as reported by its p2p server.
    async fn peer_address(&self) -> EngineResult<String>;

    async fn add_peer(&self, peer: &Enode) -> EngineResult<()>;
}

/// Read-only chain queries plus the miner controls.
#[async_trait]
pub trait EngineClient: Send + Sync {
    async fn block_number(&self) -> EngineResult<u64>;

    async fn balance(&self, address: Address) -> EngineResult<U256>;

    async fn nonce(&self, address: Address) -> EngineResult<U256>;

    async fn code_at(&self, address: Address) -> EngineResult<Bytes>;

    async fn is_mining(&self) -> EngineResult<bool>;

    async fn start_mining(&self, threads: usize) -> EngineResult<()>;

    /// Release the client. Every later call fails with
    /// [`EngineError::ClientClosed`].
    fn close(&self);
}
