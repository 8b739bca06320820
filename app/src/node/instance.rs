use crate::config::NodeConfig;
use crate::error::NodeError;
use engine::{Address, EngineClient, EngineHandle, Enode};
use ethers::utils::to_checksum;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Default)]
struct Runtime {
    handle: Option<Arc<dyn EngineHandle>>,
    client: Option<Arc<dyn EngineClient>>,
    healthy: bool,
}

/// One running node: its engine handle, RPC client, account and the last
/// known health.
///
/// The inner lock only guards snapshots of the handles and the health flag;
/// engine calls are made on cloned `Arc`s after it is released.
pub struct NodeInstance {
    name: String,
    config: NodeConfig,
    data_dir: PathBuf,
    account: Address,
    runtime: RwLock<Runtime>,
}

impl NodeInstance {
    /// A freshly started node counts as healthy until its first check.
    pub fn new(
        config: NodeConfig,
        data_dir: PathBuf,
        account: Address,
        handle: Arc<dyn EngineHandle>,
        client: Arc<dyn EngineClient>,
    ) -> Self {
        Self {
            name: config.name.clone(),
            config,
            data_dir,
            account,
            runtime: RwLock::new(Runtime {
                handle: Some(handle),
                client: Some(client),
                healthy: true,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn account(&self) -> Address {
        self.account
    }

    /// EIP-55 checksummed account, the key used by the mining active set.
    pub fn account_hex(&self) -> String {
        to_checksum(&self.account, None)
    }

    pub async fn is_healthy(&self) -> bool {
        self.runtime.read().await.healthy
    }

    pub async fn client(&self) -> Option<Arc<dyn EngineClient>> {
        self.runtime.read().await.client.clone()
    }

    pub async fn handle(&self) -> Option<Arc<dyn EngineHandle>> {
        self.runtime.read().await.handle.clone()
    }

    pub async fn has_handle(&self) -> bool {
        self.runtime.read().await.handle.is_some()
    }

    /// Query the latest block number within `timeout` and record the outcome.
    /// Returns the height on success.
    pub async fn check_health(&self, timeout: Duration) -> Result<u64, NodeError> {
        let Some(client) = self.client().await else {
            self.set_healthy(false).await;
            return Err(NodeError::ClientUnavailable(self.name.clone()));
        };

        let result = match tokio::time::timeout(timeout, client.block_number()).await {
            Ok(Ok(height)) => Ok(height),
            Ok(Err(e)) => Err(NodeError::engine(&self.name, "health check", e)),
            Err(_) => Err(NodeError::Timeout {
                name: self.name.clone(),
                operation: "health check",
                timeout,
            }),
        };

        let mut runtime = self.runtime.write().await;
        // stopped while the query was in flight
        runtime.healthy = result.is_ok() && runtime.client.is_some();
        if !runtime.healthy && result.is_ok() {
            return Err(NodeError::ClientUnavailable(self.name.clone()));
        }
        result
    }

    async fn set_healthy(&self, healthy: bool) {
        self.runtime.write().await.healthy = healthy;
    }

    /// Release the RPC client and stop the engine process.
    ///
    /// Both are detached from the instance before anything is closed, so a
    /// failure never leaves one of them half-released. Must not run
    /// concurrently with itself.
    pub async fn stop(&self) -> Result<(), NodeError> {
        let (handle, client) = {
            let mut runtime = self.runtime.write().await;
            runtime.healthy = false;
            (runtime.handle.take(), runtime.client.take())
        };

        if let Some(client) = client {
            client.close();
        }
        match handle {
            Some(handle) => handle
                .stop()
                .await
                .map_err(|e| NodeError::engine(&self.name, "stop", e)),
            None => Ok(()),
        }
    }

    /// Ask `peer` for its enode URL and add it as a peer of this node.
    pub async fn connect_to(&self, peer: &NodeInstance) -> Result<(), NodeError> {
        let own = self
            .handle()
            .await
            .ok_or_else(|| NodeError::NotInitialized(self.name.clone()))?;
        let remote = peer
            .handle()
            .await
            .ok_or_else(|| NodeError::NotInitialized(peer.name.clone()))?;

        let url = remote
            .peer_address()
            .await
            .map_err(|e| NodeError::engine(&peer.name, "peer address lookup", e))?;
        let enode: Enode = url
            .parse()
            .map_err(|e| NodeError::engine(&peer.name, "peer address parse", e))?;

        own.add_peer(&enode)
            .await
            .map_err(|e| NodeError::engine(&self.name, "add peer", e))?;
        debug!(node = %self.name, peer = %peer.name, "Added peer {}", enode);
        Ok(())
    }
}

impl std::fmt::Debug for NodeInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeInstance")
            .field("name", &self.name)
            .field("account", &self.account)
            .field("data_dir", &self.data_dir)
            .finish_non_exhaustive()
    }
}
