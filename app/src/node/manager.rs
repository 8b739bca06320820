use super::NodeInstance;
use crate::config::{Config, ConfigError, NodeConfig};
use crate::error::{ManagerError, NodeError, StartFailure};
use crate::metrics::{
    HEALTHY_NODES, HEALTH_CHECK_TOTALS, NODES_REGISTERED, NODE_BLOCK_HEIGHT, NODE_START_TOTALS,
    PEER_CONNECTION_TOTALS,
};
use engine::{Address, ChainEngine, EngineClient, EngineHandle, EngineSpec};
use futures::future::join_all;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type Registry = Arc<RwLock<HashMap<String, Arc<NodeInstance>>>>;

/// Outcome of one [`NodeManager::connect_peers`] sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PeerReport {
    pub attempted: usize,
    pub connected: usize,
    pub failed: usize,
}

/// Outcome of one [`NodeManager::health_check`] sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HealthSummary {
    pub healthy: usize,
    pub unhealthy: usize,
}

/// Settings shared by every launch task.
struct LaunchContext {
    engine: Arc<dyn ChainEngine>,
    genesis: Option<PathBuf>,
    data_root: PathBuf,
    network_id: u64,
    chain_id: u64,
    host: String,
    mining_threads: usize,
    gas_price: u64,
    startup_timeout: Duration,
}

impl LaunchContext {
    fn spec_for(&self, node: &NodeConfig) -> EngineSpec {
        EngineSpec {
            name: node.name.clone(),
            data_dir: self.data_root.join(&node.name),
            network_id: self.network_id,
            chain_id: self.chain_id,
            host: self.host.clone(),
            p2p_port: node.p2p_port(),
            discovery_port: node.discovery_port,
            rpc_port: node.rpc_port,
            ws_port: node.ws_port,
            miner: node.miner,
            mining_threads: self.mining_threads,
            gas_price: self.gas_price,
        }
    }

    /// Everything after `create`: genesis, account, beneficiary, process
    /// start and the RPC client.
    async fn bring_up(
        &self,
        node: &NodeConfig,
        spec: &EngineSpec,
        handle: &Arc<dyn EngineHandle>,
    ) -> Result<(Address, Arc<dyn EngineClient>), NodeError> {
        let name = node.name.as_str();
        let initialized = handle
            .init_genesis(self.genesis.as_deref())
            .await
            .map_err(|e| NodeError::engine(name, "genesis init", e))?;
        if initialized {
            info!(node = name, "Initialized genesis state");
        }

        let account = handle
            .ensure_account()
            .await
            .map_err(|e| NodeError::engine(name, "account setup", e))?;
        // validated at load time
        let etherbase = node.etherbase_address().ok().flatten().unwrap_or(account);
        handle.set_etherbase(etherbase).await;

        handle
            .start()
            .await
            .map_err(|e| NodeError::engine(name, "start", e))?;
        let client = self
            .engine
            .open_client(&spec.rpc_endpoint())
            .await
            .map_err(|e| NodeError::engine(name, "rpc connect", e))?;
        Ok((account, client))
    }

    async fn launch(
        &self,
        node: NodeConfig,
        cancel: CancellationToken,
    ) -> Result<Arc<NodeInstance>, NodeError> {
        let name = node.name.clone();
        let spec = self.spec_for(&node);
        tokio::fs::create_dir_all(&spec.data_dir)
            .await
            .map_err(|source| NodeError::DataDir {
                name: name.clone(),
                path: spec.data_dir.clone(),
                source,
            })?;

        let handle = self
            .engine
            .create(&spec)
            .await
            .map_err(|e| NodeError::engine(&name, "create", e))?;

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(NodeError::Cancelled(name.clone())),
            result = tokio::time::timeout(
                self.startup_timeout,
                self.bring_up(&node, &spec, &handle),
            ) => result.unwrap_or_else(|_| Err(NodeError::Timeout {
                name: name.clone(),
                operation: "startup",
                timeout: self.startup_timeout,
            })),
        };

        match outcome {
            Ok((account, client)) => Ok(Arc::new(NodeInstance::new(
                node,
                spec.data_dir,
                account,
                handle,
                client,
            ))),
            Err(err) => {
                if let Err(stop_err) = handle.stop().await {
                    warn!(node = %name, "Failed to stop half-started node: {}", stop_err);
                }
                Err(err)
            }
        }
    }
}

/// Owns every [`NodeInstance`] by name and drives bulk lifecycle operations.
///
/// The registry lock guards map updates and snapshots only. Node operations
/// run on `Arc` snapshots taken beforehand, and the registry lock is never
/// taken while a node's own lock is held.
pub struct NodeManager {
    config: Arc<Config>,
    launch: Arc<LaunchContext>,
    nodes: Registry,
    /// Held for a whole `start_all` so a node is never launched twice.
    launching: Mutex<()>,
    mesh: RwLock<BTreeSet<(String, String)>>,
    health_timeout: Duration,
    health_retries: u32,
}

impl NodeManager {
    pub fn new(
        config: Arc<Config>,
        engine: Arc<dyn ChainEngine>,
        genesis: Option<PathBuf>,
    ) -> Result<Self, ConfigError> {
        let launch = LaunchContext {
            engine,
            genesis,
            data_root: config.engine.data_dir.clone(),
            network_id: config.network.effective_network_id(),
            chain_id: config.network.chain_id,
            host: config.engine.host.clone(),
            mining_threads: config.mining.threads,
            gas_price: config.mining.gas_price,
            startup_timeout: config.engine.startup_timeout()?,
        };
        Ok(Self {
            health_timeout: config.health_check.timeout()?,
            health_retries: config.health_check.retries,
            launch: Arc::new(launch),
            config,
            nodes: Arc::new(RwLock::new(HashMap::new())),
            launching: Mutex::new(()),
            mesh: RwLock::new(BTreeSet::new()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Engine parameters a configured node is launched with.
    pub fn spec_for(&self, node: &NodeConfig) -> EngineSpec {
        self.launch.spec_for(node)
    }

    /// Launch every configured node that is not registered yet.
    ///
    /// All launches run concurrently and to completion. Nodes that started
    /// stay registered even when others fail; every failure is reported in
    /// [`ManagerError::StartFailed`], in configuration order.
    pub async fn start_all(&self, cancel: &CancellationToken) -> Result<(), ManagerError> {
        let _launching = self.launching.lock().await;
        let mut pending = Vec::new();
        {
            let nodes = self.nodes.read().await;
            for node in &self.config.nodes {
                if nodes.contains_key(&node.name) {
                    debug!(node = %node.name, "Already running, skipping launch");
                } else {
                    pending.push(node.clone());
                }
            }
        }

        info!("Starting {} node(s)", pending.len());
        let tasks = pending.into_iter().map(|node| {
            let name = node.name.clone();
            let launch = self.launch.clone();
            let registry = self.nodes.clone();
            let cancel = cancel.clone();
            let task = tokio::spawn(async move {
                let instance = launch.launch(node, cancel).await?;
                info!(
                    node = %instance.name(),
                    account = %instance.account_hex(),
                    "Node started"
                );
                let mut nodes = registry.write().await;
                nodes.insert(instance.name().to_string(), instance);
                NODES_REGISTERED.set(nodes.len() as i64);
                Ok::<_, NodeError>(())
            });
            async move { (name, task.await) }
        });

        let mut failures = Vec::new();
        for (node, joined) in join_all(tasks).await {
            let result = joined.unwrap_or_else(|e| {
                error!(node = %node, "Launch task failed: {}", e);
                Err(NodeError::TaskFailed(node.clone()))
            });
            match result {
                Ok(()) => {
                    NODE_START_TOTALS.with_label_values(&["success"]).inc();
                }
                Err(error) => {
                    NODE_START_TOTALS.with_label_values(&["failure"]).inc();
                    error!(node = %node, "Failed to start node: {}", error);
                    failures.push(StartFailure { node, error });
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ManagerError::StartFailed { failures })
        }
    }

    /// Attempt every unordered pair of registered nodes once.
    ///
    /// Individual failures are logged and counted; a partial mesh is an
    /// accepted outcome.
    pub async fn connect_peers(&self, cancel: &CancellationToken) -> PeerReport {
        let nodes = self.get_all_nodes().await;
        if nodes.len() < 2 {
            debug!("Fewer than two nodes registered, nothing to connect");
            return PeerReport::default();
        }

        let mut pairs = Vec::new();
        for (i, a) in nodes.iter().enumerate() {
            for b in &nodes[i + 1..] {
                pairs.push((a.clone(), b.clone()));
            }
        }

        let timeout = self.health_timeout;
        let attempts = pairs.into_iter().map(|(a, b)| {
            let cancel = cancel.clone();
            async move {
                let result = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(NodeError::Cancelled(a.name().to_string())),
                    result = tokio::time::timeout(timeout, a.connect_to(&b)) => {
                        result.unwrap_or_else(|_| Err(NodeError::Timeout {
                            name: a.name().to_string(),
                            operation: "peer connect",
                            timeout,
                        }))
                    }
                };
                (a, b, result)
            }
        });

        let mut report = PeerReport::default();
        for (a, b, result) in join_all(attempts).await {
            report.attempted += 1;
            match result {
                Ok(()) => {
                    report.connected += 1;
                    PEER_CONNECTION_TOTALS.with_label_values(&["success"]).inc();
                    self.mesh
                        .write()
                        .await
                        .insert(link(a.name(), b.name()));
                    debug!(node = %a.name(), peer = %b.name(), "Connected peers");
                }
                Err(e) => {
                    report.failed += 1;
                    PEER_CONNECTION_TOTALS.with_label_values(&["failure"]).inc();
                    warn!(node = %a.name(), peer = %b.name(), "Failed to connect peers: {}", e);
                }
            }
        }

        info!(
            "Peer mesh: {}/{} connections established",
            report.connected, report.attempted
        );
        report
    }

    /// Snapshot of the established peer links, each as a sorted name pair.
    pub async fn mesh_links(&self) -> Vec<(String, String)> {
        self.mesh.read().await.iter().cloned().collect()
    }

    /// Check every registered node concurrently. Failures only flip the
    /// node's health flag. A cancelled sweep stops retrying and counts the
    /// unfinished nodes as unhealthy.
    pub async fn health_check(&self, cancel: &CancellationToken) -> HealthSummary {
        let nodes = self.get_all_nodes().await;
        let timeout = self.health_timeout;
        let attempts = self.health_retries.saturating_add(1);

        let checks = nodes.iter().map(|node| async move {
            let mut last_error = None;
            for attempt in 1..=attempts {
                let result = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        debug!(node = %node.name(), "Health check cancelled");
                        return false;
                    }
                    result = node.check_health(timeout) => result,
                };
                match result {
                    Ok(height) => {
                        NODE_BLOCK_HEIGHT
                            .with_label_values(&[node.name()])
                            .set(height as i64);
                        return true;
                    }
                    Err(e) => {
                        debug!(node = %node.name(), attempt, "Health check attempt failed: {}", e);
                        last_error = Some(e);
                    }
                }
            }
            if let Some(e) = last_error {
                warn!(node = %node.name(), "Health check failed: {}", e);
            }
            false
        });

        let mut summary = HealthSummary::default();
        for healthy in join_all(checks).await {
            if healthy {
                summary.healthy += 1;
                HEALTH_CHECK_TOTALS.with_label_values(&["healthy"]).inc();
            } else {
                summary.unhealthy += 1;
                HEALTH_CHECK_TOTALS.with_label_values(&["unhealthy"]).inc();
            }
        }
        HEALTHY_NODES.set(summary.healthy as i64);
        summary
    }

    /// Stop every registered node concurrently and empty the registry.
    /// Stop errors are logged, never returned.
    pub async fn stop_all(&self) {
        let nodes = self.get_all_nodes().await;
        info!("Stopping {} node(s)", nodes.len());

        let stops = nodes.iter().map(|node| async move { (node, node.stop().await) });
        for (node, result) in join_all(stops).await {
            match result {
                Ok(()) => info!(node = %node.name(), "Node stopped"),
                Err(e) => error!(node = %node.name(), "Failed to stop node: {}", e),
            }
            let _ = NODE_BLOCK_HEIGHT.remove_label_values(&[node.name()]);
        }

        {
            let mut registry = self.nodes.write().await;
            for node in &nodes {
                registry.remove(node.name());
            }
            NODES_REGISTERED.set(registry.len() as i64);
        }
        self.mesh.write().await.clear();
        HEALTHY_NODES.set(0);
    }

    /// Registered nodes sorted by name. The vector is a copy.
    pub async fn get_all_nodes(&self) -> Vec<Arc<NodeInstance>> {
        let mut nodes: Vec<_> = self.nodes.read().await.values().cloned().collect();
        nodes.sort_by(|a, b| a.name().cmp(b.name()));
        nodes
    }

    pub async fn get_node(&self, name: &str) -> Option<Arc<NodeInstance>> {
        self.nodes.read().await.get(name).cloned()
    }

    pub async fn node_count(&self) -> usize {
        self.nodes.read().await.len()
    }
}

fn link(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}
